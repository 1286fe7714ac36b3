//! sitesmith library
//!
//! Provisioning and migration engine for WordPress sites: brings a MySQL
//! server up, recreates the site database, patches `wp-config.php`, imports
//! and rewrites foreign content, and reconciles the admin account.

pub mod admin;
pub mod cli;
pub mod command;
pub mod config_file;
pub mod container;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod migrate;
pub mod pipeline;
pub mod process_guard;
pub mod provision;
pub mod sanity;
pub mod site;
pub mod tools;
pub mod types;
pub mod wp_config;

// Re-export main types for convenience
pub use admin::{AccountState, AdminAccount, AdminReconciler, HashKind, Reconciled};
pub use command::{CommandOutput, CommandRunner, CommandSpec, SystemRunner, ToolArgs};
pub use config_file::SiteConfig;
pub use container::{ContainerRuntime, ContainerStatus, DockerCli};
pub use db::{MysqlCli, SqlClient};
pub use error::{Result, SiteError};
pub use lifecycle::{DatabaseLifecycle, LifecycleState, ReadinessPolicy};
pub use migrate::{MigrationEngine, MigrationReport, ReplacementRule, RuleOutcome};
pub use pipeline::{Pipeline, PipelineContext, PipelineReport, PipelineStage};
pub use process_guard::{ChildRegistry, CommandProcessGroup, TrackedChild};
pub use provision::{Provisioned, Provisioner};
pub use site::{Credential, DatabaseTarget, SiteContext};
pub use types::{Tool, UrlScheme};
pub use wp_config::{PatchParams, SecretBlock, SecretSource, patch};
