//! Type-safe argument modules for external tools.
//!
//! Each struct implements `ToolArgs` and maps its fields to the exact flags
//! and environment variables the corresponding program expects.
//!
//! # Security: Secrets
//!
//! Database and account passwords travel through environment variables
//! (`MYSQL_PWD`, `MYSQL_ROOT_PASSWORD`, `SITESMITH_PLAINTEXT`), never argv,
//! because argv is visible in `/proc/<pid>/cmdline` to every local user.
//! SQL, which can carry a generated password, is fed on stdin.

pub mod docker;
pub mod mysql;
pub mod wp;
