//! Error handling for the provisioning engine
//!
//! Every stage either completes or returns one of these errors, which aborts
//! the pipeline. Failures that are only worth a warning never reach this type.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::{PipelineStage, PipelineTransitionError};

/// Main error type for sitesmith
#[derive(Error, Debug)]
pub enum SiteError {
    /// The database readiness probe never succeeded
    #[error("Database not ready after {attempts} attempts ({}s of polling)", waited.as_secs())]
    Timeout { attempts: u32, waited: Duration },

    /// Database create/verify/grant failure
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Missing dump file, import failure, table enumeration failure
    #[error("Migration error: {0}")]
    Migration(String),

    /// Unexpected failure while reconciling the admin account
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// An external program could not be spawned or exited non-zero
    #[error("{program} failed (exit code {}): {}", code.map_or_else(|| "none".to_string(), |c| c.to_string()), stderr.trim())]
    ToolInvocation {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Configuration loading or shape errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input (site name, rule values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors (config file, wp-config.php)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors (secret endpoint)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Out-of-order stage transition (a bug in the caller)
    #[error("Pipeline transition error: {0}")]
    Transition(#[from] PipelineTransitionError),

    /// A pipeline stage failed; wraps the underlying error
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: Box<SiteError>,
    },
}

/// Result type alias for sitesmith operations
pub type Result<T> = std::result::Result<T, SiteError>;

impl SiteError {
    /// Create a provisioning error
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    /// Create a reconciliation error
    pub fn reconciliation(msg: impl Into<String>) -> Self {
        Self::Reconciliation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a tool invocation error
    pub fn tool(program: impl Into<String>, code: Option<i32>, stderr: impl Into<String>) -> Self {
        Self::ToolInvocation {
            program: program.into(),
            code,
            stderr: stderr.into(),
        }
    }

    /// Wrap an error with the stage it aborted
    pub fn at_stage(self, stage: PipelineStage) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The stage that failed, if this error came out of the pipeline
    pub fn failed_stage(&self) -> Option<PipelineStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
