//! Closed vocabularies used by the site configuration
//!
//! Enums instead of strings so the configuration document is checked when it
//! is parsed rather than when a command fails halfway through a run.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Scheme used to build a site's public URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UrlScheme {
    #[default]
    Http,
    Https,
}

/// External programs the engine drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tool {
    /// Container runtime
    Docker,
    /// Relational database client
    Mysql,
    /// WordPress administration tool (WP-CLI)
    Wp,
}

/// Privilege keywords accepted in a dedicated-user grant
pub const KNOWN_PRIVILEGES: &[&str] = &[
    "ALL",
    "ALL PRIVILEGES",
    "ALTER",
    "CREATE",
    "CREATE TEMPORARY TABLES",
    "CREATE VIEW",
    "DELETE",
    "DROP",
    "EVENT",
    "EXECUTE",
    "INDEX",
    "INSERT",
    "LOCK TABLES",
    "REFERENCES",
    "SELECT",
    "SHOW VIEW",
    "TRIGGER",
    "UPDATE",
];

/// Returns true if `privilege` is a grantable keyword (case-insensitive)
pub fn is_known_privilege(privilege: &str) -> bool {
    let normalized = privilege.trim().to_ascii_uppercase();
    KNOWN_PRIVILEGES.contains(&normalized.as_str())
}
