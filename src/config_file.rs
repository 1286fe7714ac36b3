//! Site configuration document
//!
//! The document is JSON. Every section has defaults so a minimal file only
//! needs credentials; `validate()` rejects values that would otherwise fail
//! deep inside a stage (or end up interpolated into SQL).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, SiteError};
use crate::types::{Tool, UrlScheme, is_known_privilege};

/// Declarative configuration for provisioning sites
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Directory that holds one document root per site
    pub sites_root: PathBuf,
    /// Domain appended to the site name (`<site>.<base_domain>`)
    pub base_domain: String,
    pub url_scheme: UrlScheme,
    /// Full URL override; when unset the URL is derived from the site name
    pub site_url: Option<String>,
    /// Blog title used by `wp core install`; defaults to the site name
    pub site_title: Option<String>,
    /// Locale passed to `wp core download`
    pub locale: String,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub wp_config: WpConfigSettings,
    pub migration: MigrationConfig,
    pub readiness: ReadinessConfig,
    pub tools: ToolPaths,
}

/// Database server, naming and credential settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub root_user: String,
    pub root_password: String,
    /// Prefix prepended to the site name to form the database name
    pub name_prefix: String,
    pub charset: String,
    pub collation: String,
    /// WordPress table prefix (`$table_prefix`)
    pub table_prefix: String,
    pub dedicated_user: DedicatedUserConfig,
    pub container: Option<ContainerConfig>,
}

/// Dedicated (scoped) database user settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedicatedUserConfig {
    pub enabled: bool,
    /// Host part of the MySQL account (`'user'@'host'`)
    pub user_host: String,
    /// Privileges granted on the site database only
    pub privileges: Vec<String>,
    pub password_length: usize,
}

/// Container-hosted database server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    pub name: String,
    pub image: String,
    /// Host port published to the container's 3306
    pub host_port: u16,
    pub volume: String,
    pub network: String,
}

/// The single administrative account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub login: String,
    pub email: String,
    pub password: String,
}

/// Settings injected into wp-config.php
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WpConfigSettings {
    /// Remote secret-key generator
    pub salt_endpoint: String,
    pub debug: bool,
    pub debug_log: bool,
    pub debug_display: bool,
    pub disallow_file_edit: bool,
    pub memory_limit: Option<String>,
    /// Raw PHP lines added before the "stop editing" marker
    pub extra_lines: Vec<String>,
}

/// Dump import and URL rewriting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// URL the dump was exported from, e.g. `https://example.com`
    pub source_url: Option<String>,
    pub optimize_tables: bool,
    pub repair_tables: bool,
    pub dry_run: bool,
    /// Set `home` and `siteurl` to the site URL after replacements
    pub update_site_options: bool,
    /// User-supplied rules, applied after the URL and domain rules
    pub replacements: Vec<RuleConfig>,
}

/// A user-supplied search/replace pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub search: String,
    pub replace: String,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub regex: bool,
}

/// Readiness polling budget
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub attempts: u32,
    pub delay_secs: u64,
}

/// Program names (or paths) for each external tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub docker: String,
    pub mysql: String,
    pub wp: String,
}

impl ToolPaths {
    /// Program to execute for `tool`
    pub fn program(&self, tool: Tool) -> &str {
        match tool {
            Tool::Docker => &self.docker,
            Tool::Mysql => &self.mysql,
            Tool::Wp => &self.wp,
        }
    }
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            sites_root: PathBuf::from("/var/www"),
            base_domain: "test".to_string(),
            url_scheme: UrlScheme::Http,
            site_url: None,
            site_title: None,
            locale: "en_US".to_string(),
            database: DatabaseConfig::default(),
            admin: AdminConfig::default(),
            wp_config: WpConfigSettings::default(),
            migration: MigrationConfig::default(),
            readiness: ReadinessConfig::default(),
            tools: ToolPaths::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            root_user: "root".to_string(),
            root_password: String::new(),
            name_prefix: "wp_".to_string(),
            charset: "utf8mb4".to_string(),
            collation: "utf8mb4_unicode_ci".to_string(),
            table_prefix: "wp_".to_string(),
            dedicated_user: DedicatedUserConfig::default(),
            container: None,
        }
    }
}

impl Default for DedicatedUserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_host: "%".to_string(),
            privileges: [
                "SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "INDEX",
                "LOCK TABLES", "CREATE TEMPORARY TABLES",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            password_length: 16,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "sitesmith-mysql".to_string(),
            image: "mysql:8.0".to_string(),
            host_port: 3306,
            volume: "sitesmith-mysql-data".to_string(),
            network: "sitesmith".to_string(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            login: "admin".to_string(),
            email: "admin@example.com".to_string(),
            password: String::new(),
        }
    }
}

impl Default for WpConfigSettings {
    fn default() -> Self {
        Self {
            salt_endpoint: "https://api.wordpress.org/secret-key/1.1/salt/".to_string(),
            debug: false,
            debug_log: false,
            debug_display: false,
            disallow_file_edit: true,
            memory_limit: None,
            extra_lines: Vec::new(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            optimize_tables: true,
            repair_tables: false,
            dry_run: false,
            update_site_options: true,
            replacements: Vec::new(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay_secs: 2,
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            mysql: "mysql".to_string(),
            wp: "wp".to_string(),
        }
    }
}

impl SiteConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            SiteError::config(format!(
                "Failed to read configuration from {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON text
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| SiteError::config(format!("Failed to parse configuration JSON: {}", e)))
    }

    /// True when the database server is container-hosted
    pub fn container_mode(&self) -> bool {
        self.database
            .container
            .as_ref()
            .is_some_and(|c| c.enabled)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let db = &self.database;

        if db.host.trim().is_empty() {
            return Err(SiteError::config("Database host must be specified"));
        }
        if db.port == 0 {
            return Err(SiteError::config("Database port must be non-zero"));
        }
        if db.root_user.trim().is_empty() {
            return Err(SiteError::config("Database root user must be specified"));
        }

        for (label, value) in [
            ("name_prefix", &db.name_prefix),
            ("charset", &db.charset),
            ("collation", &db.collation),
            ("table_prefix", &db.table_prefix),
        ] {
            if !is_plain_identifier(value, label == "name_prefix") {
                return Err(SiteError::config(format!(
                    "database.{} may only contain letters, digits and underscores: {:?}",
                    label, value
                )));
            }
        }

        if db.dedicated_user.enabled {
            let user = &db.dedicated_user;
            if user.privileges.is_empty() {
                return Err(SiteError::config(
                    "Dedicated user mode requires at least one privilege",
                ));
            }
            if let Some(bad) = user.privileges.iter().find(|p| !is_known_privilege(p)) {
                return Err(SiteError::config(format!("Unknown privilege: {:?}", bad)));
            }
            if !(8..=64).contains(&user.password_length) {
                return Err(SiteError::config(
                    "Dedicated user password length must be 8-64 characters",
                ));
            }
            if user.user_host.is_empty() || user.user_host.contains(['\'', '\\', '`']) {
                return Err(SiteError::config(format!(
                    "Invalid dedicated user host: {:?}",
                    user.user_host
                )));
            }
        }

        if let Some(container) = db.container.as_ref().filter(|c| c.enabled) {
            for (label, value) in [
                ("name", &container.name),
                ("image", &container.image),
                ("volume", &container.volume),
                ("network", &container.network),
            ] {
                if value.trim().is_empty() {
                    return Err(SiteError::config(format!(
                        "database.container.{} must be specified",
                        label
                    )));
                }
            }
            if container.host_port == 0 {
                return Err(SiteError::config("Container host port must be non-zero"));
            }
        }

        let login = self.admin.login.trim();
        if login.is_empty() || login.len() > 60 {
            return Err(SiteError::config("Admin login must be 1-60 characters long"));
        }
        if !login
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
        {
            return Err(SiteError::config(
                "Admin login can only contain letters, numbers, '_', '-', '.', '@'",
            ));
        }
        if !self.admin.email.contains('@') {
            return Err(SiteError::config("Admin email must contain '@'"));
        }

        if self.readiness.attempts == 0 {
            return Err(SiteError::config("Readiness attempts must be at least 1"));
        }

        if self.base_domain.trim().is_empty() && self.site_url.is_none() {
            return Err(SiteError::config(
                "Either base_domain or site_url must be specified",
            ));
        }

        if let Some(rule) = self
            .migration
            .replacements
            .iter()
            .find(|r| r.search.is_empty())
        {
            return Err(SiteError::config(format!(
                "Replacement rule with empty search value (replace = {:?})",
                rule.replace
            )));
        }

        Ok(())
    }
}

/// Letters, digits and underscores; `allow_empty` for optional prefixes
fn is_plain_identifier(value: &str, allow_empty: bool) -> bool {
    if value.is_empty() {
        return allow_empty;
    }
    value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SiteConfig {
        let mut config = SiteConfig::default();
        config.database.root_password = "rootpw".to_string();
        config.admin.password = "adminpw".to_string();
        config
    }

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config = SiteConfig::from_json(r#"{ "database": { "root_password": "x" } }"#)
            .expect("minimal document should parse");
        assert_eq!(config.database.port, 3306);
        assert_eq!(config.database.table_prefix, "wp_");
        assert_eq!(config.readiness.attempts, 30);
        assert_eq!(config.readiness.delay_secs, 2);
        assert_eq!(config.database.dedicated_user.password_length, 16);
        assert!(!config.container_mode());
    }

    #[test]
    fn test_container_section_enables_container_mode() {
        let config = SiteConfig::from_json(
            r#"{ "database": { "container": { "name": "db", "host_port": 3307 } } }"#,
        )
        .expect("container document should parse");
        assert!(config.container_mode());
        let container = config.database.container.as_ref().expect("container");
        assert_eq!(container.image, "mysql:8.0");
        assert_eq!(container.host_port, 3307);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_table_prefix() {
        let mut config = valid_config();
        config.database.table_prefix = "wp'; DROP".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_privilege() {
        let mut config = valid_config();
        config.database.dedicated_user.enabled = true;
        config.database.dedicated_user.privileges = vec!["SELECT".into(), "GRANT OPTION".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("GRANT OPTION"));
    }

    #[test]
    fn test_validate_rejects_empty_search_rule() {
        let mut config = valid_config();
        config.migration.replacements.push(RuleConfig {
            search: String::new(),
            replace: "x".to_string(),
            case_insensitive: false,
            regex: false,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("site.json");
        let mut config = valid_config();
        config.migration.source_url = Some("https://example.com".to_string());
        config.save_to_file(&path).expect("save");

        let loaded = SiteConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded.migration.source_url.as_deref(), Some("https://example.com"));
        assert_eq!(loaded.database.root_password, "rootpw");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = SiteConfig::load_from_file("/nonexistent/site.json").unwrap_err();
        assert!(matches!(err, SiteError::Config(_)));
    }
}
