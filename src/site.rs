//! Per-run site identity and database target
//!
//! `SiteContext` and `DatabaseTarget` are derived once from the CLI input and
//! the configuration document, then passed by reference to every stage.

use std::fmt;
use std::path::PathBuf;

use crate::config_file::SiteConfig;
use crate::error::{Result, SiteError};

/// Longest accepted site name
pub const MAX_SITE_NAME_LEN: usize = 64;

/// Identity of the site being provisioned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteContext {
    name: String,
    root: PathBuf,
    db_name: String,
    url: String,
    domain: String,
    title: String,
}

impl SiteContext {
    /// Build the context for `name` from the configuration
    pub fn new(name: &str, config: &SiteConfig) -> Result<Self> {
        validate_site_name(name)?;

        let url = match config.site_url.as_deref() {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}://{}.{}", config.url_scheme, name, config.base_domain),
        };
        let domain = domain_of(&url).to_string();
        if domain.is_empty() {
            return Err(SiteError::validation(format!("Site URL has no host: {:?}", url)));
        }

        Ok(Self {
            name: name.to_string(),
            root: config.sites_root.join(name),
            db_name: format!("{}{}", config.database.name_prefix, name),
            url,
            domain,
            title: config.site_title.clone().unwrap_or_else(|| name.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document root of the site
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// External base URL, without trailing slash
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host part of the base URL
    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn title(&self) -> &str {
        &self.title
    }
}

/// Site names: ASCII letters, digits, hyphen, underscore
pub fn validate_site_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SiteError::validation("Site name must not be empty"));
    }
    if name.len() > MAX_SITE_NAME_LEN {
        return Err(SiteError::validation(format!(
            "Site name must be at most {} characters",
            MAX_SITE_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(SiteError::validation(format!(
            "Site name can only contain letters, numbers, '-' and '_': {:?}",
            name
        )));
    }
    Ok(())
}

/// Host part of a URL: scheme, credentials, port and path stripped
pub fn domain_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host_port = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host_port = host_port.rsplit_once('@').map_or(host_port, |(_, h)| h);
    host_port.split(':').next().unwrap_or(host_port)
}

/// Username/password pair for the database server
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: String,
    /// True for a generated credential scoped to one database
    pub scoped: bool,
}

impl Credential {
    pub fn root(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            scoped: false,
        }
    }

    pub fn scoped(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            scoped: true,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("scoped", &self.scoped)
            .finish()
    }
}

/// Container that hosts the database server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub root_password: String,
    pub volume: String,
    pub network: String,
}

/// Dedicated-user grant settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedicatedUser {
    pub user_host: String,
    pub privileges: Vec<String>,
    pub password_length: usize,
}

/// Where and how to reach the database server
#[derive(Debug, Clone)]
pub struct DatabaseTarget {
    pub host: String,
    pub port: u16,
    pub root: Credential,
    pub charset: String,
    pub collation: String,
    pub table_prefix: String,
    pub dedicated_user: Option<DedicatedUser>,
    pub container: Option<ContainerSpec>,
}

impl DatabaseTarget {
    /// Derive the target from the configuration document
    pub fn from_config(config: &SiteConfig) -> Self {
        let db = &config.database;
        let container = db
            .container
            .as_ref()
            .filter(|c| c.enabled)
            .map(|c| ContainerSpec {
                name: c.name.clone(),
                image: c.image.clone(),
                host_port: c.host_port,
                root_password: db.root_password.clone(),
                volume: c.volume.clone(),
                network: c.network.clone(),
            });

        // A containerized server is reached through its published port
        let port = container.as_ref().map_or(db.port, |c| c.host_port);

        let dedicated_user = db.dedicated_user.enabled.then(|| DedicatedUser {
            user_host: db.dedicated_user.user_host.clone(),
            privileges: db
                .dedicated_user
                .privileges
                .iter()
                .map(|p| p.trim().to_ascii_uppercase())
                .collect(),
            password_length: db.dedicated_user.password_length,
        });

        Self {
            host: db.host.clone(),
            port,
            root: Credential::root(&db.root_user, &db.root_password),
            charset: db.charset.clone(),
            collation: db.collation.clone(),
            table_prefix: db.table_prefix.clone(),
            dedicated_user,
            container,
        }
    }

    /// `host:port` as written into DB_HOST
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Prefixed table name, e.g. `wp_options`
    pub fn table(&self, base: &str) -> String {
        format!("{}{}", self.table_prefix, base)
    }
}
