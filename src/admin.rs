//! Admin Identity Reconciler
//!
//! Makes sure the configured administrator login exists and carries the
//! configured password, whatever state the imported dump (or a previous run)
//! left the account table in.
//!
//! ```text
//! Unknown ──COUNT(*)──▶ Exists ──UPDATE user_pass + capabilities──▶ Reconciled
//!                  └──▶ Absent ──INSERT user + capabilities───────▶ Reconciled
//! ```
//!
//! An existence query that fails is treated as `Absent`. More than one row
//! with the login is an error: the table is left untouched for the operator.

use std::fmt;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, run_tool};
use crate::config_file::{AdminConfig, ToolPaths};
use crate::db::{SqlClient, quote_ident, quote_literal};
use crate::error::{Result, SiteError};
use crate::tools::wp::{HashPasswordArgs, WpTarget};
use crate::types::Tool;

/// Serialized PHP capability array for the administrator role
pub const ADMIN_CAPABILITIES: &str = r#"a:1:{s:13:"administrator";b:1;}"#;
pub const ADMIN_USER_LEVEL: &str = "10";

/// Prefix of hashes produced without WordPress
pub const WEAK_HASH_PREFIX: &str = "$sha256-weak$";

/// The administrative account to enforce
#[derive(Clone)]
pub struct AdminAccount {
    pub login: String,
    pub email: String,
    password: String,
}

impl AdminAccount {
    pub fn new(login: impl Into<String>, email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// URL-safe slug of the login
    pub fn nicename(&self) -> String {
        self.login
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
            .collect()
    }
}

impl From<&AdminConfig> for AdminAccount {
    fn from(config: &AdminConfig) -> Self {
        Self::new(&config.login, &config.email, &config.password)
    }
}

impl fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAccount")
            .field("login", &self.login)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Unknown,
    Exists,
    Absent,
    Reconciled,
}

/// Which hashing path produced the stored hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    WordPress,
    /// Unsalted SHA-256; WordPress will not accept it for login
    WeakFallback,
}

/// Result of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// A new row was inserted
    pub created: bool,
    /// False only when the user's ID could not be read back
    pub capabilities_granted: bool,
    pub hash_kind: HashKind,
}

// ============================================================================
// Hashing
// ============================================================================

/// Produces the value stored in `user_pass`
pub trait PasswordHasher {
    fn hash(&self, plaintext: &str) -> Result<String>;
}

impl<H: PasswordHasher + ?Sized> PasswordHasher for &H {
    fn hash(&self, plaintext: &str) -> Result<String> {
        (**self).hash(plaintext)
    }
}

/// `wp_hash_password()` evaluated by WP-CLI
pub struct WpCliHasher<'a, R> {
    runner: R,
    tools: &'a ToolPaths,
    target: WpTarget,
}

impl<'a, R: CommandRunner> WpCliHasher<'a, R> {
    pub fn new(runner: R, tools: &'a ToolPaths, target: WpTarget) -> Self {
        Self {
            runner,
            tools,
            target,
        }
    }
}

impl<R: CommandRunner> PasswordHasher for WpCliHasher<'_, R> {
    fn hash(&self, plaintext: &str) -> Result<String> {
        let args = HashPasswordArgs {
            target: self.target.clone(),
            plaintext: plaintext.to_string(),
        };
        let output = run_tool(&self.runner, self.tools, &args)?;
        let hash = output.stdout.trim();
        if hash.is_empty() {
            return Err(SiteError::tool(
                self.tools.program(Tool::Wp),
                output.exit_code,
                "wp_hash_password printed nothing",
            ));
        }
        Ok(hash.to_string())
    }
}

/// `$sha256-weak$<hex sha256>`
pub fn weak_hash(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    format!("{}{}", WEAK_HASH_PREFIX, hex::encode(digest))
}

/// Check `plaintext` against a stored fallback hash.
///
/// Hashes in WordPress's own formats cannot be checked here and yield false.
pub fn verify_password_hash(plaintext: &str, stored: &str) -> bool {
    stored.starts_with(WEAK_HASH_PREFIX) && weak_hash(plaintext) == stored
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct AdminReconciler<C, H> {
    client: C,
    hasher: H,
    table_prefix: String,
    state: AccountState,
}

impl<C: SqlClient, H: PasswordHasher> AdminReconciler<C, H> {
    /// `client` must have the site database selected
    pub fn new(client: C, hasher: H, table_prefix: impl Into<String>) -> Self {
        Self {
            client,
            hasher,
            table_prefix: table_prefix.into(),
            state: AccountState::Unknown,
        }
    }

    pub fn state(&self) -> AccountState {
        self.state
    }

    fn table(&self, base: &str) -> String {
        quote_ident(&format!("{}{}", self.table_prefix, base))
    }

    /// Enforce `account`'s password, creating the account if needed.
    ///
    /// # Errors
    ///
    /// `Reconciliation` when the login is held by several rows or an
    /// UPDATE/INSERT fails.
    pub fn reconcile(&mut self, account: &AdminAccount) -> Result<Reconciled> {
        self.state = self.detect(account)?;
        let (hash, hash_kind) = self.hash_password(account);

        let result = match self.state {
            AccountState::Exists => {
                info!(login = %account.login, "updating admin password");
                self.exec(
                    &format!(
                        "UPDATE {} SET user_pass = {} WHERE user_login = {}",
                        self.table("users"),
                        quote_literal(&hash),
                        quote_literal(&account.login)
                    ),
                    "update password",
                )?;
                Reconciled {
                    created: false,
                    capabilities_granted: self.grant_admin(account)?,
                    hash_kind,
                }
            }
            _ => {
                info!(login = %account.login, "creating admin account");
                let capabilities_granted = self.create(account, &hash)?;
                Reconciled {
                    created: true,
                    capabilities_granted,
                    hash_kind,
                }
            }
        };

        self.state = AccountState::Reconciled;
        Ok(result)
    }

    fn detect(&self, account: &AdminAccount) -> Result<AccountState> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE user_login = {}",
            self.table("users"),
            quote_literal(&account.login)
        );
        let count = match self.client.query_scalar(&sql) {
            Ok(value) => value.and_then(|v| v.trim().parse::<u64>().ok()).unwrap_or(0),
            Err(e) => {
                debug!(error = %e, "account lookup failed, treating as absent");
                return Ok(AccountState::Absent);
            }
        };
        match count {
            0 => Ok(AccountState::Absent),
            1 => Ok(AccountState::Exists),
            n => Err(SiteError::reconciliation(format!(
                "{} rows share the login '{}'; remove the duplicates and rerun",
                n, account.login
            ))),
        }
    }

    fn hash_password(&self, account: &AdminAccount) -> (String, HashKind) {
        match self.hasher.hash(account.password()) {
            Ok(hash) => (hash, HashKind::WordPress),
            Err(e) => {
                warn!(
                    error = %e,
                    "SECURITY: WordPress password hashing unavailable, storing unsalted SHA-256 hash; reset the admin password from the dashboard"
                );
                (weak_hash(account.password()), HashKind::WeakFallback)
            }
        }
    }

    /// Insert the user and grant administrator capabilities
    fn create(&self, account: &AdminAccount, hash: &str) -> Result<bool> {
        let registered = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.exec(
            &format!(
                "INSERT INTO {} (user_login, user_pass, user_nicename, user_email, user_registered, user_activation_key, user_status, display_name) VALUES ({}, {}, {}, {}, {}, '', 0, {})",
                self.table("users"),
                quote_literal(&account.login),
                quote_literal(hash),
                quote_literal(&account.nicename()),
                quote_literal(&account.email),
                quote_literal(&registered),
                quote_literal(&account.login)
            ),
            "insert user",
        )?;
        self.grant_admin(account)
    }

    /// Replace the user's capability and level metadata with administrator
    /// values. False when the user's ID cannot be read back.
    fn grant_admin(&self, account: &AdminAccount) -> Result<bool> {
        let id_sql = format!(
            "SELECT ID FROM {} WHERE user_login = {} ORDER BY ID DESC LIMIT 1",
            self.table("users"),
            quote_literal(&account.login)
        );
        let id = self
            .client
            .query_scalar(&id_sql)
            .map_err(|e| SiteError::reconciliation(format!("could not read user ID: {}", e)))?
            .and_then(|v| v.trim().parse::<u64>().ok());

        let Some(id) = id else {
            warn!(login = %account.login, "admin user ID not found, capabilities not granted");
            return Ok(false);
        };

        let usermeta = self.table("usermeta");
        for (key, value) in [
            (format!("{}capabilities", self.table_prefix), ADMIN_CAPABILITIES),
            (format!("{}user_level", self.table_prefix), ADMIN_USER_LEVEL),
        ] {
            self.exec(
                &format!(
                    "DELETE FROM {} WHERE user_id = {} AND meta_key = {}",
                    usermeta,
                    id,
                    quote_literal(&key)
                ),
                "clear capabilities",
            )?;
            self.exec(
                &format!(
                    "INSERT INTO {} (user_id, meta_key, meta_value) VALUES ({}, {}, {})",
                    usermeta,
                    id,
                    quote_literal(&key),
                    quote_literal(value)
                ),
                "grant capabilities",
            )?;
        }
        Ok(true)
    }

    fn exec(&self, sql: &str, what: &str) -> Result<()> {
        self.client
            .execute(sql)
            .map(|_| ())
            .map_err(|e| SiteError::reconciliation(format!("{} failed: {}", what, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Row;
    use std::cell::RefCell;

    struct Fixed(&'static str);

    impl PasswordHasher for Fixed {
        fn hash(&self, _plaintext: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Broken;

    impl PasswordHasher for Broken {
        fn hash(&self, _plaintext: &str) -> Result<String> {
            Err(SiteError::tool("wp", Some(1), "Error: This does not seem to be a WordPress installation."))
        }
    }

    /// Answers COUNT(*) with `count` and SELECT ID with `id`
    struct Accounts {
        count: Option<&'static str>,
        id: Option<&'static str>,
        seen: RefCell<Vec<String>>,
    }

    impl Accounts {
        fn new(count: Option<&'static str>, id: Option<&'static str>) -> Self {
            Self {
                count,
                id,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl SqlClient for Accounts {
        fn execute(&self, sql: &str) -> Result<Vec<Row>> {
            self.seen.borrow_mut().push(sql.to_string());
            let reply = if sql.starts_with("SELECT COUNT(*)") {
                match self.count {
                    Some(c) => Some(c),
                    None => return Err(SiteError::tool("mysql", Some(1), "no such table")),
                }
            } else if sql.starts_with("SELECT ID") {
                self.id
            } else {
                None
            };
            Ok(reply
                .map(|v| vec![vec![Some(v.to_string())]])
                .unwrap_or_default())
        }
    }

    fn account() -> AdminAccount {
        AdminAccount::new("admin", "admin@example.com", "s3cret pass")
    }

    #[test]
    fn test_existing_account_gets_password_update() {
        let client = Accounts::new(Some("1"), None);
        let mut reconciler = AdminReconciler::new(&client, Fixed("$P$Bhash"), "wp_");
        let result = reconciler.reconcile(&account()).expect("reconcile");

        assert!(!result.created);
        assert!(!result.capabilities_granted);
        assert_eq!(result.hash_kind, HashKind::WordPress);
        assert_eq!(reconciler.state(), AccountState::Reconciled);
        let seen = client.seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[1],
            "UPDATE `wp_users` SET user_pass = '$P$Bhash' WHERE user_login = 'admin'"
        );
    }

    #[test]
    fn test_existing_account_is_promoted_to_admin() {
        let client = Accounts::new(Some("1"), Some("4"));
        let result = AdminReconciler::new(&client, Fixed("$P$Bhash"), "wp_")
            .reconcile(&account())
            .expect("reconcile");

        assert!(result.capabilities_granted);
        let seen = client.seen.borrow();
        assert_eq!(
            seen[3],
            "DELETE FROM `wp_usermeta` WHERE user_id = 4 AND meta_key = 'wp_capabilities'"
        );
        assert_eq!(
            seen[4],
            r#"INSERT INTO `wp_usermeta` (user_id, meta_key, meta_value) VALUES (4, 'wp_capabilities', 'a:1:{s:13:"administrator";b:1;}')"#
        );
        assert!(seen[6].ends_with("VALUES (4, 'wp_user_level', '10')"));
    }

    #[test]
    fn test_duplicate_logins_are_rejected() {
        let client = Accounts::new(Some("2"), Some("9"));
        let mut reconciler = AdminReconciler::new(&client, Fixed("h"), "wp_");
        let err = reconciler.reconcile(&account()).unwrap_err();

        assert!(matches!(err, SiteError::Reconciliation(_)));
        assert_ne!(reconciler.state(), AccountState::Reconciled);
        assert_eq!(client.seen.borrow().len(), 1);
    }

    #[test]
    fn test_absent_account_is_created_with_capabilities() {
        let client = Accounts::new(Some("0"), Some("7"));
        let mut reconciler = AdminReconciler::new(&client, Fixed("$P$Bhash"), "wp_");
        let result = reconciler.reconcile(&account()).expect("reconcile");

        assert!(result.created);
        assert!(result.capabilities_granted);
        let seen = client.seen.borrow();
        assert!(seen[1].starts_with("INSERT INTO `wp_users` (user_login, user_pass"));
        assert!(seen[1].contains("'admin@example.com'"));
        assert_eq!(
            seen[4],
            r#"INSERT INTO `wp_usermeta` (user_id, meta_key, meta_value) VALUES (7, 'wp_capabilities', 'a:1:{s:13:"administrator";b:1;}')"#
        );
        assert_eq!(
            seen[6],
            "INSERT INTO `wp_usermeta` (user_id, meta_key, meta_value) VALUES (7, 'wp_user_level', '10')"
        );
    }

    #[test]
    fn test_registration_timestamp_format() {
        let client = Accounts::new(Some("0"), Some("1"));
        AdminReconciler::new(&client, Fixed("h"), "wp_")
            .reconcile(&account())
            .expect("reconcile");
        let insert = client.seen.borrow()[1].clone();
        let stamp = regex::Regex::new(r"'\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}'").expect("regex");
        assert!(stamp.is_match(&insert));
    }

    #[test]
    fn test_lookup_failure_means_absent() {
        let client = Accounts::new(None, Some("3"));
        let mut reconciler = AdminReconciler::new(&client, Fixed("h"), "wp_");
        let result = reconciler.reconcile(&account()).expect("reconcile");
        assert!(result.created);
    }

    #[test]
    fn test_missing_id_skips_grant() {
        let client = Accounts::new(Some("0"), None);
        let mut reconciler = AdminReconciler::new(&client, Fixed("h"), "wp_");
        let result = reconciler.reconcile(&account()).expect("reconcile");
        assert!(result.created);
        assert!(!result.capabilities_granted);
        assert!(!client.seen.borrow().iter().any(|s| s.contains("usermeta")));
    }

    #[test]
    fn test_hash_fallback_verifies() {
        let client = Accounts::new(Some("1"), None);
        let mut reconciler = AdminReconciler::new(&client, Broken, "wp_");
        let result = reconciler.reconcile(&account()).expect("reconcile");
        assert_eq!(result.hash_kind, HashKind::WeakFallback);

        let stored = weak_hash("s3cret pass");
        assert!(client.seen.borrow()[1].contains(&stored));
        assert!(verify_password_hash("s3cret pass", &stored));
        assert!(!verify_password_hash("wrong", &stored));
        assert!(!verify_password_hash("s3cret pass", "$P$Bsomething"));
    }

    #[test]
    fn test_account_debug_redacts_password() {
        let debug = format!("{:?}", account());
        assert!(!debug.contains("s3cret"));
        assert_eq!(AdminAccount::new("Site Admin", "a@b", "x").nicename(), "site-admin");
    }
}
