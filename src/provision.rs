//! Database Provisioner
//!
//! Recreates the site database from scratch on every run and, in
//! dedicated-user mode, creates an account limited to that database.
//!
//! Dropping is unconditional. A previous database with the same name is gone
//! after `provision` returns, whatever it contained.

use rand::Rng;
use tracing::{debug, info};

use crate::db::{SqlClient, escape_like, quote_ident, quote_literal};
use crate::error::{Result, SiteError};
use crate::site::{Credential, DatabaseTarget, DedicatedUser, SiteContext};

/// MySQL limit on account names
pub const MAX_USER_LEN: usize = 32;

/// Characters used for generated passwords.
///
/// The symbols are inert inside single-quoted SQL and PHP literals.
const PASSWORD_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!#%*+-=?@^_~";

/// Outcome of a successful provisioning run
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub db_name: String,
    /// Credential every later stage connects with
    pub credential: Credential,
}

/// Creates the database and (optionally) a scoped account
pub struct Provisioner<'a, C> {
    client: C,
    target: &'a DatabaseTarget,
}

impl<'a, C: SqlClient> Provisioner<'a, C> {
    /// `client` must be authenticated with the root credential
    pub fn new(client: C, target: &'a DatabaseTarget) -> Self {
        Self { client, target }
    }

    /// Drop, create and verify the site database, then set up the dedicated
    /// user.
    ///
    /// # Errors
    ///
    /// Any failed statement is returned as `SiteError::Provisioning`. Nothing
    /// is rolled back: a user created before a failed grant stays behind.
    pub fn provision(&self, ctx: &SiteContext) -> Result<Provisioned> {
        let db_name = ctx.db_name();
        let db = quote_ident(db_name);

        info!(database = db_name, "recreating database");
        self.exec(&format!("DROP DATABASE IF EXISTS {}", db), "drop database")?;
        self.exec(
            &format!(
                "CREATE DATABASE {} CHARACTER SET {} COLLATE {}",
                db, self.target.charset, self.target.collation
            ),
            "create database",
        )?;
        self.verify_exists(db_name)?;

        let credential = match &self.target.dedicated_user {
            Some(settings) => self.create_scoped_user(ctx.name(), db_name, settings)?,
            None => self.target.root.clone(),
        };

        Ok(Provisioned {
            db_name: db_name.to_string(),
            credential,
        })
    }

    fn verify_exists(&self, db_name: &str) -> Result<()> {
        let sql = format!(
            "SHOW DATABASES LIKE {}",
            quote_literal(&escape_like(db_name))
        );
        let rows = self.client.execute(&sql).map_err(|e| {
            SiteError::provisioning(format!("could not verify database {}: {}", db_name, e))
        })?;

        let found = rows
            .iter()
            .any(|row| row.first().and_then(Option::as_deref) == Some(db_name));
        if !found {
            return Err(SiteError::provisioning(format!(
                "database {} does not exist after CREATE DATABASE",
                db_name
            )));
        }
        debug!(database = db_name, "database verified");
        Ok(())
    }

    fn create_scoped_user(
        &self,
        site_name: &str,
        db_name: &str,
        settings: &DedicatedUser,
    ) -> Result<Credential> {
        let user = scoped_username(site_name);
        let password = generate_password(settings.password_length);
        let account = format!("{}@{}", quote_literal(&user), quote_literal(&settings.user_host));

        info!(user = %user, host = %settings.user_host, "creating dedicated database user");
        self.exec(
            &format!(
                "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {}",
                account,
                quote_literal(&password)
            ),
            "create user",
        )?;
        // A user left over from an earlier run keeps its old password otherwise
        self.exec(
            &format!("ALTER USER {} IDENTIFIED BY {}", account, quote_literal(&password)),
            "set user password",
        )?;
        self.exec(
            &format!(
                "GRANT {} ON {}.* TO {}",
                settings.privileges.join(", "),
                quote_ident(db_name),
                account
            ),
            "grant privileges",
        )?;
        self.exec("FLUSH PRIVILEGES", "flush privileges")?;

        Ok(Credential::scoped(user, password))
    }

    fn exec(&self, sql: &str, what: &str) -> Result<()> {
        self.client
            .execute(sql)
            .map(|_| ())
            .map_err(|e| SiteError::provisioning(format!("{} failed: {}", what, e)))
    }
}

/// Account name for a site's dedicated user
pub fn scoped_username(site_name: &str) -> String {
    const SUFFIX: &str = "_wp";
    let stem: String = site_name.chars().take(MAX_USER_LEN - SUFFIX.len()).collect();
    format!("{}{}", stem, SUFFIX)
}

/// Random password of `length` characters from `PASSWORD_ALPHABET`
pub fn generate_password(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::SiteConfig;
    use crate::db::Row;
    use std::cell::RefCell;

    /// Records statements; `SHOW DATABASES` answers with `listed`
    struct Recorder {
        statements: RefCell<Vec<String>>,
        listed: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn listing(names: &[&str]) -> Self {
            Self {
                statements: RefCell::new(Vec::new()),
                listed: names.iter().map(|n| n.to_string()).collect(),
                fail_on: None,
            }
        }
    }

    impl SqlClient for Recorder {
        fn execute(&self, sql: &str) -> Result<Vec<Row>> {
            self.statements.borrow_mut().push(sql.to_string());
            if self.fail_on.is_some_and(|prefix| sql.starts_with(prefix)) {
                return Err(SiteError::tool("mysql", Some(1), "ERROR 1044: Access denied"));
            }
            if sql.starts_with("SHOW DATABASES") {
                return Ok(self.listed.iter().map(|n| vec![Some(n.clone())]).collect());
            }
            Ok(Vec::new())
        }
    }

    fn target(dedicated: bool) -> DatabaseTarget {
        let mut config = SiteConfig::default();
        config.database.root_password = "rootpw".to_string();
        config.database.dedicated_user.enabled = dedicated;
        DatabaseTarget::from_config(&config)
    }

    fn demo() -> SiteContext {
        SiteContext::new("demo", &SiteConfig::default()).expect("valid site")
    }

    #[test]
    fn test_drop_create_verify() {
        let client = Recorder::listing(&["wp_demo"]);
        let target = target(false);
        let provisioned = Provisioner::new(&client, &target)
            .provision(&demo())
            .expect("provision");

        assert!(!provisioned.credential.scoped);
        assert_eq!(provisioned.credential.user, "root");
        assert_eq!(
            *client.statements.borrow(),
            vec![
                "DROP DATABASE IF EXISTS `wp_demo`",
                "CREATE DATABASE `wp_demo` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                "SHOW DATABASES LIKE 'wp\\\\_demo'",
            ]
        );
    }

    #[test]
    fn test_verify_requires_exact_match() {
        // LIKE escaping aside, a near-miss row must not count
        let client = Recorder::listing(&["wp_demo2"]);
        let target = target(false);
        let err = Provisioner::new(&client, &target)
            .provision(&demo())
            .unwrap_err();
        assert!(matches!(err, SiteError::Provisioning(_)));
    }

    #[test]
    fn test_dedicated_user_statements() {
        let client = Recorder::listing(&["wp_demo"]);
        let target = target(true);
        let provisioned = Provisioner::new(&client, &target)
            .provision(&demo())
            .expect("provision");

        let cred = &provisioned.credential;
        assert!(cred.scoped);
        assert_eq!(cred.user, "demo_wp");
        assert_eq!(cred.password.len(), 16);

        let statements = client.statements.borrow();
        assert!(statements[3].starts_with("CREATE USER IF NOT EXISTS 'demo_wp'@'%' IDENTIFIED BY '"));
        assert!(statements[4].starts_with("ALTER USER 'demo_wp'@'%'"));
        assert!(statements[5].starts_with("GRANT SELECT, INSERT, UPDATE"));
        assert!(statements[5].ends_with("ON `wp_demo`.* TO 'demo_wp'@'%'"));
        assert_eq!(statements[6], "FLUSH PRIVILEGES");
    }

    #[test]
    fn test_grant_failure_aborts_without_cleanup() {
        let mut client = Recorder::listing(&["wp_demo"]);
        client.fail_on = Some("GRANT");
        let target = target(true);
        let err = Provisioner::new(&client, &target)
            .provision(&demo())
            .unwrap_err();

        assert!(err.to_string().contains("grant privileges failed"));
        let statements = client.statements.borrow();
        assert!(!statements.iter().any(|s| s.starts_with("DROP USER")));
        assert!(statements.last().is_some_and(|s| s.starts_with("GRANT")));
    }

    #[test]
    fn test_generated_password_is_literal_safe() {
        for _ in 0..50 {
            let password = generate_password(32);
            assert_eq!(password.chars().count(), 32);
            assert!(!password.contains(['\'', '\\', '"', '`', '$']));
        }
    }

    #[test]
    fn test_scoped_username_is_bounded() {
        assert_eq!(scoped_username("blog"), "blog_wp");
        assert_eq!(scoped_username(&"x".repeat(64)).len(), MAX_USER_LEN);
    }
}
