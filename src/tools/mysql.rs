//! Type-safe arguments for the MySQL command-line client.
//!
//! # Password Handling
//!
//! The password is exported as `MYSQL_PWD` instead of `--password=...`.
//! Statements go to the client's stdin rather than `--execute`, since
//! `CREATE USER ... IDENTIFIED BY` embeds a password in the SQL itself.

use std::path::PathBuf;

use crate::command::ToolArgs;
use crate::site::Credential;
use crate::types::Tool;

/// Server address plus the credential to log in with
#[derive(Debug, Clone)]
pub struct MysqlConnection {
    pub host: String,
    pub port: u16,
    pub credential: Credential,
}

impl MysqlConnection {
    fn base_args(&self) -> Vec<String> {
        vec![
            "--protocol=TCP".to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--user".to_string(),
            self.credential.user.clone(),
        ]
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![("MYSQL_PWD".to_string(), self.credential.password.clone())]
    }
}

// ============================================================================
// Execute
// ============================================================================

/// `mysql --batch --skip-column-names <<< <sql>`
///
/// Batch mode prints one row per line with tab-separated columns and
/// escapes embedded tabs, newlines and backslashes.
#[derive(Debug, Clone)]
pub struct ExecuteArgs {
    pub connection: MysqlConnection,
    pub database: Option<String>,
    pub sql: String,
}

impl ToolArgs for ExecuteArgs {
    fn tool(&self) -> Tool {
        Tool::Mysql
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.connection.base_args();
        args.push("--batch".to_string());
        args.push("--skip-column-names".to_string());
        if let Some(db) = &self.database {
            args.push("--database".to_string());
            args.push(db.clone());
        }
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.connection.env()
    }

    fn stdin_text(&self) -> Option<String> {
        Some(format!("{};\n", self.sql.trim_end().trim_end_matches(';')))
    }
}

// ============================================================================
// Import
// ============================================================================

/// `mysql --database <db> < dump.sql`
#[derive(Debug, Clone)]
pub struct ImportArgs {
    pub connection: MysqlConnection,
    pub database: String,
    pub dump: PathBuf,
}

impl ToolArgs for ImportArgs {
    fn tool(&self) -> Tool {
        Tool::Mysql
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.connection.base_args();
        args.push("--database".to_string());
        args.push(self.database.clone());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.connection.env()
    }

    fn stdin_file(&self) -> Option<&std::path::Path> {
        Some(&self.dump)
    }
}
