//! Relational database access
//!
//! The engine talks to MySQL through the `SqlClient` trait: one statement in,
//! rows of text out. `MysqlCli` implements it with the `mysql` command-line
//! client in batch mode; tests substitute an in-memory fake.
//!
//! Identifiers and literals interpolated into statements must go through
//! `quote_ident` / `quote_literal`.

use crate::command::{CommandRunner, run_tool};
use crate::config_file::ToolPaths;
use crate::error::Result;
use crate::site::{Credential, DatabaseTarget};
use crate::tools::mysql::{ExecuteArgs, ImportArgs, MysqlConnection};

/// One result row; every column as text, `NULL` as `None`
pub type Row = Vec<Option<String>>;

/// Executes SQL statements against one server with one credential
pub trait SqlClient {
    /// Execute a statement and return its rows (empty for non-queries)
    fn execute(&self, sql: &str) -> Result<Vec<Row>>;

    /// First column of the first row, if any
    fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        Ok(self
            .execute(sql)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten()))
    }
}

impl<C: SqlClient + ?Sized> SqlClient for &C {
    fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        (**self).execute(sql)
    }
}

/// `SqlClient` backed by the `mysql` CLI
pub struct MysqlCli<R> {
    runner: R,
    tools: ToolPaths,
    connection: MysqlConnection,
    database: Option<String>,
}

impl<R: CommandRunner> MysqlCli<R> {
    /// Client for the server in `target`, logging in as `credential`
    pub fn new(runner: R, tools: ToolPaths, target: &DatabaseTarget, credential: Credential) -> Self {
        Self {
            runner,
            tools,
            connection: MysqlConnection {
                host: target.host.clone(),
                port: target.port,
                credential,
            },
            database: None,
        }
    }

    /// Select a default database for subsequent statements
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Load a dump file into `database` (stdin redirect)
    pub fn import(&self, database: &str, dump: &std::path::Path) -> Result<()> {
        let args = ImportArgs {
            connection: self.connection.clone(),
            database: database.to_string(),
            dump: dump.to_path_buf(),
        };
        run_tool(&self.runner, &self.tools, &args)?;
        Ok(())
    }
}

impl<R: CommandRunner> SqlClient for MysqlCli<R> {
    fn execute(&self, sql: &str) -> Result<Vec<Row>> {
        let args = ExecuteArgs {
            connection: self.connection.clone(),
            database: self.database.clone(),
            sql: sql.to_string(),
        };
        let output = run_tool(&self.runner, &self.tools, &args)?;
        Ok(parse_batch_output(&output.stdout))
    }
}

/// Parse `mysql --batch --skip-column-names` output
pub fn parse_batch_output(stdout: &str) -> Vec<Row> {
    // An empty line is a row holding one empty string
    stdout
        .lines()
        .map(|line| {
            line.split('\t')
                .map(|field| {
                    if field == "NULL" {
                        None
                    } else {
                        Some(unescape_batch_field(field))
                    }
                })
                .collect()
        })
        .collect()
}

/// Batch mode escapes `\t`, `\n`, `\\` and `\0` inside fields
fn unescape_batch_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Backtick-quote an identifier
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Single-quote a string literal with MySQL escapes
pub fn quote_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Escape `%`, `_` and `\` so `value` matches literally inside LIKE
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
