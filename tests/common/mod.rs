// Shared fixtures for the integration tests
//
// `FakeServer` stands in for docker, mysql and wp at the `CommandRunner`
// boundary. It keeps a tiny in-memory database and understands exactly the
// statements the engine emits; anything else fails like a syntax error.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use sitesmith::command::{CommandOutput, CommandRunner, CommandSpec};
use sitesmith::config_file::{ContainerConfig, SiteConfig};
use sitesmith::lifecycle::Sleeper;
use sitesmith::types::Tool;
use sitesmith::wp_config::SAMPLE_FILE;

pub const SAMPLE_CONFIG: &str = include_str!("../fixtures/wp-config-sample.php");

/// Columns plus rows keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl Table {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, values: &[&str]) -> Self {
        let row = self
            .columns
            .iter()
            .cloned()
            .zip(values.iter().map(|v| v.to_string()))
            .collect();
        self.rows.push(row);
        self
    }

    pub fn value_where(&self, column: &str, key: &str, key_value: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|row| row.get(key).map(String::as_str) == Some(key_value))
            .and_then(|row| row.get(column))
            .map(String::as_str)
    }

    pub fn count_where(&self, key: &str, key_value: &str) -> usize {
        self.rows
            .iter()
            .filter(|row| row.get(key).map(String::as_str) == Some(key_value))
            .count()
    }

    fn replace_all(&mut self, column: Option<&str>, search: &str, replace: &str) -> usize {
        let mut changed = 0;
        for row in &mut self.rows {
            for (name, value) in row.iter_mut() {
                if column.is_some_and(|c| c != name) || !value.contains(search) {
                    continue;
                }
                changed += value.matches(search).count();
                *value = value.replace(search, replace);
            }
        }
        changed
    }
}

pub type Tables = BTreeMap<String, Table>;

/// Mutable state of the fake world
#[derive(Debug, Default)]
pub struct State {
    /// `Some(running)` once a container exists
    pub container: Option<bool>,
    pub volumes: Vec<String>,
    pub networks: Vec<String>,
    /// Probe number (1-based) from which `SELECT 1` succeeds; `None` = never
    pub ready_on_probe: Option<u32>,
    pub probes: u32,
    pub databases: BTreeSet<String>,
    pub tables: Tables,
    /// Contents loaded by either importer
    pub dump: Tables,
    /// wp subcommands that exit non-zero (`search-replace`, `db`, `eval`, ...)
    pub failing_wp: BTreeSet<String>,
    pub commands: Vec<CommandSpec>,
    pub statements: Vec<String>,
}

pub struct FakeServer {
    pub state: RefCell<State>,
}

impl FakeServer {
    /// Externally managed server that answers the first probe
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                ready_on_probe: Some(1),
                ..State::default()
            }),
        }
    }

    pub fn with_container(self, running: bool) -> Self {
        self.state.borrow_mut().container = Some(running);
        self
    }

    pub fn ready_on_probe(self, probe: Option<u32>) -> Self {
        self.state.borrow_mut().ready_on_probe = probe;
        self
    }

    pub fn failing_wp(self, subcommands: &[&str]) -> Self {
        self.state
            .borrow_mut()
            .failing_wp
            .extend(subcommands.iter().map(|s| s.to_string()));
        self
    }

    pub fn with_dump(self, name: &str, table: Table) -> Self {
        self.state.borrow_mut().dump.insert(name.to_string(), table);
        self
    }

    pub fn with_table(self, name: &str, table: Table) -> Self {
        self.state.borrow_mut().tables.insert(name.to_string(), table);
        self
    }

    pub fn table(&self, name: &str) -> Table {
        self.state
            .borrow()
            .tables
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.borrow().statements.clone()
    }

    /// Every command line, as `program arg0 arg1 ...`
    pub fn command_lines(&self) -> Vec<String> {
        self.state
            .borrow()
            .commands
            .iter()
            .map(|spec| format!("{} {}", spec.program, spec.args.join(" ")))
            .collect()
    }

    pub fn commands_for(&self, tool: Tool) -> Vec<CommandSpec> {
        self.state
            .borrow()
            .commands
            .iter()
            .filter(|spec| spec.tool == tool)
            .cloned()
            .collect()
    }

    fn docker(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["inspect", .., name] => match state.container {
                Some(running) => CommandOutput::ok(format!("{}\n", running)),
                None => CommandOutput::failed(1, format!("Error: No such container: {}\n", name)),
            },
            ["volume", "create", name] => {
                state.volumes.push(name.to_string());
                CommandOutput::ok(format!("{}\n", name))
            }
            ["network", "create", name] => {
                state.networks.push(name.to_string());
                CommandOutput::ok("f3a1c9\n")
            }
            ["run", ..] => {
                state.container = Some(true);
                CommandOutput::ok("4be8a0d2\n")
            }
            ["start", name] => {
                state.container = Some(true);
                CommandOutput::ok(format!("{}\n", name))
            }
            _ => CommandOutput::failed(125, "docker: unknown command\n"),
        }
    }

    fn wp(&self, args: &[String]) -> CommandOutput {
        let path = args
            .iter()
            .find_map(|a| a.strip_prefix("--path="))
            .map(PathBuf::from)
            .unwrap_or_default();
        let words: Vec<&str> = args
            .iter()
            .filter(|a| !a.starts_with("--"))
            .map(String::as_str)
            .collect();

        let mut state = self.state.borrow_mut();
        if words.first().is_some_and(|w| state.failing_wp.contains(*w)) {
            return CommandOutput::failed(
                1,
                "Error: This does not seem to be a WordPress installation.\n",
            );
        }

        match words.as_slice() {
            ["core", "download"] => {
                if let Err(e) = std::fs::write(path.join(SAMPLE_FILE), SAMPLE_CONFIG) {
                    return CommandOutput::failed(1, e.to_string());
                }
                CommandOutput::ok("Success: WordPress downloaded.\n")
            }
            ["core", "install"] => {
                let login = flag(args, "--admin_user=").unwrap_or("admin");
                let email = flag(args, "--admin_email=").unwrap_or("admin@example.com");
                let users = state
                    .tables
                    .entry("wp_users".to_string())
                    .or_insert_with(users_table);
                let id = (users.rows.len() + 1).to_string();
                let mut row = BTreeMap::new();
                row.insert("ID".to_string(), id);
                row.insert("user_login".to_string(), login.to_string());
                row.insert("user_pass".to_string(), "$P$Bthrowawayhash".to_string());
                row.insert("user_email".to_string(), email.to_string());
                users.rows.push(row);
                CommandOutput::ok("Success: WordPress installed successfully.\n")
            }
            ["db", "import", _] => {
                let dump = state.dump.clone();
                state.tables.extend(dump);
                CommandOutput::ok("Success: Imported from 'dump.sql'.\n")
            }
            ["search-replace", search, replace] => {
                let dry_run = args.iter().any(|a| a == "--dry-run");
                let mut total = 0;
                for table in state.tables.values_mut() {
                    if dry_run {
                        let mut copy = table.clone();
                        total += copy.replace_all(None, search, replace);
                    } else {
                        total += table.replace_all(None, search, replace);
                    }
                }
                if dry_run {
                    CommandOutput::ok(format!("Success: {} replacements to be made.\n", total))
                } else {
                    CommandOutput::ok(format!("Success: Made {} replacements.\n", total))
                }
            }
            ["option", "update", name, value] => {
                let options = state
                    .tables
                    .entry("wp_options".to_string())
                    .or_insert_with(|| Table::new(&["option_name", "option_value"]));
                set_where(options, "option_value", value, "option_name", name);
                CommandOutput::ok(format!("Success: Updated '{}' option.\n", name))
            }
            ["eval", _] => CommandOutput::ok("$wp$2y$10$fakewordpresshashvalue"),
            _ => CommandOutput::failed(1, format!("Error: '{}' is not a registered wp command.\n", words.join(" "))),
        }
    }

    fn mysql(&self, spec: &CommandSpec) -> CommandOutput {
        let Some(text) = &spec.stdin_text else {
            // Dump import through stdin
            let mut state = self.state.borrow_mut();
            let dump = state.dump.clone();
            state.tables.extend(dump);
            return CommandOutput::ok("");
        };
        let sql = text.trim_end().trim_end_matches(';').to_string();
        self.state.borrow_mut().statements.push(sql.clone());

        match self.execute(&sql) {
            Ok(rows) => CommandOutput::ok(render_rows(&rows)),
            Err(message) => CommandOutput::failed(1, message),
        }
    }

    fn execute(&self, sql: &str) -> Result<Vec<Vec<String>>, String> {
        let p = patterns();
        let mut state = self.state.borrow_mut();

        if sql == "SELECT 1" {
            state.probes += 1;
            let up = state.container != Some(false)
                && state.ready_on_probe.is_some_and(|n| state.probes >= n);
            return if up {
                Ok(vec![vec!["1".to_string()]])
            } else {
                Err("ERROR 2003 (HY000): Can't connect to MySQL server on '127.0.0.1:3306' (111)\n"
                    .to_string())
            };
        }
        if let Some(c) = p.drop_db.captures(sql) {
            state.databases.remove(&c[1]);
            state.tables.clear();
            return Ok(Vec::new());
        }
        if let Some(c) = p.create_db.captures(sql) {
            state.databases.insert(c[1].to_string());
            return Ok(Vec::new());
        }
        if let Some(c) = p.show_databases.captures(sql) {
            let like = unescape_like(&unquote(&c[1]));
            return Ok(state
                .databases
                .iter()
                .filter(|db| **db == like)
                .map(|db| vec![db.clone()])
                .collect());
        }
        if ["CREATE USER", "ALTER USER", "GRANT ", "FLUSH ", "OPTIMIZE ", "REPAIR "]
            .iter()
            .any(|prefix| sql.starts_with(prefix))
        {
            return Ok(Vec::new());
        }
        if sql == "SHOW TABLES" {
            return Ok(state.tables.keys().map(|t| vec![t.clone()]).collect());
        }
        if let Some(c) = p.update_replace.captures(sql) {
            let table = state
                .tables
                .get_mut(&c[1])
                .ok_or_else(|| format!("ERROR 1146 (42S02): Table '{}' doesn't exist\n", &c[1]))?;
            if !table.columns.iter().any(|col| col == &c[2]) {
                return Err(format!("ERROR 1054 (42S22): Unknown column '{}' in 'field list'\n", &c[2]));
            }
            table.replace_all(Some(&c[2]), &unquote(&c[3]), &unquote(&c[4]));
            return Ok(Vec::new());
        }
        if let Some(c) = p.update_set.captures(sql) {
            let table = state
                .tables
                .get_mut(&c[1])
                .ok_or_else(|| format!("ERROR 1146 (42S02): Table '{}' doesn't exist\n", &c[1]))?;
            set_where(table, &c[2], &unquote(&c[3]), &c[4], &unquote(&c[5]));
            return Ok(Vec::new());
        }
        if let Some(c) = p.count_where.captures(sql) {
            let table = state
                .tables
                .get(&c[1])
                .ok_or_else(|| format!("ERROR 1146 (42S02): Table '{}' doesn't exist\n", &c[1]))?;
            return Ok(vec![vec![table.count_where(&c[2], &unquote(&c[3])).to_string()]]);
        }
        if let Some(c) = p.select_id.captures(sql) {
            let login = unquote(&c[2]);
            let table = state.tables.get(&c[1]).cloned().unwrap_or_default();
            return Ok(table
                .rows
                .iter()
                .filter(|row| row.get("user_login") == Some(&login))
                .filter_map(|row| row.get("ID").and_then(|id| id.parse::<u64>().ok()))
                .max()
                .map(|id| vec![vec![id.to_string()]])
                .unwrap_or_default());
        }
        if let Some(c) = p.delete_meta.captures(sql) {
            let key = unquote(&c[3]);
            if let Some(table) = state.tables.get_mut(&c[1]) {
                table.rows.retain(|row| {
                    row.get("user_id").map(String::as_str) != Some(&c[2])
                        || row.get("meta_key") != Some(&key)
                });
            }
            return Ok(Vec::new());
        }
        if let Some(c) = p.insert.captures(sql) {
            let columns: Vec<String> = c[2].split(',').map(|s| s.trim().to_string()).collect();
            let values: Vec<String> = p
                .value
                .find_iter(&c[3])
                .map(|m| {
                    let v = m.as_str().trim();
                    if v.starts_with('\'') { unquote(v) } else { v.to_string() }
                })
                .collect();
            let table = state.tables.entry(c[1].to_string()).or_insert_with(|| {
                if &c[1] == "wp_users" { users_table() } else { Table::new(&[]) }
            });
            let mut row: BTreeMap<String, String> = columns.into_iter().zip(values).collect();
            if table.columns.iter().any(|col| col == "ID") {
                row.insert("ID".to_string(), (table.rows.len() + 1).to_string());
            }
            table.rows.push(row);
            return Ok(Vec::new());
        }

        Err(format!("ERROR 1064 (42000): fake server cannot parse: {}\n", sql))
    }
}

impl CommandRunner for FakeServer {
    fn run(&self, spec: &CommandSpec) -> sitesmith::Result<CommandOutput> {
        self.state.borrow_mut().commands.push(spec.clone());
        Ok(match spec.tool {
            Tool::Docker => self.docker(&spec.args),
            Tool::Wp => self.wp(&spec.args),
            Tool::Mysql => self.mysql(spec),
        })
    }
}

/// Records requested delays instead of sleeping
#[derive(Default)]
pub struct RecordingSleeper {
    pub slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn total(&self) -> Duration {
        self.slept.borrow().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// Site configuration rooted at `sites_root`, container-hosted server
pub fn site_config(sites_root: &Path) -> SiteConfig {
    let mut config = SiteConfig::default();
    config.sites_root = sites_root.to_path_buf();
    config.site_url = Some("http://mysite.test".to_string());
    config.database.root_password = "r00t-secret".to_string();
    config.database.container = Some(ContainerConfig::default());
    config.admin.password = "correct horse battery staple".to_string();
    config.migration.source_url = Some("http://example.com".to_string());
    config
}

pub fn users_table() -> Table {
    Table::new(&[
        "ID",
        "user_login",
        "user_pass",
        "user_nicename",
        "user_email",
        "user_registered",
        "user_activation_key",
        "user_status",
        "display_name",
    ])
}

/// A small exported site whose content points at example.com
pub fn example_dump() -> Vec<(&'static str, Table)> {
    vec![
        (
            "wp_options",
            Table::new(&["option_name", "option_value"])
                .row(&["siteurl", "http://example.com"])
                .row(&["home", "http://example.com"])
                .row(&["blogdescription", "Mirrored from example.com"]),
        ),
        (
            "wp_posts",
            Table::new(&["ID", "post_title", "post_content", "post_excerpt"]).row(&[
                "1",
                "Hello",
                "<a href=\"http://example.com/about\">About</a>",
                "",
            ]),
        ),
        ("wp_users", users_table()),
        ("wp_usermeta", Table::new(&["user_id", "meta_key", "meta_value"])),
    ]
}

fn flag<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(prefix))
}

fn set_where(table: &mut Table, column: &str, value: &str, key: &str, key_value: &str) {
    for row in &mut table.rows {
        if row.get(key).map(String::as_str) == Some(key_value) {
            row.insert(column.to_string(), value.to_string());
        }
    }
}

fn render_rows(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|v| v.replace('\\', "\\\\").replace('\t', "\\t").replace('\n', "\\n"))
                .collect::<Vec<_>>()
                .join("\t")
                + "\n"
        })
        .collect()
}

/// Undo `quote_literal`
fn unquote(literal: &str) -> String {
    let inner = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(literal);
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('\0'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('Z') => out.push('\x1a'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn unescape_like(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

struct Patterns {
    drop_db: Regex,
    create_db: Regex,
    show_databases: Regex,
    update_replace: Regex,
    update_set: Regex,
    count_where: Regex,
    select_id: Regex,
    delete_meta: Regex,
    insert: Regex,
    value: Regex,
}

fn patterns() -> &'static Patterns {
    const LIT: &str = r"('(?:[^'\\]|\\.)*')";
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        drop_db: Regex::new(r"^DROP DATABASE IF EXISTS `([^`]+)`$").unwrap(),
        create_db: Regex::new(r"^CREATE DATABASE `([^`]+)`").unwrap(),
        show_databases: Regex::new(&format!(r"^SHOW DATABASES LIKE {LIT}$")).unwrap(),
        update_replace: Regex::new(&format!(
            r"^UPDATE `(\w+)` SET `(\w+)` = REPLACE\(`\w+`, {LIT}, {LIT}\) WHERE"
        ))
        .unwrap(),
        update_set: Regex::new(&format!(r"^UPDATE `(\w+)` SET (\w+) = {LIT} WHERE (\w+) = {LIT}$"))
            .unwrap(),
        count_where: Regex::new(&format!(r"^SELECT COUNT\(\*\) FROM `(\w+)` WHERE (\w+) = {LIT}$"))
            .unwrap(),
        select_id: Regex::new(&format!(
            r"^SELECT ID FROM `(\w+)` WHERE user_login = {LIT} ORDER BY ID DESC LIMIT 1$"
        ))
        .unwrap(),
        delete_meta: Regex::new(&format!(
            r"^DELETE FROM `(\w+)` WHERE user_id = (\d+) AND meta_key = {LIT}$"
        ))
        .unwrap(),
        insert: Regex::new(r"^INSERT INTO `(\w+)` \(([^)]*)\) VALUES \((.*)\)$").unwrap(),
        value: Regex::new(r"'(?:[^'\\]|\\.)*'|[^,\s][^,]*").unwrap(),
    })
}
