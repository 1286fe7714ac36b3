//! Content Migration Engine
//!
//! Imports a SQL dump and rewrites URLs and other values inside it so the
//! content works under the new site address.
//!
//! # Strategies
//!
//! Every replacement rule is first tried with `wp search-replace`, which
//! understands serialized PHP values. When that fails for any reason the raw
//! strategy runs plain SQL over a fixed list of text columns:
//!
//! ```text
//! rule ──▶ primary (wp search-replace) ──Ok──▶ RuleOutcome::Primary
//!                     │
//!                     └──Err──▶ raw (SHOW TABLES + UPDATE ... REPLACE)
//! ```
//!
//! The raw strategy does not understand serialized lengths and is not
//! wrapped in a transaction; a crash midway leaves some tables rewritten.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, run_tool};
use crate::config_file::{MigrationConfig, ToolPaths};
use crate::db::{SqlClient, escape_like, quote_ident, quote_literal};
use crate::error::{Result, SiteError};
use crate::site::{SiteContext, domain_of};
use crate::tools::mysql::{ImportArgs, MysqlConnection};
use crate::tools::wp::{DbImportArgs, OptionUpdateArgs, SearchReplaceArgs, WpTarget};

/// Core tables (without prefix) touched by table maintenance
pub const CANONICAL_TABLES: [&str; 11] = [
    "posts",
    "postmeta",
    "options",
    "usermeta",
    "users",
    "terms",
    "term_taxonomy",
    "term_relationships",
    "termmeta",
    "comments",
    "commentmeta",
];

/// Column tried first in every table by the raw strategy
pub const PRIMARY_COLUMN: &str = "option_value";

/// Columns tried when `option_value` does not exist in a table
pub const CANDIDATE_COLUMNS: [&str; 5] = [
    "post_content",
    "post_excerpt",
    "post_title",
    "comment_content",
    "meta_value",
];

/// Options rewritten to the site URL after migration
pub const SITE_URL_OPTIONS: [&str; 2] = ["home", "siteurl"];

// ============================================================================
// Rules
// ============================================================================

/// One search/replace pair with its options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementRule {
    pub search: String,
    pub replace: String,
    pub case_insensitive: bool,
    /// `search` is a regular expression
    pub regex: bool,
    /// Count matches without writing
    pub dry_run: bool,
}

impl ReplacementRule {
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
            case_insensitive: false,
            regex: false,
            dry_run: false,
        }
    }

    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    pub fn regex(mut self, yes: bool) -> Self {
        self.regex = yes;
        self
    }

    pub fn dry_run(mut self, yes: bool) -> Self {
        self.dry_run = yes;
        self
    }

    /// A rule whose search equals its replace changes nothing
    pub fn is_noop(&self) -> bool {
        self.search == self.replace
    }

    /// Pattern, replacement and flags for a regex-mode engine, if this rule
    /// needs one. A plain rule keeps plain-text semantics on both sides: the
    /// search is escaped and so are group references in the replacement.
    fn regex_form(&self) -> Option<RegexForm> {
        let flags = self.case_insensitive.then_some("i");
        if self.regex {
            Some(RegexForm {
                pattern: self.search.clone(),
                replacement: self.replace.clone(),
                flags,
            })
        } else if self.case_insensitive {
            Some(RegexForm {
                pattern: regex::escape(&self.search),
                replacement: escape_replacement(&self.replace),
                flags,
            })
        } else {
            None
        }
    }
}

struct RegexForm {
    pattern: String,
    replacement: String,
    flags: Option<&'static str>,
}

/// Make `$N` and `\N` literal for `preg_replace` and `REGEXP_REPLACE`
fn escape_replacement(replace: &str) -> String {
    replace.replace('\\', "\\\\").replace('$', "\\$")
}

impl fmt::Display for ReplacementRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} -> {:?}", self.search, self.replace)?;
        if self.regex {
            f.write_str(" [regex]")?;
        }
        if self.case_insensitive {
            f.write_str(" [i]")?;
        }
        if self.dry_run {
            f.write_str(" [dry-run]")?;
        }
        Ok(())
    }
}

/// Rules for a site, in application order: base URL, bare domain, user rules
pub fn build_rules(ctx: &SiteContext, migration: &MigrationConfig) -> Vec<ReplacementRule> {
    let mut rules = Vec::new();

    if let Some(source) = migration.source_url.as_deref() {
        let source = source.trim().trim_end_matches('/');
        if !source.is_empty() {
            rules.push(ReplacementRule::new(source, ctx.url()));
            let source_domain = domain_of(source);
            if !source_domain.is_empty() {
                rules.push(ReplacementRule::new(source_domain, ctx.domain()));
            }
        }
    }

    rules.extend(migration.replacements.iter().map(|r| {
        ReplacementRule::new(&r.search, &r.replace)
            .case_insensitive(r.case_insensitive)
            .regex(r.regex)
    }));

    for rule in &mut rules {
        rule.dry_run = migration.dry_run;
    }
    rules
}

// ============================================================================
// Results
// ============================================================================

/// `wp search-replace` finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryReport {
    /// Count reported by the tool, when it printed one
    pub replacements: Option<u64>,
}

/// `wp search-replace` could not run or exited non-zero
#[derive(Debug)]
pub struct PrimaryFailure(pub SiteError);

impl fmt::Display for PrimaryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "search-replace failed: {}", self.0)
    }
}

pub type PrimaryResult = std::result::Result<PrimaryReport, PrimaryFailure>;

/// Raw SQL sweep summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawReport {
    pub tables_scanned: usize,
    /// `table.column` pairs whose statement succeeded
    pub columns_touched: Vec<String>,
    /// Sum of `COUNT(*)` probes for dry-run rules
    pub matches: u64,
}

pub type RawResult = std::result::Result<RawReport, SiteError>;

/// What happened to one rule
#[derive(Debug)]
pub enum RuleOutcome {
    /// search == replace; nothing was executed
    Skipped,
    Primary(PrimaryReport),
    Raw {
        primary: PrimaryFailure,
        report: RawReport,
    },
}

/// How the dump got into the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMethod {
    WpCli,
    MysqlClient,
}

/// Table maintenance toggles plus the post-replacement option update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    pub optimize_tables: bool,
    pub repair_tables: bool,
    pub update_site_options: bool,
}

impl From<&MigrationConfig> for MigrationOptions {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            optimize_tables: config.optimize_tables,
            repair_tables: config.repair_tables,
            update_site_options: config.update_site_options,
        }
    }
}

/// Summary of a full migration
#[derive(Debug)]
pub struct MigrationReport {
    pub import: ImportMethod,
    /// Maintenance statements that failed (warnings only)
    pub maintenance_failures: usize,
    pub rules: Vec<(ReplacementRule, RuleOutcome)>,
    pub site_options_updated: bool,
}

// ============================================================================
// Engine
// ============================================================================

/// Runs import, maintenance and replacement against one site database
pub struct MigrationEngine<'a, R, C> {
    runner: R,
    client: C,
    tools: &'a ToolPaths,
    wp: WpTarget,
    connection: MysqlConnection,
    db_name: String,
    table_prefix: String,
}

impl<'a, R, C> MigrationEngine<'a, R, C>
where
    R: CommandRunner,
    C: SqlClient,
{
    /// `client` must have `db_name` selected; `connection` is used for the
    /// raw dump import.
    pub fn new(
        runner: R,
        client: C,
        tools: &'a ToolPaths,
        wp: WpTarget,
        connection: MysqlConnection,
        db_name: impl Into<String>,
        table_prefix: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            client,
            tools,
            wp,
            connection,
            db_name: db_name.into(),
            table_prefix: table_prefix.into(),
        }
    }

    /// Import, maintain, replace and fix up site URL options
    pub fn migrate(
        &self,
        dump: &Path,
        rules: &[ReplacementRule],
        site_url: &str,
        options: MigrationOptions,
    ) -> Result<MigrationReport> {
        let import = self.import_dump(dump)?;
        let maintenance_failures =
            self.maintain_tables(options.optimize_tables, options.repair_tables);
        let outcomes = self.apply_rules(rules)?;

        let all_dry_run = !rules.is_empty() && rules.iter().all(|r| r.dry_run);
        let site_options_updated = if options.update_site_options && !all_dry_run {
            self.update_site_options(site_url)
        } else {
            false
        };

        Ok(MigrationReport {
            import,
            maintenance_failures,
            rules: rules.iter().cloned().zip(outcomes).collect(),
            site_options_updated,
        })
    }

    /// Load `dump` with WP-CLI, falling back to the mysql client.
    ///
    /// # Errors
    ///
    /// `Migration` when the file is missing or both importers fail.
    pub fn import_dump(&self, dump: &Path) -> Result<ImportMethod> {
        if !dump.is_file() {
            return Err(SiteError::migration(format!(
                "dump file not found: {}",
                dump.display()
            )));
        }

        info!(dump = %dump.display(), "importing database dump");
        let wp_args = DbImportArgs {
            target: self.wp.clone(),
            dump: dump.to_path_buf(),
        };
        let wp_error = match run_tool(&self.runner, self.tools, &wp_args) {
            Ok(_) => return Ok(ImportMethod::WpCli),
            Err(e) => e,
        };
        warn!(error = %wp_error, "wp db import failed, retrying with mysql client");

        let raw_args = ImportArgs {
            connection: self.connection.clone(),
            database: self.db_name.clone(),
            dump: dump.to_path_buf(),
        };
        match run_tool(&self.runner, self.tools, &raw_args) {
            Ok(_) => Ok(ImportMethod::MysqlClient),
            Err(raw_error) => Err(SiteError::migration(format!(
                "dump import failed (wp: {}; mysql: {})",
                wp_error, raw_error
            ))),
        }
    }

    /// Best-effort OPTIMIZE/REPAIR over the canonical tables; returns failures
    pub fn maintain_tables(&self, optimize: bool, repair: bool) -> usize {
        let mut failures = 0;
        for (enabled, verb) in [(optimize, "OPTIMIZE"), (repair, "REPAIR")] {
            if !enabled {
                continue;
            }
            for base in CANONICAL_TABLES {
                let table = format!("{}{}", self.table_prefix, base);
                let sql = format!("{} TABLE {}", verb, quote_ident(&table));
                if let Err(e) = self.client.execute(&sql) {
                    warn!(table = %table, operation = verb, error = %e, "table maintenance failed");
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Apply rules in order
    ///
    /// # Errors
    ///
    /// Only when a rule's raw fallback cannot enumerate tables.
    pub fn apply_rules(&self, rules: &[ReplacementRule]) -> Result<Vec<RuleOutcome>> {
        rules.iter().map(|rule| self.apply_rule(rule)).collect()
    }

    pub fn apply_rule(&self, rule: &ReplacementRule) -> Result<RuleOutcome> {
        if rule.is_noop() {
            debug!(rule = %rule, "search equals replace, skipping");
            return Ok(RuleOutcome::Skipped);
        }

        info!(rule = %rule, "applying replacement");
        match self.primary(rule) {
            Ok(report) => Ok(RuleOutcome::Primary(report)),
            Err(failure) => {
                warn!(rule = %rule, error = %failure, "falling back to raw SQL replacement");
                let report = self.raw(rule)?;
                Ok(RuleOutcome::Raw {
                    primary: failure,
                    report,
                })
            }
        }
    }

    /// `wp search-replace` over all tables
    pub fn primary(&self, rule: &ReplacementRule) -> PrimaryResult {
        let (search, replace, regex, regex_flags) = match rule.regex_form() {
            Some(form) => (form.pattern, form.replacement, true, form.flags.map(str::to_string)),
            None => (rule.search.clone(), rule.replace.clone(), false, None),
        };
        let args = SearchReplaceArgs {
            target: self.wp.clone(),
            search,
            replace,
            dry_run: rule.dry_run,
            regex,
            regex_flags,
        };
        let output = run_tool(&self.runner, self.tools, &args).map_err(PrimaryFailure)?;
        Ok(PrimaryReport {
            replacements: parse_replacement_count(&output.stdout),
        })
    }

    /// Plain SQL sweep over every table
    pub fn raw(&self, rule: &ReplacementRule) -> RawResult {
        let tables: Vec<String> = self
            .client
            .execute("SHOW TABLES")
            .map_err(|e| SiteError::migration(format!("could not list tables: {}", e)))?
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect();

        let mut report = RawReport {
            tables_scanned: tables.len(),
            ..RawReport::default()
        };

        for table in &tables {
            if self.raw_column(rule, table, PRIMARY_COLUMN, &mut report) {
                continue;
            }
            for column in CANDIDATE_COLUMNS {
                self.raw_column(rule, table, column, &mut report);
            }
        }

        debug!(
            tables = report.tables_scanned,
            columns = report.columns_touched.len(),
            "raw replacement finished"
        );
        Ok(report)
    }

    /// One statement against one column; false when it failed
    fn raw_column(
        &self,
        rule: &ReplacementRule,
        table: &str,
        column: &str,
        report: &mut RawReport,
    ) -> bool {
        let sql = raw_statement(rule, table, column);
        match self.client.execute(&sql) {
            Ok(rows) => {
                if rule.dry_run {
                    report.matches += rows
                        .first()
                        .and_then(|row| row.first().cloned().flatten())
                        .and_then(|count| count.parse::<u64>().ok())
                        .unwrap_or(0);
                }
                report.columns_touched.push(format!("{}.{}", table, column));
                true
            }
            Err(e) => {
                debug!(table, column, error = %e, "column skipped");
                false
            }
        }
    }

    /// Set `home` and `siteurl`; true when both ended up updated
    pub fn update_site_options(&self, site_url: &str) -> bool {
        let options_table = format!("{}options", self.table_prefix);
        let mut all_updated = true;

        for name in SITE_URL_OPTIONS {
            let args = OptionUpdateArgs {
                target: self.wp.clone(),
                name: name.to_string(),
                value: site_url.to_string(),
            };
            let Err(e) = run_tool(&self.runner, self.tools, &args) else {
                continue;
            };
            warn!(option = name, error = %e, "wp option update failed, using SQL");

            let sql = format!(
                "UPDATE {} SET option_value = {} WHERE option_name = {}",
                quote_ident(&options_table),
                quote_literal(site_url),
                quote_literal(name)
            );
            if let Err(e) = self.client.execute(&sql) {
                warn!(option = name, error = %e, "could not update site option");
                all_updated = false;
            }
        }
        all_updated
    }
}

/// UPDATE (or COUNT probe for dry runs) of one column
pub fn raw_statement(rule: &ReplacementRule, table: &str, column: &str) -> String {
    let t = quote_ident(table);
    let c = quote_ident(column);

    match rule.regex_form() {
        Some(form) => {
            let pattern = quote_literal(&form.pattern);
            let replacement = quote_literal(&form.replacement);
            let (replace_expr, condition) = match form.flags {
                Some(match_type) => (
                    format!("REGEXP_REPLACE({c}, {pattern}, {replacement}, 1, 0, '{match_type}')"),
                    format!("REGEXP_LIKE({c}, {pattern}, '{match_type}')"),
                ),
                None => (
                    format!("REGEXP_REPLACE({c}, {pattern}, {replacement})"),
                    format!("{c} REGEXP {pattern}"),
                ),
            };
            if rule.dry_run {
                format!("SELECT COUNT(*) FROM {t} WHERE {condition}")
            } else {
                format!("UPDATE {t} SET {c} = {replace_expr} WHERE {condition}")
            }
        }
        None => {
            let like = quote_literal(&format!("%{}%", escape_like(&rule.search)));
            if rule.dry_run {
                format!("SELECT COUNT(*) FROM {t} WHERE {c} LIKE {like}")
            } else {
                format!(
                    "UPDATE {t} SET {c} = REPLACE({c}, {}, {}) WHERE {c} LIKE {like}",
                    quote_literal(&rule.search),
                    quote_literal(&rule.replace)
                )
            }
        }
    }
}

/// Count from `Success: Made 12 replacements.` or `12 replacements to be made.`
fn parse_replacement_count(stdout: &str) -> Option<u64> {
    static COUNT: OnceLock<Regex> = OnceLock::new();
    let re = COUNT.get_or_init(|| {
        Regex::new(r"(?:Made )?(\d+) replacements?").expect("count pattern is valid")
    });
    re.captures(stdout)?.get(1)?.as_str().parse().ok()
}
