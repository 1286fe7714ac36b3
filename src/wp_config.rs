//! Configuration Patcher
//!
//! Rewrites `wp-config.php` text so it points at the provisioned database and
//! carries the configured settings. `patch` is a pure function of the input
//! text and `PatchParams`; running it over its own output with the same
//! params returns the same bytes.
//!
//! # Rules
//!
//! - Connection keys and `$table_prefix` are replaced where they already
//!   appear. A missing key is left missing.
//! - Everything in `ADDITIVE_KEYS` is inserted before the "stop editing"
//!   marker when absent. Flags that are already defined get their value
//!   rewritten where they stand.
//! - Salt lines still holding the template placeholder are replaced in place.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use regex::{NoExpand, Regex};
use tracing::{debug, warn};

use crate::config_file::WpConfigSettings;
use crate::error::{Result, SiteError};
use crate::site::{Credential, DatabaseTarget};

pub const CONFIG_FILE: &str = "wp-config.php";
pub const SAMPLE_FILE: &str = "wp-config-sample.php";

/// Comment that ends the user-editable section of wp-config.php
pub const STOP_EDITING_MARKER: &str = "/* That's all, stop editing! Happy publishing. */";
const MARKER_PREFIX: &str = "/* That's all, stop editing!";

/// Value the upstream template ships in every salt line
pub const SALT_PLACEHOLDER: &str = "put your unique phrase here";

pub const BOOTSTRAP_LINE: &str = "require_once ABSPATH . 'wp-settings.php';";
const ABSPATH_GUARD: &str =
    "if ( ! defined( 'ABSPATH' ) ) {\n\tdefine( 'ABSPATH', __DIR__ . '/' );\n}";

/// The eight authentication keys and salts
pub const SECRET_KEYS: [&str; 8] = [
    "AUTH_KEY",
    "SECURE_AUTH_KEY",
    "LOGGED_IN_KEY",
    "NONCE_KEY",
    "AUTH_SALT",
    "SECURE_AUTH_SALT",
    "LOGGED_IN_SALT",
    "NONCE_SALT",
];

const CONNECTION_KEYS: [&str; 6] = [
    "DB_NAME",
    "DB_USER",
    "DB_PASSWORD",
    "DB_HOST",
    "DB_CHARSET",
    "DB_COLLATE",
];

/// A setting the patcher adds when the text does not already have it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Additive {
    /// One line of the secret/salt block
    Secret(&'static str),
    WpDebug,
    WpDebugLog,
    WpDebugDisplay,
    DisallowFileEdit,
    MemoryLimit,
    /// User-supplied raw lines; presence is an exact trimmed line match
    ExtraLines,
    /// `require_once ABSPATH . 'wp-settings.php';`, always last
    Bootstrap,
}

/// Key-presence table, in insertion order
pub const ADDITIVE_KEYS: &[Additive] = &[
    Additive::Secret("AUTH_KEY"),
    Additive::Secret("SECURE_AUTH_KEY"),
    Additive::Secret("LOGGED_IN_KEY"),
    Additive::Secret("NONCE_KEY"),
    Additive::Secret("AUTH_SALT"),
    Additive::Secret("SECURE_AUTH_SALT"),
    Additive::Secret("LOGGED_IN_SALT"),
    Additive::Secret("NONCE_SALT"),
    Additive::WpDebug,
    Additive::WpDebugLog,
    Additive::WpDebugDisplay,
    Additive::DisallowFileEdit,
    Additive::MemoryLimit,
    Additive::ExtraLines,
    Additive::Bootstrap,
];

impl Additive {
    /// Constant name for define-style settings
    pub fn define_key(self) -> Option<&'static str> {
        match self {
            Self::Secret(key) => Some(key),
            Self::WpDebug => Some("WP_DEBUG"),
            Self::WpDebugLog => Some("WP_DEBUG_LOG"),
            Self::WpDebugDisplay => Some("WP_DEBUG_DISPLAY"),
            Self::DisallowFileEdit => Some("DISALLOW_FILE_EDIT"),
            Self::MemoryLimit => Some("WP_MEMORY_LIMIT"),
            Self::ExtraLines | Self::Bootstrap => None,
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Values written into the connection defines
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    /// `host:port`
    pub db_host: String,
    pub charset: String,
    pub collation: String,
    pub table_prefix: String,
}

impl ConnectionSettings {
    pub fn new(target: &DatabaseTarget, db_name: &str, credential: &Credential) -> Self {
        Self {
            db_name: db_name.to_string(),
            db_user: credential.user.clone(),
            db_password: credential.password.clone(),
            db_host: target.host_port(),
            charset: target.charset.clone(),
            collation: target.collation.clone(),
            table_prefix: target.table_prefix.clone(),
        }
    }

    fn value(&self, key: &str) -> Option<&str> {
        match key {
            "DB_NAME" => Some(&self.db_name),
            "DB_USER" => Some(&self.db_user),
            "DB_PASSWORD" => Some(&self.db_password),
            "DB_HOST" => Some(&self.db_host),
            "DB_CHARSET" => Some(&self.charset),
            "DB_COLLATE" => Some(&self.collation),
            _ => None,
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_host", &self.db_host)
            .field("charset", &self.charset)
            .field("collation", &self.collation)
            .field("table_prefix", &self.table_prefix)
            .finish()
    }
}

/// Debug and hardening flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFlags {
    pub debug: bool,
    pub debug_log: bool,
    pub debug_display: bool,
    pub disallow_file_edit: bool,
    pub memory_limit: Option<String>,
}

impl From<&WpConfigSettings> for ConfigFlags {
    fn from(settings: &WpConfigSettings) -> Self {
        Self {
            debug: settings.debug,
            debug_log: settings.debug_log,
            debug_display: settings.debug_display,
            disallow_file_edit: settings.disallow_file_edit,
            memory_limit: settings.memory_limit.clone(),
        }
    }
}

impl ConfigFlags {
    /// PHP value for a present define, used for in-place rewrites
    fn value(&self, additive: Additive) -> Option<String> {
        match additive {
            Additive::WpDebug => Some(php_bool(self.debug)),
            Additive::WpDebugLog => Some(php_bool(self.debug_log)),
            Additive::WpDebugDisplay => Some(php_bool(self.debug_display)),
            Additive::DisallowFileEdit => Some(php_bool(self.disallow_file_edit)),
            Additive::MemoryLimit => self.memory_limit.as_deref().map(php_string),
            _ => None,
        }
    }

    /// Whether an absent define should be added
    fn wanted(&self, additive: Additive) -> bool {
        match additive {
            Additive::WpDebug => true,
            Additive::WpDebugLog | Additive::WpDebugDisplay => self.debug,
            Additive::DisallowFileEdit => self.disallow_file_edit,
            Additive::MemoryLimit => self.memory_limit.is_some(),
            _ => false,
        }
    }
}

/// The eight authentication keys and salts
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBlock {
    values: Vec<(&'static str, String)>,
}

impl SecretBlock {
    /// Build from key/value pairs; every key in `SECRET_KEYS` is required
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut found: HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.into()))
            .collect();

        let mut values = Vec::with_capacity(SECRET_KEYS.len());
        for key in SECRET_KEYS {
            let value = found
                .remove(key)
                .ok_or_else(|| SiteError::validation(format!("secret block is missing {}", key)))?;
            values.push((key, value));
        }
        Ok(Self { values })
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// `define( 'KEY', 'value' );`
    pub fn line(&self, key: &str) -> Option<String> {
        self.value(key).map(|v| define_line(key, &php_string(v)))
    }

    /// All eight define lines in `SECRET_KEYS` order
    pub fn lines(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(k, v)| define_line(k, &php_string(v)))
            .collect()
    }
}

impl fmt::Debug for SecretBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBlock")
            .field("keys", &self.values.len())
            .finish_non_exhaustive()
    }
}

/// Everything `patch` writes
#[derive(Debug, Clone)]
pub struct PatchParams {
    pub connection: ConnectionSettings,
    pub flags: ConfigFlags,
    pub secrets: SecretBlock,
    pub extra_lines: Vec<String>,
}

// ============================================================================
// Patching
// ============================================================================

struct Patterns {
    /// Full `define( 'KEY', value );` statements, value captured
    defines: HashMap<&'static str, Regex>,
    /// `define( 'KEY',` prefix only
    present: HashMap<&'static str, Regex>,
    table_prefix: Regex,
    bootstrap: Regex,
}

const QUOTED: &str = r#"'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*""#;
/// Unquoted value, allowing one level of call parentheses (`getenv('X')`)
const EXPRESSION: &str = r"(?:[^();]|\([^()]*\))*?";

impl Patterns {
    fn compile() -> Self {
        let mut keys: Vec<&'static str> = CONNECTION_KEYS.to_vec();
        keys.extend(ADDITIVE_KEYS.iter().filter_map(|a| a.define_key()));
        keys.push("ABSPATH");

        let mut defines = HashMap::new();
        let mut present = HashMap::new();
        for key in keys {
            let name = format!(r#"(?:'{k}'|"{k}")"#, k = regex::escape(key));
            defines.insert(
                key,
                Regex::new(&format!(
                    r"define\(\s*{name}\s*,\s*(?P<value>{QUOTED}|{EXPRESSION})\s*\)\s*;"
                ))
                .expect("define pattern is valid"),
            );
            present.insert(
                key,
                Regex::new(&format!(r"define\(\s*{name}\s*,")).expect("define pattern is valid"),
            );
        }

        Self {
            defines,
            present,
            table_prefix: Regex::new(&format!(r"\$table_prefix\s*=\s*(?:{QUOTED})\s*;"))
                .expect("table prefix pattern is valid"),
            bootstrap: Regex::new(r#"require_once\s*\(?\s*ABSPATH\s*\.\s*['"]wp-settings\.php['"]"#)
                .expect("bootstrap pattern is valid"),
        }
    }

    fn is_defined(&self, text: &str, key: &str) -> bool {
        self.present.get(key).is_some_and(|re| re.is_match(text))
    }

    /// Replace the first `define` of `key` with the canonical line
    fn rewrite_define(&self, text: &str, key: &str, value: &str) -> String {
        match self.defines.get(key) {
            Some(re) if re.is_match(text) => re
                .replace(text, NoExpand(&define_line(key, value)))
                .into_owned(),
            Some(_) => {
                warn!(key, "define value not understood, leaving it unpatched");
                text.to_string()
            }
            None => text.to_string(),
        }
    }

    /// Raw (still quoted) value of the first `define` of `key`
    fn defined_value<'t>(&self, text: &'t str, key: &str) -> Option<&'t str> {
        self.defines
            .get(key)?
            .captures(text)?
            .name("value")
            .map(|m| m.as_str())
    }
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(Patterns::compile)
}

/// Apply `params` to wp-config text
pub fn patch(raw: &str, params: &PatchParams) -> String {
    let p = patterns();
    let mut text = raw.to_string();

    for key in CONNECTION_KEYS {
        if !p.is_defined(&text, key) {
            debug!(key, "connection key not present, skipping");
            continue;
        }
        if let Some(value) = params.connection.value(key) {
            text = p.rewrite_define(&text, key, &php_string(value));
        }
    }
    let prefix_line = format!("$table_prefix = {};", php_string(&params.connection.table_prefix));
    text = p
        .table_prefix
        .replace(&text, NoExpand(&prefix_line))
        .into_owned();

    let mut pending: Vec<String> = Vec::new();
    for &additive in ADDITIVE_KEYS {
        match additive {
            Additive::Secret(key) => {
                let placeholder = p
                    .defined_value(&text, key)
                    .is_some_and(|v| unquote(v) == SALT_PLACEHOLDER);
                if placeholder {
                    if let Some(value) = params.secrets.value(key) {
                        text = p.rewrite_define(&text, key, &php_string(value));
                    }
                } else if !p.is_defined(&text, key) {
                    pending.extend(params.secrets.line(key));
                }
            }
            Additive::ExtraLines => {
                for line in params.extra_lines.iter().flat_map(|l| l.lines()) {
                    let line = line.trim();
                    if line.is_empty() || has_line(&text, line) || pending.iter().any(|l| l == line) {
                        continue;
                    }
                    pending.push(line.to_string());
                }
            }
            Additive::Bootstrap => {}
            flag => {
                let Some(key) = flag.define_key() else { continue };
                if p.is_defined(&text, key) {
                    if let Some(value) = params.flags.value(flag) {
                        text = p.rewrite_define(&text, key, &value);
                    }
                } else if params.flags.wanted(flag) {
                    if let Some(value) = params.flags.value(flag) {
                        pending.push(define_line(key, &value));
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        let at = insertion_point(&text, p);
        let mut block = String::new();
        if at == text.len() && !text.is_empty() && !text.ends_with('\n') {
            block.push('\n');
        }
        for line in &pending {
            block.push_str(line);
            block.push('\n');
        }
        text.insert_str(at, &block);
    }

    if !p.bootstrap.is_match(&text) {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        if !p.is_defined(&text, "ABSPATH") {
            text.push_str(ABSPATH_GUARD);
            text.push('\n');
        }
        text.push_str(BOOTSTRAP_LINE);
        text.push('\n');
    }

    text
}

/// Start of the line holding the marker, else the bootstrap line, else EOF
fn insertion_point(text: &str, p: &Patterns) -> usize {
    let hit = text
        .find(STOP_EDITING_MARKER)
        .or_else(|| text.find(MARKER_PREFIX))
        .or_else(|| p.bootstrap.find(text).map(|m| m.start()));
    match hit {
        Some(i) => text[..i].rfind('\n').map_or(0, |nl| nl + 1),
        None => text.len(),
    }
}

fn has_line(text: &str, line: &str) -> bool {
    text.lines().any(|l| l.trim() == line)
}

fn define_line(key: &str, value: &str) -> String {
    format!("define( '{}', {} );", key, value)
}

fn php_bool(value: bool) -> String {
    let literal = if value { "true" } else { "false" };
    literal.to_string()
}

/// Single-quoted PHP string literal
pub fn php_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Inverse of `php_string` (also accepts double quotes); bare values pass through
fn unquote(literal: &str) -> String {
    let inner = literal
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| literal.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
    let Some(inner) = inner else {
        return literal.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match (c, chars.clone().next()) {
            ('\\', Some(next @ ('\\' | '\'' | '"'))) => {
                out.push(next);
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

/// `wp-config.php` if it exists, else the sample, else `None`
pub fn config_source(root: &Path) -> Option<PathBuf> {
    [CONFIG_FILE, SAMPLE_FILE]
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

/// Read `source`, patch it and write the result to `dest`
pub fn patch_file(source: &Path, dest: &Path, params: &PatchParams) -> Result<()> {
    let raw = fs::read_to_string(source).map_err(|e| {
        SiteError::config(format!("Failed to read {}: {}", source.display(), e))
    })?;
    fs::write(dest, patch(&raw, params))?;
    debug!(source = %source.display(), dest = %dest.display(), "wp-config patched");
    Ok(())
}

// ============================================================================
// Secret material
// ============================================================================

/// Produces the eight authentication keys and salts
pub trait SecretSource {
    fn fetch(&self) -> Result<SecretBlock>;
}

/// WordPress.org secret-key service (or a compatible endpoint)
#[derive(Debug, Clone)]
pub struct RemoteSecretSource {
    endpoint: String,
    timeout: Duration,
}

impl RemoteSecretSource {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

impl SecretSource for RemoteSecretSource {
    fn fetch(&self) -> Result<SecretBlock> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let body = client
            .get(&self.endpoint)
            .send()?
            .error_for_status()?
            .text()?;
        parse_secret_lines(&body)
    }
}

/// Extract the eight define lines from a secret-service response
pub fn parse_secret_lines(body: &str) -> Result<SecretBlock> {
    let p = patterns();
    let pairs = SECRET_KEYS
        .iter()
        .filter_map(|&key| p.defined_value(body, key).map(|v| (key, unquote(v))))
        .collect::<Vec<_>>();
    SecretBlock::from_pairs(pairs)
}

/// Alphabet for locally generated secrets; no `'` or `\`
const SECRET_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()-_=+[]{};:,.<>/?|~";

/// Random 64-character secrets
#[derive(Debug, Clone, Copy)]
pub struct LocalSecretGenerator {
    pub length: usize,
}

impl Default for LocalSecretGenerator {
    fn default() -> Self {
        Self { length: 64 }
    }
}

impl LocalSecretGenerator {
    pub fn generate(&self) -> SecretBlock {
        let mut rng = rand::rng();
        let values = SECRET_KEYS.map(|key| {
            let value: String = (0..self.length)
                .map(|_| SECRET_ALPHABET[rng.random_range(0..SECRET_ALPHABET.len())] as char)
                .collect();
            (key, value)
        });
        SecretBlock {
            values: values.into_iter().collect(),
        }
    }
}

impl SecretSource for LocalSecretGenerator {
    fn fetch(&self) -> Result<SecretBlock> {
        Ok(self.generate())
    }
}

/// Ask `remote` first and fall back to local generation on any failure
pub fn fetch_secrets<S: SecretSource + ?Sized>(remote: &S) -> SecretBlock {
    match remote.fetch() {
        Ok(block) => block,
        Err(e) => {
            warn!(error = %e, "secret endpoint unavailable, generating secrets locally");
            LocalSecretGenerator::default().generate()
        }
    }
}
