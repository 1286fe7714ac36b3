//! Type-safe arguments for WP-CLI (`wp`).
//!
//! Every invocation carries `--path=<site root>`; `--allow-root` is added when
//! sitesmith itself runs as root, since WP-CLI refuses to run as root without it.

use std::path::PathBuf;

use crate::command::ToolArgs;
use crate::types::Tool;

/// Environment variable carrying a plaintext password into `wp eval`
pub const PLAINTEXT_ENV: &str = "SITESMITH_PLAINTEXT";

/// The WordPress install a command operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WpTarget {
    pub path: PathBuf,
    pub allow_root: bool,
}

impl WpTarget {
    pub fn new(path: impl Into<PathBuf>, allow_root: bool) -> Self {
        Self {
            path: path.into(),
            allow_root,
        }
    }

    /// Global flags followed by the subcommand words
    fn command(&self, words: &[&str]) -> Vec<String> {
        let mut args = vec![format!("--path={}", self.path.display())];
        if self.allow_root {
            args.push("--allow-root".to_string());
        }
        args.extend(words.iter().map(|w| w.to_string()));
        args
    }
}

// ============================================================================
// Core
// ============================================================================

/// `wp core download --locale=<locale>`
#[derive(Debug, Clone)]
pub struct CoreDownloadArgs {
    pub target: WpTarget,
    pub locale: String,
}

impl ToolArgs for CoreDownloadArgs {
    fn tool(&self) -> Tool {
        Tool::Wp
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.target.command(&["core", "download"]);
        args.push(format!("--locale={}", self.locale));
        args
    }
}

/// `wp core install` for a site that is not migrated from a dump.
///
/// The admin password given here is a throwaway; the reconciler sets the
/// real one afterwards.
#[derive(Debug, Clone)]
pub struct CoreInstallArgs {
    pub target: WpTarget,
    pub url: String,
    pub title: String,
    pub admin_user: String,
    pub admin_email: String,
    pub admin_password: String,
}

impl ToolArgs for CoreInstallArgs {
    fn tool(&self) -> Tool {
        Tool::Wp
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.target.command(&["core", "install"]);
        args.push(format!("--url={}", self.url));
        args.push(format!("--title={}", self.title));
        args.push(format!("--admin_user={}", self.admin_user));
        args.push(format!("--admin_email={}", self.admin_email));
        args.push(format!("--admin_password={}", self.admin_password));
        args.push("--skip-email".to_string());
        args
    }

    fn sensitive_args(&self) -> Vec<usize> {
        vec![self.to_cli_args().len() - 2]
    }
}

// ============================================================================
// Database
// ============================================================================

/// `wp db import <dump>`
#[derive(Debug, Clone)]
pub struct DbImportArgs {
    pub target: WpTarget,
    pub dump: PathBuf,
}

impl ToolArgs for DbImportArgs {
    fn tool(&self) -> Tool {
        Tool::Wp
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.target.command(&["db", "import"]);
        args.push(self.dump.display().to_string());
        args
    }
}

/// `wp search-replace <search> <replace> --all-tables`
///
/// # Field to Flag Mapping
///
/// | Field         | Flag                 |
/// |---------------|----------------------|
/// | `dry_run`     | `--dry-run`          |
/// | `regex`       | `--regex`            |
/// | `regex_flags` | `--regex-flags=<f>`  |
#[derive(Debug, Clone)]
pub struct SearchReplaceArgs {
    pub target: WpTarget,
    pub search: String,
    pub replace: String,
    pub dry_run: bool,
    pub regex: bool,
    pub regex_flags: Option<String>,
}

impl ToolArgs for SearchReplaceArgs {
    fn tool(&self) -> Tool {
        Tool::Wp
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.target.command(&["search-replace"]);
        args.push(self.search.clone());
        args.push(self.replace.clone());
        args.push("--all-tables".to_string());
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        if self.regex {
            args.push("--regex".to_string());
        }
        if let Some(flags) = &self.regex_flags {
            args.push(format!("--regex-flags={}", flags));
        }
        args
    }
}

// ============================================================================
// Eval / Options
// ============================================================================

/// `wp eval <php>` printing `wp_hash_password()` of `$SITESMITH_PLAINTEXT`
#[derive(Debug, Clone)]
pub struct HashPasswordArgs {
    pub target: WpTarget,
    pub plaintext: String,
}

impl ToolArgs for HashPasswordArgs {
    fn tool(&self) -> Tool {
        Tool::Wp
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.target.command(&["eval"]);
        args.push(format!(
            "echo wp_hash_password( getenv( '{}' ) );",
            PLAINTEXT_ENV
        ));
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![(PLAINTEXT_ENV.to_string(), self.plaintext.clone())]
    }
}

/// `wp option update <name> <value>`
#[derive(Debug, Clone)]
pub struct OptionUpdateArgs {
    pub target: WpTarget,
    pub name: String,
    pub value: String,
}

impl ToolArgs for OptionUpdateArgs {
    fn tool(&self) -> Tool {
        Tool::Wp
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = self.target.command(&["option", "update"]);
        args.push(self.name.clone());
        args.push(self.value.clone());
        args
    }
}
