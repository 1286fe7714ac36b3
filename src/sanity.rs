//! Pre-flight checks for the runtime environment
//!
//! Verifies that the external tools a run will invoke are on `PATH` before
//! any stage touches the database or the document root.

use std::process::Command;

use tracing::{debug, info};

use crate::config_file::SiteConfig;
use crate::process_guard::CommandProcessGroup;
use crate::types::Tool;

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    /// (tool, configured program) pairs that could not be found
    pub missing: Vec<(Tool, String)>,
    pub is_root: bool,
}

impl SanityCheckResult {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Tools a run with `config` will invoke
pub fn required_tools(config: &SiteConfig) -> Vec<Tool> {
    let mut tools = vec![Tool::Wp, Tool::Mysql];
    if config.container_mode() {
        tools.push(Tool::Docker);
    }
    tools
}

/// Check if a program is available in PATH (or is an existing path)
fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .in_new_process_group()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Check every tool the configuration needs
pub fn verify_environment(config: &SiteConfig) -> SanityCheckResult {
    let missing = required_tools(config)
        .into_iter()
        .filter_map(|tool| {
            let program = config.tools.program(tool);
            if binary_exists(program) {
                debug!(tool = %tool, program, "found");
                None
            } else {
                Some((tool, program.to_string()))
            }
        })
        .collect();

    SanityCheckResult {
        missing,
        is_root: nix::unistd::geteuid().is_root(),
    }
}

/// Print the failure report to stderr and exit
pub fn print_error_and_exit(result: &SanityCheckResult) -> ! {
    eprintln!();
    eprintln!("╔══════════════════════════════════════════════════════════════════╗");
    eprintln!("║              sitesmith - Pre-flight Check Failed                 ║");
    eprintln!("╚══════════════════════════════════════════════════════════════════╝");
    eprintln!();
    eprintln!("❌ ERROR: Missing required programs");
    eprintln!();
    for (tool, program) in &result.missing {
        eprintln!("   • {} ({}) - {}", program, tool, install_hint(*tool));
    }
    eprintln!();
    eprintln!("   Install them, or point the `tools` section of the site");
    eprintln!("   configuration at the right executables.");
    eprintln!();

    std::process::exit(1);
}

fn install_hint(tool: Tool) -> &'static str {
    match tool {
        Tool::Wp => "see https://wp-cli.org/#installing",
        Tool::Mysql => "install the MySQL or MariaDB client package",
        Tool::Docker => "install Docker Engine",
    }
}

/// Verify the environment and exit if anything is missing
pub fn run_preflight_checks(config: &SiteConfig) {
    debug!("Running pre-flight checks...");

    let result = verify_environment(config);
    if !result.is_ok() {
        print_error_and_exit(&result);
    }

    info!(root = result.is_root, "pre-flight checks passed");
}
