use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// sitesmith - provision WordPress sites from a site configuration
#[derive(Parser, Debug)]
#[command(name = "sitesmith")]
#[command(about = "Provision and migrate WordPress sites backed by MySQL")]
#[command(version)]
pub struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring up the database, provision the site and reconcile the admin
    Provision {
        /// Site configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Site name (letters, digits, '-' and '_')
        #[arg(short, long)]
        site: String,

        /// SQL dump to import instead of running a fresh install
        #[arg(short, long)]
        dump: Option<PathBuf>,

        /// Do not check for wp/mysql/docker on PATH first
        #[arg(long)]
        skip_preflight: bool,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        config: PathBuf,
    },
    /// Render wp-config.php for a site without touching the database
    PatchConfig {
        /// Site configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Site name (letters, digits, '-' and '_')
        #[arg(short, long)]
        site: String,

        /// wp-config.php or wp-config-sample.php to patch
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the result (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Generate secret keys locally instead of fetching them
        #[arg(long)]
        offline: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
