//! sitesmith - main entry point

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sitesmith::cli::{Cli, Commands};
use sitesmith::command::SystemRunner;
use sitesmith::config_file::SiteConfig;
use sitesmith::lifecycle::ThreadSleeper;
use sitesmith::pipeline::{ContentOutcome, Pipeline};
use sitesmith::site::{DatabaseTarget, SiteContext};
use sitesmith::wp_config::{
    self, ConfigFlags, ConnectionSettings, LocalSecretGenerator, PatchParams, RemoteSecretSource,
};
use sitesmith::{process_guard, sanity};

/// Initialize tracing; RUST_LOG overrides the default level
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);

    // Children (wp, mysql, docker) are killed with us on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    if let Err(e) = run(cli.command) {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            let site_config = load_config(&config)?;
            site_config.validate().context("Configuration validation failed")?;
            println!("✓ Configuration file is valid: {}", config.display());
        }
        Commands::Provision {
            config,
            site,
            dump,
            skip_preflight,
        } => {
            let site_config = load_config(&config)?;
            if !skip_preflight {
                sanity::run_preflight_checks(&site_config);
            }
            if let Some(dump) = dump.as_deref() {
                anyhow::ensure!(dump.is_file(), "Dump file not found: {}", dump.display());
            }
            provision(&site_config, &site, dump.as_deref())?;
        }
        Commands::PatchConfig {
            config,
            site,
            input,
            output,
            offline,
        } => {
            let site_config = load_config(&config)?;
            patch_config(&site_config, &site, &input, output.as_deref(), offline)?;
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<SiteConfig> {
    SiteConfig::load_from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))
}

fn provision(config: &SiteConfig, site: &str, dump: Option<&Path>) -> Result<()> {
    let secrets = RemoteSecretSource::new(&config.wp_config.salt_endpoint);
    let mut pipeline = Pipeline::new(config, site, SystemRunner, secrets, ThreadSleeper)
        .context("Cannot start provisioning")?;

    let report = match pipeline.run(dump) {
        Ok(report) => report,
        Err(e) => {
            if let Some(stage) = e.failed_stage() {
                eprintln!("✗ Provisioning stopped at stage: {}", stage);
            }
            return Err(e.into());
        }
    };

    let ctx = pipeline.site();
    println!("✓ Site {} is ready at {}", ctx.name(), ctx.url());
    println!(
        "  Database:   {} (user {})",
        report.provisioned.db_name, report.provisioned.credential.user
    );
    println!("  Config:     {}", report.config_path.display());
    match &report.content {
        ContentOutcome::Installed => println!("  Content:    fresh install"),
        ContentOutcome::Migrated(migration) => println!(
            "  Content:    imported via {:?}, {} rule(s) applied",
            migration.import,
            migration.rules.len()
        ),
    }
    println!(
        "  Admin:      {} ({})",
        config.admin.login,
        if report.admin.created { "created" } else { "password reset" }
    );
    if !report.admin.capabilities_granted {
        println!("  ⚠ Administrator capabilities were not granted; check the users table");
    }
    Ok(())
}

fn patch_config(
    config: &SiteConfig,
    site: &str,
    input: &Path,
    output: Option<&Path>,
    offline: bool,
) -> Result<()> {
    config.validate()?;
    let ctx = SiteContext::new(site, config)?;
    let target = DatabaseTarget::from_config(config);

    let secrets = if offline {
        LocalSecretGenerator::default().generate()
    } else {
        wp_config::fetch_secrets(&RemoteSecretSource::new(&config.wp_config.salt_endpoint))
    };
    let params = PatchParams {
        connection: ConnectionSettings::new(&target, ctx.db_name(), &target.root),
        flags: ConfigFlags::from(&config.wp_config),
        secrets,
        extra_lines: config.wp_config.extra_lines.clone(),
    };

    match output {
        Some(dest) => {
            wp_config::patch_file(input, dest, &params)?;
            println!("✓ Wrote {}", dest.display());
        }
        None => {
            let raw = fs::read_to_string(input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            print!("{}", wp_config::patch(&raw, &params));
        }
    }
    Ok(())
}
