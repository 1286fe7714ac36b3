//! Provisioning Pipeline
//!
//! Runs the engine's stages in order for one site and owns the record of
//! which stage the run is in.
//!
//! # Stage Flow
//!
//! ```text
//! NotStarted
//!     ↓
//! StartingDatabase
//!     ↓
//! ProvisioningDatabase      (drops the site database)
//!     ↓
//! DownloadingCore           (only when no wp-config file exists yet)
//!     ↓
//! PatchingConfig
//!     ↓
//! InstallingCore | MigratingContent   (fresh install, or dump import)
//!     ↓
//! ReconcilingAdmin
//!     ↓
//! Completed
//!
//! (Any stage can transition to Failed)
//! ```
//!
//! Optional stages may be skipped; mandatory ones may not. Nothing done by
//! an earlier stage is undone when a later one fails.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::admin::{AdminAccount, AdminReconciler, Reconciled, WpCliHasher};
use crate::command::{CommandRunner, run_tool};
use crate::config_file::SiteConfig;
use crate::container::DockerCli;
use crate::db::MysqlCli;
use crate::error::{Result, SiteError};
use crate::lifecycle::{DatabaseLifecycle, LifecycleState, ReadinessPolicy, Sleeper};
use crate::migrate::{MigrationEngine, MigrationOptions, MigrationReport, build_rules};
use crate::provision::{Provisioned, Provisioner, generate_password};
use crate::site::{DatabaseTarget, SiteContext};
use crate::tools::mysql::MysqlConnection;
use crate::tools::wp::{CoreDownloadArgs, CoreInstallArgs, WpTarget};
use crate::wp_config::{
    self, CONFIG_FILE, ConfigFlags, ConnectionSettings, PatchParams, SAMPLE_FILE, SecretSource,
};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PipelineStage {
    NotStarted = 0,

    /// Container created/started, readiness polled
    StartingDatabase = 1,

    /// Site database dropped and recreated; dedicated user granted.
    /// This is a DESTRUCTIVE stage
    ProvisioningDatabase = 2,

    /// `wp core download` into an empty document root
    DownloadingCore = 3,

    /// wp-config.php written
    PatchingConfig = 4,

    /// `wp core install` when no dump is supplied
    InstallingCore = 5,

    /// Dump import and URL rewriting
    MigratingContent = 6,

    /// Admin account created or re-passworded
    ReconcilingAdmin = 7,

    Completed = 8,

    Failed = 255,
}

impl PipelineStage {
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[inline]
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::ProvisioningDatabase)
    }

    /// Stages a run may legitimately skip
    #[inline]
    pub const fn is_optional(self) -> bool {
        matches!(
            self,
            Self::DownloadingCore | Self::InstallingCore | Self::MigratingContent
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::NotStarted => "Not started",
            Self::StartingDatabase => "Starting database server",
            Self::ProvisioningDatabase => "Provisioning database",
            Self::DownloadingCore => "Downloading WordPress core",
            Self::PatchingConfig => "Patching wp-config.php",
            Self::InstallingCore => "Installing WordPress",
            Self::MigratingContent => "Migrating content",
            Self::ReconcilingAdmin => "Reconciling admin account",
            Self::Completed => "Provisioning complete",
            Self::Failed => "Provisioning failed",
        }
    }

    /// All stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::NotStarted,
            Self::StartingDatabase,
            Self::ProvisioningDatabase,
            Self::DownloadingCore,
            Self::PatchingConfig,
            Self::InstallingCore,
            Self::MigratingContent,
            Self::ReconcilingAdmin,
            Self::Completed,
        ]
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during stage transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineTransitionError {
    #[error("Cannot skip from {from} to {to} ({skipped} is mandatory)")]
    SkippedStage {
        from: PipelineStage,
        to: PipelineStage,
        skipped: PipelineStage,
    },

    #[error("Cannot go backwards from {from} to {to}")]
    BackwardTransition {
        from: PipelineStage,
        to: PipelineStage,
    },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: PipelineStage },

    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: PipelineStage },
}

/// Current stage plus the history of stages entered
#[derive(Debug, Clone)]
pub struct PipelineContext {
    current: PipelineStage,
    failed_at: Option<PipelineStage>,
    /// (stage, seconds since UNIX epoch)
    history: Vec<(PipelineStage, u64)>,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    pub fn new() -> Self {
        Self {
            current: PipelineStage::NotStarted,
            failed_at: None,
            history: Vec::with_capacity(PipelineStage::all_stages().len()),
        }
    }

    #[inline]
    pub fn current_stage(&self) -> PipelineStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<PipelineStage> {
        self.failed_at
    }

    pub fn history(&self) -> &[(PipelineStage, u64)] {
        &self.history
    }

    /// Stages entered, without timestamps
    pub fn stages(&self) -> Vec<PipelineStage> {
        self.history.iter().map(|(stage, _)| *stage).collect()
    }

    /// Move forward to `target`, skipping only optional stages.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if current is Completed or Failed
    /// - `AlreadyAtStage` / `BackwardTransition` for non-forward moves
    /// - `SkippedStage` if a mandatory stage lies between current and target
    pub fn transition_to(
        &mut self,
        target: PipelineStage,
    ) -> std::result::Result<PipelineStage, PipelineTransitionError> {
        if self.current.is_terminal() {
            return Err(PipelineTransitionError::FromTerminalState { from: self.current });
        }
        if target == self.current {
            return Err(PipelineTransitionError::AlreadyAtStage { stage: target });
        }
        if target == PipelineStage::Failed || target.order() < self.current.order() {
            return Err(PipelineTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        let skipped = PipelineStage::all_stages().iter().find(|stage| {
            stage.order() > self.current.order()
                && stage.order() < target.order()
                && !stage.is_optional()
        });
        if let Some(&skipped) = skipped {
            return Err(PipelineTransitionError::SkippedStage {
                from: self.current,
                to: target,
                skipped,
            });
        }

        self.record(target);
        self.current = target;
        Ok(target)
    }

    /// Mark the run as failed at the current stage
    pub fn fail(&mut self) -> std::result::Result<(), PipelineTransitionError> {
        if self.current.is_terminal() {
            return Err(PipelineTransitionError::FromTerminalState { from: self.current });
        }
        self.failed_at = Some(self.current);
        self.record(PipelineStage::Failed);
        self.current = PipelineStage::Failed;
        Ok(())
    }

    fn record(&mut self, stage: PipelineStage) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push((stage, timestamp));
    }
}

// ============================================================================
// Run
// ============================================================================

/// How the site got its content
#[derive(Debug)]
pub enum ContentOutcome {
    /// Fresh `wp core install`
    Installed,
    Migrated(MigrationReport),
}

/// Everything a successful run produced
#[derive(Debug)]
pub struct PipelineReport {
    pub lifecycle: LifecycleState,
    pub provisioned: Provisioned,
    pub config_path: PathBuf,
    pub core_downloaded: bool,
    pub content: ContentOutcome,
    pub admin: Reconciled,
}

/// One provisioning run for one site
pub struct Pipeline<'a, R, S, Sl> {
    config: &'a SiteConfig,
    site: SiteContext,
    target: DatabaseTarget,
    runner: R,
    secrets: S,
    sleeper: Sl,
    allow_root: bool,
    state: PipelineContext,
}

impl<'a, R, S, Sl> Pipeline<'a, R, S, Sl>
where
    R: CommandRunner,
    S: SecretSource,
    Sl: Sleeper,
{
    /// Prepare a run for `site_name`.
    ///
    /// # Errors
    ///
    /// Invalid site name, invalid configuration, or no admin password.
    pub fn new(
        config: &'a SiteConfig,
        site_name: &str,
        runner: R,
        secrets: S,
        sleeper: Sl,
    ) -> Result<Self> {
        config.validate()?;
        if config.admin.password.is_empty() {
            return Err(SiteError::config("admin.password must be set to provision a site"));
        }
        let site = SiteContext::new(site_name, config)?;

        Ok(Self {
            config,
            site,
            target: DatabaseTarget::from_config(config),
            runner,
            secrets,
            sleeper,
            allow_root: nix::unistd::geteuid().is_root(),
            state: PipelineContext::new(),
        })
    }

    /// Pass `--allow-root` to WP-CLI; defaults to whether we run as root
    pub fn allow_root(mut self, allow: bool) -> Self {
        self.allow_root = allow;
        self
    }

    pub fn site(&self) -> &SiteContext {
        &self.site
    }

    pub fn context(&self) -> &PipelineContext {
        &self.state
    }

    fn wp_target(&self) -> WpTarget {
        WpTarget::new(self.site.root(), self.allow_root)
    }

    /// Enter `stage`, run `f`, and tag any error with the stage
    fn stage<T>(
        &mut self,
        stage: PipelineStage,
        f: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        self.state.transition_to(stage)?;
        if stage.is_destructive() {
            warn!(stage = %stage, site = self.site.name(), "entering destructive stage");
        } else {
            info!(stage = %stage, site = self.site.name(), "entering stage");
        }

        match f(self) {
            Ok(value) => Ok(value),
            Err(e) => {
                let _ = self.state.fail();
                Err(e.at_stage(stage))
            }
        }
    }

    /// Run every stage. With `dump`, content is migrated from it; otherwise a
    /// fresh site is installed.
    pub fn run(&mut self, dump: Option<&Path>) -> Result<PipelineReport> {
        let lifecycle = self.stage(PipelineStage::StartingDatabase, Self::start_database)?;
        let provisioned = self.stage(PipelineStage::ProvisioningDatabase, Self::provision)?;

        let core_downloaded = wp_config::config_source(self.site.root()).is_none();
        if core_downloaded {
            self.stage(PipelineStage::DownloadingCore, Self::download_core)?;
        }

        let config_path = self.stage(PipelineStage::PatchingConfig, |p| {
            p.patch_config(&provisioned)
        })?;

        let content = match dump {
            Some(dump) => {
                let report = self.stage(PipelineStage::MigratingContent, |p| {
                    p.migrate(&provisioned, dump)
                })?;
                ContentOutcome::Migrated(report)
            }
            None => {
                self.stage(PipelineStage::InstallingCore, Self::install_core)?;
                ContentOutcome::Installed
            }
        };

        let admin = self.stage(PipelineStage::ReconcilingAdmin, |p| {
            p.reconcile_admin(&provisioned)
        })?;

        self.state.transition_to(PipelineStage::Completed)?;
        info!(site = self.site.name(), url = self.site.url(), "site provisioned");

        Ok(PipelineReport {
            lifecycle,
            provisioned,
            config_path,
            core_downloaded,
            content,
            admin,
        })
    }

    fn root_client(&self) -> MysqlCli<&R> {
        MysqlCli::new(
            &self.runner,
            self.config.tools.clone(),
            &self.target,
            self.target.root.clone(),
        )
    }

    fn site_client(&self, provisioned: &Provisioned) -> MysqlCli<&R> {
        MysqlCli::new(
            &self.runner,
            self.config.tools.clone(),
            &self.target,
            provisioned.credential.clone(),
        )
        .with_database(&provisioned.db_name)
    }

    fn start_database(&self) -> Result<LifecycleState> {
        let runtime = DockerCli::new(&self.runner, self.config.tools.clone());
        let mut lifecycle = DatabaseLifecycle::new(
            runtime,
            self.root_client(),
            &self.sleeper,
            ReadinessPolicy::from(self.config.readiness),
        );
        lifecycle.ensure_ready(&self.target)
    }

    fn provision(&self) -> Result<Provisioned> {
        Provisioner::new(self.root_client(), &self.target).provision(&self.site)
    }

    fn download_core(&self) -> Result<()> {
        fs::create_dir_all(self.site.root())?;
        let args = CoreDownloadArgs {
            target: self.wp_target(),
            locale: self.config.locale.clone(),
        };
        run_tool(&self.runner, &self.config.tools, &args)?;
        Ok(())
    }

    fn patch_config(&self, provisioned: &Provisioned) -> Result<PathBuf> {
        let root = self.site.root();
        let source = wp_config::config_source(root).ok_or_else(|| {
            SiteError::config(format!(
                "neither {} nor {} found in {}",
                CONFIG_FILE,
                SAMPLE_FILE,
                root.display()
            ))
        })?;
        let dest = root.join(CONFIG_FILE);

        let params = PatchParams {
            connection: ConnectionSettings::new(
                &self.target,
                &provisioned.db_name,
                &provisioned.credential,
            ),
            flags: ConfigFlags::from(&self.config.wp_config),
            secrets: wp_config::fetch_secrets(&self.secrets),
            extra_lines: self.config.wp_config.extra_lines.clone(),
        };
        wp_config::patch_file(&source, &dest, &params)?;
        Ok(dest)
    }

    fn install_core(&self) -> Result<()> {
        // The reconciler sets the real password afterwards
        let args = CoreInstallArgs {
            target: self.wp_target(),
            url: self.site.url().to_string(),
            title: self.site.title().to_string(),
            admin_user: self.config.admin.login.clone(),
            admin_email: self.config.admin.email.clone(),
            admin_password: generate_password(24),
        };
        run_tool(&self.runner, &self.config.tools, &args)?;
        Ok(())
    }

    fn migrate(&self, provisioned: &Provisioned, dump: &Path) -> Result<MigrationReport> {
        let engine = MigrationEngine::new(
            &self.runner,
            self.site_client(provisioned),
            &self.config.tools,
            self.wp_target(),
            MysqlConnection {
                host: self.target.host.clone(),
                port: self.target.port,
                credential: provisioned.credential.clone(),
            },
            &provisioned.db_name,
            &self.target.table_prefix,
        );
        let rules = build_rules(&self.site, &self.config.migration);
        engine.migrate(
            dump,
            &rules,
            self.site.url(),
            MigrationOptions::from(&self.config.migration),
        )
    }

    fn reconcile_admin(&self, provisioned: &Provisioned) -> Result<Reconciled> {
        let hasher = WpCliHasher::new(&self.runner, &self.config.tools, self.wp_target());
        let mut reconciler = AdminReconciler::new(
            self.site_client(provisioned),
            hasher,
            &self.target.table_prefix,
        );
        reconciler.reconcile(&AdminAccount::from(&self.config.admin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_sequential() {
        for (i, stage) in PipelineStage::all_stages().iter().enumerate() {
            assert_eq!(stage.order() as usize, i, "stage {:?}", stage);
        }
    }

    #[test]
    fn test_fresh_install_path() {
        let mut ctx = PipelineContext::new();
        for stage in [
            PipelineStage::StartingDatabase,
            PipelineStage::ProvisioningDatabase,
            PipelineStage::PatchingConfig,
            PipelineStage::InstallingCore,
            PipelineStage::ReconcilingAdmin,
            PipelineStage::Completed,
        ] {
            ctx.transition_to(stage).expect("optional stages may be skipped");
        }
        assert_eq!(ctx.current_stage(), PipelineStage::Completed);
        assert_eq!(ctx.history().len(), 6);
    }

    #[test]
    fn test_migration_path_skips_install() {
        let mut ctx = PipelineContext::new();
        ctx.transition_to(PipelineStage::StartingDatabase).expect("first");
        ctx.transition_to(PipelineStage::ProvisioningDatabase).expect("second");
        ctx.transition_to(PipelineStage::DownloadingCore).expect("download");
        ctx.transition_to(PipelineStage::PatchingConfig).expect("patch");
        ctx.transition_to(PipelineStage::MigratingContent).expect("migrate");
        assert!(ctx.transition_to(PipelineStage::InstallingCore).is_err());
    }

    #[test]
    fn test_cannot_skip_mandatory_stage() {
        let mut ctx = PipelineContext::new();
        ctx.transition_to(PipelineStage::StartingDatabase).expect("first");
        let err = ctx
            .transition_to(PipelineStage::PatchingConfig)
            .unwrap_err();
        assert_eq!(
            err,
            PipelineTransitionError::SkippedStage {
                from: PipelineStage::StartingDatabase,
                to: PipelineStage::PatchingConfig,
                skipped: PipelineStage::ProvisioningDatabase,
            }
        );
    }

    #[test]
    fn test_fail_records_stage() {
        let mut ctx = PipelineContext::new();
        ctx.transition_to(PipelineStage::StartingDatabase).expect("first");
        ctx.fail().expect("fail");
        assert_eq!(ctx.failed_at(), Some(PipelineStage::StartingDatabase));
        assert!(ctx.fail().is_err());
        assert!(matches!(
            ctx.transition_to(PipelineStage::ProvisioningDatabase),
            Err(PipelineTransitionError::FromTerminalState { .. })
        ));
    }

    #[test]
    fn test_backward_and_repeat_rejected() {
        let mut ctx = PipelineContext::new();
        ctx.transition_to(PipelineStage::StartingDatabase).expect("first");
        assert!(matches!(
            ctx.transition_to(PipelineStage::StartingDatabase),
            Err(PipelineTransitionError::AlreadyAtStage { .. })
        ));
        assert!(matches!(
            ctx.transition_to(PipelineStage::NotStarted),
            Err(PipelineTransitionError::BackwardTransition { .. })
        ));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(PipelineStage::MigratingContent.to_string(), "Migrating content");
        assert!(PipelineStage::ProvisioningDatabase.is_destructive());
        assert!(!PipelineStage::PatchingConfig.is_optional());
    }

    #[test]
    fn test_new_requires_admin_password() {
        let config = SiteConfig::default();
        let result = Pipeline::new(
            &config,
            "demo",
            crate::command::SystemRunner,
            crate::wp_config::LocalSecretGenerator::default(),
            crate::lifecycle::ThreadSleeper,
        );
        assert!(matches!(result, Err(SiteError::Config(_))));
    }
}
