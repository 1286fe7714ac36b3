//! Container runtime boundary
//!
//! The lifecycle manager only needs five operations from the runtime. They
//! are a trait so the lifecycle state machine can be exercised without a
//! docker daemon.

use tracing::debug;

use crate::command::{CommandRunner, CommandSpec, run_tool};
use crate::config_file::ToolPaths;
use crate::error::{Result, SiteError};
use crate::site::ContainerSpec;
use crate::tools::docker::{InspectArgs, NetworkCreateArgs, RunArgs, StartArgs, VolumeCreateArgs};

/// Observed state of a named container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Missing,
    Stopped,
    Running,
}

/// Operations the lifecycle manager needs from a container runtime.
///
/// `create_volume` and `create_network` must treat "already exists" as success.
pub trait ContainerRuntime {
    fn status(&self, name: &str) -> Result<ContainerStatus>;
    fn create_volume(&self, name: &str) -> Result<()>;
    fn create_network(&self, name: &str) -> Result<()>;
    fn run(&self, spec: &ContainerSpec) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
}

impl<C: ContainerRuntime + ?Sized> ContainerRuntime for &C {
    fn status(&self, name: &str) -> Result<ContainerStatus> {
        (**self).status(name)
    }
    fn create_volume(&self, name: &str) -> Result<()> {
        (**self).create_volume(name)
    }
    fn create_network(&self, name: &str) -> Result<()> {
        (**self).create_network(name)
    }
    fn run(&self, spec: &ContainerSpec) -> Result<()> {
        (**self).run(spec)
    }
    fn start(&self, name: &str) -> Result<()> {
        (**self).start(name)
    }
}

/// `ContainerRuntime` backed by the docker CLI
pub struct DockerCli<R> {
    runner: R,
    tools: ToolPaths,
}

impl<R: CommandRunner> DockerCli<R> {
    pub fn new(runner: R, tools: ToolPaths) -> Self {
        Self { runner, tools }
    }

    /// Run a create command, tolerating "already exists"
    fn create_idempotent(&self, spec: CommandSpec, what: &str) -> Result<()> {
        let output = self.runner.run(&spec)?;
        if output.success {
            return Ok(());
        }
        if output.stderr.to_ascii_lowercase().contains("already exists") {
            debug!(what, "already exists");
            return Ok(());
        }
        Err(SiteError::tool(&spec.program, output.exit_code, output.stderr))
    }
}

impl<R: CommandRunner> ContainerRuntime for DockerCli<R> {
    fn status(&self, name: &str) -> Result<ContainerStatus> {
        let spec = CommandSpec::from_args(
            &InspectArgs {
                name: name.to_string(),
            },
            &self.tools,
        );
        let output = self.runner.run(&spec)?;
        if output.success {
            return Ok(match output.stdout.trim() {
                "true" => ContainerStatus::Running,
                _ => ContainerStatus::Stopped,
            });
        }
        if output.stderr.to_ascii_lowercase().contains("no such") {
            return Ok(ContainerStatus::Missing);
        }
        Err(SiteError::tool(&spec.program, output.exit_code, output.stderr))
    }

    fn create_volume(&self, name: &str) -> Result<()> {
        let spec = CommandSpec::from_args(
            &VolumeCreateArgs {
                name: name.to_string(),
            },
            &self.tools,
        );
        self.create_idempotent(spec, "volume")
    }

    fn create_network(&self, name: &str) -> Result<()> {
        let spec = CommandSpec::from_args(
            &NetworkCreateArgs {
                name: name.to_string(),
            },
            &self.tools,
        );
        self.create_idempotent(spec, "network")
    }

    fn run(&self, spec: &ContainerSpec) -> Result<()> {
        run_tool(&self.runner, &self.tools, &RunArgs { spec: spec.clone() })?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        run_tool(
            &self.runner,
            &self.tools,
            &StartArgs {
                name: name.to_string(),
            },
        )?;
        Ok(())
    }
}
