//! Type-safe arguments for the container runtime (`docker`).

use crate::command::ToolArgs;
use crate::site::ContainerSpec;
use crate::types::Tool;

/// Data directory of the official MySQL image
pub const MYSQL_DATA_DIR: &str = "/var/lib/mysql";

/// Port the server listens on inside the container
pub const MYSQL_CONTAINER_PORT: u16 = 3306;

// ============================================================================
// Inspect
// ============================================================================

/// `docker inspect --format {{.State.Running}} <name>`
///
/// Prints `true`/`false` for an existing container and exits non-zero when
/// no container has that name.
#[derive(Debug, Clone)]
pub struct InspectArgs {
    pub name: String,
}

impl ToolArgs for InspectArgs {
    fn tool(&self) -> Tool {
        Tool::Docker
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            self.name.clone(),
        ]
    }
}

// ============================================================================
// Volume / Network
// ============================================================================

/// `docker volume create <name>`
#[derive(Debug, Clone)]
pub struct VolumeCreateArgs {
    pub name: String,
}

impl ToolArgs for VolumeCreateArgs {
    fn tool(&self) -> Tool {
        Tool::Docker
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["volume".to_string(), "create".to_string(), self.name.clone()]
    }
}

/// `docker network create <name>`
#[derive(Debug, Clone)]
pub struct NetworkCreateArgs {
    pub name: String,
}

impl ToolArgs for NetworkCreateArgs {
    fn tool(&self) -> Tool {
        Tool::Docker
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["network".to_string(), "create".to_string(), self.name.clone()]
    }
}

// ============================================================================
// Run / Start
// ============================================================================

/// `docker run --detach ...` for a new database container.
///
/// # Environment Contract
///
/// `--env MYSQL_ROOT_PASSWORD` is passed without a value, so docker copies it
/// from its own environment, which `get_env_vars()` populates.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub spec: ContainerSpec,
}

impl ToolArgs for RunArgs {
    fn tool(&self) -> Tool {
        Tool::Docker
    }

    fn to_cli_args(&self) -> Vec<String> {
        let spec = &self.spec;
        vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--publish".to_string(),
            format!("{}:{}", spec.host_port, MYSQL_CONTAINER_PORT),
            "--volume".to_string(),
            format!("{}:{}", spec.volume, MYSQL_DATA_DIR),
            "--network".to_string(),
            spec.network.clone(),
            "--env".to_string(),
            "MYSQL_ROOT_PASSWORD".to_string(),
            spec.image.clone(),
        ]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![(
            "MYSQL_ROOT_PASSWORD".to_string(),
            self.spec.root_password.clone(),
        )]
    }
}

/// `docker start <name>`
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub name: String,
}

impl ToolArgs for StartArgs {
    fn tool(&self) -> Tool {
        Tool::Docker
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["start".to_string(), self.name.clone()]
    }
}
