//! Structured external commands
//!
//! Every subprocess the engine starts is described by a `CommandSpec`: a
//! program, an argument vector, environment variables and optional stdin
//! (a file or inline text). Specs are built by typed argument structs implementing `ToolArgs`,
//! so flag names live in one place and nothing is ever passed through a
//! shell.
//!
//! Execution goes through the `CommandRunner` trait. `SystemRunner` is the
//! real implementation; tests substitute a scripted runner.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config_file::ToolPaths;
use crate::error::{Result, SiteError};
use crate::process_guard::{CommandProcessGroup, TrackedChild};
use crate::types::Tool;

/// Typed arguments for one invocation of an external tool.
///
/// # Contract
///
/// - `to_cli_args()` returns the argument vector exactly as the tool parses it.
/// - `get_env_vars()` carries values that must stay out of argv (passwords).
/// - `stdin_text()` carries payloads that may embed secrets (SQL statements).
/// - `sensitive_args()` lists argv positions to mask in logs.
pub trait ToolArgs {
    /// Which tool this invocation targets
    fn tool(&self) -> Tool;

    /// Arguments, excluding the program name
    fn to_cli_args(&self) -> Vec<String>;

    /// Environment variables for the child
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// File whose contents become the child's stdin
    fn stdin_file(&self) -> Option<&Path> {
        None
    }

    /// Text written to the child's stdin; takes precedence over `stdin_file`
    fn stdin_text(&self) -> Option<String> {
        None
    }

    /// Indexes into `to_cli_args()` that must not be logged
    fn sensitive_args(&self) -> Vec<usize> {
        Vec::new()
    }
}

/// A fully resolved command, ready to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub tool: Tool,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<PathBuf>,
    /// Never logged
    pub stdin_text: Option<String>,
    pub sensitive: Vec<usize>,
}

impl CommandSpec {
    /// Resolve typed arguments against the configured tool paths
    pub fn from_args<T: ToolArgs + ?Sized>(args: &T, paths: &ToolPaths) -> Self {
        let tool = args.tool();
        Self {
            tool,
            program: paths.program(tool).to_string(),
            args: args.to_cli_args(),
            env: args.get_env_vars(),
            stdin: args.stdin_file().map(Path::to_path_buf),
            stdin_text: args.stdin_text(),
            sensitive: args.sensitive_args(),
        }
    }

    /// Human-readable command line with secrets masked and env values hidden
    pub fn display_redacted(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        for (i, arg) in self.args.iter().enumerate() {
            if self.sensitive.contains(&i) {
                parts.push("<redacted>".to_string());
            } else {
                parts.push(arg.clone());
            }
        }
        let mut line = parts.join(" ");
        if !self.env.is_empty() {
            let keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
            line.push_str(&format!(" [env: {}]", keys.join(", ")));
        }
        if let Some(text) = &self.stdin_text {
            line.push_str(&format!(" <<< [{} bytes]", text.len()));
        } else if let Some(stdin) = &self.stdin {
            line.push_str(&format!(" < {}", stdin.display()));
        }
        line
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
            success: false,
        }
    }

    /// Turn a non-zero exit into `SiteError::ToolInvocation`
    pub fn ensure_success(self, program: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(SiteError::tool(program, self.exit_code, self.stderr))
        }
    }
}

/// Executes command specs
pub trait CommandRunner {
    /// Run to completion. `Err` only when the process could not be started or
    /// waited on; a non-zero exit is reported through `CommandOutput`.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        (**self).run(spec)
    }
}

/// Run typed arguments and require a zero exit
pub fn run_tool<R, T>(runner: &R, paths: &ToolPaths, args: &T) -> Result<CommandOutput>
where
    R: CommandRunner + ?Sized,
    T: ToolArgs + ?Sized,
{
    let spec = CommandSpec::from_args(args, paths);
    let program = spec.program.clone();
    runner.run(&spec)?.ensure_success(&program)
}

/// Runs commands as real child processes.
///
/// Children get their own process group and are registered with the global
/// process registry for as long as they run, so a signal to sitesmith tears
/// them down too.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec.display_redacted(), "running");

        let stdin = match (&spec.stdin_text, &spec.stdin) {
            (Some(_), _) => Stdio::piped(),
            (None, Some(path)) => Stdio::from(File::open(path)?),
            (None, None) => Stdio::null(),
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group()
            .spawn()
            .map_err(|e| {
                SiteError::tool(&spec.program, None, format!("failed to spawn: {}", e))
            })?;
        let tracked = TrackedChild::register(child.id(), &spec.program);

        // Written from a thread so a chatty child cannot fill its stdout pipe
        // while we are still blocked on its stdin
        let feeder = match (spec.stdin_text.clone(), child.stdin.take()) {
            (Some(text), Some(mut pipe)) => Some(std::thread::spawn(move || {
                pipe.write_all(text.as_bytes())
            })),
            _ => None,
        };
        let waited = child.wait_with_output();
        drop(tracked);
        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Err(e)) => debug!(error = %e, "child closed stdin early"),
                Ok(Ok(())) | Err(_) => {}
            }
        }

        let output = waited.map_err(|e| {
            SiteError::tool(&spec.program, None, format!("failed to wait: {}", e))
        })?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            success: output.status.success(),
        };
        debug!(
            program = %spec.program,
            exit_code = ?result.exit_code,
            "finished"
        );
        Ok(result)
    }
}
