//! Database Lifecycle Manager
//!
//! Brings the database server to a state where it accepts authenticated
//! connections. For an externally managed server this is a no-op; for a
//! container-hosted one it creates or starts the container and then polls a
//! readiness probe.
//!
//! # State Flow
//!
//! ```text
//! Absent ──create──▶ Created ─┐
//!                             ├──▶ Starting ──probe ok──▶ Ready
//! Stopped ──start─────────────┘        │
//!                                      └──attempts exhausted──▶ Unavailable
//! ```

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config_file::ReadinessConfig;
use crate::container::{ContainerRuntime, ContainerStatus};
use crate::db::SqlClient;
use crate::error::{Result, SiteError};
use crate::site::DatabaseTarget;

/// Minimal statement used to detect a server accepting connections
pub const READINESS_PROBE: &str = "SELECT 1";

/// Lifecycle of the database server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Initial state, also used when no container exists
    Absent,
    /// Container launched by this run
    Created,
    /// Container exists but is not running
    Stopped,
    /// Waiting for the readiness probe
    Starting,
    /// Server accepts authenticated queries
    Ready,
    /// Readiness probe never succeeded (terminal)
    Unavailable,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Bounded, fixed-interval polling budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay: Duration::from_secs(2),
        }
    }
}

impl From<ReadinessConfig> for ReadinessPolicy {
    fn from(config: ReadinessConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            delay: Duration::from_secs(config.delay_secs),
        }
    }
}

impl ReadinessPolicy {
    /// Total delay spent when every attempt fails (no sleep after the last)
    pub fn worst_case_delay(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

/// Blocks the calling thread between probe attempts
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<S: Sleeper + ?Sized> Sleeper for &S {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Drives the server to `Ready`
pub struct DatabaseLifecycle<C, P, S> {
    runtime: C,
    probe: P,
    sleeper: S,
    policy: ReadinessPolicy,
    state: LifecycleState,
    history: Vec<LifecycleState>,
}

impl<C, P, S> DatabaseLifecycle<C, P, S>
where
    C: ContainerRuntime,
    P: SqlClient,
    S: Sleeper,
{
    /// `probe` must log in with the root credential
    pub fn new(runtime: C, probe: P, sleeper: S, policy: ReadinessPolicy) -> Self {
        Self {
            runtime,
            probe,
            sleeper,
            policy,
            state: LifecycleState::Absent,
            history: vec![LifecycleState::Absent],
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Every state entered, in order
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    /// Ensure the server in `target` is accepting connections.
    ///
    /// Safe to call repeatedly: an existing container is never re-created and
    /// a running one is never re-started.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the probe fails on every attempt (state `Unavailable`)
    /// - `ToolInvocation` when the runtime cannot inspect/create/start
    pub fn ensure_ready(&mut self, target: &DatabaseTarget) -> Result<LifecycleState> {
        let Some(container) = target.container.as_ref() else {
            debug!("database server is externally managed");
            self.enter(LifecycleState::Ready);
            return Ok(self.state);
        };

        match self.runtime.status(&container.name)? {
            ContainerStatus::Missing => {
                self.enter(LifecycleState::Absent);
                info!(container = %container.name, image = %container.image, "creating database container");
                self.runtime.create_volume(&container.volume)?;
                self.runtime.create_network(&container.network)?;
                self.runtime.run(container)?;
                self.enter(LifecycleState::Created);
            }
            ContainerStatus::Stopped => {
                self.enter(LifecycleState::Stopped);
                info!(container = %container.name, "starting stopped database container");
                self.runtime.start(&container.name)?;
            }
            ContainerStatus::Running => {
                debug!(container = %container.name, "database container already running");
            }
        }

        self.enter(LifecycleState::Starting);
        self.poll_until_ready()
    }

    fn poll_until_ready(&mut self) -> Result<LifecycleState> {
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            match self.probe.execute(READINESS_PROBE) {
                Ok(_) => {
                    info!(attempt, "database server is ready");
                    self.enter(LifecycleState::Ready);
                    return Ok(self.state);
                }
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "readiness probe failed");
                }
            }
            if attempt < attempts {
                self.sleeper.sleep(self.policy.delay);
            }
        }

        warn!(attempts, "database server never became ready");
        self.enter(LifecycleState::Unavailable);
        Err(SiteError::Timeout {
            attempts,
            waited: self.policy.delay * (attempts - 1),
        })
    }

    fn enter(&mut self, state: LifecycleState) {
        self.state = state;
        if self.history.last() != Some(&state) {
            self.history.push(state);
        }
    }
}
