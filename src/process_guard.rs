//! Teardown of external tools on interruption
//!
//! A `docker run` or `wp db import` left behind after sitesmith is killed keeps
//! writing to a database the operator believes abandoned. Every tool runs as
//! the leader of its own process group, is tracked here while it runs and gets
//! the whole group signalled when sitesmith receives SIGINT, SIGTERM or SIGHUP.

use nix::libc;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{setpgid, Pid};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long tools get to exit after SIGTERM before SIGKILL
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Running tool processes keyed by pid (which is also their pgid)
#[derive(Debug, Default)]
pub struct ChildRegistry {
    running: HashMap<u32, String>,
    shutting_down: bool,
}

/// What `shutdown` had to do
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub exited: Vec<String>,
    pub killed: Vec<String>,
}

impl ChildRegistry {
    pub fn global() -> &'static Mutex<ChildRegistry> {
        static REGISTRY: OnceLock<Mutex<ChildRegistry>> = OnceLock::new();
        REGISTRY.get_or_init(|| Mutex::new(ChildRegistry::default()))
    }

    /// Lock the global registry, recovering from a poisoned lock
    fn lock_global() -> MutexGuard<'static, ChildRegistry> {
        Self::global()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn track(&mut self, pid: u32, program: impl Into<String>) {
        let program = program.into();
        debug!(pid, %program, "tracking tool process");
        self.running.insert(pid, program);
    }

    pub fn forget(&mut self, pid: u32) -> Option<String> {
        self.running.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Stop every tracked tool: SIGTERM to each group, then SIGKILL whatever
    /// is still alive once `grace` has elapsed. Only the first call acts.
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownSummary {
        let mut summary = ShutdownSummary::default();
        if std::mem::replace(&mut self.shutting_down, true) || self.running.is_empty() {
            return summary;
        }

        let running: Vec<(u32, String)> = self.running.drain().collect();
        info!(tools = running.len(), "stopping running tools");
        for (pid, program) in &running {
            deliver(*pid, Signal::SIGTERM, program);
        }

        let deadline = Instant::now() + grace;
        let mut alive: Vec<&(u32, String)> = running.iter().collect();
        loop {
            alive.retain(|(pid, _)| is_alive(*pid));
            if alive.is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        for (pid, program) in &running {
            if alive.iter().any(|(p, _)| p == pid) {
                warn!(pid, %program, "tool ignored SIGTERM, killing");
                deliver(*pid, Signal::SIGKILL, program);
                summary.killed.push(program.clone());
            } else {
                summary.exited.push(program.clone());
            }
        }
        summary
    }
}

/// Removes a tool from the global registry when it goes out of scope
#[derive(Debug)]
pub struct TrackedChild {
    pid: u32,
}

impl TrackedChild {
    pub fn register(pid: u32, program: &str) -> Self {
        ChildRegistry::lock_global().track(pid, program);
        TrackedChild { pid }
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        ChildRegistry::lock_global().forget(self.pid);
    }
}

/// Signal the group, falling back to the lone process if it has none
fn deliver(pid: u32, signal: Signal, program: &str) {
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(target, signal) {
        debug!(pid, %program, error = %e, "group signal failed, signalling process");
        let _ = kill(target, signal);
    }
}

/// Zombies count as gone
fn is_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            // state follows the parenthesised comm, which may contain spaces
            let after_comm = stat.rsplit_once(')')?.1;
            after_comm.split_whitespace().next().map(str::to_owned)
        })
        .is_none_or(|state| state != "Z" && state != "X")
}

/// Spawn the watcher thread that stops running tools and exits on
/// SIGINT, SIGTERM or SIGHUP
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    std::thread::Builder::new()
        .name("sitesmith-signals".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                warn!(signal = sig, "interrupted, stopping running tools");
                let summary = ChildRegistry::lock_global().shutdown(SHUTDOWN_GRACE);
                if !summary.killed.is_empty() {
                    warn!(killed = ?summary.killed, "tools had to be killed");
                }
                std::process::exit(128 + sig);
            }
        })?;
    Ok(())
}

/// Process-group isolation for spawned tools
pub trait CommandProcessGroup {
    /// Make the child lead a new process group and receive SIGTERM if
    /// sitesmith dies without running its handlers
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: setpgid and prctl are async-signal-safe
        unsafe {
            self.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::other)?;
                match libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) {
                    -1 => Err(std::io::Error::last_os_error()),
                    _ => Ok(()),
                }
            });
        }
        self
    }
}
