//! Readiness probes that go beyond "the process exists".
use std::{
    net::{Ipv4Addr, SocketAddr, TcpStream},
    os::unix::{net::UnixStream, process::CommandExt},
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    config::{AdminCommand, ReadinessCheck, ServiceDescriptor},
    constants::{ADMIN_PING_TIMEOUT, PROBE_CONNECT_TIMEOUT},
    env::EnvironmentSnapshot,
    error::NotReady,
    process::{self, ProcessHandle},
};

/// Floor for per-attempt timeouts; a zero timeout is rejected by `connect_timeout`.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Outcome of a single readiness attempt.
enum Attempt {
    Ready,
    NotYet(String),
    Dead,
}

/// Confirms that a started service accepts connections.
///
/// Probes only report facts; state transitions stay with the supervisor.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    handle: ProcessHandle,
    env: Option<Arc<EnvironmentSnapshot>>,
}

impl HealthProbe {
    pub fn new(handle: ProcessHandle) -> Self {
        Self { handle, env: None }
    }

    /// Environment used for administrative pings.
    pub fn with_environment(mut self, env: Arc<EnvironmentSnapshot>) -> Self {
        self.env = Some(env);
        self
    }

    /// Tries the descriptor's readiness check up to `attempts` times, `interval` apart.
    ///
    /// The whole probe, admin pings included, is bounded by `attempts * interval`.
    /// Gives up early when the process dies while being probed.
    pub fn probe(
        &self,
        descriptor: &ServiceDescriptor,
        attempts: usize,
        interval: Duration,
    ) -> Result<(), NotReady> {
        let attempts = attempts.max(1);
        let budget = interval
            .saturating_mul(u32::try_from(attempts).unwrap_or(u32::MAX))
            .max(PROBE_CONNECT_TIMEOUT);
        let deadline = Instant::now() + budget;
        let mut reason = String::from("no attempt made");

        for attempt in 1..=attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.attempt(descriptor, remaining) {
                Attempt::Ready => {
                    debug!(
                        "Service '{}' ready after {attempt} attempt(s)",
                        descriptor.id
                    );
                    return Ok(());
                }
                Attempt::Dead => {
                    return Err(NotReady {
                        service: descriptor.id,
                        attempts: attempt,
                        reason: "process exited before becoming ready".into(),
                    });
                }
                Attempt::NotYet(why) => reason = why,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NotReady {
                    service: descriptor.id,
                    attempts: attempt,
                    reason,
                });
            }
            if attempt < attempts {
                thread::sleep(interval.min(remaining));
            }
        }

        Err(NotReady {
            service: descriptor.id,
            attempts,
            reason,
        })
    }

    /// Runs the readiness check once without waiting. Used by status reports.
    pub fn check_once(&self, descriptor: &ServiceDescriptor) -> Result<(), String> {
        match self.attempt(descriptor, ADMIN_PING_TIMEOUT) {
            Attempt::Ready => Ok(()),
            Attempt::NotYet(reason) => Err(reason),
            Attempt::Dead => Err("process not running".into()),
        }
    }

    /// One readiness attempt that takes at most about `budget`.
    fn attempt(&self, descriptor: &ServiceDescriptor, budget: Duration) -> Attempt {
        if !self.handle.is_alive(descriptor) {
            return Attempt::Dead;
        }

        let connect_timeout = PROBE_CONNECT_TIMEOUT.min(budget).max(MIN_WAIT);
        let connected = match &descriptor.readiness {
            ReadinessCheck::Tcp(port) => {
                let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, *port));
                TcpStream::connect_timeout(&addr, connect_timeout)
                    .map(drop)
                    .map_err(|err| format!("connect to {addr} failed: {err}"))
            }
            ReadinessCheck::UnixSocket(path) => UnixStream::connect(path)
                .map(drop)
                .map_err(|err| format!("connect to {} failed: {err}", path.display())),
            ReadinessCheck::None => Ok(()),
        };

        if let Err(reason) = connected {
            return Attempt::NotYet(reason);
        }

        let Some(admin) = &descriptor.admin_ping else {
            return Attempt::Ready;
        };
        let ping_timeout = ADMIN_PING_TIMEOUT.min(budget).max(MIN_WAIT);
        match self.admin_ping(admin, ping_timeout) {
            Ok(()) => Attempt::Ready,
            Err(reason) => Attempt::NotYet(reason),
        }
    }

    fn admin_ping(&self, admin: &AdminCommand, timeout: Duration) -> Result<(), String> {
        if !admin.binary.is_file() {
            warn!(
                "Admin tool {} not found; relying on socket check only",
                admin.binary.display()
            );
            return Ok(());
        }

        let mut cmd = Command::new(&admin.binary);
        cmd.args(&admin.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        if let Some(env) = &self.env {
            env.apply(&mut cmd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| format!("admin ping failed to run: {err}"))?;
        match process::wait_or_kill(&mut child, timeout) {
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => Err(format!("admin ping exited with {status}")),
            Ok(None) => Err(format!("admin ping timed out after {timeout:?}")),
            Err(err) => Err(format!("admin ping failed: {err}")),
        }
    }
}

/// Number of attempts that fit in `grace` at `interval` spacing.
pub fn attempts_within(grace: Duration, interval: Duration) -> usize {
    if interval.is_zero() {
        return 1;
    }
    ((grace.as_millis() / interval.as_millis().max(1)) as usize).max(1)
}
