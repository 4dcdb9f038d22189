//! Error handling for the webstack supervisor.
use std::{io, path::PathBuf, time::Duration};

use strum_macros::Display;
use thiserror::Error;

use crate::{config::ServiceId, diagnostics::CheckId};

/// Failures raised while launching a service process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The configured binary does not exist on disk.
    #[error("Service '{service}' binary not found at {}", path.display())]
    BinaryNotFound {
        /// The service being started.
        service: ServiceId,
        /// The path that was expected to hold the binary.
        path: PathBuf,
    },

    /// The operating system refused to spawn the process.
    #[error("Failed to spawn service '{service}': {source}")]
    SpawnRefused {
        /// The service being started.
        service: ServiceId,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A live process is already recorded in the pid file.
    #[error("Service '{service}' is already running (PID {pid})")]
    AlreadyRunning {
        /// The service being started.
        service: ServiceId,
        /// The live process id found in the pid file.
        pid: u32,
    },

    /// The pid file could not be written after the spawn.
    #[error("Failed to record PID for service '{service}': {source}")]
    PidFile {
        /// The service being started.
        service: ServiceId,
        /// The underlying pid file error.
        #[source]
        source: PidFileError,
    },
}

/// Failures raised while stopping a service process.
///
/// A forced kill is not an error; it is reported through
/// [`crate::process::StopOutcome::ForcedKill`].
#[derive(Debug, Error)]
pub enum StopError {
    /// Signalling the process failed for a reason other than it being gone.
    #[error("Failed to signal service '{service}' (PID {pid}): {source}")]
    Signal {
        /// The service being stopped.
        service: ServiceId,
        /// The process id that was signalled.
        pid: u32,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The process survived SIGKILL.
    #[error("Service '{service}' (PID {pid}) is still alive after SIGKILL")]
    StillAlive {
        /// The service being stopped.
        service: ServiceId,
        /// The surviving process id.
        pid: u32,
    },

    /// The pid file could not be read or removed.
    #[error("PID file error for service '{service}': {source}")]
    PidFile {
        /// The service being stopped.
        service: ServiceId,
        /// The underlying pid file error.
        #[source]
        source: PidFileError,
    },
}

/// A readiness probe exhausted its attempts.
#[derive(Debug, Error)]
#[error("Service '{service}' not ready after {attempts} attempt(s): {reason}")]
pub struct NotReady {
    /// The probed service.
    pub service: ServiceId,
    /// Number of attempts made before giving up.
    pub attempts: usize,
    /// Last observed failure.
    pub reason: String,
}

/// Errors surfaced by the service supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Spawning the process failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Stopping the process failed.
    #[error(transparent)]
    Stop(#[from] StopError),

    /// The service never became ready.
    #[error(transparent)]
    NotReady(#[from] NotReady),

    /// A declared dependency is not running.
    #[error("Service '{service}' cannot start because dependency '{dependency}' is not running")]
    DependencyNotReady {
        /// The service that was asked to start.
        service: ServiceId,
        /// The dependency that is not running.
        dependency: ServiceId,
    },

    /// A dependency failed earlier in the same aggregate start.
    #[error("Service '{service}' skipped because dependency '{dependency}' failed to start")]
    DependencyFailed {
        /// The skipped service.
        service: ServiceId,
        /// The dependency that failed.
        dependency: ServiceId,
    },

    /// The dependency graph contains a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },

    /// The service is not part of the registry.
    #[error("Service '{0}' is not managed by this stack")]
    UnknownService(ServiceId),

    /// The old process survived a failed stop during restart.
    #[error("Service '{service}' is still running (PID {pid}) after a failed stop")]
    StillRunning {
        /// The service being restarted.
        service: ServiceId,
        /// The surviving process id.
        pid: u32,
    },

    /// A worker thread panicked while operating on the service.
    #[error("Worker for service '{0}' panicked")]
    WorkerPanicked(ServiceId),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

impl<T> From<std::sync::PoisonError<T>> for SupervisorError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SupervisorError::MutexPoisonError(err.to_string())
    }
}

impl SupervisorError {
    /// The service this error is about, when there is one.
    pub fn service(&self) -> Option<ServiceId> {
        match self {
            SupervisorError::Spawn(
                SpawnError::BinaryNotFound { service, .. }
                | SpawnError::SpawnRefused { service, .. }
                | SpawnError::AlreadyRunning { service, .. }
                | SpawnError::PidFile { service, .. },
            ) => Some(*service),
            SupervisorError::Stop(
                StopError::Signal { service, .. }
                | StopError::StillAlive { service, .. }
                | StopError::PidFile { service, .. },
            ) => Some(*service),
            SupervisorError::NotReady(not_ready) => Some(not_ready.service),
            SupervisorError::DependencyNotReady { service, .. }
            | SupervisorError::DependencyFailed { service, .. }
            | SupervisorError::StillRunning { service, .. } => Some(*service),
            SupervisorError::UnknownService(service)
            | SupervisorError::WorkerPanicked(service) => Some(*service),
            SupervisorError::DependencyCycle { .. }
            | SupervisorError::MutexPoisonError(_) => None,
        }
    }

    /// The step of the lifecycle that failed, for user-facing reports.
    pub fn step(&self) -> &'static str {
        match self {
            SupervisorError::Spawn(_) => "spawn",
            SupervisorError::Stop(_) => "stop",
            SupervisorError::NotReady(_) => "readiness probe",
            SupervisorError::DependencyNotReady { .. }
            | SupervisorError::DependencyFailed { .. }
            | SupervisorError::DependencyCycle { .. } => "dependency check",
            SupervisorError::UnknownService(_) => "lookup",
            SupervisorError::StillRunning { .. } => "restart",
            SupervisorError::WorkerPanicked(_) => "worker",
            SupervisorError::MutexPoisonError(_) => "locking",
        }
    }
}

/// Whether an aggregate operation got anything done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FailureExtent {
    /// Some services succeeded.
    #[strum(to_string = "partial")]
    Partial,
    /// No service succeeded.
    #[strum(to_string = "total")]
    Total,
}

/// Combined report of a `start_all` / `stop_all` that had at least one failure.
#[derive(Debug, Error)]
#[error("{extent} failure: {}", describe_failures(.failures))]
pub struct AggregateFailure {
    /// Partial or total.
    pub extent: FailureExtent,
    /// Services whose operation succeeded.
    pub succeeded: Vec<ServiceId>,
    /// Per-service errors, in the order the operations ran.
    pub failures: Vec<(ServiceId, SupervisorError)>,
}

impl AggregateFailure {
    pub fn new(succeeded: Vec<ServiceId>, failures: Vec<(ServiceId, SupervisorError)>) -> Self {
        let extent = if succeeded.is_empty() {
            FailureExtent::Total
        } else {
            FailureExtent::Partial
        };
        Self {
            extent,
            succeeded,
            failures,
        }
    }

    /// The error recorded for `service`, if its operation failed.
    pub fn error_for(&self, service: ServiceId) -> Option<&SupervisorError> {
        self.failures
            .iter()
            .find(|(id, _)| *id == service)
            .map(|(_, err)| err)
    }
}

fn describe_failures(failures: &[(ServiceId, SupervisorError)]) -> String {
    failures
        .iter()
        .map(|(service, err)| format!("{service} ({}): {err}", err.step()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Waiting on a submitted operation did not yield a result.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The operation is still running; the caller may wait again.
    #[error("Operation did not finish within {0:?}")]
    TimedOut(Duration),

    /// The worker went away without reporting a result.
    #[error("Operation worker exited without a result")]
    WorkerGone,
}

/// Errors raised while switching the active runtime version.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// The requested version has no installed tree.
    #[error("Runtime version '{0}' is not installed")]
    NotInstalled(String),

    /// The requested version is already the current one; nothing was touched.
    #[error("Runtime version '{0}' is already current")]
    AlreadyCurrent(String),

    /// The FastCGI manager's operation lock could not be taken.
    #[error("Failed to lock the FastCGI manager for switching: {0}")]
    Lock(#[source] SupervisorError),

    /// Stopping the running FastCGI manager failed.
    #[error("Failed to stop the FastCGI manager before switching: {0}")]
    Stop(#[source] SupervisorError),

    /// The alias could not be repointed.
    #[error("Failed to repoint the current-version alias to '{version}': {source}")]
    Relink {
        /// Version the alias was being pointed at.
        version: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The new version failed to start and there was no previous version to restore.
    #[error("Runtime version '{version}' failed to start: {source}")]
    StartFailed {
        /// Version that failed to start.
        version: String,
        /// The start failure.
        #[source]
        source: SupervisorError,
    },

    /// The new version failed and restoring the previous one failed too.
    #[error(
        "Switch to '{attempted}' failed ({start_error}) and rollback to '{previous}' failed ({rollback_error}); manual intervention required"
    )]
    SwitchFailedUnrecoverable {
        /// Version the switch tried to activate.
        attempted: String,
        /// Version the rollback tried to restore.
        previous: String,
        /// Why the new version failed to start.
        start_error: SupervisorError,
        /// Why the rollback failed.
        rollback_error: String,
    },
}

/// A repair ran but its check still fails afterwards.
#[derive(Debug, Error)]
#[error("Repair for {check} on '{subject}' did not resolve the problem: {reason}")]
pub struct DiagnosticFailure {
    /// The check whose repair was attempted.
    pub check: CheckId,
    /// What the check was about (a service, path or port).
    pub subject: String,
    /// Why the repair is considered failed.
    pub reason: String,
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing a PID file.
    #[error("Failed to access PID file: {0}")]
    Io(#[from] io::Error),

    /// The PID file does not contain a process id.
    #[error("PID file {} does not contain a process id: {content:?}", path.display())]
    Corrupt {
        /// Location of the corrupt file.
        path: PathBuf,
        /// Raw (trimmed) file contents.
        content: String,
    },
}

/// Errors raised by the persisted settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Error reading or writing the settings file.
    #[error("Failed to access settings file: {0}")]
    Io(#[from] io::Error),

    /// The settings file is not valid JSON.
    #[error("Failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),

    /// The key is not one the store knows about.
    #[error("Unknown settings key '{0}'")]
    UnknownKey(String),

    /// The value cannot be parsed for the given key.
    #[error("Invalid value '{value}' for settings key '{key}': {reason}")]
    InvalidValue {
        /// Settings key.
        key: String,
        /// Rejected value.
        value: String,
        /// Parse failure.
        reason: String,
    },
}

/// Errors raised while loading the stack manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the manifest file.
    #[error("Failed to read manifest: {0}")]
    ReadError(#[from] io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// The manifest references an unset environment variable.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    /// A duration string in the manifest could not be parsed.
    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),
}
