//! Per-service state machines and the operations that drive them.
//!
//! Every transition goes through [`ServiceSupervisor`]. Operations on one
//! service serialize on that service's lock; operations on different services
//! may run concurrently, subject to dependency order.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread,
    time::Duration,
};
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ServiceDescriptor, ServiceId, ServiceRegistry},
    constants::{DEFAULT_STOP_TIMEOUT, PROBE_INTERVAL},
    diagnostics::ServiceStateView,
    env::EnvironmentResolver,
    error::{AggregateFailure, SpawnError, SupervisorError, WaitError},
    probe::{HealthProbe, attempts_within},
    process::{ProcessExit, ProcessHandle, StopOutcome},
};

/// How often the exit watcher checks whether its supervisor is gone.
const WATCHER_TICK: Duration = Duration::from_millis(500);

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceState {
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServiceState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        match (self, next) {
            (current, next) if current == next => true,
            (_, Failed) => true,
            (Unknown | Stopped | Failed, Starting) => true,
            (Starting, Running) => true,
            // Adopting a process that is already alive.
            (Unknown | Stopped | Failed, Running) => true,
            (Unknown | Stopped | Running | Failed, Stopping) => true,
            (Unknown | Stopping | Failed, Stopped) => true,
            _ => false,
        }
    }

    /// Starting and Stopping only exist while an operation holds the service lock.
    pub fn is_transitional(self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }
}

/// Snapshot of a service's state as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub since: DateTime<Utc>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: ServiceState::Unknown,
            pid: None,
            last_error: None,
            since: Utc::now(),
        }
    }
}

/// Tunables for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Time between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    /// Spacing of readiness attempts within a service's startup grace.
    pub probe_interval: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            probe_interval: PROBE_INTERVAL,
        }
    }
}

#[derive(Debug, Default)]
struct ServiceSlot {
    op_lock: Mutex<()>,
    status: Mutex<ServiceStatus>,
}

impl ServiceSlot {
    fn status(&self) -> MutexGuard<'_, ServiceStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct Inner {
    registry: ServiceRegistry,
    env: Arc<EnvironmentResolver>,
    handle: ProcessHandle,
    options: SupervisorOptions,
    order: Vec<ServiceId>,
    slots: BTreeMap<ServiceId, ServiceSlot>,
}

/// Owns the registry and drives every service's state machine.
#[derive(Debug, Clone)]
pub struct ServiceSupervisor {
    inner: Arc<Inner>,
}

/// A result that a worker thread will deliver later.
///
/// Dropping it abandons the wait only; processes started by the operation keep running.
#[derive(Debug)]
pub struct PendingOperation<T> {
    rx: Receiver<T>,
}

impl<T> PendingOperation<T> {
    /// Blocks until the operation finishes.
    pub fn wait(self) -> Result<T, WaitError> {
        self.rx.recv().map_err(|_| WaitError::WorkerGone)
    }

    /// Blocks for at most `timeout`. A timed-out wait can be retried.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, WaitError> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(WaitError::TimedOut(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(WaitError::WorkerGone),
        }
    }

    /// Returns the result if it is already available.
    pub fn try_result(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl ServiceSupervisor {
    /// Builds a supervisor with default timings.
    pub fn new(
        registry: ServiceRegistry,
        env: Arc<EnvironmentResolver>,
    ) -> Result<Self, SupervisorError> {
        Self::with_options(registry, env, SupervisorOptions::default())
    }

    /// Builds a supervisor. Fails when the dependency graph has a cycle or an unknown id.
    pub fn with_options(
        registry: ServiceRegistry,
        env: Arc<EnvironmentResolver>,
        options: SupervisorOptions,
    ) -> Result<Self, SupervisorError> {
        let order = registry.start_order()?;
        let slots = registry
            .ids()
            .map(|id| (id, ServiceSlot::default()))
            .collect();

        let (exit_tx, exit_rx) = mpsc::channel();
        let inner = Arc::new(Inner {
            registry,
            env,
            handle: ProcessHandle::with_exit_notifier(exit_tx),
            options,
            order,
            slots,
        });
        spawn_exit_watcher(Arc::downgrade(&inner), exit_rx);

        Ok(Self { inner })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn environment(&self) -> &Arc<EnvironmentResolver> {
        &self.inner.env
    }

    pub fn process_handle(&self) -> &ProcessHandle {
        &self.inner.handle
    }

    /// Topological start order computed from the registry.
    pub fn start_order(&self) -> &[ServiceId] {
        &self.inner.order
    }

    pub fn status(&self, id: ServiceId) -> Option<ServiceStatus> {
        self.inner.slots.get(&id).map(|slot| slot.status().clone())
    }

    pub fn state(&self, id: ServiceId) -> ServiceState {
        self.inner.state(id)
    }

    /// Status of every service in start order.
    pub fn statuses(&self) -> Vec<(ServiceId, ServiceStatus)> {
        self.inner
            .order
            .iter()
            .filter_map(|id| self.status(*id).map(|status| (*id, status)))
            .collect()
    }

    /// Reconciles recorded state with the process table.
    ///
    /// Services with an operation in flight are left alone.
    pub fn refresh(&self) -> Vec<(ServiceId, ServiceStatus)> {
        for id in &self.inner.order {
            self.inner.reconcile(*id);
        }
        self.statuses()
    }

    /// Starts one service. Dependencies must already be running; they are never started implicitly.
    pub fn start_one(&self, id: ServiceId) -> Result<u32, SupervisorError> {
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock()?;
        self.inner.start_locked(id)
    }

    /// Stops one service. Stopping a stopped service succeeds.
    pub fn stop_one(&self, id: ServiceId) -> Result<StopOutcome, SupervisorError> {
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock()?;
        self.inner.stop_locked(id)
    }

    /// Stop then start under one lock. Ends in either Running or Failed.
    pub fn restart(&self, id: ServiceId) -> Result<u32, SupervisorError> {
        let inner = &self.inner;
        let slot = inner.slot(id)?;
        let _op = slot.op_lock.lock()?;
        info!("Restarting service '{id}'");

        if let Err(err) = inner.stop_locked(id) {
            let descriptor = inner.descriptor(id)?;
            if let Some(pid) = inner.handle.live_pid(descriptor) {
                error!("Restart of '{id}' aborted: stop failed and PID {pid} is still alive");
                inner.transition(id, ServiceState::Failed, Some(pid), Some(err.to_string()));
                return Err(SupervisorError::StillRunning { service: id, pid });
            }
            warn!("Stop of '{id}' failed ({err}) but the process is gone; starting anyway");
        }

        inner.start_locked(id).inspect_err(|err| {
            inner.transition(id, ServiceState::Failed, None, Some(err.to_string()));
        })
    }

    /// Runs `op` while holding `id`'s operation lock, so no other start, stop or
    /// restart of that service can interleave with the steps inside it.
    pub fn with_service_locked<T>(
        &self,
        id: ServiceId,
        op: impl FnOnce(&LockedService<'_>) -> T,
    ) -> Result<T, SupervisorError> {
        let slot = self.inner.slot(id)?;
        let _op = slot.op_lock.lock()?;
        Ok(op(&LockedService {
            inner: &self.inner,
            id,
        }))
    }

    /// Starts every service in dependency order.
    ///
    /// Services that share a dependency level start concurrently. A failure
    /// skips the failed service's dependents but never stops what already runs.
    pub fn start_all(&self) -> Result<Vec<ServiceId>, AggregateFailure> {
        info!("Starting all services...");

        let mut started = Vec::new();
        let mut failures = Vec::new();
        let mut failed: BTreeSet<ServiceId> = BTreeSet::new();

        for wave in self.inner.waves() {
            let mut runnable = Vec::new();
            for id in wave {
                let blocked_by = self
                    .inner
                    .descriptor(id)
                    .ok()
                    .and_then(|d| d.dependencies.iter().find(|dep| failed.contains(*dep)).copied());
                match blocked_by {
                    Some(dependency) => {
                        error!("Skipping start of '{id}' because dependency '{dependency}' failed.");
                        failed.insert(id);
                        failures.push((
                            id,
                            SupervisorError::DependencyFailed {
                                service: id,
                                dependency,
                            },
                        ));
                    }
                    None => runnable.push(id),
                }
            }

            let results: Vec<(ServiceId, Result<u32, SupervisorError>)> = thread::scope(|scope| {
                let workers: Vec<_> = runnable
                    .iter()
                    .map(|id| {
                        let id = *id;
                        (id, scope.spawn(move || self.start_one(id)))
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|(id, worker)| {
                        let result = worker
                            .join()
                            .unwrap_or(Err(SupervisorError::WorkerPanicked(id)));
                        (id, result)
                    })
                    .collect()
            });

            for (id, result) in results {
                match result {
                    Ok(_) => started.push(id),
                    Err(err) => {
                        error!("Failed to start service '{id}': {err}");
                        failed.insert(id);
                        failures.push((id, err));
                    }
                }
            }
        }

        if failures.is_empty() {
            info!("All services started successfully.");
            Ok(started)
        } else {
            Err(AggregateFailure::new(started, failures))
        }
    }

    /// Stops every service in reverse dependency order. Every stop is attempted.
    pub fn stop_all(&self) -> Result<Vec<(ServiceId, StopOutcome)>, AggregateFailure> {
        info!("Stopping all services...");

        let mut stopped = Vec::new();
        let mut failures = Vec::new();
        for id in self.inner.order.iter().rev() {
            match self.stop_one(*id) {
                Ok(outcome) => stopped.push((*id, outcome)),
                Err(err) => {
                    error!("Failed to stop service '{id}': {err}");
                    failures.push((*id, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(stopped)
        } else {
            let succeeded = stopped.into_iter().map(|(id, _)| id).collect();
            Err(AggregateFailure::new(succeeded, failures))
        }
    }

    /// Runs `op` on a worker thread and returns a handle to its result.
    pub fn submit<T, F>(&self, label: &str, op: F) -> PendingOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(&ServiceSupervisor) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let supervisor = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("op-{label}"))
            .spawn(move || {
                let _ = tx.send(op(&supervisor));
            });
        if let Err(err) = spawned {
            error!("Failed to spawn worker for '{label}': {err}");
        }
        PendingOperation { rx }
    }

    pub fn start_async(&self, id: ServiceId) -> PendingOperation<Result<u32, SupervisorError>> {
        self.submit(&format!("start-{id}"), move |s| s.start_one(id))
    }

    pub fn stop_async(
        &self,
        id: ServiceId,
    ) -> PendingOperation<Result<StopOutcome, SupervisorError>> {
        self.submit(&format!("stop-{id}"), move |s| s.stop_one(id))
    }

    pub fn restart_async(&self, id: ServiceId) -> PendingOperation<Result<u32, SupervisorError>> {
        self.submit(&format!("restart-{id}"), move |s| s.restart(id))
    }

    pub fn start_all_async(&self) -> PendingOperation<Result<Vec<ServiceId>, AggregateFailure>> {
        self.submit("start-all", |s| s.start_all())
    }

    pub fn stop_all_async(
        &self,
    ) -> PendingOperation<Result<Vec<(ServiceId, StopOutcome)>, AggregateFailure>> {
        self.submit("stop-all", |s| s.stop_all())
    }
}

/// One service with its operation lock held. See [`ServiceSupervisor::with_service_locked`].
pub struct LockedService<'a> {
    inner: &'a Inner,
    id: ServiceId,
}

impl LockedService<'_> {
    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state(self.id)
    }

    pub fn start(&self) -> Result<u32, SupervisorError> {
        self.inner.start_locked(self.id)
    }

    pub fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        self.inner.stop_locked(self.id)
    }
}

impl ServiceStateView for ServiceSupervisor {
    fn service_state(&self, id: ServiceId) -> ServiceState {
        self.state(id)
    }
}

impl Inner {
    fn slot(&self, id: ServiceId) -> Result<&ServiceSlot, SupervisorError> {
        self.slots
            .get(&id)
            .ok_or(SupervisorError::UnknownService(id))
    }

    fn descriptor(&self, id: ServiceId) -> Result<&ServiceDescriptor, SupervisorError> {
        self.registry
            .get(id)
            .ok_or(SupervisorError::UnknownService(id))
    }

    fn state(&self, id: ServiceId) -> ServiceState {
        self.slots
            .get(&id)
            .map(|slot| slot.status().state)
            .unwrap_or(ServiceState::Unknown)
    }

    fn transition(
        &self,
        id: ServiceId,
        next: ServiceState,
        pid: Option<u32>,
        error: Option<String>,
    ) -> bool {
        match self.slots.get(&id) {
            Some(slot) => apply_transition(&mut slot.status(), id, next, pid, error),
            None => false,
        }
    }

    /// Groups the start order into levels whose members share no dependency.
    fn waves(&self) -> Vec<Vec<ServiceId>> {
        let mut level: BTreeMap<ServiceId, usize> = BTreeMap::new();
        let mut waves: Vec<Vec<ServiceId>> = Vec::new();
        for id in &self.order {
            let depth = self
                .registry
                .get(*id)
                .map(|d| {
                    d.dependencies
                        .iter()
                        .filter_map(|dep| level.get(dep))
                        .map(|l| l + 1)
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            level.insert(*id, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(*id);
        }
        waves
    }

    /// True when `dep` is running. A stale state is re-probed instead of trusted.
    fn dependency_ready(&self, dep: ServiceId) -> bool {
        let (Some(slot), Some(descriptor)) = (self.slots.get(&dep), self.registry.get(dep)) else {
            return false;
        };

        match self.state(dep) {
            ServiceState::Running if self.handle.is_alive(descriptor) => true,
            ServiceState::Starting | ServiceState::Stopping => false,
            state => {
                // Only adjust a dependency nobody else is operating on.
                let Ok(_op) = slot.op_lock.try_lock() else {
                    return false;
                };
                match self.handle.live_pid(descriptor) {
                    Some(pid) => {
                        let probe = HealthProbe::new(self.handle.clone())
                            .with_environment(self.env.current());
                        if probe.check_once(descriptor).is_ok() && state != ServiceState::Failed {
                            debug!("Dependency '{dep}' found running (PID {pid})");
                            self.transition(dep, ServiceState::Running, Some(pid), None);
                            true
                        } else {
                            false
                        }
                    }
                    None => {
                        if state == ServiceState::Running {
                            self.transition(
                                dep,
                                ServiceState::Failed,
                                None,
                                Some("process no longer running".into()),
                            );
                        }
                        false
                    }
                }
            }
        }
    }

    fn start_locked(&self, id: ServiceId) -> Result<u32, SupervisorError> {
        let descriptor = self.descriptor(id)?;

        for dep in &descriptor.dependencies {
            if !self.dependency_ready(*dep) {
                warn!("Cannot start '{id}': dependency '{dep}' is not running");
                return Err(SupervisorError::DependencyNotReady {
                    service: id,
                    dependency: *dep,
                });
            }
        }

        if let Some(pid) = self.handle.live_pid(descriptor) {
            info!("Service '{id}' is already running (PID {pid})");
            self.transition(id, ServiceState::Running, Some(pid), None);
            return Ok(pid);
        }

        let state = self.state(id);
        if !matches!(
            state,
            ServiceState::Unknown | ServiceState::Stopped | ServiceState::Failed
        ) {
            self.transition(
                id,
                ServiceState::Failed,
                None,
                Some("process no longer running".into()),
            );
        }

        let env = self.env.current();
        self.transition(id, ServiceState::Starting, None, None);

        let pid = match self.handle.start(descriptor, &env) {
            Ok(pid) => pid,
            Err(SpawnError::AlreadyRunning { pid, .. }) => {
                self.transition(id, ServiceState::Running, Some(pid), None);
                return Ok(pid);
            }
            Err(err) => {
                error!("Failed to spawn '{id}': {err}");
                self.transition(id, ServiceState::Failed, None, Some(err.to_string()));
                return Err(err.into());
            }
        };

        let interval = self.options.probe_interval;
        let probe = HealthProbe::new(self.handle.clone()).with_environment(Arc::clone(&env));
        if let Err(not_ready) =
            probe.probe(descriptor, attempts_within(descriptor.startup_grace, interval), interval)
        {
            error!("{not_ready}");
            if let Err(err) = self.handle.stop(descriptor, self.options.stop_timeout) {
                warn!("Failed to clean up unready service '{id}': {err}");
            }
            self.transition(id, ServiceState::Failed, None, Some(not_ready.to_string()));
            return Err(not_ready.into());
        }

        self.transition(id, ServiceState::Running, Some(pid), None);
        info!("Service '{id}' is running (PID {pid})");
        Ok(pid)
    }

    fn stop_locked(&self, id: ServiceId) -> Result<StopOutcome, SupervisorError> {
        let descriptor = self.descriptor(id)?;
        let pid = self.slots.get(&id).and_then(|slot| slot.status().pid);

        self.transition(id, ServiceState::Stopping, pid, None);
        match self.handle.stop(descriptor, self.options.stop_timeout) {
            Ok(outcome) => {
                self.transition(id, ServiceState::Stopped, None, None);
                Ok(outcome)
            }
            Err(err) => {
                match self.handle.live_pid(descriptor) {
                    Some(pid) => {
                        self.transition(id, ServiceState::Failed, Some(pid), Some(err.to_string()))
                    }
                    None => self.transition(id, ServiceState::Stopped, None, None),
                };
                Err(err.into())
            }
        }
    }

    fn reconcile(&self, id: ServiceId) {
        let (Some(slot), Some(descriptor)) = (self.slots.get(&id), self.registry.get(id)) else {
            return;
        };
        let Ok(_op) = slot.op_lock.try_lock() else {
            debug!("Skipping refresh of '{id}': operation in flight");
            return;
        };

        let state = self.state(id);
        match (self.handle.live_pid(descriptor), state) {
            (Some(pid), ServiceState::Unknown | ServiceState::Stopped) => {
                self.transition(id, ServiceState::Running, Some(pid), None);
            }
            (Some(pid), _) => {
                slot.status().pid = Some(pid);
            }
            (None, ServiceState::Running) => {
                warn!("Service '{id}' is no longer running");
                self.transition(
                    id,
                    ServiceState::Failed,
                    None,
                    Some("process no longer running".into()),
                );
            }
            (None, ServiceState::Unknown) => {
                self.transition(id, ServiceState::Stopped, None, None);
            }
            (None, _) => {}
        }
    }

    /// Marks a running service failed when its process exits behind our back.
    fn on_exit(&self, exit: ProcessExit) {
        let Some(slot) = self.slots.get(&exit.service) else {
            return;
        };
        let mut status = slot.status();
        if status.state == ServiceState::Running && status.pid == Some(exit.pid) {
            warn!(
                "Service '{}' (PID {}) exited unexpectedly with {}",
                exit.service, exit.pid, exit.status
            );
            apply_transition(
                &mut status,
                exit.service,
                ServiceState::Failed,
                None,
                Some(format!("exited unexpectedly with {}", exit.status)),
            );
        }
    }
}

fn apply_transition(
    status: &mut ServiceStatus,
    id: ServiceId,
    next: ServiceState,
    pid: Option<u32>,
    error: Option<String>,
) -> bool {
    if !status.state.can_transition_to(next) {
        warn!(
            "Ignoring illegal transition for '{id}': {} -> {next}",
            status.state
        );
        return false;
    }
    if status.state != next {
        debug!("Service '{id}': {} -> {next}", status.state);
        status.since = Utc::now();
    }
    status.state = next;
    status.pid = pid;
    status.last_error = error;
    true
}

fn spawn_exit_watcher(inner: Weak<Inner>, rx: Receiver<ProcessExit>) {
    let spawned = thread::Builder::new()
        .name("exit-watcher".into())
        .spawn(move || {
            loop {
                match rx.recv_timeout(WATCHER_TICK) {
                    Ok(exit) => match inner.upgrade() {
                        Some(inner) => inner.on_exit(exit),
                        None => break,
                    },
                    Err(RecvTimeoutError::Timeout) => {
                        if inner.strong_count() == 0 {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Exit watcher stopped");
        });
    if let Err(err) = spawned {
        error!("Failed to spawn exit watcher: {err}");
    }
}
