//! OS-level process control for a single managed service.
//!
//! The pid file is the single source of truth for liveness. It holds the
//! process id as a plain integer so the legacy shell scripts and the
//! supervisor agree on who is running.
use fs2::FileExt;
use nix::{errno::Errno, sys::signal, unistd::Pid};
use std::{
    ffi::{OsStr, OsString},
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::mpsc::Sender,
    thread,
    time::{Duration, Instant},
};
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, error, info, warn};

use crate::{
    config::{ServiceDescriptor, ServiceId},
    constants::{CURRENT_VERSION_ALIAS, PID_LOCK_SUFFIX, STOP_POLL_INTERVAL},
    env::EnvironmentSnapshot,
    error::{PidFileError, SpawnError, StopError},
};

/// How long to wait for the kernel to reap a process after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A plain-integer pid file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

/// Exclusive advisory lock on a pid file, released on drop.
#[derive(Debug)]
pub struct PidFileLock {
    _file: File,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Reads the recorded pid. `Ok(None)` when the file is absent.
    pub fn read(&self) -> Result<Option<u32>, PidFileError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let trimmed = contents.trim();
        match trimmed.parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => Err(PidFileError::Corrupt {
                path: self.path.clone(),
                content: trimmed.to_string(),
            }),
        }
    }

    /// Writes the pid through a temporary file and a rename, so readers never see a torn value.
    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, format!("{pid}\n"))?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Removes the file; a missing file is not an error.
    pub fn remove(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Takes the cross-process lock guarding writes to this pid file.
    pub fn lock(&self) -> Result<PidFileLock, PidFileError> {
        let mut lock_path: OsString = self.path.clone().into_os_string();
        lock_path.push(PID_LOCK_SUFFIX);
        let lock_path = PathBuf::from(lock_path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(PidFileLock { _file: file })
    }
}

/// Result of a successful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No live process was recorded.
    AlreadyStopped,
    /// The process exited after SIGTERM.
    Graceful,
    /// The process ignored SIGTERM and was killed. Reported as a warning.
    ForcedKill,
}

/// Emitted by the waiter thread when a spawned process exits.
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub service: ServiceId,
    pub pid: u32,
    pub status: ExitStatus,
}

/// Starts, stops and probes service processes described by a [`ServiceDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct ProcessHandle {
    exit_tx: Option<Sender<ProcessExit>>,
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports every exit of a process spawned by this handle on `exit_tx`.
    pub fn with_exit_notifier(exit_tx: Sender<ProcessExit>) -> Self {
        Self {
            exit_tx: Some(exit_tx),
        }
    }

    /// Spawns the service with the snapshot applied and records its pid.
    pub fn start(
        &self,
        descriptor: &ServiceDescriptor,
        env: &EnvironmentSnapshot,
    ) -> Result<u32, SpawnError> {
        let service = descriptor.id;

        if !descriptor.binary.is_file() {
            return Err(SpawnError::BinaryNotFound {
                service,
                path: descriptor.binary.clone(),
            });
        }

        let pid_file = PidFile::new(&descriptor.pid_file);
        let _lock = pid_file
            .lock()
            .map_err(|source| SpawnError::PidFile { service, source })?;

        match pid_file.read() {
            Ok(Some(pid)) if pid_alive(pid) && process_matches_binary(pid, &descriptor.binary) => {
                return Err(SpawnError::AlreadyRunning { service, pid });
            }
            Ok(Some(pid)) => {
                debug!("Clearing stale PID {pid} for '{service}'");
                let _ = pid_file.remove();
            }
            Ok(None) => {}
            Err(err) => {
                warn!("Discarding unreadable pid file for '{service}': {err}");
                let _ = pid_file.remove();
            }
        }

        let (stdout, stderr) = open_log(&descriptor.log_file)
            .map_err(|source| SpawnError::SpawnRefused { service, source })?;

        debug!(
            "Launching service '{service}': {} {}",
            descriptor.binary.display(),
            descriptor.args.join(" ")
        );

        let mut cmd = Command::new(&descriptor.binary);
        cmd.args(&descriptor.args)
            .current_dir(&descriptor.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        env.apply(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|source| SpawnError::SpawnRefused { service, source })?;
        let pid = child.id();

        if let Err(source) = pid_file.write(pid) {
            error!("Failed to record PID {pid} for '{service}'; killing it");
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpawnError::PidFile { service, source });
        }

        let exit_tx = self.exit_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("wait-{service}"))
            .spawn(move || match child.wait() {
                Ok(status) => {
                    debug!("Service '{service}' (PID {pid}) exited with {status}");
                    if let Some(tx) = exit_tx {
                        let _ = tx.send(ProcessExit {
                            service,
                            pid,
                            status,
                        });
                    }
                }
                Err(err) => warn!("Failed to wait on '{service}' (PID {pid}): {err}"),
            });
        if let Err(err) = spawned {
            warn!("Failed to spawn waiter for '{service}': {err}");
        }

        info!("Started service '{service}' (PID {pid})");
        Ok(pid)
    }

    /// Stops the recorded process: SIGTERM, poll until `timeout`, then SIGKILL.
    ///
    /// A missing pid file is success. The pid file is removed only once the
    /// process is confirmed gone.
    pub fn stop(
        &self,
        descriptor: &ServiceDescriptor,
        timeout: Duration,
    ) -> Result<StopOutcome, StopError> {
        let service = descriptor.id;
        let pid_file = PidFile::new(&descriptor.pid_file);

        if !pid_file.exists() {
            debug!("Service '{service}' has no pid file; nothing to stop");
            return Ok(StopOutcome::AlreadyStopped);
        }

        let _lock = pid_file
            .lock()
            .map_err(|source| StopError::PidFile { service, source })?;

        let pid = match pid_file.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return Ok(StopOutcome::AlreadyStopped),
            Err(PidFileError::Corrupt { content, .. }) => {
                warn!("Removing corrupt pid file for '{service}' ({content:?})");
                pid_file
                    .remove()
                    .map_err(|source| StopError::PidFile { service, source })?;
                return Ok(StopOutcome::AlreadyStopped);
            }
            Err(source) => return Err(StopError::PidFile { service, source }),
        };

        if !pid_alive(pid) || !process_matches_binary(pid, &descriptor.binary) {
            debug!("Service '{service}' PID {pid} is not ours or gone; clearing pid file");
            pid_file
                .remove()
                .map_err(|source| StopError::PidFile { service, source })?;
            return Ok(StopOutcome::AlreadyStopped);
        }

        let outcome = terminate_pid(pid, service.as_ref(), timeout).map_err(|source| {
            if source.kind() == ErrorKind::TimedOut {
                StopError::StillAlive { service, pid }
            } else {
                StopError::Signal {
                    service,
                    pid,
                    source,
                }
            }
        })?;

        pid_file
            .remove()
            .map_err(|source| StopError::PidFile { service, source })?;

        match outcome {
            StopOutcome::ForcedKill => {
                warn!("Service '{service}' (PID {pid}) had to be killed forcefully")
            }
            _ => info!("Service '{service}' (PID {pid}) stopped"),
        }
        Ok(outcome)
    }

    /// Pid file present, process alive, and (best effort) running our binary.
    pub fn is_alive(&self, descriptor: &ServiceDescriptor) -> bool {
        self.live_pid(descriptor).is_some()
    }

    /// The recorded pid when it passes [`Self::is_alive`].
    pub fn live_pid(&self, descriptor: &ServiceDescriptor) -> Option<u32> {
        let pid = PidFile::new(&descriptor.pid_file).read().ok().flatten()?;
        (pid_alive(pid) && process_matches_binary(pid, &descriptor.binary)).then_some(pid)
    }
}

fn open_log(path: &Path) -> io::Result<(File, File)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let clone = file.try_clone()?;
    Ok((file, clone))
}

fn nix_error_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// True when a process with this pid exists and is not a zombie.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match signal::kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(_) => return false,
    }

    let mut system = System::new();
    let target = SysPid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    !matches!(
        system.process(target).map(|process| process.status()),
        Some(ProcessStatus::Zombie | ProcessStatus::Dead)
    )
}

/// Best-effort guard against pid reuse: the process image or its command line
/// must reference `binary`. Unreadable process details count as a match.
///
/// Daemons that rewrite their process title can only be matched by image, so a
/// binary reached through a `current` alias also matches every sibling version.
pub fn process_matches_binary(pid: u32, binary: &Path) -> bool {
    let mut system = System::new();
    let target = SysPid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::Always)
            .with_cmd(UpdateKind::Always),
    );

    let Some(process) = system.process(target) else {
        return false;
    };

    let exe = process.exe();
    let cmd = process.cmd();
    if exe.is_none() && cmd.is_empty() {
        return true;
    }

    let known: Vec<PathBuf> = binary_variants(binary)
        .iter()
        .filter_map(|variant| fs::canonicalize(variant).ok())
        .collect();
    let same = |candidate: &Path| {
        candidate == binary
            || fs::canonicalize(candidate).is_ok_and(|resolved| known.contains(&resolved))
    };

    exe.is_some_and(same) || cmd.iter().any(|arg| same(Path::new(arg)))
}

/// `binary` plus the same relative path under each sibling of a `current` alias on its path.
fn binary_variants(binary: &Path) -> Vec<PathBuf> {
    let mut variants = vec![binary.to_path_buf()];

    let alias = binary.ancestors().skip(1).find(|dir| {
        dir.file_name() == Some(OsStr::new(CURRENT_VERSION_ALIAS))
            && fs::symlink_metadata(dir).is_ok_and(|meta| meta.file_type().is_symlink())
    });
    let Some(alias) = alias else {
        return variants;
    };
    let (Ok(suffix), Some(parent)) = (binary.strip_prefix(alias), alias.parent()) else {
        return variants;
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return variants;
    };

    for entry in entries.flatten() {
        if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            variants.push(entry.path().join(suffix));
        }
    }
    variants
}

/// True when `pid` or one of its descendants holds a TCP socket listening on `port`.
///
/// Reads `/proc`; where that is unavailable no ownership is claimed.
pub fn holds_listening_port(pid: u32, port: u16) -> bool {
    let listeners = match listening_inodes(port) {
        Ok(inodes) => inodes,
        Err(err) => {
            debug!("Cannot read TCP socket tables: {err}");
            return false;
        }
    };
    if listeners.is_empty() {
        return false;
    }

    process_tree(pid)
        .into_iter()
        .any(|member| socket_inodes(member).iter().any(|inode| listeners.contains(inode)))
}

fn listening_inodes(port: u16) -> io::Result<Vec<u64>> {
    let mut inodes = Vec::new();
    let mut tables_read = 0;
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let contents = match fs::read_to_string(table) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        tables_read += 1;
        inodes.extend(
            contents
                .lines()
                .skip(1)
                .filter_map(|row| listener_inode(row, port)),
        );
    }

    if tables_read == 0 {
        return Err(io::Error::new(ErrorKind::NotFound, "no /proc/net/tcp tables"));
    }
    Ok(inodes)
}

/// The socket inode of a `/proc/net/tcp` row when it is in LISTEN state on `port`.
fn listener_inode(row: &str, port: u16) -> Option<u64> {
    const TCP_LISTEN: &str = "0A";

    let fields: Vec<&str> = row.split_whitespace().collect();
    let (_, local_port) = fields.get(1)?.rsplit_once(':')?;
    if *fields.get(3)? != TCP_LISTEN || u16::from_str_radix(local_port, 16).ok()? != port {
        return None;
    }
    fields.get(9)?.parse().ok().filter(|inode| *inode != 0)
}

fn socket_inodes(pid: u32) -> Vec<u64> {
    let Ok(entries) = fs::read_dir(format!("/proc/{pid}/fd")) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter_map(|target| {
            target
                .to_str()?
                .strip_prefix("socket:[")?
                .strip_suffix(']')?
                .parse()
                .ok()
        })
        .collect()
}

/// `pid` followed by all of its descendants.
fn process_tree(pid: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing(),
    );

    let mut tree = vec![pid];
    let mut next = 0;
    while next < tree.len() {
        let parent = SysPid::from_u32(tree[next]);
        tree.extend(
            system
                .processes()
                .iter()
                .filter(|(_, process)| process.parent() == Some(parent))
                .map(|(child, _)| child.as_u32()),
        );
        next += 1;
    }
    tree
}

/// Sends SIGTERM to `pid` (and its process group when it leads one), waits up to
/// `timeout`, then escalates to SIGKILL.
///
/// Returns `TimedOut` when the process survives SIGKILL.
pub fn terminate_pid(pid: u32, label: &str, timeout: Duration) -> io::Result<StopOutcome> {
    let raw = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    let target = Pid::from_raw(raw);

    if !pid_alive(pid) {
        return Ok(StopOutcome::AlreadyStopped);
    }

    debug!("Stopping '{label}' (PID {pid})");
    let supervisor_pgid = unsafe { libc::getpgid(0) };
    let child_pgid = unsafe { libc::getpgid(raw) };
    let leads_group = child_pgid == raw && child_pgid != supervisor_pgid;

    if leads_group {
        let kill_result = unsafe { libc::killpg(child_pgid, libc::SIGTERM) };
        if kill_result < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::ESRCH => {}
                Some(code) if code == libc::EPERM => {
                    warn!(
                        "Insufficient permissions to signal process group {child_pgid} for '{label}'. Falling back to direct signal"
                    );
                }
                _ => return Err(err),
            }
        }
    }

    match signal::kill(target, Some(signal::SIGTERM)) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return Ok(StopOutcome::Graceful),
        Err(err) => return Err(nix_error_to_io(err)),
    }

    if wait_for_exit(pid, timeout) {
        return Ok(StopOutcome::Graceful);
    }

    warn!("'{label}' did not exit after SIGTERM within {timeout:?}; sending SIGKILL");
    if leads_group {
        unsafe {
            libc::killpg(child_pgid, libc::SIGKILL);
        }
    }
    match signal::kill(target, Some(signal::SIGKILL)) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => return Err(nix_error_to_io(err)),
    }

    if wait_for_exit(pid, KILL_GRACE) {
        Ok(StopOutcome::ForcedKill)
    } else {
        Err(io::Error::new(
            ErrorKind::TimedOut,
            format!("PID {pid} survived SIGKILL"),
        ))
    }
}

/// Waits for a child with a timeout, returning `Ok(None)` when it is still running.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// Like [`wait_with_timeout`], but kills and reaps the child when time runs out.
///
/// A child spawned with `process_group(0)` has its whole group killed.
pub fn wait_or_kill(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    if let Some(status) = wait_with_timeout(child, timeout)? {
        return Ok(Some(status));
    }

    let group_killed = i32::try_from(child.id())
        .ok()
        .filter(|raw| unsafe { libc::getpgid(*raw) } == *raw)
        .is_some_and(|raw| signal::killpg(Pid::from_raw(raw), signal::SIGKILL).is_ok());
    if !group_killed {
        let _ = child.kill();
    }
    child.wait()?;
    Ok(None)
}

/// Polls liveness every [`STOP_POLL_INTERVAL`] until the process is gone or `timeout` elapses.
fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }
}
