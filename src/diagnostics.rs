//! Checklist of independent health predicates, each with an optional repair.
//!
//! Every run re-reads settings and the filesystem; nothing is cached between runs.
use serde::Serialize;
use std::{
    fs,
    io::ErrorKind,
    net::{Ipv4Addr, TcpListener},
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter};
use tracing::{error, info, warn};

use crate::{
    confgen,
    config::{ServiceDescriptor, ServiceId, ServiceRegistry},
    constants::{DEFAULT_STOP_TIMEOUT, MAX_UNIX_SOCKET_PATH},
    env::{EnvironmentResolver, EnvironmentSnapshot},
    error::DiagnosticFailure,
    process::{self, PidFile},
    runtime::StackLayout,
    settings::Settings,
    supervisor::ServiceState,
    version,
};

/// Read access to the supervisor's view of service state.
///
/// Used to tell a stack-owned process the supervisor still considers
/// running from a stale one left over from an earlier run.
pub trait ServiceStateView: Send + Sync {
    fn service_state(&self, id: ServiceId) -> ServiceState;
}

/// The checks, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CheckId {
    BinaryExists,
    ConfigValid,
    SocketPath,
    AliasIntegrity,
    PortAvailable,
    Libraries,
    RequiredDirectories,
    DatabaseInitialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum RepairOutcome {
    Success,
    Failed,
    NotAttempted,
}

/// What a check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Healthy,
    BinaryMissing,
    ConfigMissing,
    ConfigInvalid,
    SystemSocket,
    SocketPathTooLong,
    StaleSocket,
    AliasMissing,
    AliasBroken,
    AliasNotSymlink,
    NoRuntimeInstalled,
    PortOwnedByService,
    PortHeldByStaleProcess,
    /// Occupied by a process we cannot prove is ours.
    PortConflict,
    PortUnavailable,
    LibraryMissing,
    DirectoryMissing,
    DatabaseUninitialized,
}

impl FindingKind {
    pub fn is_healthy(self) -> bool {
        matches!(self, FindingKind::Healthy | FindingKind::PortOwnedByService)
    }
}

/// A fix a finding offers. Every repair is safe to run twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Repair {
    RegenerateConfig { service: ServiceId },
    SyncConfig { service: ServiceId },
    RelocateSocket { service: ServiceId, to: PathBuf },
    RemoveSocket { path: PathBuf },
    RelinkAlias { version: String },
    TerminateStale { service: ServiceId, pid: u32, port: u16 },
    CreateDirectories { paths: Vec<PathBuf> },
    InitializeDatabase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticFinding {
    pub check: CheckId,
    pub kind: FindingKind,
    pub severity: Severity,
    /// The service, path or port the finding is about.
    pub subject: String,
    pub description: String,
    pub repair: Option<Repair>,
    pub repair_outcome: RepairOutcome,
    pub repair_detail: Option<String>,
}

impl DiagnosticFinding {
    fn new(
        check: CheckId,
        kind: FindingKind,
        severity: Severity,
        subject: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            check,
            kind,
            severity,
            subject: subject.into(),
            description: description.into(),
            repair: None,
            repair_outcome: RepairOutcome::NotAttempted,
            repair_detail: None,
        }
    }

    fn healthy(check: CheckId, subject: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(check, FindingKind::Healthy, Severity::Info, subject, description)
    }

    fn with_repair(mut self, repair: Repair) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn has_repair(&self) -> bool {
        self.repair.is_some()
    }

    /// Has a repair that has not been shown to work yet.
    pub fn is_actionable(&self) -> bool {
        self.repair.is_some() && self.repair_outcome != RepairOutcome::Success
    }
}

/// Everything a single run looks at, loaded fresh from disk.
struct CheckContext {
    settings: Settings,
    registry: ServiceRegistry,
    env: Arc<EnvironmentSnapshot>,
}

/// Runs the checklist and its repairs.
pub struct DiagnosticsEngine {
    layout: StackLayout,
    env: Arc<EnvironmentResolver>,
    state_view: Option<Arc<dyn ServiceStateView>>,
    stop_timeout: Duration,
}

impl DiagnosticsEngine {
    pub fn new(layout: StackLayout, env: Arc<EnvironmentResolver>) -> Self {
        Self {
            layout,
            env,
            state_view: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Lets the port check ask which services the supervisor believes are running.
    pub fn with_state_view(mut self, view: Arc<dyn ServiceStateView>) -> Self {
        self.state_view = Some(view);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn context(&self) -> CheckContext {
        let settings = Settings::load(&self.layout.settings_path()).unwrap_or_else(|err| {
            warn!("Using default settings for diagnostics: {err}");
            Settings::default()
        });
        let registry = ServiceRegistry::load(&self.layout, &settings).unwrap_or_else(|err| {
            warn!("Ignoring unreadable manifest for diagnostics: {err}");
            ServiceRegistry::new(crate::config::default_descriptors(&self.layout, &settings))
        });
        CheckContext {
            settings,
            registry,
            env: self.env.current(),
        }
    }

    /// Evaluates every check in order. The sequence is lazy; each check runs when reached.
    pub fn run_all(&self) -> impl Iterator<Item = DiagnosticFinding> + '_ {
        let ctx = self.context();
        CheckId::iter().flat_map(move |check| self.run_check(check, &ctx))
    }

    /// Runs every check, applies each available repair, and re-checks to record the real outcome.
    pub fn auto_repair(&self) -> Vec<DiagnosticFinding> {
        let findings: Vec<_> = self.run_all().collect();
        let mut repaired = Vec::with_capacity(findings.len());

        for mut finding in findings {
            let Some(repair) = finding.repair.clone() else {
                repaired.push(finding);
                continue;
            };

            info!("Repairing {} on '{}': {:?}", finding.check, finding.subject, repair);
            let attempt = self.apply(&repair);

            let ctx = self.context();
            let still_failing = self
                .run_check(finding.check, &ctx)
                .into_iter()
                .find(|f| f.subject == finding.subject && !f.kind.is_healthy());

            let failure = match (attempt, still_failing) {
                (Ok(()), None) => None,
                (Err(reason), _) => Some(reason),
                (Ok(()), Some(after)) => Some(after.description),
            };

            match failure {
                None => {
                    info!("Repaired {} on '{}'", finding.check, finding.subject);
                    finding.repair_outcome = RepairOutcome::Success;
                }
                Some(reason) => {
                    let failure = DiagnosticFailure {
                        check: finding.check,
                        subject: finding.subject.clone(),
                        reason,
                    };
                    error!("{failure}");
                    finding.repair_outcome = RepairOutcome::Failed;
                    finding.repair_detail = Some(failure.reason);
                }
            }
            repaired.push(finding);
        }

        repaired
    }

    fn run_check(&self, check: CheckId, ctx: &CheckContext) -> Vec<DiagnosticFinding> {
        match check {
            CheckId::BinaryExists => self.check_binaries(ctx),
            CheckId::ConfigValid => self.check_configs(ctx),
            CheckId::SocketPath => self.check_sockets(ctx),
            CheckId::AliasIntegrity => self.check_alias(),
            CheckId::PortAvailable => self.check_ports(ctx),
            CheckId::Libraries => self.check_libraries(ctx),
            CheckId::RequiredDirectories => self.check_directories(),
            CheckId::DatabaseInitialized => self.check_database_initialized(),
        }
    }

    fn check_binaries(&self, ctx: &CheckContext) -> Vec<DiagnosticFinding> {
        ctx.registry
            .descriptors()
            .map(|descriptor| {
                let subject = descriptor.id.to_string();
                if descriptor.binary.is_file() {
                    DiagnosticFinding::healthy(
                        CheckId::BinaryExists,
                        subject,
                        format!("found {}", descriptor.binary.display()),
                    )
                } else {
                    DiagnosticFinding::new(
                        CheckId::BinaryExists,
                        FindingKind::BinaryMissing,
                        Severity::Error,
                        subject,
                        format!("binary not found at {}", descriptor.binary.display()),
                    )
                }
            })
            .collect()
    }

    fn check_configs(&self, ctx: &CheckContext) -> Vec<DiagnosticFinding> {
        let check = CheckId::ConfigValid;
        let alias_ok = self.layout.php_current().is_dir();
        let mut findings = Vec::new();

        for descriptor in ctx.registry.descriptors() {
            let service = descriptor.id;
            for config in &descriptor.config_files {
                let subject = config.path.display().to_string();

                if service == ServiceId::FastCgiManager && !alias_ok {
                    findings.push(DiagnosticFinding::new(
                        check,
                        FindingKind::Healthy,
                        Severity::Info,
                        subject,
                        "skipped: no active runtime version",
                    ));
                    continue;
                }

                let content = match fs::read_to_string(&config.path) {
                    Ok(content) => content,
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        findings.push(
                            DiagnosticFinding::new(
                                check,
                                FindingKind::ConfigMissing,
                                Severity::Error,
                                subject,
                                format!("{service} config is missing"),
                            )
                            .with_repair(Repair::RegenerateConfig { service }),
                        );
                        continue;
                    }
                    Err(err) => {
                        findings.push(DiagnosticFinding::new(
                            check,
                            FindingKind::ConfigInvalid,
                            Severity::Error,
                            subject,
                            format!("cannot read {service} config: {err}"),
                        ));
                        continue;
                    }
                };

                if content.trim().is_empty() {
                    findings.push(
                        DiagnosticFinding::new(
                            check,
                            FindingKind::ConfigInvalid,
                            Severity::Error,
                            subject,
                            format!("{service} config is empty"),
                        )
                        .with_repair(Repair::RegenerateConfig { service }),
                    );
                    continue;
                }

                if let Err(reason) = confgen::validate(config.format, &content) {
                    findings.push(DiagnosticFinding::new(
                        check,
                        FindingKind::ConfigInvalid,
                        Severity::Error,
                        subject,
                        format!("{service} config does not parse: {reason}"),
                    ));
                    continue;
                }

                let own_socket = ctx.settings.database_socket(&self.layout);
                match confgen::system_socket_reference(&content) {
                    Some(socket) if own_socket != Path::new(socket) => {
                        findings.push(
                            DiagnosticFinding::new(
                                check,
                                FindingKind::SystemSocket,
                                Severity::Warning,
                                subject,
                                format!("{service} config points at system socket {socket}"),
                            )
                            .with_repair(Repair::SyncConfig { service }),
                        );
                    }
                    _ => findings.push(DiagnosticFinding::healthy(
                        check,
                        subject,
                        format!("{service} config is valid"),
                    )),
                }
            }
        }
        findings
    }

    fn check_sockets(&self, ctx: &CheckContext) -> Vec<DiagnosticFinding> {
        let check = CheckId::SocketPath;
        let handle = process::ProcessHandle::new();
        let mut findings = Vec::new();

        for descriptor in ctx.registry.descriptors() {
            let Some(socket) = descriptor.socket_path() else {
                continue;
            };
            let service = descriptor.id;
            let subject = service.to_string();
            let length = socket.as_os_str().len();

            if length > MAX_UNIX_SOCKET_PATH {
                let file_name = socket
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(format!("{service}.sock")));
                findings.push(
                    DiagnosticFinding::new(
                        check,
                        FindingKind::SocketPathTooLong,
                        Severity::Error,
                        subject,
                        format!(
                            "{service} socket {} is {length} bytes; the limit is {MAX_UNIX_SOCKET_PATH}",
                            socket.display()
                        ),
                    )
                    .with_repair(Repair::RelocateSocket {
                        service,
                        to: self.layout.short_socket_dir().join(file_name),
                    }),
                );
            } else if socket.exists() && !handle.is_alive(descriptor) {
                findings.push(
                    DiagnosticFinding::new(
                        check,
                        FindingKind::StaleSocket,
                        Severity::Warning,
                        subject,
                        format!(
                            "{service} is not running but its socket {} remains",
                            socket.display()
                        ),
                    )
                    .with_repair(Repair::RemoveSocket {
                        path: socket.to_path_buf(),
                    }),
                );
            } else {
                findings.push(DiagnosticFinding::healthy(
                    check,
                    subject,
                    format!("{service} socket {} is usable", socket.display()),
                ));
            }
        }
        findings
    }

    fn check_alias(&self) -> Vec<DiagnosticFinding> {
        let check = CheckId::AliasIntegrity;
        let alias = self.layout.php_current();
        let subject = alias.display().to_string();

        let installed = version::discover_versions(&self.layout).unwrap_or_default();
        let highest = installed.last().map(|v| v.version.clone());
        let relink = |finding: DiagnosticFinding| match &highest {
            Some(version) => finding.with_repair(Repair::RelinkAlias {
                version: version.clone(),
            }),
            None => finding,
        };

        let metadata = match fs::symlink_metadata(&alias) {
            Ok(metadata) => metadata,
            Err(_) if installed.is_empty() => {
                return vec![DiagnosticFinding::new(
                    check,
                    FindingKind::NoRuntimeInstalled,
                    Severity::Error,
                    subject,
                    "no runtime version is installed",
                )];
            }
            Err(_) => {
                return vec![relink(DiagnosticFinding::new(
                    check,
                    FindingKind::AliasMissing,
                    Severity::Error,
                    subject,
                    "current-version alias does not exist",
                ))];
            }
        };

        if !metadata.file_type().is_symlink() {
            return vec![DiagnosticFinding::new(
                check,
                FindingKind::AliasNotSymlink,
                Severity::Warning,
                subject,
                "current-version alias is a real directory, not a link",
            )];
        }

        match version::current_version(&self.layout) {
            Some(current) if installed.iter().any(|v| v.version == current) => {
                vec![DiagnosticFinding::healthy(
                    check,
                    subject,
                    format!("current version is {current}"),
                )]
            }
            _ => {
                let target = fs::read_link(&alias)
                    .map(|t| t.display().to_string())
                    .unwrap_or_default();
                vec![relink(DiagnosticFinding::new(
                    check,
                    FindingKind::AliasBroken,
                    Severity::Error,
                    subject,
                    format!("current-version alias points at missing or incomplete '{target}'"),
                ))]
            }
        }
    }

    fn check_ports(&self, ctx: &CheckContext) -> Vec<DiagnosticFinding> {
        ctx.registry
            .descriptors()
            .filter_map(|descriptor| {
                descriptor
                    .listen_port
                    .map(|port| self.check_port(descriptor, port))
            })
            .collect()
    }

    fn check_port(&self, descriptor: &ServiceDescriptor, port: u16) -> DiagnosticFinding {
        let check = CheckId::PortAvailable;
        let service = descriptor.id;
        let subject = format!("{port}/tcp");

        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
            Ok(listener) => {
                drop(listener);
                return DiagnosticFinding::healthy(check, subject, format!("port {port} is free"));
            }
            Err(err) if err.kind() != ErrorKind::AddrInUse => {
                return DiagnosticFinding::new(
                    check,
                    FindingKind::PortUnavailable,
                    Severity::Warning,
                    subject,
                    format!("cannot test port {port}: {err}"),
                );
            }
            Err(_) => {}
        }

        // Ownership is only claimed for a live process recorded in our own pid
        // file that actually holds the listening socket.
        let recorded = PidFile::new(&descriptor.pid_file)
            .read()
            .ok()
            .flatten()
            .filter(|pid| {
                process::pid_alive(*pid) && process::process_matches_binary(*pid, &descriptor.binary)
            });
        let owner = recorded.filter(|pid| process::holds_listening_port(*pid, port));

        let Some(pid) = owner else {
            let detail = match recorded {
                Some(pid) => format!(
                    "port {port} for {service} is in use by a process other than {service} (PID {pid})"
                ),
                None => format!("port {port} for {service} is in use by an unknown process"),
            };
            return DiagnosticFinding::new(
                check,
                FindingKind::PortConflict,
                Severity::Error,
                subject,
                detail,
            );
        };

        let believed_running = self
            .state_view
            .as_ref()
            .is_none_or(|view| view.service_state(service) == ServiceState::Running);

        if believed_running {
            DiagnosticFinding::new(
                check,
                FindingKind::PortOwnedByService,
                Severity::Info,
                subject,
                format!("port {port} is served by {service} (PID {pid})"),
            )
        } else {
            DiagnosticFinding::new(
                check,
                FindingKind::PortHeldByStaleProcess,
                Severity::Error,
                subject,
                format!("port {port} is held by a stale {service} process (PID {pid})"),
            )
            .with_repair(Repair::TerminateStale { service, pid, port })
        }
    }

    fn check_libraries(&self, ctx: &CheckContext) -> Vec<DiagnosticFinding> {
        let check = CheckId::Libraries;
        ctx.registry
            .features()
            .iter()
            .map(|(feature, libraries)| {
                let missing: Vec<&str> = libraries
                    .iter()
                    .map(String::as_str)
                    .filter(|lib| ctx.env.find_library(lib).is_none())
                    .collect();
                if missing.is_empty() {
                    DiagnosticFinding::healthy(
                        check,
                        feature.clone(),
                        format!("libraries for '{feature}' are available"),
                    )
                } else {
                    DiagnosticFinding::new(
                        check,
                        FindingKind::LibraryMissing,
                        Severity::Info,
                        feature.clone(),
                        format!(
                            "'{feature}' unavailable; missing {} in the isolated library path",
                            missing.join(", ")
                        ),
                    )
                }
            })
            .collect()
    }

    fn check_directories(&self) -> Vec<DiagnosticFinding> {
        let check = CheckId::RequiredDirectories;
        let subject = self.layout.root().display().to_string();
        let missing: Vec<PathBuf> = self
            .layout
            .required_dirs()
            .into_iter()
            .filter(|dir| !dir.is_dir())
            .collect();

        if missing.is_empty() {
            return vec![DiagnosticFinding::healthy(
                check,
                subject,
                "runtime directories exist",
            )];
        }

        let listed = missing
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        vec![
            DiagnosticFinding::new(
                check,
                FindingKind::DirectoryMissing,
                Severity::Warning,
                subject,
                format!("missing directories: {listed}"),
            )
            .with_repair(Repair::CreateDirectories { paths: missing }),
        ]
    }

    fn check_database_initialized(&self) -> Vec<DiagnosticFinding> {
        let check = CheckId::DatabaseInitialized;
        let data = self.layout.mariadb_data();
        let subject = data.display().to_string();

        if data.join("mysql").is_dir() {
            return vec![DiagnosticFinding::healthy(
                check,
                subject,
                "database data directory is initialised",
            )];
        }

        let finding = DiagnosticFinding::new(
            check,
            FindingKind::DatabaseUninitialized,
            Severity::Warning,
            subject,
            "database data directory has no system tables",
        );
        if self.layout.mariadb_install_db().is_file() {
            vec![finding.with_repair(Repair::InitializeDatabase)]
        } else {
            vec![finding]
        }
    }

    fn apply(&self, repair: &Repair) -> Result<(), String> {
        match repair {
            Repair::RegenerateConfig { service } => {
                let ctx = self.context();
                let values = confgen::ConfigValues::from_settings(&self.layout, &ctx.settings);
                confgen::generate(*service, &self.layout, &values)
                    .map(drop)
                    .map_err(|err| err.to_string())
            }
            Repair::SyncConfig { service } => {
                let ctx = self.context();
                let values = confgen::ConfigValues::from_settings(&self.layout, &ctx.settings);
                confgen::sync(*service, &self.layout, &values)
                    .map(drop)
                    .map_err(|err| err.to_string())
            }
            Repair::RelocateSocket { service, to } => self.relocate_socket(*service, to),
            Repair::RemoveSocket { path } => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.to_string()),
            },
            Repair::RelinkAlias { version } => {
                version::repoint_alias(&self.layout.php_root(), version)
                    .map_err(|err| err.to_string())
            }
            Repair::TerminateStale { service, pid, port } => {
                self.terminate_stale(*service, *pid, *port)
            }
            Repair::CreateDirectories { paths } => {
                for path in paths {
                    fs::create_dir_all(path)
                        .map_err(|err| format!("{}: {err}", path.display()))?;
                }
                Ok(())
            }
            Repair::InitializeDatabase => self.initialize_database(),
        }
    }

    /// Re-checks ownership right before signalling; the pid may have been
    /// reused since the finding was produced.
    fn terminate_stale(&self, service: ServiceId, pid: u32, port: u16) -> Result<(), String> {
        let ctx = self.context();
        let descriptor = ctx
            .registry
            .get(service)
            .ok_or_else(|| format!("{service} is not registered"))?;
        let pid_file = PidFile::new(&descriptor.pid_file);
        if pid_file.read().ok().flatten() != Some(pid) {
            return Err(format!("pid file for {service} no longer names PID {pid}"));
        }

        if !process::pid_alive(pid) {
            return pid_file.remove().map_err(|err| err.to_string());
        }
        if !process::process_matches_binary(pid, &descriptor.binary)
            || !process::holds_listening_port(pid, port)
        {
            return Err(format!(
                "PID {pid} is no longer {service} holding port {port}; not terminating it"
            ));
        }

        process::terminate_pid(pid, service.as_ref(), self.stop_timeout)
            .map_err(|err| err.to_string())?;
        pid_file.remove().map_err(|err| err.to_string())
    }

    fn relocate_socket(&self, service: ServiceId, to: &Path) -> Result<(), String> {
        if let Some(dir) = to.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|err| format!("{}: {err}", dir.display()))?;
        }

        let path = self.layout.settings_path();
        let mut settings = Settings::load(&path).map_err(|err| err.to_string())?;
        match service {
            ServiceId::FastCgiManager => settings.fastcgi_socket = Some(to.to_path_buf()),
            ServiceId::Database => settings.database_socket = Some(to.to_path_buf()),
            ServiceId::WebServer => return Err("web server has no socket to relocate".into()),
        }
        settings.save(&path).map_err(|err| err.to_string())?;

        confgen::apply_settings(&self.layout, &settings).map_err(|err| err.to_string())?;
        info!("Relocated {service} socket to {}", to.display());
        Ok(())
    }

    fn initialize_database(&self) -> Result<(), String> {
        let script = self.layout.mariadb_install_db();
        let data = self.layout.mariadb_data();
        fs::create_dir_all(&data).map_err(|err| err.to_string())?;

        let user = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| user.name)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "nobody".into());

        let mut cmd = Command::new(&script);
        cmd.arg(format!("--basedir={}", self.layout.mariadb_dir().display()))
            .arg(format!("--datadir={}", data.display()))
            .arg(format!("--user={user}"))
            .stdin(Stdio::null());
        self.env.current().apply(&mut cmd);

        let output = cmd.output().map_err(|err| err.to_string())?;
        if output.status.success() {
            info!("Database data directory initialised");
            Ok(())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

/// Logs findings through the application log, the only place they persist.
pub fn log_findings(findings: &[DiagnosticFinding]) {
    for finding in findings {
        let line = format!(
            "[{}] {}: {}",
            finding.check, finding.subject, finding.description
        );
        match finding.severity {
            Severity::Info => info!("{line}"),
            Severity::Warning => warn!("{line}"),
            Severity::Error => error!("{line}"),
        }
    }
}
