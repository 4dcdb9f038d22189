use std::{
    error::Error,
    fs::{self, OpenOptions},
    io::{IsTerminal, stdout},
    os::unix::process::CommandExt,
    process::Command,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use webstack::{
    cli::{Cli, Commands, ConfigAction, LogKind, parse_args},
    confgen,
    config::{ServiceId, ServiceRegistry},
    constants::LIBRARY_PATH_VAR,
    diagnostics::{DiagnosticsEngine, Severity, log_findings},
    env::EnvironmentResolver,
    logs,
    runtime::StackLayout,
    selftest::SelfTest,
    settings::Settings,
    status::StatusSnapshot,
    supervisor::ServiceSupervisor,
    version::{RuntimeVersionSwitcher, SwitchOutcome, discover_versions},
};

/// How often `watch` reconciles state with the process table.
const WATCH_TICK: Duration = Duration::from_secs(2);

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let layout = StackLayout::discover();
    init_logging(&args, &layout);

    let mut settings = Settings::load(&layout.settings_path())?;

    match args.command {
        Commands::Start { service } => {
            prepare_stack(&layout, &settings)?;
            let supervisor = build_supervisor(&layout, &settings)?;
            match service {
                Some(service) => {
                    let pid = supervisor.start_one(service)?;
                    println!("{service} running (PID {pid})");
                }
                None => {
                    let started = supervisor.start_all()?;
                    println!("Started {} service(s)", started.len());
                }
            }
        }
        Commands::Stop { service } => {
            let supervisor = build_supervisor(&layout, &settings)?;
            match service {
                Some(service) => {
                    let outcome = supervisor.stop_one(service)?;
                    println!("{service}: {outcome:?}");
                }
                None => {
                    for (service, outcome) in supervisor.stop_all()? {
                        println!("{service}: {outcome:?}");
                    }
                    if settings.auto_clean_logs {
                        logs::clean_logs(&layout)?;
                    }
                    if settings.auto_clean_temp {
                        logs::clean_temp(&layout)?;
                    }
                }
            }
        }
        Commands::Restart { service } => {
            prepare_stack(&layout, &settings)?;
            let supervisor = build_supervisor(&layout, &settings)?;
            match service {
                Some(service) => {
                    let pid = supervisor.restart(service)?;
                    println!("{service} running (PID {pid})");
                }
                None => {
                    supervisor.stop_all()?;
                    let started = supervisor.start_all()?;
                    println!("Restarted {} service(s)", started.len());
                }
            }
        }
        Commands::Status { json, no_color } => {
            let supervisor = build_supervisor(&layout, &settings)?;
            let snapshot = StatusSnapshot::capture(&supervisor, &layout);
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                let color = !no_color && stdout().is_terminal();
                print!("{}", snapshot.render(color));
            }
        }
        Commands::Versions { json } => {
            let versions = discover_versions(&layout)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&versions)?);
            } else if versions.is_empty() {
                println!("No PHP runtimes installed under {}", layout.php_root().display());
            } else {
                for version in versions {
                    let marker = if version.is_current { "*" } else { " " };
                    println!("{marker} {:<8} {}", version.version, version.path.display());
                }
            }
        }
        Commands::SwitchVersion { version } => {
            let supervisor = build_supervisor(&layout, &settings)?;
            let switcher = RuntimeVersionSwitcher::new(layout.clone(), supervisor);
            match switcher.switch_to(&version)? {
                SwitchOutcome::Switched { from, to } => println!(
                    "Switched PHP runtime from {} to {to}",
                    from.as_deref().unwrap_or("<none>")
                ),
                SwitchOutcome::RolledBack {
                    attempted,
                    restored,
                    start_error,
                } => {
                    warn!("PHP {attempted} failed to start: {start_error}");
                    println!("PHP {attempted} failed to start; restored {restored}");
                }
            }
        }
        Commands::Doctor { json } => {
            let engine = build_diagnostics(&layout, &settings)?;
            let findings: Vec<_> = engine.run_all().collect();
            log_findings(&findings);
            if json {
                println!("{}", serde_json::to_string_pretty(&findings)?);
            } else {
                for finding in &findings {
                    let fix = if finding.has_repair() { " [repairable]" } else { "" };
                    println!(
                        "{:<8} {:<22} {}: {}{fix}",
                        finding.severity.to_string().to_lowercase(),
                        finding.check.to_string(),
                        finding.subject,
                        finding.description
                    );
                }
            }
            let problems = findings
                .iter()
                .filter(|f| !f.kind.is_healthy() && f.severity == Severity::Error)
                .count();
            if problems > 0 {
                return Err(format!("{problems} problem(s) found; run `wstack repair`").into());
            }
        }
        Commands::Repair => {
            let engine = build_diagnostics(&layout, &settings)?;
            let findings = engine.auto_repair();
            for finding in findings.iter().filter(|f| f.has_repair()) {
                println!(
                    "{} {}: {}{}",
                    finding.check,
                    finding.subject,
                    finding.repair_outcome,
                    finding
                        .repair_detail
                        .as_deref()
                        .map(|d| format!(" ({d})"))
                        .unwrap_or_default()
                );
            }
            let remaining = findings.iter().filter(|f| f.is_actionable()).count();
            if remaining > 0 {
                return Err(format!("{remaining} repair(s) did not succeed").into());
            }
            println!("Nothing left to repair");
        }
        Commands::Config { action } => match action {
            ConfigAction::List => {
                for (key, value) in settings.entries() {
                    println!("{key} = {}", value.unwrap_or_default());
                }
            }
            ConfigAction::Get { key } => {
                println!("{}", settings.get(&key)?.unwrap_or_default());
            }
            ConfigAction::Set { key, value } => {
                settings.set(&key, &value)?;
                settings.save(&layout.settings_path())?;
                info!("Setting '{key}' updated");
                if key.ends_with("_port") || key.ends_with("_socket") {
                    let changed = confgen::apply_settings(&layout, &settings)?;
                    if !changed.is_empty() {
                        let names: Vec<String> = changed.iter().map(ToString::to_string).collect();
                        println!(
                            "Updated configs for {}; restart those services to apply",
                            names.join(", ")
                        );
                    }
                }
            }
            ConfigAction::Reset => {
                settings = Settings::default();
                settings.save(&layout.settings_path())?;
                let changed = confgen::apply_settings(&layout, &settings)?;
                info!("Settings reset to defaults");
                println!("Settings reset to defaults");
                if !changed.is_empty() {
                    let names: Vec<String> = changed.iter().map(ToString::to_string).collect();
                    println!(
                        "Updated configs for {}; restart those services to apply",
                        names.join(", ")
                    );
                }
            }
        },
        Commands::Test { service, json } => {
            let registry = ServiceRegistry::load(&layout, &settings)?;
            let resolver = EnvironmentResolver::new(layout.clone(), settings.auto_load_env);
            let snapshot = resolver.current();
            let results = SelfTest::new(&layout, &registry, &snapshot).run(service);
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for result in &results {
                    let verdict = if result.passed { "PASS" } else { "FAIL" };
                    println!("{verdict} {:<10} {}", result.service.to_string(), result.detail);
                }
            }
            let failed = results.iter().filter(|r| !r.passed).count();
            if failed > 0 {
                return Err(format!("{failed} self-test(s) failed").into());
            }
        }
        Commands::Env { json } => {
            let resolver = EnvironmentResolver::new(layout.clone(), settings.auto_load_env);
            let snapshot = resolver.current();
            if json {
                println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
            } else {
                println!("{LIBRARY_PATH_VAR}={}", join_paths(snapshot.library_paths()));
                println!("PATH={}", join_paths(snapshot.executable_paths()));
                for (key, value) in snapshot.vars() {
                    println!("{key}={value}");
                }
            }
        }
        Commands::Logs {
            service,
            lines,
            kind,
        } => {
            let paths = match service {
                None => vec![layout.app_log()],
                Some(service) => log_paths(&layout, &settings, service, kind)?,
            };
            logs::show_logs(&paths, lines)?;
        }
        Commands::Clean {
            logs: clean_logs,
            temp,
            build,
        } => {
            // With no flag, clean logs and temporary files.
            let (clean_logs, temp) = if clean_logs || temp || build {
                (clean_logs, temp)
            } else {
                (true, true)
            };
            if clean_logs {
                println!("Cleaned {} log file(s)", logs::clean_logs(&layout)?.len());
            }
            if temp {
                println!("Cleaned {} temporary file(s)", logs::clean_temp(&layout)?);
            }
            if build {
                let freed = logs::clean_build(&layout)?;
                println!("Freed {:.1} MB of build files", freed as f64 / 1_048_576.0);
            }
        }
        Commands::Client { args } => {
            let client = layout.mariadb_client();
            if !client.is_file() {
                return Err(format!("database client not found at {}", client.display()).into());
            }
            let resolver = EnvironmentResolver::new(layout.clone(), settings.auto_load_env);
            let mut cmd = Command::new(&client);
            cmd.arg(format!("--socket={}", settings.database_socket(&layout).display()))
                .args(args);
            resolver.current().apply(&mut cmd);
            // Only returns on failure.
            let err = cmd.exec();
            return Err(format!("failed to run {}: {err}", client.display()).into());
        }
        Commands::Watch => {
            prepare_stack(&layout, &settings)?;
            let supervisor = build_supervisor(&layout, &settings)?;
            run_watch(&supervisor, &settings)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli, layout: &StackLayout) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let app_log = fs::create_dir_all(layout.root())
        .and_then(|()| OpenOptions::new().create(true).append(true).open(layout.app_log()))
        .ok()
        .map(|file| fmt::layer().with_ansi(false).with_writer(Arc::new(file)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(app_log)
        .try_init();
}

fn build_supervisor(
    layout: &StackLayout,
    settings: &Settings,
) -> Result<ServiceSupervisor, Box<dyn Error>> {
    let registry = ServiceRegistry::load(layout, settings)?;
    let env = Arc::new(EnvironmentResolver::new(layout.clone(), settings.auto_load_env));
    let supervisor = ServiceSupervisor::new(registry, env)?;
    supervisor.refresh();
    Ok(supervisor)
}

/// The state view is a freshly refreshed supervisor, which adopts every live
/// recorded daemon as Running. From the command line a held port is therefore
/// either owned or a conflict; stale holders are only reported to callers that
/// share a long-lived supervisor whose service has been marked Failed.
fn build_diagnostics(
    layout: &StackLayout,
    settings: &Settings,
) -> Result<DiagnosticsEngine, Box<dyn Error>> {
    let supervisor = build_supervisor(layout, settings)?;
    let env = supervisor.environment().clone();
    Ok(DiagnosticsEngine::new(layout.clone(), env).with_state_view(Arc::new(supervisor)))
}

/// Creates the runtime directories and brings the service configs in line with the settings.
fn prepare_stack(layout: &StackLayout, settings: &Settings) -> Result<(), Box<dyn Error>> {
    for dir in layout.required_dirs() {
        fs::create_dir_all(&dir)?;
    }
    let changed = confgen::apply_settings(layout, settings)?;
    if !changed.is_empty() {
        info!("Synchronised configs for {changed:?}");
    }
    Ok(())
}

fn log_paths(
    layout: &StackLayout,
    settings: &Settings,
    service: ServiceId,
    kind: LogKind,
) -> Result<Vec<std::path::PathBuf>, Box<dyn Error>> {
    let registry = ServiceRegistry::load(layout, settings)?;
    let descriptor = registry
        .get(service)
        .ok_or_else(|| format!("service '{service}' is not registered"))?;
    Ok(match kind {
        LogKind::Daemon => vec![logs::daemon_log(layout, service)],
        LogKind::Console => vec![descriptor.log_file.clone()],
        LogKind::All => logs::service_logs(layout, descriptor),
    })
}

fn join_paths(paths: &[std::path::PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Keeps the stack supervised in the foreground until Ctrl-C.
fn run_watch(supervisor: &ServiceSupervisor, settings: &Settings) -> Result<(), Box<dyn Error>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        flag.store(false, Ordering::SeqCst);
    })?;

    if settings.auto_start_on_launch {
        info!("Starting services on launch");
        if let Err(err) = supervisor.start_all() {
            error!("{err}");
        }
    }

    let mut last = supervisor.statuses();
    info!("Watching the stack; press Ctrl-C to exit");
    while running.load(Ordering::SeqCst) {
        thread::sleep(WATCH_TICK);
        let current = supervisor.refresh();
        for ((service, before), (_, after)) in last.iter().zip(current.iter()) {
            if before.state != after.state {
                info!("Service '{service}' is now {}", after.state);
            }
        }
        last = current;
    }

    if settings.auto_stop_on_exit {
        info!("Stopping services on exit");
        supervisor.stop_all()?;
    }
    Ok(())
}
