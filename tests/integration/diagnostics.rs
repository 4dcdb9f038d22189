#[path = "common/mod.rs"]
mod common;

use std::{
    fs, io,
    net::{Ipv4Addr, TcpListener},
    os::{
        fd::AsRawFd,
        unix::{net::UnixListener, process::CommandExt},
    },
    path::Path,
    process::{Child, Command, Stdio},
    sync::Arc,
    time::Duration,
};

use common::{TestStack, processes_running, wait_until, write_script};
use webstack::{
    config::ServiceId,
    diagnostics::{
        CheckId, DiagnosticFinding, DiagnosticsEngine, FindingKind, Repair, RepairOutcome,
        ServiceStateView,
    },
    env::EnvironmentResolver,
    settings::Settings,
    supervisor::ServiceState,
};

struct FixedView(ServiceState);

impl ServiceStateView for FixedView {
    fn service_state(&self, _id: ServiceId) -> ServiceState {
        self.0
    }
}

fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("no free port")
}

/// Points both services at ports nothing else is using.
fn isolate_ports(stack: &TestStack) -> Settings {
    let settings = Settings {
        nginx_port: free_port(),
        database_port: free_port(),
        ..Settings::default()
    };
    settings.save(&stack.layout.settings_path()).unwrap();
    settings
}

fn engine(stack: &TestStack) -> DiagnosticsEngine {
    let env = Arc::new(EnvironmentResolver::new(stack.layout.clone(), false));
    DiagnosticsEngine::new(stack.layout.clone(), env)
}

fn findings_for(findings: &[DiagnosticFinding], check: CheckId) -> Vec<&DiagnosticFinding> {
    findings.iter().filter(|f| f.check == check).collect()
}

#[test]
fn repairing_twice_leaves_nothing_actionable() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    fs::remove_file(stack.layout.php_current()).unwrap();
    let engine = engine(&stack);

    let before: Vec<_> = engine.run_all().collect();
    assert!(before.iter().any(|f| f.kind == FindingKind::AliasMissing));
    assert!(before.iter().any(|f| f.kind == FindingKind::ConfigMissing));
    assert!(before.iter().any(|f| f.kind == FindingKind::DirectoryMissing));

    let first = engine.auto_repair();
    assert!(first
        .iter()
        .filter(|f| f.has_repair())
        .all(|f| f.repair_outcome == RepairOutcome::Success));

    let second = engine.auto_repair();
    assert_eq!(second.iter().filter(|f| f.is_actionable()).count(), 0);

    let after: Vec<_> = engine.run_all().collect();
    assert!(after.iter().all(|f| !f.has_repair()), "{after:#?}");
    assert!(stack.layout.php_current().is_dir());
    assert!(stack.layout.nginx_conf().is_file());
    assert!(stack.layout.php_fpm_conf().is_file());
    assert!(stack.layout.mariadb_conf().is_file());
}

#[test]
fn missing_binary_is_reported_without_a_repair() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    fs::remove_file(stack.layout.nginx_binary()).unwrap();

    let findings: Vec<_> = engine(&stack).run_all().collect();
    let binaries = findings_for(&findings, CheckId::BinaryExists);

    let web = binaries
        .iter()
        .find(|f| f.subject == ServiceId::WebServer.to_string())
        .unwrap();
    assert_eq!(web.kind, FindingKind::BinaryMissing);
    assert!(!web.has_repair());
}

#[test]
fn stale_socket_is_removed() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    let socket = stack.layout.php_fpm_socket();
    drop(UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let repaired = engine(&stack).auto_repair();
    let finding = repaired
        .iter()
        .find(|f| f.kind == FindingKind::StaleSocket)
        .expect("stale socket reported");

    assert_eq!(finding.repair_outcome, RepairOutcome::Success);
    assert!(!socket.exists());
}

#[test]
fn overlong_socket_path_is_relocated() {
    let stack = TestStack::installed();
    let mut settings = isolate_ports(&stack);
    let deep = stack.dir.path().join("a".repeat(60)).join("b".repeat(60));
    fs::create_dir_all(&deep).unwrap();
    settings.database_socket = Some(deep.join("mariadb.sock"));
    settings.save(&stack.layout.settings_path()).unwrap();

    let engine = engine(&stack);
    let before: Vec<_> = engine.run_all().collect();
    let too_long = before
        .iter()
        .find(|f| f.kind == FindingKind::SocketPathTooLong)
        .expect("long socket reported");
    let Some(Repair::RelocateSocket { to, .. }) = &too_long.repair else {
        panic!("expected a relocation repair");
    };
    let target = to.clone();

    let repaired = engine.auto_repair();
    let relocated = repaired
        .iter()
        .find(|f| f.kind == FindingKind::SocketPathTooLong)
        .unwrap();
    assert_eq!(relocated.repair_outcome, RepairOutcome::Success);

    let saved = Settings::load(&stack.layout.settings_path()).unwrap();
    assert_eq!(saved.database_socket.as_deref(), Some(target.as_path()));
    let my_cnf = fs::read_to_string(stack.layout.mariadb_conf()).unwrap();
    assert!(my_cnf.contains(&target.display().to_string()));
}

#[test]
fn system_socket_reference_is_rewritten() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    fs::write(
        stack.layout.mariadb_conf(),
        "[client]\nsocket = /tmp/mysql.sock\n\n[mysqld]\nport = 3306\nsocket = /tmp/mysql.sock\n",
    )
    .unwrap();

    let repaired = engine(&stack).auto_repair();
    let finding = repaired
        .iter()
        .find(|f| f.kind == FindingKind::SystemSocket)
        .expect("system socket reported");

    assert_eq!(finding.repair_outcome, RepairOutcome::Success);
    let my_cnf = fs::read_to_string(stack.layout.mariadb_conf()).unwrap();
    assert!(!my_cnf.contains("/tmp/mysql.sock"));
    assert!(my_cnf.contains(&stack.layout.mariadb_socket().display().to_string()));
}

#[test]
fn unparsable_config_has_no_automatic_repair() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    fs::create_dir_all(stack.layout.nginx_conf().parent().unwrap()).unwrap();
    fs::write(stack.layout.nginx_conf(), "http {\n    server {\n").unwrap();

    let findings: Vec<_> = engine(&stack).run_all().collect();
    let nginx = findings_for(&findings, CheckId::ConfigValid)
        .into_iter()
        .find(|f| Path::new(&f.subject) == stack.layout.nginx_conf())
        .unwrap();

    assert_eq!(nginx.kind, FindingKind::ConfigInvalid);
    assert!(!nginx.has_repair());
}

/// Starts the database binary outside any supervisor, sharing `listener`'s
/// socket, and records it in the pid file the way an earlier run would have.
fn leftover_database(stack: &TestStack, listener: &TcpListener) -> Child {
    let fd = listener.as_raw_fd();
    let mut command = Command::new(stack.layout.mariadb_binary());
    command.process_group(0).stdin(Stdio::null());
    unsafe {
        command.pre_exec(move || {
            if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = command.spawn().expect("spawn leftover database");
    let binary = stack.layout.mariadb_binary();
    assert!(wait_until(Duration::from_secs(3), || {
        processes_running(&binary).contains(&child.id())
    }));

    let pid_file = stack.pid_file(ServiceId::Database);
    fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
    fs::write(&pid_file, format!("{}\n", child.id())).unwrap();
    child
}

fn port_finding(diagnostics: DiagnosticsEngine, port: u16) -> DiagnosticFinding {
    let subject = format!("{port}/tcp");
    diagnostics
        .run_all()
        .find(|f| f.check == CheckId::PortAvailable && f.subject == subject)
        .expect("database port checked")
}

#[test]
fn listening_daemon_is_owned_or_stale_depending_on_supervisor_state() {
    let stack = TestStack::installed();
    let settings = isolate_ports(&stack);
    let port = settings.database_port;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    let mut daemon = leftover_database(&stack, &listener);
    drop(listener);

    let owned = port_finding(
        engine(&stack).with_state_view(Arc::new(FixedView(ServiceState::Running))),
        port,
    );
    assert_eq!(owned.kind, FindingKind::PortOwnedByService);
    assert!(owned.kind.is_healthy());

    let stale = port_finding(
        engine(&stack).with_state_view(Arc::new(FixedView(ServiceState::Failed))),
        port,
    );
    assert_eq!(stale.kind, FindingKind::PortHeldByStaleProcess);
    assert_eq!(
        stale.repair,
        Some(Repair::TerminateStale {
            service: ServiceId::Database,
            pid: daemon.id(),
            port,
        })
    );

    let repaired = engine(&stack)
        .with_state_view(Arc::new(FixedView(ServiceState::Failed)))
        .with_stop_timeout(Duration::from_secs(2))
        .auto_repair();
    let finding = repaired
        .iter()
        .find(|f| f.check == CheckId::PortAvailable && f.has_repair())
        .expect("stale holder repaired");
    assert_eq!(finding.repair_outcome, RepairOutcome::Success);
    assert!(!stack.pid_file(ServiceId::Database).exists());
    daemon.wait().unwrap();
}

#[test]
fn foreign_listener_is_a_conflict_even_while_the_daemon_runs() {
    let stack = TestStack::installed();
    let settings = isolate_ports(&stack);
    let supervisor = stack.supervisor();
    supervisor.start_one(ServiceId::Database).unwrap();
    // Bound by the test process, not by the recorded daemon.
    let _listener = TcpListener::bind((Ipv4Addr::LOCALHOST, settings.database_port)).unwrap();

    for state in [ServiceState::Running, ServiceState::Failed] {
        let finding = port_finding(
            engine(&stack).with_state_view(Arc::new(FixedView(state))),
            settings.database_port,
        );
        assert_eq!(finding.kind, FindingKind::PortConflict);
        assert!(!finding.has_repair());
    }

    supervisor.stop_all().expect("stop all");
}

#[test]
fn refreshed_supervisor_adopts_a_leftover_daemon_as_the_port_owner() {
    let stack = TestStack::installed();
    let settings = isolate_ports(&stack);
    let port = settings.database_port;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    let mut daemon = leftover_database(&stack, &listener);
    drop(listener);

    let supervisor = stack.supervisor();
    supervisor.refresh();
    assert_eq!(supervisor.state(ServiceId::Database), ServiceState::Running);

    let finding = port_finding(
        engine(&stack).with_state_view(Arc::new(supervisor.clone())),
        port,
    );
    assert_eq!(finding.kind, FindingKind::PortOwnedByService);

    supervisor.stop_all().expect("stop all");
    daemon.wait().unwrap();
}

#[test]
fn uninitialised_database_is_initialised_by_the_install_script() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    write_script(
        &stack.layout.mariadb_install_db(),
        "#!/bin/sh\nfor arg in \"$@\"; do\n  case \"$arg\" in\n    --datadir=*) mkdir -p \"${arg#--datadir=}/mysql\" ;;\n  esac\ndone\n",
    );

    let repaired = engine(&stack).auto_repair();
    let finding = repaired
        .iter()
        .find(|f| f.check == CheckId::DatabaseInitialized && f.has_repair())
        .expect("initialisation offered");

    assert_eq!(finding.repair_outcome, RepairOutcome::Success);
    assert!(stack.layout.mariadb_data().join("mysql").is_dir());
}

#[test]
fn failing_install_script_reports_the_failure() {
    let stack = TestStack::installed();
    isolate_ports(&stack);
    write_script(
        &stack.layout.mariadb_install_db(),
        "#!/bin/sh\necho 'cannot create system tables' >&2\nexit 1\n",
    );

    let repaired = engine(&stack).auto_repair();
    let finding = repaired
        .iter()
        .find(|f| f.check == CheckId::DatabaseInitialized && f.has_repair())
        .unwrap();

    assert_eq!(finding.repair_outcome, RepairOutcome::Failed);
    assert!(finding.is_actionable());
    assert!(finding
        .repair_detail
        .as_deref()
        .is_some_and(|detail| detail.contains("cannot create system tables")));
}
