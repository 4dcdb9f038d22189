#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    net::{Ipv4Addr, TcpListener},
    os::unix::net::UnixListener,
    thread,
    time::{Duration, Instant},
};

use common::{TestStack, is_process_alive, processes_running, read_pid, wait_until, write_script};
use webstack::{
    config::{AdminCommand, ReadinessCheck, ServiceId},
    error::{FailureExtent, SpawnError, SupervisorError},
    process::StopOutcome,
    supervisor::ServiceState,
};

#[test]
fn start_records_the_live_pid() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    let pid = supervisor.start_one(ServiceId::Database).expect("start database");

    assert!(is_process_alive(pid));
    assert_eq!(read_pid(&stack.pid_file(ServiceId::Database)), Some(pid));
    let status = supervisor.status(ServiceId::Database).unwrap();
    assert_eq!(status.state, ServiceState::Running);
    assert_eq!(status.pid, Some(pid));

    supervisor.stop_all().expect("stop all");
}

#[test]
fn stop_is_idempotent() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    let pid = supervisor.start_one(ServiceId::FastCgiManager).unwrap();
    let first = supervisor.stop_one(ServiceId::FastCgiManager).unwrap();
    let second = supervisor.stop_one(ServiceId::FastCgiManager).unwrap();

    assert_eq!(first, StopOutcome::Graceful);
    assert_eq!(second, StopOutcome::AlreadyStopped);
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Stopped);
    assert!(!stack.pid_file(ServiceId::FastCgiManager).exists());
    assert!(wait_until(Duration::from_secs(3), || !is_process_alive(pid)));
}

#[test]
fn start_all_runs_dependencies_first() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    assert_eq!(supervisor.start_order().last(), Some(&ServiceId::WebServer));
    let started = supervisor.start_all().expect("start all");

    assert_eq!(started.len(), 3);
    assert_eq!(started.last(), Some(&ServiceId::WebServer));
    for (_, status) in supervisor.statuses() {
        assert_eq!(status.state, ServiceState::Running);
    }

    let stopped = supervisor.stop_all().expect("stop all");
    let order: Vec<_> = stopped.iter().map(|(id, _)| *id).collect();
    assert_eq!(order.first(), Some(&ServiceId::WebServer));
}

#[test]
fn start_all_reports_partial_failure_when_web_server_binary_is_missing() {
    let stack = TestStack::installed();
    fs::remove_file(stack.layout.nginx_binary()).unwrap();
    let supervisor = stack.supervisor();

    let failure = supervisor.start_all().expect_err("web server cannot start");

    assert_eq!(failure.extent, FailureExtent::Partial);
    assert!(failure.succeeded.contains(&ServiceId::Database));
    assert!(failure.succeeded.contains(&ServiceId::FastCgiManager));
    assert!(matches!(
        failure.error_for(ServiceId::WebServer),
        Some(SupervisorError::Spawn(SpawnError::BinaryNotFound { .. }))
    ));
    assert_eq!(supervisor.state(ServiceId::WebServer), ServiceState::Failed);
    assert_eq!(supervisor.state(ServiceId::Database), ServiceState::Running);

    supervisor.stop_all().expect("stop all");
}

#[test]
fn dependents_of_a_failed_service_are_skipped() {
    let stack = TestStack::installed();
    fs::remove_file(stack.layout.mariadb_binary()).unwrap();
    let supervisor = stack.supervisor();

    let failure = supervisor.start_all().expect_err("database cannot start");

    assert!(matches!(
        failure.error_for(ServiceId::WebServer),
        Some(SupervisorError::DependencyFailed {
            dependency: ServiceId::Database,
            ..
        })
    ));
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Running);
    assert!(!stack.pid_file(ServiceId::WebServer).exists());

    supervisor.stop_all().expect("stop all");
}

#[test]
fn start_one_does_not_start_dependencies_implicitly() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    let err = supervisor.start_one(ServiceId::WebServer).unwrap_err();

    assert!(matches!(err, SupervisorError::DependencyNotReady { .. }));
    assert_ne!(supervisor.state(ServiceId::WebServer), ServiceState::Running);
    assert!(processes_running(&stack.layout.mariadb_binary()).is_empty());
}

#[test]
fn restart_replaces_the_process() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    let before = supervisor.start_one(ServiceId::Database).unwrap();
    let after = supervisor.restart(ServiceId::Database).unwrap();

    assert_ne!(before, after);
    assert_eq!(supervisor.state(ServiceId::Database), ServiceState::Running);
    assert!(wait_until(Duration::from_secs(3), || !is_process_alive(before)));

    supervisor.stop_all().expect("stop all");
}

#[test]
fn restart_of_a_broken_service_ends_failed() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    supervisor.start_one(ServiceId::Database).unwrap();
    fs::remove_file(stack.layout.mariadb_binary()).unwrap();

    assert!(supervisor.restart(ServiceId::Database).is_err());
    assert_eq!(supervisor.state(ServiceId::Database), ServiceState::Failed);
}

#[test]
fn starting_a_running_service_adopts_it() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();
    let pid = supervisor.start_one(ServiceId::Database).unwrap();

    // A second supervisor sees the same pid file.
    let other = stack.supervisor();
    other.refresh();
    assert_eq!(other.state(ServiceId::Database), ServiceState::Running);
    assert_eq!(other.start_one(ServiceId::Database).unwrap(), pid);
    assert_eq!(processes_running(&stack.layout.mariadb_binary()), vec![pid]);

    supervisor.stop_all().expect("stop all");
}

#[test]
fn unexpected_exit_marks_the_service_failed() {
    let stack = TestStack::installed();
    write_script(&stack.layout.mariadb_binary(), "#!/bin/sh\nsleep 1\n");
    let supervisor = stack.supervisor();

    supervisor.start_one(ServiceId::Database).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        supervisor.state(ServiceId::Database) == ServiceState::Failed
    }));
}

#[test]
fn concurrent_start_and_stop_never_duplicate_processes() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();
    let binary = stack.layout.mariadb_binary();

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let supervisor = supervisor.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    if i % 2 == 0 {
                        let _ = supervisor.start_one(ServiceId::Database);
                    } else {
                        let _ = supervisor.stop_one(ServiceId::Database);
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    // Stopped children may take a moment to be reaped.
    assert!(wait_until(Duration::from_secs(3), || {
        processes_running(&binary).len() <= 1
    }));
    let state = supervisor.state(ServiceId::Database);
    assert!(matches!(state, ServiceState::Running | ServiceState::Stopped));
    if state == ServiceState::Running {
        let pid = read_pid(&stack.pid_file(ServiceId::Database));
        assert_eq!(processes_running(&binary).first().copied(), pid);
    }

    supervisor.stop_all().expect("stop all");
    assert!(wait_until(Duration::from_secs(3), || processes_running(&binary).is_empty()));
}

#[test]
fn async_operations_report_their_result() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();

    let pending = supervisor.start_all_async();
    let started = pending.wait().expect("worker result").expect("start all");
    assert_eq!(started.len(), 3);

    let stopped = supervisor
        .stop_async(ServiceId::WebServer)
        .wait_timeout(Duration::from_secs(10))
        .expect("worker result")
        .expect("stop web server");
    assert_eq!(stopped, StopOutcome::Graceful);

    supervisor.stop_all().expect("stop all");
}

#[test]
fn service_listening_on_its_unix_socket_becomes_running() {
    let stack = TestStack::installed();
    let socket = stack.dir.path().join("fpm.sock");
    let _listener = UnixListener::bind(&socket).unwrap();
    let supervisor = stack.supervisor_with(stack.descriptors_with(
        ServiceId::FastCgiManager,
        |descriptor| descriptor.readiness = ReadinessCheck::UnixSocket(socket.clone()),
    ));

    let pid = supervisor.start_one(ServiceId::FastCgiManager).expect("socket accepted");

    assert!(is_process_alive(pid));
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Running);

    supervisor.stop_all().expect("stop all");
}

#[test]
fn service_listening_on_its_tcp_port_becomes_running() {
    let stack = TestStack::installed();
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let supervisor = stack.supervisor_with(stack.descriptors_with(ServiceId::Database, |descriptor| {
        descriptor.readiness = ReadinessCheck::Tcp(port);
    }));

    supervisor.start_one(ServiceId::Database).expect("port accepted");

    assert_eq!(supervisor.state(ServiceId::Database), ServiceState::Running);
    supervisor.stop_all().expect("stop all");
}

#[test]
fn service_that_never_listens_fails_and_is_cleaned_up() {
    let stack = TestStack::installed();
    let socket = stack.dir.path().join("nobody.sock");
    let supervisor = stack.supervisor_with(stack.descriptors_with(
        ServiceId::FastCgiManager,
        |descriptor| {
            descriptor.readiness = ReadinessCheck::UnixSocket(socket.clone());
            descriptor.startup_grace = Duration::from_millis(500);
        },
    ));

    let result = supervisor.start_one(ServiceId::FastCgiManager);

    assert!(matches!(result, Err(SupervisorError::NotReady(_))));
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Failed);
    assert!(!stack.pid_file(ServiceId::FastCgiManager).exists());
    let binary = stack.layout.php_fpm_binary();
    assert!(wait_until(Duration::from_secs(3), || processes_running(&binary).is_empty()));
}

#[test]
fn hanging_admin_ping_cannot_outlast_the_startup_grace() {
    let stack = TestStack::installed();
    let socket = stack.dir.path().join("db.sock");
    let _listener = UnixListener::bind(&socket).unwrap();
    let ping = stack.dir.path().join("hanging-admin");
    write_script(&ping, "#!/bin/sh\nsleep 20\n");
    let supervisor = stack.supervisor_with(stack.descriptors_with(ServiceId::Database, |descriptor| {
        descriptor.readiness = ReadinessCheck::UnixSocket(socket.clone());
        descriptor.admin_ping = Some(AdminCommand {
            binary: ping.clone(),
            args: Vec::new(),
        });
        descriptor.startup_grace = Duration::from_secs(1);
    }));
    let started = Instant::now();

    let result = supervisor.start_one(ServiceId::Database);

    assert!(started.elapsed() < Duration::from_secs(6), "took {:?}", started.elapsed());
    assert!(matches!(result, Err(SupervisorError::NotReady(_))));
    assert_eq!(supervisor.state(ServiceId::Database), ServiceState::Failed);
    assert!(wait_until(Duration::from_secs(3), || processes_running(&ping).is_empty()));
}
