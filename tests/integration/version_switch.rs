#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use common::{TestStack, processes_running, wait_until};
use webstack::{
    config::ServiceId,
    error::SwitchError,
    supervisor::ServiceState,
    version::{RuntimeVersionSwitcher, SwitchOutcome, current_version},
};

fn switcher(stack: &TestStack) -> RuntimeVersionSwitcher {
    RuntimeVersionSwitcher::new(stack.layout.clone(), stack.supervisor())
}

#[test]
fn switching_to_the_current_version_touches_nothing() {
    let stack = TestStack::installed();
    let supervisor = stack.supervisor();
    let pid = supervisor.start_one(ServiceId::FastCgiManager).unwrap();
    let switcher = RuntimeVersionSwitcher::new(stack.layout.clone(), supervisor.clone());

    let err = switcher.switch_to("8.3").unwrap_err();

    assert!(matches!(err, SwitchError::AlreadyCurrent(version) if version == "8.3"));
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Running);
    assert_eq!(
        supervisor.status(ServiceId::FastCgiManager).unwrap().pid,
        Some(pid)
    );

    supervisor.stop_all().expect("stop all");
}

#[test]
fn unknown_version_is_rejected() {
    let stack = TestStack::installed();

    let err = switcher(&stack).switch_to("9.9").unwrap_err();

    assert!(matches!(err, SwitchError::NotInstalled(_)));
    assert_eq!(current_version(&stack.layout).as_deref(), Some("8.3"));
}

#[test]
fn switch_restarts_fastcgi_on_the_new_version() {
    let stack = TestStack::installed();
    stack.install_php("8.4", true);
    let supervisor = stack.supervisor();
    supervisor.start_one(ServiceId::FastCgiManager).unwrap();
    let switcher = RuntimeVersionSwitcher::new(stack.layout.clone(), supervisor.clone());

    let outcome = switcher.switch_to("8.4").expect("switch");

    match outcome {
        SwitchOutcome::Switched { from, to } => {
            assert_eq!(from.as_deref(), Some("8.3"));
            assert_eq!(to, "8.4");
        }
        other => panic!("expected a clean switch, got {other:?}"),
    }
    assert_eq!(current_version(&stack.layout).as_deref(), Some("8.4"));
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Running);
    assert!(stack.layout.php_root().join("8.4/php-fpm.pid").exists());
    assert!(!stack.layout.php_root().join("8.3/php-fpm.pid").exists());

    supervisor.stop_all().expect("stop all");
}

#[test]
fn failed_start_rolls_back_to_the_previous_version() {
    let stack = TestStack::installed();
    // Discoverable, but has no php-fpm to start.
    stack.install_php("8.4", false);
    let supervisor = stack.supervisor();
    supervisor.start_one(ServiceId::FastCgiManager).unwrap();
    let switcher = RuntimeVersionSwitcher::new(stack.layout.clone(), supervisor.clone());

    let outcome = switcher.switch_to("8.4").expect("rollback is not an error");

    match outcome {
        SwitchOutcome::RolledBack {
            attempted,
            restored,
            ..
        } => {
            assert_eq!(attempted, "8.4");
            assert_eq!(restored, "8.3");
        }
        other => panic!("expected a rollback, got {other:?}"),
    }
    assert_eq!(current_version(&stack.layout).as_deref(), Some("8.3"));
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Running);
    let fpm = stack.layout.php_fpm_binary();
    assert_eq!(processes_running(&fpm).len(), 1);

    supervisor.stop_all().expect("stop all");
}

#[test]
fn failed_start_without_previous_version_is_an_error() {
    let stack = TestStack::installed();
    fs::remove_file(stack.layout.php_current()).unwrap();
    stack.install_php("8.4", false);

    let err = switcher(&stack).switch_to("8.4").unwrap_err();

    assert!(matches!(err, SwitchError::StartFailed { .. }));
    assert_eq!(current_version(&stack.layout).as_deref(), Some("8.4"));
}

#[test]
fn failed_rollback_leaves_fastcgi_failed() {
    let stack = TestStack::installed();
    stack.install_php("8.4", false);
    let supervisor = stack.supervisor();
    supervisor.start_one(ServiceId::FastCgiManager).unwrap();
    // The previous version loses its daemon while still running.
    fs::remove_file(stack.layout.php_root().join("8.3/sbin/php-fpm")).unwrap();
    let switcher = RuntimeVersionSwitcher::new(stack.layout.clone(), supervisor.clone());

    let err = switcher.switch_to("8.4").unwrap_err();

    match err {
        SwitchError::SwitchFailedUnrecoverable {
            attempted,
            previous,
            ..
        } => {
            assert_eq!(attempted, "8.4");
            assert_eq!(previous, "8.3");
        }
        other => panic!("expected an unrecoverable switch, got {other:?}"),
    }
    assert_eq!(supervisor.state(ServiceId::FastCgiManager), ServiceState::Failed);
    let fpm = stack.layout.php_fpm_binary();
    assert!(wait_until(Duration::from_secs(3), || processes_running(&fpm).is_empty()));
}

#[test]
fn concurrent_starts_never_duplicate_fastcgi_during_switches() {
    let stack = TestStack::installed();
    stack.install_php("8.4", true);
    let supervisor = stack.supervisor();
    supervisor.start_one(ServiceId::FastCgiManager).unwrap();
    let switcher = RuntimeVersionSwitcher::new(stack.layout.clone(), supervisor.clone());
    let fpm = stack.layout.php_fpm_binary();

    let done = Arc::new(AtomicBool::new(false));
    let starter = {
        let supervisor = supervisor.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                let _ = supervisor.start_one(ServiceId::FastCgiManager);
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    for version in ["8.4", "8.3", "8.4", "8.3", "8.4", "8.3"] {
        switcher.switch_to(version).expect("switch");
        let running = processes_running(&fpm);
        assert!(running.len() <= 1, "duplicate php-fpm after switching to {version}: {running:?}");
    }

    done.store(true, Ordering::SeqCst);
    starter.join().unwrap();
    supervisor.stop_all().expect("stop all");
    assert!(wait_until(Duration::from_secs(3), || processes_running(&fpm).is_empty()));
}
