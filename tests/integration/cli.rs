#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::{TestStack, write_script};
use predicates::{boolean::PredicateBooleanExt, str::contains};
use webstack::version::repoint_alias;

struct CliStack {
    stack: TestStack,
}

impl CliStack {
    fn new() -> Self {
        let stack = TestStack::new();
        fs::create_dir_all(stack.dir.path().join("home")).expect("failed to create home dir");
        Self { stack }
    }

    fn installed() -> Self {
        let cli = Self::new();
        cli.stack.install_php("8.2", true);
        cli.stack.install_php("8.3", true);
        repoint_alias(&cli.stack.layout.php_root(), "8.3").expect("failed to link current");
        cli
    }

    fn home(&self) -> std::path::PathBuf {
        self.stack.dir.path().join("home")
    }

    fn wstack(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("wstack"));
        cmd.env("HOME", self.home())
            .env("WEBSTACK_HOME", self.stack.layout.root())
            .env_remove("RUST_LOG");
        cmd
    }
}

#[test]
fn config_set_persists_and_rewrites_the_web_server_config() {
    let cli = CliStack::new();

    cli.wstack()
        .args(["config", "set", "nginx_port", "9091"])
        .assert()
        .success();

    cli.wstack()
        .args(["config", "get", "nginx_port"])
        .assert()
        .success()
        .stdout(contains("9091"));

    assert!(cli.home().join(".config/webstack/settings.json").is_file());
    let nginx = fs::read_to_string(cli.stack.layout.nginx_conf()).unwrap();
    assert!(nginx.contains("listen 127.0.0.1:9091") || nginx.contains("listen 9091"));
}

#[test]
fn config_rejects_unknown_keys() {
    let cli = CliStack::new();

    cli.wstack()
        .args(["config", "set", "colour", "blue"])
        .assert()
        .failure();
}

#[test]
fn config_list_shows_every_key() {
    let cli = CliStack::new();

    cli.wstack()
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(contains("nginx_port = 8080"))
        .stdout(contains("auto_stop_on_exit = true"));
}

#[test]
fn versions_marks_the_current_runtime() {
    let cli = CliStack::installed();

    cli.wstack()
        .arg("versions")
        .assert()
        .success()
        .stdout(contains("* 8.3"))
        .stdout(contains("  8.2"));
}

#[test]
fn switching_to_the_current_version_fails_without_side_effects() {
    let cli = CliStack::installed();

    cli.wstack()
        .args(["switch-version", "8.3"])
        .assert()
        .failure();

    assert_eq!(
        webstack::version::current_version(&cli.stack.layout).as_deref(),
        Some("8.3")
    );
}

#[test]
fn status_json_reports_stopped_services() {
    let cli = CliStack::installed();

    let output = cli
        .wstack()
        .args(["status", "--json"])
        .output()
        .expect("failed to run status");
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["runtime_version"], "8.3");
    let services = report["services"].as_array().unwrap();
    assert_eq!(services.len(), 3);
    assert!(services.iter().all(|s| s["state"] == "stopped"));
}

#[test]
fn stop_with_nothing_running_succeeds() {
    let cli = CliStack::installed();

    cli.wstack().arg("stop").assert().success();
    cli.wstack()
        .args(["stop", "--service", "database"])
        .assert()
        .success();
}

#[test]
fn start_without_binaries_fails() {
    let cli = CliStack::new();

    cli.wstack()
        .args(["start", "--service", "database"])
        .assert()
        .failure();
}

#[test]
fn doctor_reports_missing_binaries() {
    let cli = CliStack::new();

    cli.wstack()
        .arg("doctor")
        .assert()
        .failure()
        .stdout(contains("binary-exists"));
}

#[test]
fn clean_logs_empties_service_logs() {
    let cli = CliStack::new();
    let log = cli.stack.layout.nginx_dir().join("logs/error.log");
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    fs::write(&log, "old failure\n").unwrap();

    cli.wstack()
        .args(["clean", "--logs"])
        .assert()
        .success()
        .stdout(contains("Cleaned 1 log file(s)"));

    assert_eq!(fs::read(&log).unwrap().len(), 0);
}

#[test]
fn logs_tails_the_daemon_log() {
    let cli = CliStack::new();
    let log = cli.stack.layout.mariadb_dir().join("logs/error.log");
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    fs::write(&log, "first\nsecond\nthird\n").unwrap();

    cli.wstack()
        .args(["logs", "database", "-l", "1"])
        .assert()
        .success()
        .stdout(contains("third"))
        .stdout(contains("second").not());
}

#[test]
fn env_prints_the_stack_home() {
    let cli = CliStack::new();

    cli.wstack()
        .arg("env")
        .assert()
        .success()
        .stdout(contains(format!(
            "WEBSTACK_HOME={}",
            cli.stack.layout.root().display()
        )));
}

#[test]
fn application_log_records_operations() {
    let cli = CliStack::installed();

    cli.wstack().arg("stop").assert().success();

    let app_log = fs::read_to_string(cli.stack.layout.app_log()).unwrap();
    assert!(app_log.contains("Stopping all services"));
    assert!(!app_log.contains("\x1b["));
}

#[test]
fn config_reset_restores_defaults_and_configs() {
    let cli = CliStack::new();
    cli.wstack()
        .args(["config", "set", "nginx_port", "9091"])
        .assert()
        .success();

    cli.wstack()
        .args(["config", "reset"])
        .assert()
        .success()
        .stdout(contains("Settings reset to defaults"));

    cli.wstack()
        .args(["config", "get", "nginx_port"])
        .assert()
        .success()
        .stdout(contains("8080"));
    let nginx = fs::read_to_string(cli.stack.layout.nginx_conf()).unwrap();
    assert!(!nginx.contains("9091"));
}

#[test]
fn clean_build_leaves_logs_alone() {
    let cli = CliStack::new();
    let layout = &cli.stack.layout;
    fs::create_dir_all(layout.build_dir().join("nginx-1.27.0/objs")).unwrap();
    fs::write(layout.build_dir().join("nginx-1.27.0/objs/nginx"), "binary").unwrap();
    fs::create_dir_all(layout.downloads_dir()).unwrap();
    fs::write(layout.downloads_dir().join("php-8.3.0.tar.gz"), "archive").unwrap();
    let log = layout.nginx_dir().join("logs/error.log");
    fs::create_dir_all(log.parent().unwrap()).unwrap();
    fs::write(&log, "keep me\n").unwrap();

    cli.wstack()
        .args(["clean", "--build"])
        .assert()
        .success()
        .stdout(contains("of build files"))
        .stdout(contains("log file(s)").not());

    assert_eq!(fs::read_dir(layout.build_dir()).unwrap().count(), 0);
    assert_eq!(fs::read_dir(layout.downloads_dir()).unwrap().count(), 0);
    assert_eq!(fs::read_to_string(&log).unwrap(), "keep me\n");
}

#[test]
fn self_test_runs_the_php_binary() {
    let cli = CliStack::installed();
    write_script(
        &cli.stack.layout.php_root().join("8.3/bin/php"),
        "#!/bin/sh\necho 'PHP 8.3.12 (cli)'\n",
    );

    cli.wstack()
        .args(["test", "--service", "php"])
        .assert()
        .success()
        .stdout(contains("PASS"))
        .stdout(contains("PHP 8.3.12 (cli)"));
}

#[test]
fn self_test_fails_when_the_admin_tool_is_missing() {
    let cli = CliStack::installed();

    cli.wstack()
        .args(["test", "--service", "database", "--json"])
        .assert()
        .failure()
        .stdout(contains("\"passed\": false"))
        .stdout(contains("not found"));
}
