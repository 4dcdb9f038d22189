#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tempfile::TempDir;
use webstack::{
    config::{ReadinessCheck, ServiceDescriptor, ServiceId, ServiceRegistry, default_descriptors},
    env::EnvironmentResolver,
    runtime::StackLayout,
    settings::Settings,
    supervisor::{ServiceSupervisor, SupervisorOptions},
    version::repoint_alias,
};

/// A long-running fake daemon. No `exec`, so the script path stays in the command line.
pub const SLEEPER: &str = "#!/bin/sh\nsleep 30\n";

/// A daemon that dies straight away.
pub const CRASHER: &str = "#!/bin/sh\nexit 1\n";

/// A throwaway stack root with fake daemons.
pub struct TestStack {
    pub dir: TempDir,
    pub layout: StackLayout,
}

impl TestStack {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let layout = StackLayout::at(dir.path());
        Self { dir, layout }
    }

    /// A stack with nginx, mariadb and PHP 8.3 (current) installed as sleepers.
    pub fn installed() -> Self {
        let stack = Self::new();
        write_script(&stack.layout.nginx_binary(), SLEEPER);
        write_script(&stack.layout.mariadb_binary(), SLEEPER);
        stack.install_php("8.3", true);
        repoint_alias(&stack.layout.php_root(), "8.3").expect("failed to link current");
        stack
    }

    /// Installs a PHP tree. Without `with_fpm` the tree is discoverable but cannot start.
    pub fn install_php(&self, version: &str, with_fpm: bool) {
        let root = self.layout.php_root().join(version);
        write_script(&root.join("bin/php"), SLEEPER);
        if with_fpm {
            write_script(&root.join("sbin/php-fpm"), SLEEPER);
        }
    }

    /// The stack's own descriptors with liveness-only readiness.
    pub fn descriptors(&self) -> Vec<ServiceDescriptor> {
        default_descriptors(&self.layout, &Settings::default())
            .into_iter()
            .map(|mut descriptor| {
                descriptor.readiness = ReadinessCheck::None;
                descriptor.admin_ping = None;
                descriptor.startup_grace = Duration::from_secs(2);
                descriptor
            })
            .collect()
    }

    /// The test descriptors with `service`'s entry adjusted by `adjust`.
    pub fn descriptors_with(
        &self,
        service: ServiceId,
        adjust: impl FnOnce(&mut ServiceDescriptor),
    ) -> Vec<ServiceDescriptor> {
        let mut descriptors = self.descriptors();
        if let Some(descriptor) = descriptors.iter_mut().find(|d| d.id == service) {
            adjust(descriptor);
        }
        descriptors
    }

    pub fn supervisor(&self) -> ServiceSupervisor {
        self.supervisor_with(self.descriptors())
    }

    pub fn supervisor_with(&self, descriptors: Vec<ServiceDescriptor>) -> ServiceSupervisor {
        let env = Arc::new(EnvironmentResolver::new(self.layout.clone(), false));
        ServiceSupervisor::with_options(
            ServiceRegistry::new(descriptors),
            env,
            SupervisorOptions {
                stop_timeout: Duration::from_secs(3),
                probe_interval: Duration::from_millis(50),
            },
        )
        .expect("valid dependency graph")
    }

    pub fn pid_file(&self, service: ServiceId) -> PathBuf {
        self.descriptors()
            .into_iter()
            .find(|d| d.id == service)
            .map(|d| d.pid_file)
            .expect("service has a descriptor")
    }
}

pub fn write_script(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create script dir");
    }
    fs::write(path, body).expect("failed to write script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
}

pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    webstack::process::pid_alive(pid)
}

/// Live processes whose command line names `binary`.
pub fn processes_running(binary: &Path) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    system
        .processes()
        .iter()
        .filter(|(_, process)| {
            !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                && process.cmd().iter().any(|arg| Path::new(arg) == binary)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}
