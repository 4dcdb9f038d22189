//! One-shot checks that each installed daemon runs under the stack environment.
//!
//! Unlike diagnostics these execute the binaries: `nginx -t`, `php -v` and the
//! database admin ping. Every command is bounded by [`ADMIN_PING_TIMEOUT`].
use serde::Serialize;
use std::{
    io::Read,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, warn};

use crate::{
    config::{ServiceId, ServiceRegistry},
    constants::ADMIN_PING_TIMEOUT,
    env::EnvironmentSnapshot,
    process,
    runtime::StackLayout,
};

/// Result of one self-test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfTestResult {
    pub service: ServiceId,
    pub command: String,
    pub passed: bool,
    pub detail: String,
}

/// Runs the self-test commands of every service, or only `only`.
pub struct SelfTest<'a> {
    layout: &'a StackLayout,
    registry: &'a ServiceRegistry,
    env: &'a EnvironmentSnapshot,
    timeout: Duration,
}

impl<'a> SelfTest<'a> {
    pub fn new(
        layout: &'a StackLayout,
        registry: &'a ServiceRegistry,
        env: &'a EnvironmentSnapshot,
    ) -> Self {
        Self {
            layout,
            registry,
            env,
            timeout: ADMIN_PING_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run(&self, only: Option<ServiceId>) -> Vec<SelfTestResult> {
        self.registry
            .descriptors()
            .map(|descriptor| descriptor.id)
            .filter(|id| only.is_none_or(|wanted| wanted == *id))
            .filter_map(|id| self.run_one(id))
            .collect()
    }

    fn run_one(&self, service: ServiceId) -> Option<SelfTestResult> {
        let descriptor = self.registry.get(service)?;
        let (binary, args, working_dir) = match service {
            ServiceId::WebServer => (
                descriptor.binary.clone(),
                vec![
                    "-t".to_string(),
                    "-p".to_string(),
                    format!("{}/", self.layout.nginx_dir().display()),
                    "-c".to_string(),
                    self.layout.nginx_conf().display().to_string(),
                ],
                Some(descriptor.working_dir.clone()),
            ),
            ServiceId::FastCgiManager => (self.layout.php_binary(), vec!["-v".to_string()], None),
            ServiceId::Database => {
                let admin = descriptor.admin_ping.as_ref()?;
                (admin.binary.clone(), admin.args.clone(), None)
            }
        };

        let command = std::iter::once(binary.display().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let (passed, detail) = self.execute(&binary, &args, working_dir.as_deref());
        if passed {
            info!("Self-test of '{service}' passed: {detail}");
        } else {
            warn!("Self-test of '{service}' failed: {detail}");
        }

        Some(SelfTestResult {
            service,
            command,
            passed,
            detail,
        })
    }

    fn execute(&self, binary: &Path, args: &[String], working_dir: Option<&Path>) -> (bool, String) {
        if !binary.is_file() {
            return (false, format!("{} not found", binary.display()));
        }

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = working_dir.filter(|dir| dir.is_dir()) {
            cmd.current_dir(dir);
        }
        self.env.apply(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return (false, format!("failed to run: {err}")),
        };
        debug!("Running self-test command {} (PID {})", binary.display(), child.id());

        match process::wait_or_kill(&mut child, self.timeout) {
            Ok(Some(status)) if status.success() => {
                (true, summary(&mut child).unwrap_or_else(|| "ok".into()))
            }
            Ok(Some(status)) => (
                false,
                summary(&mut child).map_or_else(|| format!("exited with {status}"), |line| {
                    format!("exited with {status}: {line}")
                }),
            ),
            Ok(None) => (false, format!("timed out after {:?}", self.timeout)),
            Err(err) => (false, format!("failed while waiting: {err}")),
        }
    }
}

/// First non-empty line of stdout, or of stderr when stdout is silent.
fn summary(child: &mut Child) -> Option<String> {
    let mut stdout = String::new();
    let mut stderr = String::new();
    if let Some(out) = child.stdout.as_mut() {
        let _ = out.read_to_string(&mut stdout);
    }
    if let Some(err) = child.stderr.as_mut() {
        let _ = err.read_to_string(&mut stderr);
    }
    [stdout, stderr]
        .iter()
        .flat_map(|text| text.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
