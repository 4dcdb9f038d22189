//! Installed PHP runtimes and switching the `current` alias between them.
use regex::Regex;
use serde::Serialize;
use std::{
    cmp::Ordering,
    fs, io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tracing::{error, info, warn};

use crate::{
    config::ServiceId,
    constants::CURRENT_VERSION_ALIAS,
    error::{SupervisorError, SwitchError},
    runtime::StackLayout,
    supervisor::{LockedService, ServiceState, ServiceSupervisor},
};

/// One installed runtime tree under `<stack>/php`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeVersion {
    pub version: String,
    pub path: PathBuf,
    pub is_current: bool,
}

/// How a switch that did not return an error ended.
#[derive(Debug)]
pub enum SwitchOutcome {
    /// The new version is current and running.
    Switched { from: Option<String>, to: String },
    /// The new version failed to start; the previous one is current and running again.
    RolledBack {
        attempted: String,
        restored: String,
        start_error: SupervisorError,
    },
}

/// Compares dotted version strings numerically (`8.10` > `8.9`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> { v.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    parse(a).cmp(&parse(b))
}

/// Lists installed versions in ascending order.
///
/// A version directory has a dotted-digit name and contains `bin/php` or `sbin/php-fpm`.
pub fn discover_versions(layout: &StackLayout) -> io::Result<Vec<RuntimeVersion>> {
    let php_root = layout.php_root();
    if !php_root.is_dir() {
        return Ok(Vec::new());
    }

    let pattern = Regex::new(r"^\d+(\.\d+)*$").expect("valid regex");
    let current = current_version(layout);

    let mut versions = Vec::new();
    for entry in fs::read_dir(&php_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == CURRENT_VERSION_ALIAS || !pattern.is_match(&name) {
            continue;
        }
        let path = entry.path();
        if !path.join("bin/php").is_file() && !path.join("sbin/php-fpm").is_file() {
            continue;
        }
        versions.push(RuntimeVersion {
            is_current: current.as_deref() == Some(name.as_str()),
            version: name,
            path,
        });
    }

    versions.sort_by(|a, b| compare_versions(&a.version, &b.version));
    Ok(versions)
}

/// The version the alias resolves to, or `None` if it is absent or dangling.
pub fn current_version(layout: &StackLayout) -> Option<String> {
    let alias = layout.php_current();
    let target = fs::read_link(&alias).ok()?;
    if !alias.is_dir() {
        return None;
    }
    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Points `<php_root>/current` at `version` by renaming a fresh link over the old one.
///
/// The alias is never absent while this runs.
pub fn repoint_alias(php_root: &Path, version: &str) -> io::Result<()> {
    let alias = php_root.join(CURRENT_VERSION_ALIAS);
    let tmp = php_root.join(format!(
        ".{CURRENT_VERSION_ALIAS}.{}.tmp",
        std::process::id()
    ));

    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    symlink(version, &tmp)?;
    if let Err(err) = fs::rename(&tmp, &alias) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// Switches the FastCGI manager between installed runtimes.
#[derive(Debug, Clone)]
pub struct RuntimeVersionSwitcher {
    layout: StackLayout,
    supervisor: ServiceSupervisor,
}

impl RuntimeVersionSwitcher {
    pub fn new(layout: StackLayout, supervisor: ServiceSupervisor) -> Self {
        Self { layout, supervisor }
    }

    pub fn installed_versions(&self) -> io::Result<Vec<RuntimeVersion>> {
        discover_versions(&self.layout)
    }

    pub fn current(&self) -> Option<String> {
        current_version(&self.layout)
    }

    pub fn highest(&self) -> io::Result<Option<RuntimeVersion>> {
        Ok(self.installed_versions()?.pop())
    }

    /// Stops the FastCGI manager, repoints the alias and starts the new version.
    ///
    /// If the new version fails to start, the previous version is restored and
    /// restarted; that is reported as [`SwitchOutcome::RolledBack`]. The FastCGI
    /// manager's lock is held from the current-version check to the end of any
    /// rollback, so a concurrent start cannot spawn a second runtime.
    pub fn switch_to(&self, version: &str) -> Result<SwitchOutcome, SwitchError> {
        let installed = self
            .installed_versions()
            .map_err(|source| SwitchError::Relink {
                version: version.to_string(),
                source,
            })?;
        if !installed.iter().any(|v| v.version == version) {
            return Err(SwitchError::NotInstalled(version.to_string()));
        }

        self.supervisor
            .with_service_locked(ServiceId::FastCgiManager, |fastcgi| {
                self.switch_locked(fastcgi, version)
            })
            .map_err(SwitchError::Lock)?
    }

    fn switch_locked(
        &self,
        fastcgi: &LockedService<'_>,
        version: &str,
    ) -> Result<SwitchOutcome, SwitchError> {
        let previous = self.current();
        if previous.as_deref() == Some(version) {
            info!("Runtime version '{version}' is already current");
            return Err(SwitchError::AlreadyCurrent(version.to_string()));
        }

        let was_running = fastcgi.state() == ServiceState::Running;
        info!(
            "Switching runtime from {} to '{version}'",
            previous.as_deref().unwrap_or("<none>")
        );

        fastcgi.stop().map_err(SwitchError::Stop)?;

        if let Err(source) = repoint_alias(&self.layout.php_root(), version) {
            error!("Failed to repoint alias to '{version}': {source}");
            if was_running && let Err(err) = fastcgi.start() {
                warn!("Could not restart the previous runtime: {err}");
            }
            return Err(SwitchError::Relink {
                version: version.to_string(),
                source,
            });
        }

        let start_error = match fastcgi.start() {
            Ok(pid) => {
                info!("Runtime '{version}' is active (PID {pid})");
                return Ok(SwitchOutcome::Switched {
                    from: previous,
                    to: version.to_string(),
                });
            }
            Err(err) => err,
        };

        let Some(previous) = previous else {
            error!("Runtime '{version}' failed to start and there is no version to roll back to");
            return Err(SwitchError::StartFailed {
                version: version.to_string(),
                source: start_error,
            });
        };

        warn!("Runtime '{version}' failed to start ({start_error}); rolling back to '{previous}'");
        let rollback = repoint_alias(&self.layout.php_root(), &previous)
            .map_err(|err| format!("relink failed: {err}"))
            .and_then(|()| {
                fastcgi
                    .start()
                    .map_err(|err| format!("restart failed: {err}"))
            });

        match rollback {
            Ok(_) => {
                warn!("Rolled back to runtime '{previous}'");
                Ok(SwitchOutcome::RolledBack {
                    attempted: version.to_string(),
                    restored: previous,
                    start_error,
                })
            }
            Err(rollback_error) => {
                error!("Rollback to '{previous}' failed: {rollback_error}");
                Err(SwitchError::SwitchFailedUnrecoverable {
                    attempted: version.to_string(),
                    previous,
                    start_error,
                    rollback_error,
                })
            }
        }
    }
}
