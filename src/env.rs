//! Isolated runtime environment injected into every spawned process.
//!
//! The resolver publishes immutable [`EnvironmentSnapshot`]s. A reload swaps in
//! a new snapshot; operations that already captured the previous one keep it.
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, RwLock},
};
use tracing::{debug, info, warn};

use crate::{
    constants::{LIBRARY_PATH_VAR, STACK_HOME_ENV},
    runtime::StackLayout,
};

/// System executable directories kept after the stack's own so basic tools resolve.
const SYSTEM_BIN_DIRS: &[&str] = &["/usr/bin", "/bin"];

/// Library and executable search paths plus extra variables for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentSnapshot {
    library_paths: Vec<PathBuf>,
    executable_paths: Vec<PathBuf>,
    vars: BTreeMap<String, String>,
    loaded_at: DateTime<Utc>,
}

impl EnvironmentSnapshot {
    pub fn new(
        library_paths: Vec<PathBuf>,
        executable_paths: Vec<PathBuf>,
        vars: BTreeMap<String, String>,
    ) -> Self {
        Self {
            library_paths,
            executable_paths,
            vars,
            loaded_at: Utc::now(),
        }
    }

    pub fn library_paths(&self) -> &[PathBuf] {
        &self.library_paths
    }

    pub fn executable_paths(&self) -> &[PathBuf] {
        &self.executable_paths
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    fn joined(paths: &[PathBuf]) -> Option<OsString> {
        if paths.is_empty() {
            return None;
        }
        env::join_paths(paths).ok()
    }

    /// Applies the snapshot to a command. An empty library path removes any
    /// inherited value so the stack never falls back to foreign libraries.
    pub fn apply(&self, cmd: &mut Command) {
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }

        match Self::joined(&self.library_paths) {
            Some(value) => {
                cmd.env(LIBRARY_PATH_VAR, value);
            }
            None => {
                cmd.env_remove(LIBRARY_PATH_VAR);
            }
        }

        if let Some(value) = Self::joined(&self.executable_paths) {
            cmd.env("PATH", value);
        }
    }

    /// Whether a shared library named `stem` (e.g. `libicuuc`) is present on the library path.
    pub fn find_library(&self, stem: &str) -> Option<PathBuf> {
        for dir in &self.library_paths {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(&format!("{stem}.so"))
                    || (name.starts_with(&format!("{stem}.")) && name.ends_with(".dylib"))
                {
                    return Some(entry.path());
                }
            }
        }
        None
    }
}

/// Computes and publishes environment snapshots for the stack.
#[derive(Debug)]
pub struct EnvironmentResolver {
    layout: StackLayout,
    load_env_file: bool,
    current: RwLock<Arc<EnvironmentSnapshot>>,
}

impl EnvironmentResolver {
    /// Creates a resolver and computes its first snapshot.
    pub fn new(layout: StackLayout, load_env_file: bool) -> Self {
        let snapshot = Arc::new(resolve(&layout, load_env_file));
        Self {
            layout,
            load_env_file,
            current: RwLock::new(snapshot),
        }
    }

    /// The snapshot new operations should capture.
    pub fn current(&self) -> Arc<EnvironmentSnapshot> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Recomputes the environment and publishes it atomically.
    pub fn reload(&self) -> Arc<EnvironmentSnapshot> {
        let snapshot = Arc::new(resolve(&self.layout, self.load_env_file));
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::clone(&snapshot);
        info!(
            "Environment reloaded ({} library dirs, {} executable dirs)",
            snapshot.library_paths.len(),
            snapshot.executable_paths.len()
        );
        snapshot
    }
}

/// Builds a snapshot for `layout`, optionally merging `env.sh`.
pub fn resolve(layout: &StackLayout, load_env_file: bool) -> EnvironmentSnapshot {
    let deps = layout.deps_dir();

    let mut library_paths: Vec<PathBuf> = [deps.join("lib"), deps.join("lib64")]
        .into_iter()
        .filter(|path| path.is_dir())
        .collect();

    let mut executable_paths: Vec<PathBuf> = [
        deps.join("bin"),
        layout.root().join("bin"),
        layout.mariadb_dir().join("bin"),
        layout.php_current().join("bin"),
    ]
    .into_iter()
    .filter(|path| path.is_dir())
    .collect();

    let mut vars = BTreeMap::new();
    vars.insert(
        STACK_HOME_ENV.to_string(),
        layout.root().display().to_string(),
    );
    vars.insert(
        "PKG_CONFIG_PATH".to_string(),
        deps.join("lib/pkgconfig").display().to_string(),
    );

    if load_env_file {
        let env_file = layout.env_file();
        if env_file.exists() {
            for (key, value) in parse_env_file(&env_file) {
                if key == LIBRARY_PATH_VAR || key == "PATH" {
                    let target = if key == "PATH" {
                        &mut executable_paths
                    } else {
                        &mut library_paths
                    };
                    for entry in env::split_paths(&value) {
                        if entry.starts_with(layout.root()) && !target.contains(&entry) {
                            target.push(entry);
                        }
                    }
                } else {
                    vars.insert(key, value);
                }
            }
            debug!("Merged environment file {}", env_file.display());
        } else {
            debug!("No environment file at {}", env_file.display());
        }
    }

    for dir in SYSTEM_BIN_DIRS {
        let dir = PathBuf::from(dir);
        if !executable_paths.contains(&dir) {
            executable_paths.push(dir);
        }
    }

    EnvironmentSnapshot::new(library_paths, executable_paths, vars)
}

/// Parses `[export] KEY=VALUE` lines, expanding `$VAR` against earlier keys and the process
/// environment. Unset variables expand to the empty string, as in a shell.
pub fn parse_env_file(path: &Path) -> Vec<(String, String)> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!("Failed to read env file {}: {}", path.display(), err);
            return Vec::new();
        }
    };

    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid regex");
    let mut resolved: Vec<(String, String)> = Vec::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line).trim();

        let Some((key, value)) = line.split_once('=') else {
            warn!("Ignoring malformed line in env file: {}", line);
            continue;
        };

        let key = key.trim().to_string();
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }

        let expanded = re.replace_all(value, |caps: &regex::Captures| {
            let name = &caps[1];
            resolved
                .iter()
                .rev()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .or_else(|| env::var(name).ok())
                .unwrap_or_default()
        });
        let expanded = expanded.to_string();

        resolved.retain(|(k, _)| k != &key);
        resolved.push((key, expanded));
    }

    resolved
}
