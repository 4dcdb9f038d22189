//! Service descriptors and the registry that owns them.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tracing::debug;

use crate::{
    constants::{DATABASE_GRACE, FASTCGI_GRACE, WEB_SERVER_GRACE},
    error::{ConfigError, SupervisorError},
    runtime::StackLayout,
    settings::Settings,
};

/// The three services of the stack.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
pub enum ServiceId {
    /// nginx.
    #[serde(rename = "web-server", alias = "nginx")]
    #[strum(to_string = "web-server", serialize = "nginx")]
    WebServer,
    /// php-fpm.
    #[serde(rename = "fastcgi", alias = "php", alias = "php-fpm")]
    #[strum(to_string = "fastcgi", serialize = "php", serialize = "php-fpm")]
    FastCgiManager,
    /// MariaDB.
    #[serde(rename = "database", alias = "mysql", alias = "mariadb")]
    #[strum(to_string = "database", serialize = "mysql", serialize = "mariadb")]
    Database,
}

/// How the supervisor decides a started service accepts work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Connect to `127.0.0.1:<port>`.
    Tcp(u16),
    /// Connect to a Unix domain socket.
    UnixSocket(PathBuf),
    /// Process liveness only.
    None,
}

/// Native syntax of a daemon config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    /// nginx directive blocks.
    Nginx,
    /// `[section]` / `key = value` files (php-fpm, my.cnf).
    Ini,
}

/// A config file a service needs before it can start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub format: ConfigFormat,
}

/// An administrative command used as an extra readiness gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
}

/// Static metadata for one managed service. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub pid_file: PathBuf,
    /// Receives the process's stdout and stderr.
    pub log_file: PathBuf,
    pub readiness: ReadinessCheck,
    pub admin_ping: Option<AdminCommand>,
    pub config_files: Vec<ConfigFile>,
    pub dependencies: BTreeSet<ServiceId>,
    pub startup_grace: Duration,
    /// TCP port the service owns, checked for conflicts by diagnostics.
    pub listen_port: Option<u16>,
}

impl ServiceDescriptor {
    /// Unix socket the service serves, if readiness is socket based.
    pub fn socket_path(&self) -> Option<&Path> {
        match &self.readiness {
            ReadinessCheck::UnixSocket(path) => Some(path),
            _ => None,
        }
    }
}

/// Per-service overrides read from `webstack.yaml`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServiceOverride {
    pub binary: Option<String>,
    pub args: Option<Vec<String>>,
    pub startup_grace: Option<String>,
    pub depends_on: Option<Vec<ServiceId>>,
}

/// Structure of the optional stack manifest.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: HashMap<ServiceId, ServiceOverride>,
    /// Optional feature name mapped to the shared libraries it needs.
    pub features: Option<BTreeMap<String, Vec<String>>>,
}

/// Expands `$VAR` and `${VAR}` references from the process environment.
pub(crate) fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid regex");
    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingVariable(var_name)),
        None => Ok(result.to_string()),
    }
}

/// Parses durations such as `500ms`, `10s`, `5m`, `2h` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    if let Some(millis) = value.strip_suffix("ms") {
        let amount: u64 = millis
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;

    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Loads `webstack.yaml` if present, expanding environment variables.
pub fn load_manifest(path: &Path) -> Result<Option<Manifest>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path).map_err(|e| {
        ConfigError::ReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;
    let expanded = expand_env_vars(&content)?;
    let manifest: Manifest = serde_yaml::from_str(&expanded)?;
    Ok(Some(manifest))
}

/// Libraries the `intl` extension needs; missing ones only disable that feature.
fn default_features() -> BTreeMap<String, Vec<String>> {
    BTreeMap::from([(
        "intl".to_string(),
        vec![
            "libicuuc".to_string(),
            "libicui18n".to_string(),
            "libicudata".to_string(),
        ],
    )])
}

/// Default descriptors for the stack rooted at `layout`.
pub fn default_descriptors(
    layout: &StackLayout,
    settings: &Settings,
) -> Vec<ServiceDescriptor> {
    let fastcgi_socket = settings.fastcgi_socket(layout);
    let database_socket = settings.database_socket(layout);

    let web_server = ServiceDescriptor {
        id: ServiceId::WebServer,
        binary: layout.nginx_binary(),
        args: vec![
            "-p".into(),
            format!("{}/", layout.nginx_dir().display()),
            "-c".into(),
            "conf/nginx.conf".into(),
            "-g".into(),
            "daemon off;".into(),
        ],
        working_dir: layout.nginx_dir(),
        pid_file: layout.nginx_pid(),
        log_file: layout.nginx_dir().join("logs/console.log"),
        readiness: ReadinessCheck::Tcp(settings.nginx_port),
        admin_ping: None,
        config_files: vec![ConfigFile {
            path: layout.nginx_conf(),
            format: ConfigFormat::Nginx,
        }],
        dependencies: BTreeSet::from([ServiceId::FastCgiManager, ServiceId::Database]),
        startup_grace: WEB_SERVER_GRACE,
        listen_port: Some(settings.nginx_port),
    };

    let fastcgi = ServiceDescriptor {
        id: ServiceId::FastCgiManager,
        binary: layout.php_fpm_binary(),
        args: vec![
            "--nodaemonize".into(),
            "-y".into(),
            layout.php_fpm_conf().display().to_string(),
        ],
        working_dir: layout.php_current(),
        pid_file: layout.php_fpm_pid(),
        log_file: layout.php_current().join("logs/console.log"),
        readiness: ReadinessCheck::UnixSocket(fastcgi_socket),
        admin_ping: None,
        config_files: vec![ConfigFile {
            path: layout.php_fpm_conf(),
            format: ConfigFormat::Ini,
        }],
        dependencies: BTreeSet::new(),
        startup_grace: FASTCGI_GRACE,
        listen_port: None,
    };

    let database = ServiceDescriptor {
        id: ServiceId::Database,
        binary: layout.mariadb_binary(),
        args: vec![
            format!("--defaults-file={}", layout.mariadb_conf().display()),
            format!("--socket={}", database_socket.display()),
            format!("--pid-file={}", layout.mariadb_pid().display()),
            format!("--datadir={}", layout.mariadb_data().display()),
            format!("--port={}", settings.database_port),
        ],
        working_dir: layout.mariadb_dir(),
        pid_file: layout.mariadb_pid(),
        log_file: layout.mariadb_dir().join("logs/startup.log"),
        readiness: ReadinessCheck::UnixSocket(database_socket.clone()),
        admin_ping: Some(AdminCommand {
            binary: layout.mariadb_admin(),
            args: vec![format!("--socket={}", database_socket.display()), "ping".into()],
        }),
        config_files: vec![ConfigFile {
            path: layout.mariadb_conf(),
            format: ConfigFormat::Ini,
        }],
        dependencies: BTreeSet::new(),
        startup_grace: DATABASE_GRACE,
        listen_port: Some(settings.database_port),
    };

    vec![database, fastcgi, web_server]
}

/// Owns the immutable set of service descriptors.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    descriptors: BTreeMap<ServiceId, ServiceDescriptor>,
    features: BTreeMap<String, Vec<String>>,
}

impl ServiceRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        Self {
            descriptors: descriptors.into_iter().map(|d| (d.id, d)).collect(),
            features: default_features(),
        }
    }

    /// Replaces the optional-feature library table.
    pub fn with_features(mut self, features: BTreeMap<String, Vec<String>>) -> Self {
        self.features = features;
        self
    }

    /// Builds the registry for a stack, applying `webstack.yaml` overrides.
    pub fn load(layout: &StackLayout, settings: &Settings) -> Result<Self, ConfigError> {
        let manifest = load_manifest(&layout.manifest_path())?;
        Self::from_parts(layout, settings, manifest)
    }

    pub fn from_parts(
        layout: &StackLayout,
        settings: &Settings,
        manifest: Option<Manifest>,
    ) -> Result<Self, ConfigError> {
        let mut descriptors = default_descriptors(layout, settings);
        let mut registry_features = default_features();

        if let Some(manifest) = manifest {
            for descriptor in &mut descriptors {
                let Some(overrides) = manifest.services.get(&descriptor.id) else {
                    continue;
                };
                debug!("Applying manifest overrides for '{}'", descriptor.id);

                if let Some(binary) = &overrides.binary {
                    let path = PathBuf::from(binary);
                    descriptor.binary = if path.is_absolute() {
                        path
                    } else {
                        layout.root().join(path)
                    };
                }
                if let Some(args) = &overrides.args {
                    descriptor.args = args.clone();
                }
                if let Some(grace) = &overrides.startup_grace {
                    descriptor.startup_grace = parse_duration(grace)?;
                }
                if let Some(deps) = &overrides.depends_on {
                    descriptor.dependencies = deps.iter().copied().collect();
                }
            }

            if let Some(features) = manifest.features {
                registry_features = features;
            }
        }

        Ok(Self::new(descriptors).with_features(registry_features))
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceDescriptor> {
        self.descriptors.get(&id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.descriptors.keys().copied()
    }

    pub fn features(&self) -> &BTreeMap<String, Vec<String>> {
        &self.features
    }

    /// Topological start order; dependencies always precede their dependents.
    pub fn start_order(&self) -> Result<Vec<ServiceId>, SupervisorError> {
        let mut in_degree: BTreeMap<ServiceId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<ServiceId, Vec<ServiceId>> = BTreeMap::new();

        for descriptor in self.descriptors.values() {
            in_degree.entry(descriptor.id).or_insert(0);
            for dep in &descriptor.dependencies {
                if !self.descriptors.contains_key(dep) {
                    return Err(SupervisorError::UnknownService(*dep));
                }
                *in_degree.entry(descriptor.id).or_insert(0) += 1;
                dependents.entry(*dep).or_default().push(descriptor.id);
            }
        }

        let mut ready: VecDeque<ServiceId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.descriptors.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() != self.descriptors.len() {
            let cycle = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(id, _)| id.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(SupervisorError::DependencyCycle { cycle });
        }

        Ok(order)
    }

    /// Reverse of [`Self::start_order`].
    pub fn stop_order(&self) -> Result<Vec<ServiceId>, SupervisorError> {
        let mut order = self.start_order()?;
        order.reverse();
        Ok(order)
    }
}
