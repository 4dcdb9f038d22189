//! Persisted user preferences consumed by the supervisor.
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    constants::{DEFAULT_DATABASE_PORT, DEFAULT_NGINX_PORT},
    error::SettingsError,
    runtime::StackLayout,
};

/// Keys understood by [`Settings::get`] and [`Settings::set`].
pub const SETTINGS_KEYS: &[&str] = &[
    "nginx_port",
    "database_port",
    "auto_start_on_launch",
    "auto_stop_on_exit",
    "minimize_to_tray",
    "auto_load_env",
    "auto_clean_logs",
    "auto_clean_temp",
    "fastcgi_socket",
    "database_socket",
];

/// Key/value settings store backed by a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub nginx_port: u16,
    pub database_port: u16,
    pub auto_start_on_launch: bool,
    pub auto_stop_on_exit: bool,
    pub minimize_to_tray: bool,
    pub auto_load_env: bool,
    /// Empty the service logs after a full stop.
    pub auto_clean_logs: bool,
    /// Remove temporary files after a full stop.
    pub auto_clean_temp: bool,
    /// Overrides the FastCGI socket location (set when relocating a long path).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fastcgi_socket: Option<PathBuf>,
    /// Overrides the database socket location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_socket: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nginx_port: DEFAULT_NGINX_PORT,
            database_port: DEFAULT_DATABASE_PORT,
            auto_start_on_launch: false,
            auto_stop_on_exit: true,
            minimize_to_tray: false,
            auto_load_env: true,
            auto_clean_logs: false,
            auto_clean_temp: false,
            fastcgi_socket: None,
            database_socket: None,
        }
    }
}

impl Settings {
    /// Loads settings, returning defaults when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the settings through a temporary file so readers never see a partial document.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn fastcgi_socket(&self, layout: &StackLayout) -> PathBuf {
        self.fastcgi_socket
            .clone()
            .unwrap_or_else(|| layout.php_fpm_socket())
    }

    pub fn database_socket(&self, layout: &StackLayout) -> PathBuf {
        self.database_socket
            .clone()
            .unwrap_or_else(|| layout.mariadb_socket())
    }

    /// Returns the value stored under `key` rendered as a string.
    pub fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let value = match key {
            "nginx_port" => Some(self.nginx_port.to_string()),
            "database_port" => Some(self.database_port.to_string()),
            "auto_start_on_launch" => Some(self.auto_start_on_launch.to_string()),
            "auto_stop_on_exit" => Some(self.auto_stop_on_exit.to_string()),
            "minimize_to_tray" => Some(self.minimize_to_tray.to_string()),
            "auto_load_env" => Some(self.auto_load_env.to_string()),
            "auto_clean_logs" => Some(self.auto_clean_logs.to_string()),
            "auto_clean_temp" => Some(self.auto_clean_temp.to_string()),
            "fastcgi_socket" => self
                .fastcgi_socket
                .as_ref()
                .map(|p| p.display().to_string()),
            "database_socket" => self
                .database_socket
                .as_ref()
                .map(|p| p.display().to_string()),
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        };
        Ok(value)
    }

    /// Parses `value` for `key` and stores it. An empty value clears optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        match key {
            "nginx_port" => self.nginx_port = parse_port(key, value)?,
            "database_port" => self.database_port = parse_port(key, value)?,
            "auto_start_on_launch" => self.auto_start_on_launch = parse_flag(key, value)?,
            "auto_stop_on_exit" => self.auto_stop_on_exit = parse_flag(key, value)?,
            "minimize_to_tray" => self.minimize_to_tray = parse_flag(key, value)?,
            "auto_load_env" => self.auto_load_env = parse_flag(key, value)?,
            "auto_clean_logs" => self.auto_clean_logs = parse_flag(key, value)?,
            "auto_clean_temp" => self.auto_clean_temp = parse_flag(key, value)?,
            "fastcgi_socket" => self.fastcgi_socket = parse_path(value),
            "database_socket" => self.database_socket = parse_path(value),
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    /// All keys with their current values, in a stable order.
    pub fn entries(&self) -> Vec<(&'static str, Option<String>)> {
        SETTINGS_KEYS
            .iter()
            .map(|key| (*key, self.get(key).ok().flatten()))
            .collect()
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, SettingsError> {
    match value.parse::<u16>() {
        Ok(0) => Err(invalid(key, value, "port must be between 1 and 65535")),
        Ok(port) => Ok(port),
        Err(err) => Err(invalid(key, value, &err.to_string())),
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected true or false")),
    }
}

fn parse_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> SettingsError {
    SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
