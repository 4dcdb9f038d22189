//! Runtime paths for the user-local stack.
use std::{
    env,
    path::{Path, PathBuf},
};

use crate::constants::{
    APP_LOG_FILE_NAME, CURRENT_VERSION_ALIAS, DEFAULT_STACK_DIR_NAME, ENV_FILE_NAME,
    MANIFEST_FILE_NAME, SETTINGS_FILE_NAME, STACK_HOME_ENV,
};

/// Every on-disk location the supervisor touches, derived from one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackLayout {
    root: PathBuf,
    config_dir: PathBuf,
}

impl StackLayout {
    /// Resolves the stack root from `WEBSTACK_HOME`, falling back to `~/webstack`.
    pub fn discover() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));

        let root = env::var_os(STACK_HOME_ENV)
            .map(PathBuf::from)
            .filter(|path| !path.as_os_str().is_empty())
            .unwrap_or_else(|| home.join(DEFAULT_STACK_DIR_NAME));

        Self {
            root,
            config_dir: home.join(".config/webstack"),
        }
    }

    /// Builds a layout rooted at `root`, keeping settings beside it.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_dir = root.join(".config");
        Self { root, config_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(ENV_FILE_NAME)
    }

    pub fn app_log(&self) -> PathBuf {
        self.root.join(APP_LOG_FILE_NAME)
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.root.join("deps")
    }

    pub fn www_dir(&self) -> PathBuf {
        self.root.join("www")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Source trees left behind by the build scripts.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    // nginx

    pub fn nginx_dir(&self) -> PathBuf {
        self.root.join("nginx")
    }

    pub fn nginx_binary(&self) -> PathBuf {
        self.nginx_dir().join("nginx")
    }

    pub fn nginx_conf(&self) -> PathBuf {
        self.nginx_dir().join("conf/nginx.conf")
    }

    pub fn nginx_pid(&self) -> PathBuf {
        self.nginx_dir().join("nginx.pid")
    }

    // php

    pub fn php_root(&self) -> PathBuf {
        self.root.join("php")
    }

    /// The alias through which every consumer reaches the active runtime.
    pub fn php_current(&self) -> PathBuf {
        self.php_root().join(CURRENT_VERSION_ALIAS)
    }

    pub fn php_binary(&self) -> PathBuf {
        self.php_current().join("bin/php")
    }

    pub fn php_fpm_binary(&self) -> PathBuf {
        self.php_current().join("sbin/php-fpm")
    }

    pub fn php_fpm_conf(&self) -> PathBuf {
        self.php_current().join("etc/php-fpm.conf")
    }

    pub fn php_fpm_pid(&self) -> PathBuf {
        self.php_current().join("php-fpm.pid")
    }

    pub fn php_fpm_socket(&self) -> PathBuf {
        self.php_current().join("php-fpm.sock")
    }

    // mariadb

    pub fn mariadb_dir(&self) -> PathBuf {
        self.root.join("mariadb")
    }

    pub fn mariadb_binary(&self) -> PathBuf {
        self.mariadb_dir().join("bin/mariadbd")
    }

    pub fn mariadb_admin(&self) -> PathBuf {
        self.mariadb_dir().join("bin/mariadb-admin")
    }

    pub fn mariadb_client(&self) -> PathBuf {
        self.mariadb_dir().join("bin/mariadb")
    }

    pub fn mariadb_install_db(&self) -> PathBuf {
        self.mariadb_dir().join("scripts/mariadb-install-db")
    }

    pub fn mariadb_conf(&self) -> PathBuf {
        self.mariadb_dir().join("my.cnf")
    }

    pub fn mariadb_pid(&self) -> PathBuf {
        self.mariadb_dir().join("mariadb.pid")
    }

    pub fn mariadb_socket(&self) -> PathBuf {
        self.mariadb_dir().join("mariadb.sock")
    }

    pub fn mariadb_data(&self) -> PathBuf {
        self.mariadb_dir().join("data")
    }

    /// Directories every service expects to exist before it starts.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.nginx_dir().join("logs"),
            self.mariadb_dir().join("logs"),
            self.mariadb_dir().join("tmp"),
            self.mariadb_data(),
            self.www_dir(),
        ]
    }

    /// Short socket directory used when a socket path outgrows the OS limit.
    pub fn short_socket_dir(&self) -> PathBuf {
        if let Some(runtime_dir) = env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from)
            && runtime_dir.is_absolute()
        {
            return runtime_dir.join("webstack");
        }
        let uid = nix::unistd::getuid();
        PathBuf::from(format!("/tmp/webstack-{uid}"))
    }
}
