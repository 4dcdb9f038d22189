//! Constants and configuration values for the webstack supervisor.
//!
//! This module centralizes the timing values, file names and platform limits
//! used throughout the supervisor core.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Environment variable that overrides the stack root directory.
pub const STACK_HOME_ENV: &str = "WEBSTACK_HOME";

/// Directory name under `$HOME` used when no override is set.
pub const DEFAULT_STACK_DIR_NAME: &str = "webstack";

/// Optional YAML manifest overriding service descriptors.
pub const MANIFEST_FILE_NAME: &str = "webstack.yaml";

/// Shell-style environment file sourced into every spawn.
pub const ENV_FILE_NAME: &str = "env.sh";

/// User-facing application log stored in the stack root.
pub const APP_LOG_FILE_NAME: &str = "webstack_manager.log";

/// Name of the runtime-version alias inside the PHP root.
pub const CURRENT_VERSION_ALIAS: &str = "current";

/// Lock file suffix for PID files to ensure exclusive access across processes.
pub const PID_LOCK_SUFFIX: &str = ".lock";

/// Settings file stored under `$HOME/.config/webstack`.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Interval between liveness checks while waiting for a process to exit.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a service gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between readiness probe attempts.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Connect timeout for a single TCP readiness attempt.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

/// Upper bound for one administrative ping or self-test command.
pub const ADMIN_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Startup grace period for the web server.
pub const WEB_SERVER_GRACE: Duration = Duration::from_secs(5);

/// Startup grace period for the FastCGI manager.
pub const FASTCGI_GRACE: Duration = Duration::from_secs(5);

/// Startup grace period for the database, which initializes slowly.
pub const DATABASE_GRACE: Duration = Duration::from_secs(30);

// ============================================================================
// Default Ports
// ============================================================================

/// Default nginx listen port.
pub const DEFAULT_NGINX_PORT: u16 = 8080;

/// Default MariaDB port.
pub const DEFAULT_DATABASE_PORT: u16 = 3306;

// ============================================================================
// Platform Limits
// ============================================================================

/// Longest usable Unix socket path in bytes (`sun_path` minus the NUL byte).
#[cfg(target_os = "linux")]
pub const MAX_UNIX_SOCKET_PATH: usize = 107;

/// Longest usable Unix socket path in bytes (`sun_path` minus the NUL byte).
#[cfg(not(target_os = "linux"))]
pub const MAX_UNIX_SOCKET_PATH: usize = 103;

/// Environment variable carrying the dynamic loader search path.
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";

/// Environment variable carrying the dynamic loader search path.
#[cfg(not(target_os = "macos"))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Socket paths that belong to a system-wide database install.
pub const SYSTEM_DATABASE_SOCKETS: &[&str] = &[
    "/tmp/mysql.sock",
    "/var/run/mysqld/mysqld.sock",
    "/run/mysqld/mysqld.sock",
];
