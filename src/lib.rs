//! Webstack is the supervisor core for a user-local web stack: nginx, php-fpm and
//! MariaDB built into one directory tree and run as ordinary user processes. It
//! starts and stops the daemons in dependency order, tracks their state, switches
//! the active PHP runtime, and diagnoses and repairs common breakage.

/// CLI interface.
pub mod cli;

/// Config file rendering and in-place rewriting.
pub mod confgen;

/// Service descriptors, manifest and registry.
pub mod config;

/// Timing and file-name constants.
pub mod constants;

/// Diagnostic checks and repairs.
pub mod diagnostics;

/// Environment snapshots passed to spawned daemons.
pub mod env;

/// Error handling.
pub mod error;

/// Logs management.
pub mod logs;

/// Readiness probes.
pub mod probe;

/// PID files and process start/stop.
pub mod process;

/// On-disk layout of the stack.
pub mod runtime;

/// One-shot self-tests of the installed binaries.
pub mod selftest;

/// Persisted settings.
pub mod settings;

/// Status reports.
pub mod status;

/// Service state machines and lifecycle operations.
pub mod supervisor;

/// PHP runtime discovery and switching.
pub mod version;

#[doc(hidden)]
pub mod test_utils;
