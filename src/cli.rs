//! Command-line interface for the webstack supervisor.
use std::{fmt, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::ServiceId;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Which of a service's logs to display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogKind {
    /// The log the daemon writes itself.
    #[default]
    Daemon,
    /// Captured stdout/stderr of the supervised process.
    Console,
    /// Both of the above.
    All,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Daemon => "daemon",
            LogKind::Console => "console",
            LogKind::All => "all",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daemon" => Ok(LogKind::Daemon),
            "console" => Ok(LogKind::Console),
            "all" => Ok(LogKind::All),
            _ => Err(format!(
                "invalid log kind '{s}', must be one of: daemon, console, all"
            )),
        }
    }
}

fn parse_service(value: &str) -> Result<ServiceId, String> {
    value.trim().to_ascii_lowercase().parse().map_err(|_| {
        format!("unknown service '{value}' (expected web-server, fastcgi or database)")
    })
}

/// Command-line interface for the webstack supervisor.
#[derive(Parser)]
#[command(name = "wstack", version, author)]
#[command(about = "Supervises a user-local nginx, php-fpm and MariaDB stack", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start every service in dependency order, or only the named one.
    Start {
        #[arg(short, long, value_parser = parse_service)]
        service: Option<ServiceId>,
    },

    /// Stop every service in reverse dependency order, or only the named one.
    Stop {
        #[arg(short, long, value_parser = parse_service)]
        service: Option<ServiceId>,
    },

    /// Restart every service, or only the named one.
    Restart {
        #[arg(short, long, value_parser = parse_service)]
        service: Option<ServiceId>,
    },

    /// Show the state of each service.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// List installed PHP runtimes.
    Versions {
        #[arg(long)]
        json: bool,
    },

    /// Make another installed PHP runtime current and restart php-fpm on it.
    SwitchVersion {
        /// Version directory name, e.g. `8.3`.
        version: String,
    },

    /// Run every diagnostic check and report findings.
    Doctor {
        #[arg(long)]
        json: bool,
    },

    /// Run diagnostics and apply every available repair.
    Repair,

    /// Read or change persisted settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run each service's binary once under the stack environment: `nginx -t`,
    /// `php -v` and the database admin ping.
    Test {
        #[arg(short, long, value_parser = parse_service)]
        service: Option<ServiceId>,

        #[arg(long)]
        json: bool,
    },

    /// Print the resolved environment snapshot.
    Env {
        #[arg(long)]
        json: bool,
    },

    /// Show logs for a service, or the manager's own log when none is given.
    Logs {
        #[arg(value_parser = parse_service)]
        service: Option<ServiceId>,

        /// Number of lines to show.
        #[arg(short, long, default_value = "50")]
        lines: usize,

        /// Kind of logs to show: daemon, console, or all.
        #[arg(short = 'k', long, default_value_t = LogKind::default())]
        kind: LogKind,
    },

    /// Empty log files and remove temporary files.
    Clean {
        /// Truncate non-empty `*.log` files.
        #[arg(long)]
        logs: bool,

        /// Remove files from the temporary directories.
        #[arg(long)]
        temp: bool,

        /// Empty `build/` and remove downloaded archives. Never implied.
        #[arg(long)]
        build: bool,
    },

    /// Open the database client against the stack's socket.
    Client {
        /// Extra arguments passed to the client.
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Stay in the foreground supervising the stack until Ctrl-C.
    Watch,
}

/// `config` subcommands.
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print every setting.
    List,
    /// Print one setting.
    Get { key: String },
    /// Change one setting. Port and socket changes are written into the service configs.
    Set { key: String, value: String },
    /// Restore every setting to its default and rewrite the service configs.
    Reset,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
