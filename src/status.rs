//! Point-in-time status reports built from the supervisor's view of the stack.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;

use crate::{
    config::ServiceId,
    probe::HealthProbe,
    runtime::StackLayout,
    supervisor::{ServiceState, ServiceSupervisor},
    version::current_version,
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Readiness as observed at report time.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UptimeInfo {
    pub seconds: u64,
    pub human: String,
}

/// Status entry for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub service: ServiceId,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub since: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<Readiness>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<UptimeInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Whole-stack report.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub captured_at: DateTime<Utc>,
    pub runtime_version: Option<String>,
    pub services: Vec<ServiceReport>,
}

impl StatusSnapshot {
    /// Reconciles the supervisor with the process table and reports every service.
    ///
    /// Running services get one readiness attempt; nothing else is probed.
    pub fn capture(supervisor: &ServiceSupervisor, layout: &StackLayout) -> Self {
        let probe = HealthProbe::new(supervisor.process_handle().clone())
            .with_environment(supervisor.environment().current());

        let services = supervisor
            .refresh()
            .into_iter()
            .map(|(service, status)| {
                let readiness = match (status.state, supervisor.registry().get(service)) {
                    (ServiceState::Running, Some(descriptor)) => {
                        let check = probe.check_once(descriptor);
                        Some(Readiness {
                            ready: check.is_ok(),
                            detail: check.err(),
                        })
                    }
                    _ => None,
                };
                ServiceReport {
                    service,
                    state: status.state,
                    pid: status.pid,
                    since: status.since,
                    readiness,
                    uptime: status.pid.and_then(compute_uptime),
                    last_error: status.last_error,
                }
            })
            .collect();

        Self {
            captured_at: Utc::now(),
            runtime_version: current_version(layout),
            services,
        }
    }

    /// Services whose state or readiness needs attention.
    pub fn unhealthy(&self) -> impl Iterator<Item = &ServiceReport> {
        self.services.iter().filter(|report| {
            report.state == ServiceState::Failed
                || report.readiness.as_ref().is_some_and(|r| !r.ready)
        })
    }

    /// Renders the report for a terminal.
    pub fn render(&self, color: bool) -> String {
        let paint = |code: &'static str| if color { code } else { "" };
        let reset = paint(RESET);

        let mut out = String::new();
        out.push_str(&format!(
            "PHP runtime: {}\n",
            self.runtime_version.as_deref().unwrap_or("<none>")
        ));

        for report in &self.services {
            let marker = match report.state {
                ServiceState::Running if report.readiness.as_ref().is_none_or(|r| r.ready) => {
                    paint(GREEN_BOLD)
                }
                ServiceState::Failed => paint(RED_BOLD),
                state if state.is_transitional() => paint(YELLOW_BOLD),
                ServiceState::Running => paint(YELLOW_BOLD),
                _ => "",
            };
            out.push_str(&format!(
                "{marker}● {:<12} {}{reset}",
                report.service.to_string(),
                report.state
            ));
            if let Some(pid) = report.pid {
                out.push_str(&format!("  (PID {pid})"));
            }
            if let Some(uptime) = &report.uptime {
                out.push_str(&format!("  up {}", uptime.human));
            }
            out.push('\n');

            if let Some(Readiness {
                ready: false,
                detail,
            }) = &report.readiness
            {
                out.push_str(&format!(
                    "    not ready: {}\n",
                    detail.as_deref().unwrap_or("no detail")
                ));
            }
            if let Some(err) = &report.last_error {
                out.push_str(&format!("    last error: {err}\n"));
            }
        }
        out
    }
}

fn compute_uptime(pid: u32) -> Option<UptimeInfo> {
    let started_at: DateTime<Utc> = fs::metadata(format!("/proc/{pid}"))
        .ok()?
        .modified()
        .ok()?
        .into();
    let seconds = Utc::now()
        .signed_duration_since(started_at)
        .to_std()
        .ok()?
        .as_secs();
    Some(UptimeInfo {
        seconds,
        human: format_elapsed(seconds),
    })
}

fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{total_seconds}s"),
        60..=3_599 => format!("{}m", total_seconds / 60),
        3_600..=86_399 => format!("{}h {}m", total_seconds / 3_600, total_seconds % 3_600 / 60),
        _ => format!("{}d {}h", total_seconds / 86_400, total_seconds % 86_400 / 3_600),
    }
}
