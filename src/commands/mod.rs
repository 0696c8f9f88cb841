pub mod check;
pub mod import;
pub mod serve;
pub mod status;

use crate::bridge::audit;
use crate::bridge::config::BridgeConfig;
use crate::bridge::driver::{LaunchFailure, probe_receiver};
use crate::bridge::paths::BridgePaths;
use crate::bridge::store::Ledger;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Checks that must pass before a driver run launches anything. Returns
/// false (with issues recorded) when the run has to stop.
pub fn preflight(report: &mut CommandReport, ledger: &Ledger, cfg: &BridgeConfig) -> bool {
    if let Err(err) = ledger.ensure_writable() {
        report.issue(err.to_string());
        return false;
    }

    if !cfg.driver.require_receiver {
        report.detail("receiver_check=skipped");
        return true;
    }
    match probe_receiver(&cfg.driver.callback_base_url) {
        Ok(()) => {
            report.detail("receiver_check=ok");
            true
        }
        Err(err) => {
            report.issue(format!(
                "{err}; start `chat2bear serve` first or set CHAT2BEAR_REQUIRE_RECEIVER=false"
            ));
            false
        }
    }
}

pub fn report_failures(report: &mut CommandReport, failures: &[LaunchFailure]) {
    for failure in failures {
        report.issue(format!(
            "transport failure for {}: {}",
            failure.conversation_id, failure.reason
        ));
    }
}

/// Record the run in the audit log. A write failure is reported but never
/// turns a successful run into a failed one.
pub fn audit_run(report: &mut CommandReport, paths: &BridgePaths, message: &str) {
    let status = if report.ok { "ok" } else { "issues" };
    if let Err(err) = audit::append_event(paths, &report.command, status, message) {
        report.detail(format!("audit_log_error={err:#}"));
    }
}
