use anyhow::Result;
use std::path::PathBuf;

use crate::bear::launcher::OpenLauncher;
use crate::bridge::config::load_config;
use crate::bridge::driver::{CheckTarget, DriverSettings, run_check};
use crate::bridge::export::load_conversations;
use crate::bridge::paths::resolve_paths;
use crate::bridge::reconcile::Reconciliation;
use crate::bridge::store::Ledger;
use crate::commands::{CommandReport, audit_run, preflight, report_failures};

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub ledger: Option<PathBuf>,
    pub export: Option<PathBuf>,
    pub max: Option<u64>,
    pub force: bool,
}

pub fn run(opts: &CheckOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?.with_ledger_override(opts.ledger.as_deref());
    let cfg = load_config()?;
    let mut report = CommandReport::new("check-bear-notes-exist");
    let ledger = Ledger::new(&paths.ledger_file);
    let launcher = OpenLauncher::from_config(&cfg.launcher);

    report.detail(format!("ledger={}", ledger.path().display()));
    report.detail(format!("launcher={}", launcher.describe()));
    report.detail(format!("launcher_available={}", launcher.available()));
    report.detail(format!("force={}", opts.force));

    if !preflight(&mut report, &ledger, &cfg) {
        audit_run(&mut report, &paths, "aborted before launching");
        return Ok(report);
    }

    let (entries, _) = ledger.entries()?;
    let reconciliation = Reconciliation::from_entries(&entries);
    let targets = match &opts.export {
        Some(path) => {
            report.detail(format!("export={}", path.display()));
            CheckTarget::from_export(&load_conversations(path)?)
        }
        None => {
            report.detail("export=none; checking imported conversations from the ledger");
            CheckTarget::from_ledger(&reconciliation)
        }
    };

    let settings = DriverSettings::for_check(&cfg.driver, opts.max, opts.force);
    let out = run_check(&targets, &reconciliation, &launcher, &settings);

    report.detail(format!("targets={}", targets.len()));
    report.detail(format!("requested={}", out.requested));
    report.detail(format!("requested_by_id={}", out.by_id));
    report.detail(format!("requested_by_title={}", out.by_title));
    report.detail(format!("already_verified={}", out.already_verified));
    report.detail(format!("known_missing={}", out.known_missing));
    report.detail(format!("no_identifier_or_title={}", out.no_lookup));
    report.detail(format!("failed={}", out.failed));
    if out.capped {
        report.detail(format!(
            "stopped at max={}; run again to continue",
            settings.max_requests
        ));
    }
    report_failures(&mut report, &out.failures);

    audit_run(
        &mut report,
        &paths,
        &format!("requested={} failed={}", out.requested, out.failed),
    );
    Ok(report)
}
