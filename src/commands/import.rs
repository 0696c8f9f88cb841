use anyhow::Result;
use std::path::PathBuf;

use crate::bear::launcher::OpenLauncher;
use crate::bridge::config::load_config;
use crate::bridge::driver::{DriverSettings, run_import};
use crate::bridge::export::load_conversations;
use crate::bridge::paths::resolve_paths;
use crate::bridge::reconcile::Reconciliation;
use crate::bridge::store::Ledger;
use crate::commands::{CommandReport, audit_run, preflight, report_failures};

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub ledger: Option<PathBuf>,
    pub export: PathBuf,
    pub max: Option<u64>,
}

pub fn run(opts: &ImportOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?.with_ledger_override(opts.ledger.as_deref());
    let cfg = load_config()?;
    let mut report = CommandReport::new("import");
    let ledger = Ledger::new(&paths.ledger_file);
    let launcher = OpenLauncher::from_config(&cfg.launcher);

    report.detail(format!("ledger={}", ledger.path().display()));
    report.detail(format!("export={}", opts.export.display()));
    report.detail(format!("launcher={}", launcher.describe()));
    report.detail(format!("launcher_available={}", launcher.available()));

    if !preflight(&mut report, &ledger, &cfg) {
        audit_run(&mut report, &paths, "aborted before launching");
        return Ok(report);
    }

    let conversations = load_conversations(&opts.export)?;
    let (entries, skipped) = ledger.entries()?;
    let reconciliation = Reconciliation::from_entries(&entries);
    let settings = DriverSettings::for_import(&cfg.driver, opts.max);
    let out = run_import(&conversations, &reconciliation, &launcher, &settings);

    report.detail(format!("export_conversations={}", conversations.len()));
    report.detail(format!("ledger_entries={}", entries.len()));
    if skipped > 0 {
        report.detail(format!("ledger_skipped_lines={skipped}"));
    }
    report.detail(format!("considered={}", out.considered));
    report.detail(format!("launched={}", out.launched));
    report.detail(format!("reimported={}", out.reimported));
    report.detail(format!("already_imported={}", out.already_imported));
    report.detail(format!("pending_callback={}", out.pending));
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
        &format!(
            "launched={} reimported={} skipped={} failed={}",
            out.launched,
            out.reimported,
            out.already_imported + out.pending,
            out.failed
        ),
    );
    Ok(report)
}
