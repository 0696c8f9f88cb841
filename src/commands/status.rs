use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::bridge::export::{ConversationRecord, load_conversations};
use crate::bridge::paths::resolve_paths;
use crate::bridge::reconcile::{ImportState, Reconciliation, compute_state};
use crate::bridge::store::Ledger;
use crate::bridge::warn::{self, WarnEvent};
use crate::commands::CommandReport;
use crate::error::WarnCode;

const ALL_STATES: [ImportState; 4] = [
    ImportState::NeverAttempted,
    ImportState::PendingCallback,
    ImportState::Imported,
    ImportState::ImportedButMissing,
];

#[derive(Debug, Clone)]
pub struct StatusOptions {
    pub ledger: Option<PathBuf>,
    pub export: Option<PathBuf>,
    pub conversation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportComparison {
    pub conversations: usize,
    pub by_state: BTreeMap<ImportState, usize>,
    pub not_in_export: Vec<String>,
}

/// Where each export conversation stands, and which ledger conversations
/// the export does not know about.
pub fn compare_with_export(
    reconciliation: &Reconciliation,
    conversations: &[ConversationRecord],
) -> ExportComparison {
    let mut out = ExportComparison::default();
    let mut seen = BTreeSet::new();
    for record in conversations {
        if !seen.insert(record.conversation_id.as_str()) {
            continue;
        }
        out.conversations += 1;
        *out
            .by_state
            .entry(reconciliation.state(&record.conversation_id))
            .or_default() += 1;
    }
    out.not_in_export = reconciliation
        .statuses()
        .filter(|s| !seen.contains(s.conversation_id.as_str()))
        .map(|s| s.conversation_id.clone())
        .collect();
    out
}

pub fn run(opts: &StatusOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?.with_ledger_override(opts.ledger.as_deref());
    let mut report = CommandReport::new("status");
    let ledger = Ledger::new(&paths.ledger_file);

    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("ledger={}", ledger.path().display()));
    report.detail(format!("ledger_exists={}", ledger.path().exists()));

    let (entries, skipped) = ledger.entries()?;
    let reconciliation = Reconciliation::from_entries(&entries);
    report.detail(format!("entries={}", reconciliation.total_entries()));
    report.detail(format!("skipped_lines={skipped}"));
    report.detail(format!("unattributed_entries={}", reconciliation.unattributed()));

    let counts = reconciliation.counts_by_state();
    for state in ALL_STATES {
        report.detail(format!(
            "ledger.{}={}",
            state.as_str(),
            counts.get(&state).copied().unwrap_or(0)
        ));
    }
    let unverified = reconciliation
        .statuses()
        .filter(|s| s.needs_verification())
        .count();
    report.detail(format!("needs_verification={unverified}"));
    for status in reconciliation
        .statuses()
        .filter(|s| s.state == ImportState::ImportedButMissing)
    {
        report.detail(format!(
            "missing={} bear_id={} entries={} last_ts={}",
            status.conversation_id,
            status.bear_id.as_deref().unwrap_or("-"),
            status.entry_count,
            status.latest_timestamp
        ));
    }

    if let Some(id) = opts.conversation.as_deref() {
        let state = compute_state(&entries, id);
        report.detail(format!("conversation={id}"));
        report.detail(format!("conversation.state={}", state.as_str()));
        if let Some(status) = reconciliation.status(id) {
            report.detail(format!(
                "conversation.bear_id={}",
                status.bear_id.as_deref().unwrap_or("-")
            ));
            report.detail(format!("conversation.entries={}", status.entry_count));
            report.detail(format!(
                "conversation.needs_verification={}",
                status.needs_verification()
            ));
        }
    }

    if let Some(path) = &opts.export {
        let conversations = load_conversations(path)?;
        let cmp = compare_with_export(&reconciliation, &conversations);
        report.detail(format!("export={}", path.display()));
        report.detail(format!("export_conversations={}", cmp.conversations));
        for state in ALL_STATES {
            report.detail(format!(
                "export.{}={}",
                state.as_str(),
                cmp.by_state.get(&state).copied().unwrap_or(0)
            ));
        }
        for id in &cmp.not_in_export {
            warn::emit(WarnEvent {
                code: WarnCode::IdentifierMismatch,
                stage: "status",
                action: "compare-export",
                conversation: id,
                note: "",
                reason: "ledger-only",
                err: "conversation recorded in ledger but absent from export",
            });
            report.detail(format!("not_in_export={id}"));
        }
    }

    Ok(report)
}
