use crate::bear::launcher::Launcher;
use crate::bear::xcallback::{NoteLookup, create_note_url, health_url, open_note_url};
use crate::bridge::config::DriverConfig;
use crate::bridge::export::ConversationRecord;
use crate::bridge::reconcile::{ImportState, Reconciliation};
use crate::bridge::warn::{self, WarnEvent};
use crate::error::{BridgeError, WarnCode};
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub callback_base_url: String,
    pub tag_prefix: String,
    pub max_requests: u64,
    pub interval: Duration,
    pub force: bool,
}

impl DriverSettings {
    pub fn for_import(cfg: &DriverConfig, max_override: Option<u64>) -> Self {
        Self {
            callback_base_url: cfg.callback_base_url.clone(),
            tag_prefix: cfg.tag_prefix.clone(),
            max_requests: max_override.unwrap_or(cfg.max_per_run),
            interval: Duration::from_millis(cfg.launch_interval_ms),
            force: false,
        }
    }

    pub fn for_check(cfg: &DriverConfig, max_override: Option<u64>, force: bool) -> Self {
        Self {
            interval: Duration::from_millis(cfg.check_interval_ms),
            force,
            ..Self::for_import(cfg, max_override)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFailure {
    pub conversation_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    Create,
    Recreate,
    AlreadyImported,
    AwaitingCallback,
}

/// What one import pass does with a conversation in `state`.
pub fn import_action(state: ImportState) -> ImportAction {
    match state {
        ImportState::NeverAttempted => ImportAction::Create,
        ImportState::ImportedButMissing => ImportAction::Recreate,
        ImportState::Imported => ImportAction::AlreadyImported,
        ImportState::PendingCallback => ImportAction::AwaitingCallback,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOutcome {
    pub considered: usize,
    pub already_imported: usize,
    pub pending: usize,
    pub launched: usize,
    pub reimported: usize,
    pub failed: usize,
    pub capped: bool,
    pub failures: Vec<LaunchFailure>,
}

/// Paces launches and enforces the per-run request cap.
struct Throttle {
    max: u64,
    interval: Duration,
    attempts: u64,
}

impl Throttle {
    fn new(settings: &DriverSettings) -> Self {
        Self {
            max: settings.max_requests,
            interval: settings.interval,
            attempts: 0,
        }
    }

    fn exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    fn before_launch(&mut self) {
        if self.attempts > 0 && !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
        self.attempts += 1;
    }
}

fn report_transport_failure(
    failures: &mut Vec<LaunchFailure>,
    conversation_id: &str,
    stage: &str,
    err: &str,
) {
    warn::emit(WarnEvent {
        code: WarnCode::TransportFailure,
        stage,
        action: "launch",
        conversation: conversation_id,
        note: "",
        reason: "retry-next-run",
        err,
    });
    failures.push(LaunchFailure {
        conversation_id: conversation_id.to_string(),
        reason: err.to_string(),
    });
}

/// One import pass. Issues a create request for every conversation that is
/// not durably imported and writes nothing to the ledger: the receiver
/// records the outcome when Bear calls back.
pub fn run_import(
    conversations: &[ConversationRecord],
    reconciliation: &Reconciliation,
    launcher: &dyn Launcher,
    settings: &DriverSettings,
) -> ImportOutcome {
    let mut out = ImportOutcome::default();
    let mut throttle = Throttle::new(settings);
    let mut issued: BTreeSet<&str> = BTreeSet::new();

    for record in conversations {
        let id = record.conversation_id.as_str();
        let state = if issued.contains(id) {
            ImportState::PendingCallback
        } else {
            reconciliation.state(id)
        };

        let action = import_action(state);
        match action {
            ImportAction::AlreadyImported => {
                out.considered += 1;
                out.already_imported += 1;
                debug!(event = "import_skip", conversation_id = id, reason = "already_imported");
                continue;
            }
            ImportAction::AwaitingCallback => {
                out.considered += 1;
                out.pending += 1;
                debug!(event = "import_skip", conversation_id = id, reason = "pending_callback");
                continue;
            }
            ImportAction::Create | ImportAction::Recreate => {}
        }

        if throttle.exhausted() {
            out.capped = true;
            info!(event = "import_capped", max = settings.max_requests);
            break;
        }
        out.considered += 1;

        let url = match create_note_url(record, &settings.callback_base_url, &settings.tag_prefix)
        {
            Ok(url) => url,
            Err(err) => {
                out.failed += 1;
                report_transport_failure(&mut out.failures, id, "import", &format!("{err:#}"));
                continue;
            }
        };

        throttle.before_launch();
        match launcher.launch(&url) {
            Ok(()) => {
                issued.insert(id);
                out.launched += 1;
                if action == ImportAction::Recreate {
                    out.reimported += 1;
                }
                info!(
                    event = "import_requested",
                    conversation_id = id,
                    reimport = action == ImportAction::Recreate,
                    characters = record.character_count,
                );
            }
            Err(err) => {
                out.failed += 1;
                report_transport_failure(&mut out.failures, id, "import", &err.to_string());
            }
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub conversation_id: String,
    pub title: Option<String>,
}

impl CheckTarget {
    pub fn from_export(conversations: &[ConversationRecord]) -> Vec<Self> {
        conversations
            .iter()
            .map(|c| Self {
                conversation_id: c.conversation_id.clone(),
                title: Some(c.title.clone()),
            })
            .collect()
    }

    /// Every conversation the ledger knows as imported.
    pub fn from_ledger(reconciliation: &Reconciliation) -> Vec<Self> {
        reconciliation
            .statuses()
            .filter(|s| s.state == ImportState::Imported)
            .map(|s| Self {
                conversation_id: s.conversation_id.clone(),
                title: s.title.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckOutcome {
    pub considered: usize,
    pub requested: usize,
    pub by_id: usize,
    pub by_title: usize,
    pub already_verified: usize,
    pub known_missing: usize,
    pub no_lookup: usize,
    pub failed: usize,
    pub capped: bool,
    pub failures: Vec<LaunchFailure>,
}

/// One verification pass. Asks Bear to open each unverified note without
/// showing it; the receiver records whether the note was found.
pub fn run_check(
    targets: &[CheckTarget],
    reconciliation: &Reconciliation,
    launcher: &dyn Launcher,
    settings: &DriverSettings,
) -> CheckOutcome {
    let mut out = CheckOutcome::default();
    let mut throttle = Throttle::new(settings);
    let mut seen: BTreeSet<&str> = BTreeSet::new();

    for target in targets {
        let id = target.conversation_id.as_str();
        if !seen.insert(id) {
            continue;
        }
        let status = reconciliation.status(id);
        let state = reconciliation.state(id);

        match state {
            ImportState::ImportedButMissing if !settings.force => {
                out.considered += 1;
                out.known_missing += 1;
                debug!(event = "check_skip", conversation_id = id, reason = "known_missing");
                continue;
            }
            ImportState::Imported
                if !settings.force && !status.is_some_and(|s| s.needs_verification()) =>
            {
                out.considered += 1;
                out.already_verified += 1;
                debug!(event = "check_skip", conversation_id = id, reason = "already_verified");
                continue;
            }
            _ => {}
        }

        let lookup = match (
            status.and_then(|s| s.bear_id.as_deref()),
            target.title.as_deref().filter(|t| !t.trim().is_empty()),
        ) {
            (Some(bear_id), _) => NoteLookup::ById(bear_id),
            (None, Some(title)) => NoteLookup::ByTitle(title),
            (None, None) => {
                out.considered += 1;
                out.no_lookup += 1;
                debug!(event = "check_skip", conversation_id = id, reason = "no_identifier_or_title");
                continue;
            }
        };

        if throttle.exhausted() {
            out.capped = true;
            info!(event = "check_capped", max = settings.max_requests);
            break;
        }
        out.considered += 1;

        let url = match open_note_url(lookup, id, &settings.callback_base_url) {
            Ok(url) => url,
            Err(err) => {
                out.failed += 1;
                report_transport_failure(&mut out.failures, id, "check", &format!("{err:#}"));
                continue;
            }
        };

        throttle.before_launch();
        match launcher.launch(&url) {
            Ok(()) => {
                out.requested += 1;
                match lookup {
                    NoteLookup::ById(_) => out.by_id += 1,
                    NoteLookup::ByTitle(_) => out.by_title += 1,
                }
                info!(event = "check_requested", conversation_id = id, state = state.as_str());
            }
            Err(err) => {
                out.failed += 1;
                report_transport_failure(&mut out.failures, id, "check", &err.to_string());
            }
        }
    }

    out
}

/// Fails when nothing answers on the receiver's health endpoint, in which
/// case any callback Bear makes would be lost.
pub fn probe_receiver(callback_base_url: &str) -> Result<(), BridgeError> {
    let unavailable = |detail: String| {
        BridgeError::ReceiverUnavailable(format!("{callback_base_url} ({detail})"))
    };
    let url = health_url(callback_base_url).map_err(|err| unavailable(format!("{err:#}")))?;
    let client = reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .map_err(|err| unavailable(err.to_string()))?;
    let resp = client
        .get(url)
        .send()
        .map_err(|err| unavailable(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(unavailable(format!("health returned {}", resp.status())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::entry::LedgerEntry;
    use crate::bridge::receiver::CallbackReceiver;
    use crate::bridge::store::Ledger;
    use std::cell::RefCell;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingLauncher {
        urls: RefCell<Vec<String>>,
        fail_when_contains: Option<&'static str>,
    }

    impl Launcher for RecordingLauncher {
        fn launch(&self, url: &str) -> Result<(), BridgeError> {
            if let Some(needle) = self.fail_when_contains
                && url.contains(needle)
            {
                return Err(BridgeError::TransportFailure {
                    target: url.to_string(),
                    reason: "application not installed".to_string(),
                });
            }
            self.urls.borrow_mut().push(url.to_string());
            Ok(())
        }
    }

    fn settings() -> DriverSettings {
        DriverSettings {
            callback_base_url: "http://localhost:3000".to_string(),
            tag_prefix: "chatgpt/archive".to_string(),
            max_requests: 100,
            interval: Duration::ZERO,
            force: false,
        }
    }

    fn conversation(id: &str, title: &str, characters: u64) -> ConversationRecord {
        ConversationRecord {
            conversation_id: id.to_string(),
            title: title.to_string(),
            body_text: "x".repeat(characters as usize),
            character_count: characters,
            create_time: None,
        }
    }

    fn reconcile(ledger: &Ledger) -> Reconciliation {
        let (entries, _) = ledger.entries().expect("entries");
        Reconciliation::from_entries(&entries)
    }

    #[test]
    fn import_action_covers_every_state() {
        assert_eq!(import_action(ImportState::NeverAttempted), ImportAction::Create);
        assert_eq!(import_action(ImportState::ImportedButMissing), ImportAction::Recreate);
        assert_eq!(import_action(ImportState::Imported), ImportAction::AlreadyImported);
        assert_eq!(import_action(ImportState::PendingCallback), ImportAction::AwaitingCallback);
    }

    #[test]
    fn import_then_callback_then_skip() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("ledger.jsonl"));
        let conversations = vec![conversation("abc", "T", 10)];
        let launcher = RecordingLauncher::default();

        let first = run_import(&conversations, &reconcile(&ledger), &launcher, &settings());
        assert_eq!(first.launched, 1);
        assert_eq!(launcher.urls.borrow().len(), 1);
        assert!(launcher.urls.borrow()[0].starts_with("bear://x-callback-url/create?title=T&"));
        assert!(!ledger.path().exists());

        CallbackReceiver::new(ledger.clone())
            .on_created(Some("n1"), Some("T"), Some("abc"), Some("10"))
            .expect("callback");
        let (entries, _) = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 1);

        let second = run_import(&conversations, &reconcile(&ledger), &launcher, &settings());
        assert_eq!(second.launched, 0);
        assert_eq!(second.already_imported, 1);
        assert_eq!(launcher.urls.borrow().len(), 1);
    }

    #[test]
    fn latest_exists_denied_triggers_reimport() {
        let entries = vec![
            LedgerEntry::note_created(Some("n1".into()), Some("T".into()), Some("abc".into()), Some(10), 1),
            LedgerEntry::exists_denied(None, Some("abc".into()), 2),
        ];
        let launcher = RecordingLauncher::default();
        let out = run_import(
            &[conversation("abc", "T", 10)],
            &Reconciliation::from_entries(&entries),
            &launcher,
            &settings(),
        );
        assert_eq!(out.launched, 1);
        assert_eq!(out.reimported, 1);
    }

    #[test]
    fn repeated_identifier_in_one_run_is_pending_not_relaunched() {
        let launcher = RecordingLauncher::default();
        let out = run_import(
            &[conversation("abc", "T", 1), conversation("abc", "T", 1)],
            &Reconciliation::default(),
            &launcher,
            &settings(),
        );
        assert_eq!(out.launched, 1);
        assert_eq!(out.pending, 1);
    }

    #[test]
    fn transport_failure_is_reported_and_run_continues() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("ledger.jsonl"));
        let launcher = RecordingLauncher {
            fail_when_contains: Some("conversation_id%3Dbad"),
            ..RecordingLauncher::default()
        };
        let out = run_import(
            &[conversation("bad", "B", 1), conversation("good", "G", 1)],
            &reconcile(&ledger),
            &launcher,
            &settings(),
        );
        assert_eq!(out.failed, 1);
        assert_eq!(out.launched, 1);
        assert_eq!(out.failures[0].conversation_id, "bad");
        assert_eq!(launcher.urls.borrow().len(), 1);
        assert!(!ledger.path().exists());
        assert_eq!(reconcile(&ledger).state("bad"), ImportState::NeverAttempted);
    }

    #[test]
    fn import_stops_at_request_cap() {
        let launcher = RecordingLauncher::default();
        let settings = DriverSettings {
            max_requests: 2,
            ..settings()
        };
        let conversations = (0..5)
            .map(|i| conversation(&format!("c{i}"), "T", 1))
            .collect::<Vec<_>>();
        let out = run_import(&conversations, &Reconciliation::default(), &launcher, &settings);
        assert_eq!(out.launched, 2);
        assert!(out.capped);
    }

    #[test]
    fn check_opens_unverified_by_id_and_unknown_by_title() {
        let entries = vec![
            LedgerEntry::note_created(Some("n1".into()), Some("A".into()), Some("a".into()), Some(1), 1),
            LedgerEntry::note_created(Some("n2".into()), Some("B".into()), Some("b".into()), Some(1), 1),
            LedgerEntry::exists_confirmed(Some("n2".into()), Some("b".into()), 2),
            LedgerEntry::note_created(Some("n3".into()), Some("C".into()), Some("c".into()), Some(1), 1),
            LedgerEntry::exists_denied(Some("n3".into()), Some("c".into()), 2),
        ];
        let rec = Reconciliation::from_entries(&entries);
        let conversations = vec![
            conversation("a", "A", 1),
            conversation("b", "B", 1),
            conversation("c", "C", 1),
            conversation("d", "Fresh title", 1),
        ];
        let launcher = RecordingLauncher::default();

        let out = run_check(&CheckTarget::from_export(&conversations), &rec, &launcher, &settings());
        assert_eq!(out.requested, 2);
        assert_eq!(out.by_id, 1);
        assert_eq!(out.by_title, 1);
        assert_eq!(out.already_verified, 1);
        assert_eq!(out.known_missing, 1);
        let urls = launcher.urls.borrow();
        assert!(urls[0].starts_with("bear://x-callback-url/open-note?id=n1&"));
        assert!(urls[1].starts_with("bear://x-callback-url/open-note?title=Fresh%20title&"));
    }

    #[test]
    fn forced_check_revisits_verified_and_missing_notes() {
        let entries = vec![
            LedgerEntry::note_created(Some("n2".into()), Some("B".into()), Some("b".into()), Some(1), 1),
            LedgerEntry::exists_confirmed(Some("n2".into()), Some("b".into()), 2),
            LedgerEntry::note_created(Some("n3".into()), Some("C".into()), Some("c".into()), Some(1), 1),
            LedgerEntry::exists_denied(Some("n3".into()), Some("c".into()), 2),
        ];
        let rec = Reconciliation::from_entries(&entries);
        let launcher = RecordingLauncher::default();
        let settings = DriverSettings {
            force: true,
            ..settings()
        };

        let out = run_check(&CheckTarget::from_ledger(&rec), &rec, &launcher, &settings);
        // Only imported conversations come from the ledger; `c` is missing.
        assert_eq!(out.requested, 1);
        assert_eq!(out.by_id, 1);

        let targets = vec![
            CheckTarget { conversation_id: "b".into(), title: None },
            CheckTarget { conversation_id: "c".into(), title: None },
        ];
        let out = run_check(&targets, &rec, &launcher, &settings);
        assert_eq!(out.requested, 2);
    }

    #[test]
    fn check_without_id_or_title_is_skipped() {
        let launcher = RecordingLauncher::default();
        let targets = vec![CheckTarget {
            conversation_id: "orphan".into(),
            title: None,
        }];
        let out = run_check(&targets, &Reconciliation::default(), &launcher, &settings());
        assert_eq!(out.no_lookup, 1);
        assert_eq!(out.requested, 0);
    }

    #[test]
    fn probe_fails_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = probe_receiver(&format!("http://{addr}")).unwrap_err();
        assert!(matches!(err, BridgeError::ReceiverUnavailable(_)));
    }
}
