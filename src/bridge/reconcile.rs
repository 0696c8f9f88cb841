use crate::bridge::entry::{EntryKind, LedgerEntry};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportState {
    NeverAttempted,
    PendingCallback,
    Imported,
    ImportedButMissing,
}

impl ImportState {
    pub fn from_kind(kind: EntryKind) -> Self {
        match kind {
            EntryKind::NoteCreated | EntryKind::ExistsConfirmed => Self::Imported,
            EntryKind::ExistsDenied => Self::ImportedButMissing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverAttempted => "never_attempted",
            Self::PendingCallback => "pending_callback",
            Self::Imported => "imported",
            Self::ImportedButMissing => "imported_but_missing",
        }
    }
}

/// Ordering key: timestamp first, then stream position so that equal
/// timestamps resolve to the later line.
type Rank = (i64, usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationStatus {
    pub conversation_id: String,
    pub state: ImportState,
    pub latest_kind: EntryKind,
    pub latest_timestamp: i64,
    pub bear_id: Option<String>,
    pub title: Option<String>,
    pub entry_count: usize,
    latest_rank: Rank,
    bear_rank: Rank,
    title_rank: Rank,
}

impl ConversationStatus {
    fn new(conversation_id: &str, entry: &LedgerEntry, rank: Rank) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            state: ImportState::from_kind(entry.kind),
            latest_kind: entry.kind,
            latest_timestamp: entry.timestamp,
            bear_id: entry.bear_id.clone(),
            title: entry.title.clone(),
            entry_count: 1,
            latest_rank: rank,
            bear_rank: rank,
            title_rank: rank,
        }
    }

    fn absorb(&mut self, entry: &LedgerEntry, rank: Rank) {
        self.entry_count += 1;
        if rank >= self.latest_rank {
            self.latest_rank = rank;
            self.latest_kind = entry.kind;
            self.latest_timestamp = entry.timestamp;
            self.state = ImportState::from_kind(entry.kind);
        }
        if let Some(bear_id) = &entry.bear_id
            && (self.bear_id.is_none() || rank >= self.bear_rank)
        {
            self.bear_id = Some(bear_id.clone());
            self.bear_rank = rank;
        }
        if let Some(title) = &entry.title
            && (self.title.is_none() || rank >= self.title_rank)
        {
            self.title = Some(title.clone());
            self.title_rank = rank;
        }
    }

    /// The latest fact is an unverified creation.
    pub fn needs_verification(&self) -> bool {
        self.latest_kind == EntryKind::NoteCreated
    }
}

/// Per-conversation view folded from the whole ledger.
///
/// Entries without a `conversation_id` are attributed through the
/// `bear_id` that some other entry links to a conversation; entries with
/// neither identifier stay in the ledger but count as unattributed.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    statuses: BTreeMap<String, ConversationStatus>,
    total_entries: usize,
    unattributed: usize,
}

impl Reconciliation {
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a LedgerEntry>,
    {
        let mut out = Self::default();
        let mut links: BTreeMap<&'a str, &'a str> = BTreeMap::new();
        let mut by_note_only: Vec<(&'a LedgerEntry, usize)> = Vec::new();

        for (pos, entry) in entries.into_iter().enumerate() {
            out.total_entries += 1;
            match (entry.conversation_id.as_deref(), entry.bear_id.as_deref()) {
                (Some(conversation_id), bear_id) => {
                    if let Some(bear_id) = bear_id {
                        links.insert(bear_id, conversation_id);
                    }
                    out.absorb(conversation_id, entry, (entry.timestamp, pos));
                }
                (None, Some(_)) => by_note_only.push((entry, pos)),
                (None, None) => out.unattributed += 1,
            }
        }

        for (entry, pos) in by_note_only {
            let linked = entry
                .bear_id
                .as_deref()
                .and_then(|bear_id| links.get(bear_id));
            match linked {
                Some(conversation_id) => {
                    out.absorb(conversation_id, entry, (entry.timestamp, pos));
                }
                None => out.unattributed += 1,
            }
        }

        out
    }

    fn absorb(&mut self, conversation_id: &str, entry: &LedgerEntry, rank: Rank) {
        match self.statuses.get_mut(conversation_id) {
            Some(status) => status.absorb(entry, rank),
            None => {
                self.statuses.insert(
                    conversation_id.to_string(),
                    ConversationStatus::new(conversation_id, entry, rank),
                );
            }
        }
    }

    pub fn state(&self, conversation_id: &str) -> ImportState {
        self.statuses
            .get(conversation_id)
            .map_or(ImportState::NeverAttempted, |s| s.state)
    }

    pub fn status(&self, conversation_id: &str) -> Option<&ConversationStatus> {
        self.statuses.get(conversation_id)
    }

    pub fn statuses(&self) -> impl Iterator<Item = &ConversationStatus> {
        self.statuses.values()
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    pub fn unattributed(&self) -> usize {
        self.unattributed
    }

    pub fn counts_by_state(&self) -> BTreeMap<ImportState, usize> {
        let mut out = BTreeMap::new();
        for status in self.statuses.values() {
            *out.entry(status.state).or_insert(0) += 1;
        }
        out
    }
}

/// Current state of one conversation: the kind of its latest entry, or
/// `NeverAttempted` when the ledger holds nothing for it.
pub fn compute_state(entries: &[LedgerEntry], conversation_id: &str) -> ImportState {
    Reconciliation::from_entries(entries).state(conversation_id)
}
