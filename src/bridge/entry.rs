use anyhow::anyhow;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    NoteCreated,
    ExistsConfirmed,
    ExistsDenied,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoteCreated => "note_created",
            Self::ExistsConfirmed => "exists_confirmed",
            Self::ExistsDenied => "exists_denied",
        }
    }
}

/// One immutable fact in the ledger.
///
/// `timestamp` is epoch milliseconds fixed when the fact was received.
/// `issues` names callback parameters that arrived missing or malformed;
/// such entries are still recorded so the fact itself is never lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLedgerLine")]
pub struct LedgerEntry {
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bear_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_count: Option<u64>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

pub fn normalize_id(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl LedgerEntry {
    fn bare(kind: EntryKind, timestamp: i64) -> Self {
        Self {
            kind,
            conversation_id: None,
            bear_id: None,
            title: None,
            character_count: None,
            timestamp,
            detail: None,
            issues: Vec::new(),
        }
    }

    pub fn note_created(
        bear_id: Option<String>,
        title: Option<String>,
        conversation_id: Option<String>,
        character_count: Option<u64>,
        timestamp: i64,
    ) -> Self {
        Self {
            conversation_id: normalize_id(conversation_id),
            bear_id: normalize_id(bear_id),
            title,
            character_count,
            ..Self::bare(EntryKind::NoteCreated, timestamp)
        }
    }

    pub fn exists_confirmed(
        bear_id: Option<String>,
        conversation_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            conversation_id: normalize_id(conversation_id),
            bear_id: normalize_id(bear_id),
            ..Self::bare(EntryKind::ExistsConfirmed, timestamp)
        }
    }

    pub fn exists_denied(
        bear_id: Option<String>,
        conversation_id: Option<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            conversation_id: normalize_id(conversation_id),
            bear_id: normalize_id(bear_id),
            ..Self::bare(EntryKind::ExistsDenied, timestamp)
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_issues(mut self, issues: Vec<String>) -> Self {
        self.issues = issues;
        self
    }
}

/// Accepts the current line shape as well as the older import log, which
/// had no `kind` and tracked verification with an `exists_in_bear` flag.
#[derive(Debug, Deserialize)]
struct RawLedgerLine {
    #[serde(default)]
    kind: Option<EntryKind>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default, alias = "bear_note_id")]
    bear_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "characters")]
    character_count: Option<Value>,
    #[serde(default, alias = "ts")]
    timestamp: Option<Value>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    exists_in_bear: Option<bool>,
}

fn count_from_value(value: Option<Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn timestamp_from_value(value: Option<Value>) -> anyhow::Result<i64> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| anyhow!("timestamp out of range")),
        Some(Value::String(s)) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.timestamp_millis())
                .map_err(|err| anyhow!("unparsable timestamp `{s}`: {err}"))
        }
        Some(other) => Err(anyhow!("unexpected timestamp value {other}")),
    }
}

impl TryFrom<RawLedgerLine> for LedgerEntry {
    type Error = anyhow::Error;

    fn try_from(raw: RawLedgerLine) -> Result<Self, Self::Error> {
        let conversation_id = normalize_id(raw.conversation_id);
        let bear_id = normalize_id(raw.bear_id);

        let kind = match (raw.kind, raw.exists_in_bear) {
            (Some(kind), _) => kind,
            (None, Some(true)) => EntryKind::ExistsConfirmed,
            (None, Some(false)) => EntryKind::ExistsDenied,
            (None, None) if conversation_id.is_some() || bear_id.is_some() => {
                EntryKind::NoteCreated
            }
            (None, None) => return Err(anyhow!("ledger line has no kind and no identifier")),
        };

        Ok(Self {
            kind,
            conversation_id,
            bear_id,
            title: raw.title,
            character_count: count_from_value(raw.character_count),
            timestamp: timestamp_from_value(raw.timestamp)?,
            detail: raw.detail,
            issues: raw.issues,
        })
    }
}
