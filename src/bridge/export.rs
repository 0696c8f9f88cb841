use crate::bridge::warn::{self, WarnEvent};
use crate::error::{BridgeError, WarnCode};
use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use serde_json::Value;
use std::fs;
use std::path::Path;

const CHAT_LINK_BASE: &str = "https://chat.openai.com/c/";

/// One conversation from the export, rendered into the note body Bear
/// receives. Read once per run and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub title: String,
    pub body_text: String,
    pub character_count: u64,
    pub create_time: Option<f64>,
}

impl ConversationRecord {
    /// `YYYY-MM` of the conversation's creation in local time, or of now
    /// when the export has no creation time.
    pub fn archive_month(&self) -> String {
        let created = self
            .create_time
            .and_then(|secs| Local.timestamp_opt(secs as i64, 0).single())
            .unwrap_or_else(Local::now);
        created.format("%Y-%m").to_string()
    }
}

pub fn load_conversations(path: &Path) -> Result<Vec<ConversationRecord>> {
    let raw = fs::read_to_string(path)
        .map_err(|err| BridgeError::InvalidExport(format!("{}: {err}", path.display())))?;
    parse_conversations(&raw).with_context(|| format!("failed to load {}", path.display()))
}

pub fn parse_conversations(raw: &str) -> Result<Vec<ConversationRecord>> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|err| BridgeError::InvalidExport(format!("not valid JSON: {err}")))?;
    let Some(items) = parsed.as_array() else {
        return Err(BridgeError::InvalidExport("expected a JSON array of conversations".into()).into());
    };

    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        match conversation_from_item(item) {
            Some(record) => out.push(record),
            None => warn::emit(WarnEvent {
                code: WarnCode::ExportItemSkipped,
                stage: "export-read",
                action: "skip-item",
                conversation: "",
                note: "",
                reason: "missing-conversation-id",
                err: &format!("item {idx}"),
            }),
        }
    }
    Ok(out)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn conversation_from_item(item: &Value) -> Option<ConversationRecord> {
    let conversation_id =
        non_empty_str(item.get("conversation_id")).or_else(|| non_empty_str(item.get("id")))?;
    let title = item
        .get("title")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("Untitled");
    let body_text = render_body(conversation_id, item.get("mapping"));
    let character_count = body_text.chars().count() as u64;

    Some(ConversationRecord {
        conversation_id: conversation_id.to_string(),
        title: title.to_string(),
        body_text,
        character_count,
        create_time: item.get("create_time").and_then(Value::as_f64),
    })
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

pub fn role_marker(role: &str) -> &str {
    match role {
        "user" => "👤",
        "assistant" => "🤖",
        other => other,
    }
}

fn render_body(conversation_id: &str, mapping: Option<&Value>) -> String {
    let mut text = format!("[ChatGPT Link]({CHAT_LINK_BASE}{conversation_id})\n\n");
    let Some(nodes) = mapping.and_then(Value::as_object) else {
        return text;
    };

    for node in nodes.values() {
        let Some(message) = node.get("message").filter(|m| !is_falsy(m)) else {
            continue;
        };
        let role = message
            .get("author")
            .and_then(|a| a.get("role"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Some(parts) = message
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        else {
            continue;
        };
        if parts.first().is_none_or(is_falsy) {
            continue;
        }

        let strings = parts
            .iter()
            .filter_map(Value::as_str)
            .filter(|t| !t.trim().is_empty());

        let lines = if role == "user" {
            let mut user_parts = strings
                .map(|t| escape_triple_backticks(&escape_hashtags(t)))
                .collect::<Vec<_>>();
            if user_parts.is_empty() {
                continue;
            }
            if let Some(first) = user_parts.first_mut() {
                *first = first.trim().to_string();
            }
            if let Some(last) = user_parts.last_mut() {
                *last = last.trim().to_string();
            }
            let mut fenced = Vec::with_capacity(user_parts.len() + 2);
            fenced.push("```".to_string());
            fenced.extend(user_parts);
            fenced.push("```".to_string());
            fenced
        } else {
            strings.map(escape_hashtags).collect::<Vec<_>>()
        };

        text.push_str(role_marker(role));
        text.push('\n');
        text.push_str(&lines.join("\n"));
        text.push_str("\n\n");
    }

    text
}

/// Bear reads `#word` as a tag. Escape every `#` that is neither part of a
/// run of `#` nor followed by a space (a Markdown heading).
pub fn escape_hashtags(text: &str) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(text.len() + 8);
    for (i, &ch) in chars.iter().enumerate() {
        if ch == '#' {
            let after_hash = i > 0 && chars[i - 1] == '#';
            let before_space = chars.get(i + 1) == Some(&' ');
            if !after_hash && !before_space {
                out.push('\\');
            }
        }
        out.push(ch);
    }
    out
}

/// Escape code fences in user text so they stay literal inside the fence
/// the note wraps around it.
pub fn escape_triple_backticks(text: &str) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(text.len() + 8);
    let mut i = 0;
    while i < chars.len() {
        let fence = chars.len() - i >= 3 && chars[i..i + 3].iter().all(|&c| c == '`');
        if fence && (i == 0 || chars[i - 1] != '`') {
            out.push_str("\\```");
            i += 3;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
