use crate::bridge::export::ConversationRecord;
use anyhow::{Context, Result};
use url::Url;
use url::form_urlencoded::byte_serialize;

pub const SUCCESS_PATH: &str = "/success";
pub const EXISTS_PATH: &str = "/bear-exists";
pub const MISSING_PATH: &str = "/bear-missing";
pub const HEALTH_PATH: &str = "/health";

/// Percent-encode one URL component, spaces as `%20` rather than `+`.
pub fn quote(value: &str) -> String {
    byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn callback_url(base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base)
        .with_context(|| format!("invalid callback base url `{base}`"))?
        .join(path.trim_start_matches('/'))
        .with_context(|| format!("invalid callback path `{path}`"))?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

pub fn health_url(base: &str) -> Result<Url> {
    callback_url(base, HEALTH_PATH, &[])
}

/// `bear://x-callback-url/create` for a conversation. Bear appends
/// `identifier` and `title` to the success callback.
pub fn create_note_url(
    record: &ConversationRecord,
    callback_base: &str,
    tag_prefix: &str,
) -> Result<String> {
    let characters = record.character_count.to_string();
    let success = callback_url(
        callback_base,
        SUCCESS_PATH,
        &[
            ("conversation_id", record.conversation_id.as_str()),
            ("characters", characters.as_str()),
        ],
    )?;
    let tag = format!("{}/{}", tag_prefix.trim_end_matches('/'), record.archive_month());

    Ok(format!(
        "bear://x-callback-url/create?title={}&text={}&tags={}&x-success={}",
        quote(&record.title),
        quote(&record.body_text),
        quote(&tag),
        quote(success.as_str()),
    ))
}

/// How an existence check addresses the note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteLookup<'a> {
    ById(&'a str),
    ByTitle(&'a str),
}

/// `bear://x-callback-url/open-note` without showing a window; Bear calls
/// the exists endpoint when the note opens and the missing endpoint when it
/// does not.
pub fn open_note_url(
    lookup: NoteLookup<'_>,
    conversation_id: &str,
    callback_base: &str,
) -> Result<String> {
    let success = callback_url(
        callback_base,
        EXISTS_PATH,
        &[("conversation_id", conversation_id)],
    )?;
    let mut missing_params = vec![("conversation_id", conversation_id)];
    let target = match lookup {
        NoteLookup::ById(id) => {
            missing_params.push(("identifier", id));
            format!("id={}", quote(id))
        }
        NoteLookup::ByTitle(title) => format!("title={}", quote(title)),
    };
    let error = callback_url(callback_base, MISSING_PATH, &missing_params)?;

    Ok(format!(
        "bear://x-callback-url/open-note?{target}&show_window=no&x-success={}&x-error={}",
        quote(success.as_str()),
        quote(error.as_str()),
    ))
}
