use crate::bear::xcallback::{EXISTS_PATH, HEALTH_PATH, MISSING_PATH, SUCCESS_PATH};
use crate::bridge::entry::LedgerEntry;
use crate::bridge::store::Ledger;
use crate::bridge::util::now_epoch_millis;
use crate::bridge::warn::{self, WarnEvent};
use crate::error::WarnCode;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const CLOSE_PAGE: &str =
    "<!doctype html><html><body><script>window.close();</script>recorded</body></html>";

/// Turns Bear callbacks into ledger facts.
///
/// Holds nothing but the ledger handle: every call is one append and
/// nothing is read back. Bad parameters are recorded in `issues`, never
/// rejected, because Bear does not retry a callback.
#[derive(Debug, Clone)]
pub struct CallbackReceiver {
    ledger: Ledger,
}

fn present(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

impl CallbackReceiver {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn on_created(
        &self,
        bear_id: Option<&str>,
        title: Option<&str>,
        conversation_id: Option<&str>,
        characters: Option<&str>,
    ) -> Result<LedgerEntry> {
        let mut issues = Vec::new();
        let bear_id = present(bear_id);
        let conversation_id = present(conversation_id);
        if bear_id.is_none() {
            issues.push("identifier missing".to_string());
        }
        if conversation_id.is_none() {
            issues.push("conversation_id missing".to_string());
        }
        if present(title).is_none() {
            issues.push("title missing".to_string());
        }
        let character_count = match present(characters) {
            None => {
                issues.push("characters missing".to_string());
                None
            }
            Some(raw) => match raw.parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => {
                    issues.push(format!("characters malformed: {raw}"));
                    None
                }
            },
        };

        let entry = LedgerEntry::note_created(
            bear_id,
            title.map(ToOwned::to_owned),
            conversation_id,
            character_count,
            now_epoch_millis(),
        )
        .with_issues(issues);
        self.record(entry, "success")
    }

    pub fn on_exists(
        &self,
        bear_id: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<LedgerEntry> {
        let bear_id = present(bear_id);
        let conversation_id = present(conversation_id);
        let mut issues = Vec::new();
        if bear_id.is_none() {
            issues.push("identifier missing".to_string());
        }
        let entry = LedgerEntry::exists_confirmed(bear_id, conversation_id, now_epoch_millis())
            .with_issues(issues);
        self.record(entry, "bear-exists")
    }

    pub fn on_missing(
        &self,
        bear_id: Option<&str>,
        conversation_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<LedgerEntry> {
        let bear_id = present(bear_id);
        let conversation_id = present(conversation_id);
        let mut issues = Vec::new();
        if conversation_id.is_none() {
            issues.push("conversation_id missing".to_string());
        }
        let entry = LedgerEntry::exists_denied(bear_id, conversation_id, now_epoch_millis())
            .with_detail(present(error_message))
            .with_issues(issues);
        self.record(entry, "bear-missing")
    }

    fn record(&self, entry: LedgerEntry, endpoint: &str) -> Result<LedgerEntry> {
        let conversation = entry.conversation_id.as_deref().unwrap_or_default();
        let note = entry.bear_id.as_deref().unwrap_or_default();
        if !entry.issues.is_empty() {
            warn::emit(WarnEvent {
                code: WarnCode::CallbackData,
                stage: "receiver",
                action: endpoint,
                conversation,
                note,
                reason: "recorded-with-issues",
                err: &entry.issues.join("; "),
            });
        }
        self.ledger.append(&entry)?;
        info!(
            event = "callback_recorded",
            endpoint,
            kind = entry.kind.as_str(),
            conversation_id = conversation,
            bear_id = note,
        );
        Ok(entry)
    }
}

/// Query parameters where the first occurrence of a key wins. Parsing never
/// fails, so a callback is never turned away for its query string.
#[derive(Debug, Default)]
struct CallbackParams(BTreeMap<String, String>);

impl CallbackParams {
    fn parse(raw: Option<&str>) -> Self {
        let mut out = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(raw.unwrap_or_default().as_bytes()) {
            out.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
        Self(out)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

type Shared = Arc<CallbackReceiver>;

async fn record_blocking<F>(append: F) -> Response
where
    F: FnOnce() -> Result<LedgerEntry> + Send + 'static,
{
    match tokio::task::spawn_blocking(append).await {
        Ok(Ok(_)) => Html(CLOSE_PAGE).into_response(),
        Ok(Err(err)) => {
            error!(event = "ledger_append_failed", error = %format!("{err:#}"));
            (StatusCode::INTERNAL_SERVER_ERROR, "ledger append failed").into_response()
        }
        Err(err) => {
            error!(event = "ledger_append_panicked", error = %err);
            (StatusCode::INTERNAL_SERVER_ERROR, "ledger append failed").into_response()
        }
    }
}

async fn success(State(receiver): State<Shared>, RawQuery(query): RawQuery) -> Response {
    let params = CallbackParams::parse(query.as_deref());
    record_blocking(move || {
        receiver.on_created(
            params.get("identifier"),
            params.get("title"),
            params.get("conversation_id"),
            params.get("characters"),
        )
    })
    .await
}

async fn exists(State(receiver): State<Shared>, RawQuery(query): RawQuery) -> Response {
    let params = CallbackParams::parse(query.as_deref());
    record_blocking(move || {
        receiver.on_exists(params.get("identifier"), params.get("conversation_id"))
    })
    .await
}

async fn missing(State(receiver): State<Shared>, RawQuery(query): RawQuery) -> Response {
    let params = CallbackParams::parse(query.as_deref());
    record_blocking(move || {
        receiver.on_missing(
            params.get("identifier"),
            params.get("conversation_id"),
            params.get("errorMessage"),
        )
    })
    .await
}

pub fn router(receiver: CallbackReceiver) -> Router {
    Router::new()
        .route(SUCCESS_PATH, get(success))
        .route(EXISTS_PATH, get(exists))
        .route(MISSING_PATH, get(missing))
        .route(HEALTH_PATH, get(|| async { "ok" }))
        .with_state(Arc::new(receiver))
}

/// Bind the listener, refusing anything but a loopback address.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    if !addr.ip().is_loopback() {
        anyhow::bail!("receiver must bind a loopback address, got {addr}");
    }
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind receiver on {addr}"))
}

pub async fn serve<S>(listener: TcpListener, receiver: CallbackReceiver, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(
        event = "receiver_start",
        addr = %addr,
        ledger = %receiver.ledger().path().display()
    );
    axum::serve(listener, router(receiver))
        .with_graceful_shutdown(shutdown)
        .await
        .context("callback receiver stopped with an error")?;
    info!(event = "receiver_stop", addr = %addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::entry::EntryKind;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    #[test]
    fn on_created_appends_one_note_created_entry() {
        let tmp = tempdir().expect("tempdir");
        let receiver = CallbackReceiver::new(Ledger::new(tmp.path().join("ledger.jsonl")));

        let entry = receiver
            .on_created(Some("n1"), Some("T"), Some("abc"), Some("10"))
            .expect("record");
        assert!(entry.issues.is_empty());

        let (entries, _) = receiver.ledger().entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::NoteCreated);
        assert_eq!(entries[0].conversation_id.as_deref(), Some("abc"));
        assert_eq!(entries[0].bear_id.as_deref(), Some("n1"));
        assert_eq!(entries[0].character_count, Some(10));
    }

    #[test]
    fn malformed_created_callback_is_recorded_with_issues() {
        let tmp = tempdir().expect("tempdir");
        let receiver = CallbackReceiver::new(Ledger::new(tmp.path().join("ledger.jsonl")));

        let bad = receiver
            .on_created(Some("n1"), Some("T"), Some(""), Some("ten"))
            .expect("bad callback still recorded");
        assert!(bad.conversation_id.is_none());
        assert!(bad.issues.iter().any(|i| i == "conversation_id missing"));
        assert!(bad.issues.iter().any(|i| i.starts_with("characters malformed")));

        receiver
            .on_created(Some("n2"), Some("U"), Some("xyz"), Some("3"))
            .expect("good callback");

        let (entries, skipped) = receiver.ledger().entries().expect("entries");
        assert_eq!(skipped, 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].conversation_id.as_deref(), Some("xyz"));
        assert!(entries[1].issues.is_empty());
    }

    #[test]
    fn callback_params_keep_first_value_and_decode() {
        let params = CallbackParams::parse(Some("title=A+b%20c&title=second&identifier=N"));
        assert_eq!(params.get("title"), Some("A b c"));
        assert_eq!(params.get("identifier"), Some("N"));
        assert_eq!(params.get("missing"), None);
        assert!(CallbackParams::parse(None).get("title").is_none());
    }

    struct Running {
        base: String,
        stop: Option<oneshot::Sender<()>>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    impl Running {
        async fn shutdown(mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.handle.await.expect("join").expect("serve");
        }
    }

    async fn start(ledger: Ledger) -> Running {
        let listener = bind("127.0.0.1:0".parse().expect("addr"))
            .await
            .expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(serve(listener, CallbackReceiver::new(ledger), async move {
            let _ = stopped.await;
        }));
        Running {
            base,
            stop: Some(stop),
            handle,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_endpoints_append_and_close_the_page() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("ledger.jsonl"));
        let running = start(ledger.clone()).await;

        let health = reqwest::get(format!("{}/health", running.base))
            .await
            .expect("health");
        assert_eq!(health.text().await.expect("body"), "ok");

        let created = reqwest::get(format!(
            "{}/success?conversation_id=abc&characters=10&identifier=n1&title=My%20T",
            running.base
        ))
        .await
        .expect("success");
        assert!(created.status().is_success());
        assert!(created.text().await.expect("body").contains("window.close()"));

        reqwest::get(format!("{}/bear-exists?conversation_id=abc&identifier=n1", running.base))
            .await
            .expect("exists");
        reqwest::get(format!(
            "{}/bear-missing?conversation_id=abc&identifier=n1&errorCode=1&errorMessage=The%20note%20could%20not%20be%20found",
            running.base
        ))
        .await
        .expect("missing");

        running.shutdown().await;

        let (entries, _) = ledger.entries().expect("entries");
        let kinds = entries.iter().map(|e| e.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                EntryKind::NoteCreated,
                EntryKind::ExistsConfirmed,
                EntryKind::ExistsDenied
            ]
        );
        assert_eq!(entries[0].title.as_deref(), Some("My T"));
        assert_eq!(
            entries[2].detail.as_deref(),
            Some("The note could not be found")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_without_any_parameters_is_still_acknowledged() {
        let tmp = tempdir().expect("tempdir");
        let ledger = Ledger::new(tmp.path().join("ledger.jsonl"));
        let running = start(ledger.clone()).await;

        let resp = reqwest::get(format!("{}/success", running.base))
            .await
            .expect("success");
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        running.shutdown().await;

        let (entries, _) = ledger.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].issues.len(), 4);
    }

    #[tokio::test]
    async fn non_loopback_bind_is_refused() {
        let err = bind("0.0.0.0:0".parse().expect("addr")).await.unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }
}
