use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::bridge::config::load_config;
use crate::bridge::paths::resolve_paths;
use crate::bridge::receiver::{self, CallbackReceiver};
use crate::bridge::store::Ledger;
use crate::commands::CommandReport;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub ledger: Option<PathBuf>,
    pub bind: Option<String>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(event = "signal_error", error = %err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(event = "signal_error", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Runs the callback receiver in the foreground until interrupted.
pub fn run(opts: &ServeOptions) -> Result<CommandReport> {
    let paths = resolve_paths()?.with_ledger_override(opts.ledger.as_deref());
    let cfg = load_config()?;
    let mut report = CommandReport::new("serve");
    let ledger = Ledger::new(&paths.ledger_file);
    ledger.ensure_writable()?;

    let raw_addr = opts.bind.as_deref().unwrap_or(&cfg.receiver.bind_addr);
    let addr: SocketAddr = raw_addr
        .trim()
        .parse()
        .with_context(|| format!("invalid bind address `{raw_addr}`"))?;

    report.detail(format!("ledger={}", ledger.path().display()));
    report.detail(format!("bind={addr}"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async {
        let listener = receiver::bind(addr).await?;
        eprintln!("chat2bear receiver listening on http://{addr} (ctrl-c to stop)");
        receiver::serve(listener, CallbackReceiver::new(ledger), shutdown_signal()).await
    })?;

    report.detail("receiver stopped");
    Ok(report)
}
