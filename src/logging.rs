use std::env;
use tracing_subscriber::EnvFilter;

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// `CHAT2BEAR_LOG` wins, then `RUST_LOG`, then the `-v` count.
fn build_filter(explicit: Option<String>, verbose: u8) -> EnvFilter {
    explicit
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v.trim()).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(verbose)))
}

pub fn init(verbose: u8) {
    let explicit = env::var("CHAT2BEAR_LOG")
        .ok()
        .or_else(|| env::var("RUST_LOG").ok());

    // Logs go to stderr so `--json` output stays parseable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_filter(explicit, verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
