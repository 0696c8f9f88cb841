use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BridgePaths {
    pub home: PathBuf,
    pub ledger_file: PathBuf,
    pub logs_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths() -> Result<BridgePaths> {
    let home = required_home_dir()?;
    let bridge_home = env_or_default_path("CHAT2BEAR_HOME", home.join(".chat2bear"));

    let ledger_file = env_or_default_path("CHAT2BEAR_LEDGER", bridge_home.join("ledger.jsonl"));
    let logs_dir = env_or_default_path("CHAT2BEAR_LOGS_DIR", bridge_home.join("logs"));

    Ok(BridgePaths {
        home: bridge_home,
        ledger_file,
        logs_dir,
    })
}

impl BridgePaths {
    /// A `--ledger` flag wins over env and defaults.
    pub fn with_ledger_override(mut self, ledger: Option<&Path>) -> Self {
        if let Some(path) = ledger {
            self.ledger_file = path.to_path_buf();
        }
        self
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_override_replaces_resolved_path() {
        let paths = BridgePaths {
            home: PathBuf::from("/h"),
            ledger_file: PathBuf::from("/h/ledger.jsonl"),
            logs_dir: PathBuf::from("/h/logs"),
        };
        let got = paths.with_ledger_override(Some(Path::new("/tmp/other.jsonl")));
        assert_eq!(got.ledger_file, PathBuf::from("/tmp/other.jsonl"));
        assert_eq!(got.audit_log(), PathBuf::from("/h/logs/audit.log"));
    }
}
