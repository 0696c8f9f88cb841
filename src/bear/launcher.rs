use crate::bridge::config::LauncherConfig;
use crate::bridge::util::{run_command_with_timeout, truncate_with_ellipsis};
use crate::error::BridgeError;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Hands a URL to Bear. Implementations return once the URL has been
/// handed off; they never wait for Bear to act on it.
pub trait Launcher {
    fn launch(&self, url: &str) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone)]
pub struct OpenLauncher {
    bin: String,
    args: Vec<String>,
    timeout: Duration,
}

fn ensure_executable_path(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .with_context(|| format!("launcher binary path does not exist: {}", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("launcher binary path is not a file: {}", path.display());
    }
    Ok(())
}

fn resolve_bin(configured: &str) -> Result<PathBuf> {
    let trimmed = configured.trim();
    if trimmed.is_empty() {
        anyhow::bail!("launcher binary is not configured");
    }
    if trimmed.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(trimmed);
        ensure_executable_path(&path)?;
        return Ok(path);
    }
    which::which(trimmed).with_context(|| format!("`{trimmed}` not found on PATH"))
}

impl OpenLauncher {
    pub fn from_config(cfg: &LauncherConfig) -> Self {
        Self {
            bin: cfg.open_bin.clone(),
            args: cfg.open_args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
        }
    }

    pub fn available(&self) -> bool {
        resolve_bin(&self.bin).is_ok()
    }

    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            self.bin.clone()
        } else {
            format!("{} {}", self.bin, self.args.join(" "))
        }
    }
}

impl Launcher for OpenLauncher {
    fn launch(&self, url: &str) -> Result<(), BridgeError> {
        let failure = |reason: String| BridgeError::TransportFailure {
            target: truncate_with_ellipsis(url, 80),
            reason,
        };

        let bin = resolve_bin(&self.bin).map_err(|err| failure(format!("{err:#}")))?;
        let mut cmd = Command::new(&bin);
        cmd.args(&self.args).arg(url);
        let out = run_command_with_timeout(&mut cmd, self.timeout)
            .map_err(|err| failure(format!("failed to run `{}`: {err:#}", bin.display())))?;
        if !out.status.success() {
            return Err(failure(format!(
                "`{}` exited with {}: {}",
                bin.display(),
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}
