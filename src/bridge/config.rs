use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub bind_addr: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub callback_base_url: String,
    pub max_per_run: u64,
    pub launch_interval_ms: u64,
    pub check_interval_ms: u64,
    pub require_receiver: bool,
    pub tag_prefix: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:3000".to_string(),
            max_per_run: 1000,
            launch_interval_ms: 1000,
            check_interval_ms: 100,
            require_receiver: true,
            tag_prefix: "chatgpt/archive".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub open_bin: String,
    pub open_args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            open_bin: "open".to_string(),
            open_args: vec!["-g".to_string()],
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    pub receiver: ReceiverConfig,
    pub driver: DriverConfig,
    pub launcher: LauncherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialBridgeConfig {
    receiver: Option<ReceiverConfig>,
    driver: Option<DriverConfig>,
    launcher: Option<LauncherConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_csv(var: &str, fallback: &[String]) -> Vec<String> {
    match env::var(var) {
        // An explicitly empty value clears the launcher args.
        Ok(v) => v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>(),
        Err(_) => fallback.to_vec(),
    }
}

fn validate(cfg: &BridgeConfig) -> Result<()> {
    if cfg.receiver.bind_addr.trim().is_empty() {
        return Err(anyhow!("invalid receiver bind address: cannot be empty"));
    }
    if cfg.receiver.bind_addr.parse::<SocketAddr>().is_err() {
        return Err(anyhow!(
            "invalid receiver bind address `{}`: expected host:port",
            cfg.receiver.bind_addr
        ));
    }
    let base = url::Url::parse(&cfg.driver.callback_base_url).map_err(|err| {
        anyhow!(
            "invalid callback base url `{}`: {err}",
            cfg.driver.callback_base_url
        )
    })?;
    if base.scheme() != "http" && base.scheme() != "https" {
        return Err(anyhow!("invalid callback base url: scheme must be http or https"));
    }
    if cfg.driver.max_per_run == 0 {
        return Err(anyhow!("invalid max per run: must be >= 1"));
    }
    if cfg.driver.tag_prefix.trim().is_empty() {
        return Err(anyhow!("invalid tag prefix: cannot be empty"));
    }
    if cfg.launcher.open_bin.trim().is_empty() {
        return Err(anyhow!("invalid launcher binary: cannot be empty"));
    }
    if cfg.launcher.timeout_secs == 0 {
        return Err(anyhow!("invalid launcher timeout: must be >= 1 second"));
    }
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("CHAT2BEAR_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".chat2bear").join("config.toml"))
}

fn merge_file_config(base: &mut BridgeConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)?;
    merge_toml(base, &raw)
        .map_err(|err| anyhow!("failed to parse config {}: {err}", path.display()))
}

fn merge_toml(base: &mut BridgeConfig, raw: &str) -> Result<()> {
    let parsed: PartialBridgeConfig = toml::from_str(raw)?;
    if let Some(receiver) = parsed.receiver {
        base.receiver = receiver;
    }
    if let Some(driver) = parsed.driver {
        base.driver = driver;
    }
    if let Some(launcher) = parsed.launcher {
        base.launcher = launcher;
    }
    Ok(())
}

pub fn load_config() -> Result<BridgeConfig> {
    let mut cfg = BridgeConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.receiver.bind_addr = env_or_string("CHAT2BEAR_BIND_ADDR", &cfg.receiver.bind_addr);
    cfg.driver.callback_base_url =
        env_or_string("CHAT2BEAR_CALLBACK_BASE_URL", &cfg.driver.callback_base_url);
    cfg.driver.max_per_run = env_or_u64("CHAT2BEAR_MAX_PER_RUN", cfg.driver.max_per_run);
    cfg.driver.launch_interval_ms =
        env_or_u64("CHAT2BEAR_LAUNCH_INTERVAL_MS", cfg.driver.launch_interval_ms);
    cfg.driver.check_interval_ms =
        env_or_u64("CHAT2BEAR_CHECK_INTERVAL_MS", cfg.driver.check_interval_ms);
    cfg.driver.require_receiver =
        env_or_bool("CHAT2BEAR_REQUIRE_RECEIVER", cfg.driver.require_receiver);
    cfg.driver.tag_prefix = env_or_string("CHAT2BEAR_TAG_PREFIX", &cfg.driver.tag_prefix);
    cfg.launcher.open_bin = env_or_string("CHAT2BEAR_OPEN_BIN", &cfg.launcher.open_bin);
    cfg.launcher.open_args = env_or_csv("CHAT2BEAR_OPEN_ARGS", &cfg.launcher.open_args);
    cfg.launcher.timeout_secs =
        env_or_u64("CHAT2BEAR_LAUNCH_TIMEOUT_SECS", cfg.launcher.timeout_secs);

    validate(&cfg)?;
    Ok(cfg)
}
