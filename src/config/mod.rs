use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4310;
const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_AGENT_MODEL: &str = "deep-research-pro-preview-12-2025";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TASK_TTL_DAYS: u32 = 7;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 3600;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4310).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,researchd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default, human-readable) | "json" (structured).
    log_format: Option<String>,
    /// Override the research backend base URL.
    api_base_url: Option<String>,
    /// Agent model id passed when starting an interaction.
    agent_model: Option<String>,
    /// Per-request HTTP timeout against the backend, in seconds (default: 60).
    request_timeout_secs: Option<u64>,
    /// Days a task record is retained before expiry (default: 7).
    task_ttl_days: Option<u32>,
    /// Seconds between expired-task purge sweeps (default: 3600; 0 = never).
    purge_interval_secs: Option<u64>,
    /// Bind address for the WebSocket server (default: "127.0.0.1").
    bind_address: Option<String>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" | "json".
    pub log_format: String,
    /// Research backend base URL (RESEARCHD_API_URL env var).
    pub api_base_url: String,
    /// Agent model id for new interactions (RESEARCHD_AGENT_MODEL env var).
    pub agent_model: String,
    /// Per-request HTTP timeout against the backend, in seconds.
    pub request_timeout_secs: u64,
    /// Task record time-to-live in days. Retention is a store concern —
    /// the governor never deletes records itself.
    pub task_ttl_days: u32,
    /// Interval between purge sweeps of expired tasks (0 = disabled).
    pub purge_interval_secs: u64,
    /// Bind address for the WebSocket server (default: "127.0.0.1").
    pub bind_address: String,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // TOML is the lowest-priority override layer.
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let log_format = std::env::var("RESEARCHD_LOG_FORMAT")
            .ok()
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let api_base_url = std::env::var("RESEARCHD_API_URL")
            .ok()
            .or(toml.api_base_url)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let agent_model = std::env::var("RESEARCHD_AGENT_MODEL")
            .ok()
            .or(toml.agent_model)
            .unwrap_or_else(|| DEFAULT_AGENT_MODEL.to_string());

        let bind_address = bind_address
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        Self {
            port,
            data_dir,
            log,
            log_format,
            api_base_url,
            agent_model,
            request_timeout_secs: toml
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            task_ttl_days: toml.task_ttl_days.unwrap_or(DEFAULT_TASK_TTL_DAYS),
            purge_interval_secs: toml
                .purge_interval_secs
                .unwrap_or(DEFAULT_PURGE_INTERVAL_SECS),
            bind_address,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        // ~/Library/Application Support/researchd
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("researchd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/researchd or ~/.local/share/researchd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("researchd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("researchd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        // %APPDATA%\researchd
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("researchd");
        }
    }
    PathBuf::from(".researchd")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_apply_without_config_file() {
        let dir = TempDir::new().unwrap();
        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.task_ttl_days, 7);
        assert_eq!(cfg.bind_address, "127.0.0.1");
        assert_eq!(cfg.agent_model, DEFAULT_AGENT_MODEL);
    }

    #[test]
    fn toml_overrides_defaults_but_not_cli() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 9999\ntask_ttl_days = 3\n",
        )
        .unwrap();

        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.task_ttl_days, 3);

        let cfg = DaemonConfig::new(Some(4444), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, 4444, "CLI beats TOML");
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = \"not a number").unwrap();
        let cfg = DaemonConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }
}
