pub mod config;
pub mod identity;
pub mod ipc;
pub mod mcp;
pub mod research;
pub mod secrets;
pub mod storage;

// Re-export auth so main.rs can use researchd::auth directly.
pub use ipc::auth;

use std::sync::Arc;

use config::DaemonConfig;
use ipc::event::EventBroadcaster;
use research::{HttpResearchBackend, PollGovernor};
use secrets::Vault;
use storage::Storage;

/// Shared application state passed to every RPC handler and background task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub broadcaster: Arc<EventBroadcaster>,
    /// The rate-limited polling state machine over the research backend.
    pub governor: Arc<PollGovernor<HttpResearchBackend>>,
    /// Seals backend credentials before they are persisted.
    pub vault: Arc<Vault>,
    /// Stable random identifier for this daemon install, persisted in the
    /// settings table on first startup.
    pub daemon_id: String,
    pub started_at: std::time::Instant,
    /// Local WebSocket auth token. Every new connection must send a
    /// `daemon.auth` RPC with this token before any other method call.
    /// Empty string means auth is disabled (not recommended).
    pub auth_token: String,
}

impl AppContext {
    /// Wire up the full daemon state from a config. The storage schema is
    /// applied, the vault key loaded or created, and the governor bound to
    /// the HTTP backend the config names.
    pub async fn build(config: DaemonConfig, auth_token: String) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let storage = Arc::new(Storage::new(&config.data_dir).await?);
        let broadcaster = Arc::new(EventBroadcaster::new());
        let vault = Arc::new(Vault::open(&config.data_dir)?);

        let daemon_id = match storage.get_setting("daemon_id").await? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                storage.set_setting("daemon_id", &id).await?;
                id
            }
        };

        let backend = Arc::new(HttpResearchBackend::new(
            &config.api_base_url,
            &config.agent_model,
            config.request_timeout_secs,
        )?);
        let governor = Arc::new(PollGovernor::new(
            storage.clone(),
            backend,
            broadcaster.clone(),
            config.task_ttl_days,
        ));

        Ok(Self {
            config,
            storage,
            broadcaster,
            governor,
            vault,
            daemon_id,
            started_at: std::time::Instant::now(),
            auth_token,
        })
    }
}
