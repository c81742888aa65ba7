//! Relay server configuration and shared application state

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use relay_blob::BlobStore;
use tracing::{info, warn};

use crate::auth::AuthManager;
use crate::broadcast::BroadcastBus;
use crate::clock::MonotonicClock;
use crate::presence::PresenceRegistry;
use crate::protocol::{Dispatcher, PresenceProtocol};
use crate::sessions::SessionManager;
use crate::store::{ChatStore, SqliteChatStore};

/// Configuration for the relay server
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Listen port
    pub port: u16,
    /// Root of all persisted data
    pub data_root: PathBuf,
    /// Frames buffered per connection before new ones are dropped
    pub send_queue: usize,
    /// Upload limit in MB
    pub max_file_mb: usize,
    /// Require a login token on `/ws`
    pub require_auth: bool,
    /// Default look-back for the history endpoint
    pub history_days: i64,
    /// Accounts created at start-up if absent
    pub seed_users: Vec<(String, String)>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            data_root: relay_common::data_root(),
            send_queue: 256,
            max_file_mb: 10,
            require_auth: true,
            history_days: 7,
            seed_users: ["Saurabh", "Neha", "Rajiv", "Pralhad"]
                .iter()
                .map(|name| (name.to_string(), name.to_lowercase()))
                .collect(),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `RELAY_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.port = env_or("RELAY_PORT", config.port);
        config.send_queue = env_or("RELAY_SEND_QUEUE", config.send_queue);
        config.max_file_mb = env_or("RELAY_MAX_FILE_MB", config.max_file_mb);
        config.require_auth = env_or("RELAY_REQUIRE_AUTH", config.require_auth);
        config.history_days = env_or("RELAY_HISTORY_DAYS", config.history_days);
        if let Ok(raw) = std::env::var("RELAY_SEED_USERS") {
            config.seed_users = parse_seed_users(&raw);
        }
        config
    }

    /// Create config with all data under `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_root: base_dir.into(),
            ..Self::default()
        }
    }

    pub fn max_file_bytes(&self) -> usize {
        self.max_file_mb * 1024 * 1024
    }

    pub fn db_path(&self) -> PathBuf {
        relay_common::db_path(&self.data_root)
    }

    /// Ensure all directories exist
    pub fn ensure_dirs(&self) -> anyhow::Result<PathBuf> {
        relay_common::init_structure(&self.data_root)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse `name:pass,name:pass`. Malformed entries are skipped.
fn parse_seed_users(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, pass) = entry.trim().split_once(':')?;
            let name = name.trim();
            if name.is_empty() || pass.is_empty() {
                warn!("Skipping malformed seed user entry {:?}", entry);
                return None;
            }
            Some((name.to_string(), pass.to_string()))
        })
        .collect()
}

/// App state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub store: Arc<dyn ChatStore>,
    pub auth: Arc<AuthManager>,
    pub files: Arc<BlobStore>,
    pub registry: Arc<PresenceRegistry>,
    pub sessions: Arc<SessionManager>,
    pub bus: Arc<BroadcastBus>,
    pub protocol: Arc<PresenceProtocol>,
    pub dispatcher: Arc<Dispatcher>,
}

impl AppState {
    /// Open the stores under `config.data_root` and wire every component.
    pub async fn build(config: RelayConfig) -> anyhow::Result<Self> {
        config.ensure_dirs()?;
        let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::open(&config.db_path()).await?);
        let auth = Arc::new(AuthManager::new(Arc::clone(&store)));
        Self::assemble(config, store, auth).await
    }

    /// Wire components around an already opened store and auth manager.
    pub async fn assemble(
        config: RelayConfig,
        store: Arc<dyn ChatStore>,
        auth: Arc<AuthManager>,
    ) -> anyhow::Result<Self> {
        let root: &Path = &config.data_root;
        let files = Arc::new(
            BlobStore::new(
                relay_common::blobs_dir(root),
                relay_common::blob_meta_path(root),
            )
            .await?,
        );

        auth.seed(&config.seed_users).await?;

        let clock = Arc::new(MonotonicClock::new());
        let registry = Arc::new(PresenceRegistry::new());
        let sessions = Arc::new(SessionManager::new(Arc::clone(&store), Arc::clone(&clock)));
        let bus = Arc::new(BroadcastBus::new(config.send_queue));
        let protocol = Arc::new(PresenceProtocol::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&bus),
            Arc::clone(&store),
            clock,
        ));
        let dispatcher = Arc::new(Dispatcher::for_protocol(Arc::clone(&protocol)));

        info!("Relay state ready under {:?}", config.data_root);

        Ok(Self {
            config: Arc::new(config),
            store,
            auth,
            files,
            registry,
            sessions,
            bus,
            protocol,
            dispatcher,
        })
    }
}
