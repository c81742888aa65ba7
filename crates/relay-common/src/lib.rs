//! Centralized data directory layout for the chat relay
//!
//! Directory layout:
//! ```text
//! relay_data/
//! ├── local/           # relay.sqlite (users, sessions, messages)
//! └── files/           # Uploaded attachments
//!     ├── blobs/       # Attachment bytes, one file per fileId
//!     └── meta.sqlite  # Attachment metadata
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable that overrides the data root.
pub const ROOT_ENV: &str = "RELAY_ROOT";

/// Fallback data root when neither the env var nor a persisted root is set.
pub const DEFAULT_ROOT: &str = "relay_data";

#[derive(Serialize, Deserialize, Debug, Default)]
struct RelayPaths {
    data_root: Option<PathBuf>,
}

/// Location of the persisted-root config file
fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("chat-relay").join("config.json"))
}

/// Load the persisted data root, if one was saved
fn load_persistent_root() -> Option<PathBuf> {
    let path = config_path()?;
    if !path.exists() {
        return None;
    }
    read_root_file(&path)
}

fn read_root_file(path: &Path) -> Option<PathBuf> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<RelayPaths>(&content) {
            Ok(config) => config.data_root,
            Err(e) => {
                warn!("Failed to parse config file at {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            warn!("Failed to read config file at {:?}: {}", path, e);
            None
        }
    }
}

/// Resolve the data root: `RELAY_ROOT`, then the persisted root, then `relay_data`
pub fn data_root() -> PathBuf {
    if let Ok(val) = std::env::var(ROOT_ENV) {
        return PathBuf::from(val);
    }

    if let Some(root) = load_persistent_root() {
        return root;
    }

    PathBuf::from(DEFAULT_ROOT)
}

/// Local state directory under `root`
pub fn local_dir(root: &Path) -> PathBuf {
    root.join("local")
}

/// Relay database file (users, sessions, messages)
pub fn db_path(root: &Path) -> PathBuf {
    local_dir(root).join("relay.sqlite")
}

/// Attachment storage directory
pub fn files_dir(root: &Path) -> PathBuf {
    root.join("files")
}

/// Directory holding attachment bytes
pub fn blobs_dir(root: &Path) -> PathBuf {
    files_dir(root).join("blobs")
}

/// Attachment metadata database
pub fn blob_meta_path(root: &Path) -> PathBuf {
    files_dir(root).join("meta.sqlite")
}

/// Ensure a single directory exists
pub fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Create the full directory structure under `root` and return its canonical form.
pub fn init_structure(root: &Path) -> anyhow::Result<PathBuf> {
    ensure_dir(root)?;
    ensure_dir(&local_dir(root))?;
    ensure_dir(&files_dir(root))?;
    ensure_dir(&blobs_dir(root))?;

    let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    info!("Relay directory structure initialized at: {:?}", canonical);

    Ok(canonical)
}
