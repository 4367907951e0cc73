use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use collaboration::transport::lan::DEFAULT_BEACON_PORT;
use collaboration::{ResolutionPolicy, SyncConfig};
use reasoning::BackendConfig;
use replica::{ActorId, ProjectId};

/// Per-user application data directory
pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("collab-peer")
}

pub fn default_config_path() -> PathBuf {
    app_data_dir().join("peer.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub project_id: ProjectId,
    pub actor_id: ActorId,
    pub display_name: String,

    /// Directory the project's paths are relative to
    pub project_root: PathBuf,

    /// Operation log, snapshots and the outbound queue live here
    pub data_dir: PathBuf,

    /// Address the WebSocket listener binds to
    pub listen: SocketAddr,

    /// `ws://host:port` endpoints dialed directly
    pub peers: Vec<String>,

    pub relay_url: Option<String>,

    pub lan_discovery: bool,
    pub lan_port: u16,

    pub checkpoint_interval_secs: u64,

    pub sync: SyncConfig,
    pub policy: ResolutionPolicy,
    pub backend: BackendConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            project_id: ProjectId::new(),
            actor_id: ActorId::new(),
            display_name: std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string()),
            project_root: PathBuf::from("."),
            data_dir: app_data_dir(),
            listen: SocketAddr::from(([0, 0, 0, 0], 7420)),
            peers: Vec::new(),
            relay_url: None,
            lan_discovery: true,
            lan_port: DEFAULT_BEACON_PORT,
            checkpoint_interval_secs: 300,
            sync: SyncConfig::default(),
            policy: ResolutionPolicy::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl PeerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("peer.json");
        let config = PeerConfig {
            peers: vec!["ws://10.0.0.2:7420".into()],
            ..PeerConfig::default()
        };

        config.save(&path).unwrap();
        let loaded = PeerConfig::load(&path).unwrap();
        assert_eq!(loaded.project_id, config.project_id);
        assert_eq!(loaded.peers, config.peers);
        assert_eq!(loaded.sync, SyncConfig::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.json");
        std::fs::write(&path, r#"{"display_name": "ada", "lan_discovery": false}"#).unwrap();

        let config = PeerConfig::load(&path).unwrap();
        assert_eq!(config.display_name, "ada");
        assert!(!config.lan_discovery);
        assert_eq!(config.lan_port, DEFAULT_BEACON_PORT);
        assert_eq!(config.policy.auto_apply_threshold, 0.85);
    }
}
