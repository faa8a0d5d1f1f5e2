//! Storage Manager for persisting agent snapshots to disk
//!
//! ## Storage Structure
//!
//! ```text
//! ~/.wide-deep-bandit/
//! ├── config.toml
//! └── agents/
//!     └── <name>.json    # Full agent snapshot
//! ```

use crate::agent::WideDeepBandit;
use crate::network::Approximator;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

/// Summary of a stored snapshot, read without rebuilding the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub saved_at: DateTime<Utc>,
    pub t: u64,
}

#[derive(Deserialize)]
struct SnapshotHeader {
    saved_at: DateTime<Utc>,
    t: u64,
}

#[derive(Clone)]
pub struct StorageManager {
    base_dir: PathBuf,
}

impl StorageManager {
    pub fn new() -> Result<Self> {
        let base_dir = dirs::home_dir()
            .context("Could not find home directory")?
            .join(".wide-deep-bandit");
        Self::with_base_dir(base_dir)
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join("agents"))
            .context("Failed to create storage directory")?;
        info!("Storage initialized at: {:?}", base_dir);
        Ok(Self { base_dir })
    }

    fn agents_dir(&self) -> PathBuf {
        self.base_dir.join("agents")
    }

    fn agent_path(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !name.starts_with('.');
        if !valid {
            bail!("Invalid agent name: {:?}", name);
        }
        Ok(self.agents_dir().join(format!("{}.json", name)))
    }

    pub fn save_agent<N>(&self, name: &str, agent: &WideDeepBandit<N>) -> Result<PathBuf>
    where
        N: Approximator + Clone + Serialize,
    {
        let path = self.agent_path(name)?;
        let bytes = agent
            .to_bytes()
            .with_context(|| format!("Failed to serialize agent {}", name))?;

        // Write next to the target, then rename, so a crash never leaves a torn snapshot
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes)
            .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move snapshot into place: {}", path.display()))?;

        info!("Saved agent {} (t={}, {} KB)", name, agent.t(), bytes.len() / 1024);
        Ok(path)
    }

    /// `Ok(None)` if no snapshot exists under `name`.
    pub fn load_agent<N>(&self, name: &str, seed: u64) -> Result<Option<WideDeepBandit<N>>>
    where
        N: Approximator + Clone + DeserializeOwned,
    {
        let path = self.agent_path(name)?;
        if !path.exists() {
            debug!("No snapshot for agent {}", name);
            return Ok(None);
        }

        let bytes = fs::read(&path)
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let agent = WideDeepBandit::from_bytes(&bytes, seed)
            .with_context(|| format!("Failed to restore agent from {}", path.display()))?;

        info!("Loaded agent {} (t={})", name, agent.t());
        Ok(Some(agent))
    }

    pub fn list_agents(&self) -> Result<Vec<AgentInfo>> {
        let mut agents = Vec::new();
        for entry in fs::read_dir(self.agents_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match fs::read(&path).map(|b| serde_json::from_slice::<SnapshotHeader>(&b)) {
                Ok(Ok(header)) => agents.push(AgentInfo {
                    name: name.to_string(),
                    saved_at: header.saved_at,
                    t: header.t,
                }),
                Ok(Err(e)) => debug!("Skipping unreadable snapshot {:?}: {}", path, e),
                Err(e) => debug!("Skipping {:?}: {}", path, e),
            }
        }

        agents.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, Strategy};
    use crate::network::WideDeepNetwork;
    use crate::users::UserId;
    use ndarray::array;
    use tempfile::tempdir;

    fn tiny_agent() -> WideDeepBandit {
        let config = AgentConfig {
            num_actions: 2,
            num_features: 2,
            wide_embed_size: 8,
            wide_embed_dim: 2,
            deep_layer_sizes: vec![4],
            initial_pulls: 1,
            batch_size: 8,
            ..AgentConfig::default()
        };
        let mut agent = WideDeepBandit::new(config).unwrap();
        for i in 0..5u64 {
            agent
                .record(&UserId::from(i), array![i as f64, 1.0].view(), (i % 2) as usize, 1.0)
                .unwrap();
        }
        agent
    }

    #[test]
    fn test_save_and_load_agent() {
        let temp_dir = tempdir().unwrap();
        let storage = StorageManager::with_base_dir(temp_dir.path().to_path_buf()).unwrap();

        let agent = tiny_agent();
        let path = storage.save_agent("ads", &agent).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let mut loaded: WideDeepBandit<WideDeepNetwork> =
            storage.load_agent("ads", 1).unwrap().unwrap();
        assert_eq!(loaded.t(), 5);
        assert_eq!(loaded.raw_buffer().len(), 5);
        assert_eq!(loaded.users().len(), 6);
        assert!(loaded
            .decide(&"3".into(), array![0.5, 1.0].view(), Strategy::ExpectedValue)
            .is_ok());
    }

    #[test]
    fn test_load_missing_agent() {
        let temp_dir = tempdir().unwrap();
        let storage = StorageManager::with_base_dir(temp_dir.path().to_path_buf()).unwrap();
        let loaded: Option<WideDeepBandit> = storage.load_agent("nope", 0).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let temp_dir = tempdir().unwrap();
        let storage = StorageManager::with_base_dir(temp_dir.path().to_path_buf()).unwrap();
        let agent = tiny_agent();
        assert!(storage.save_agent("../escape", &agent).is_err());
        assert!(storage.save_agent("", &agent).is_err());
    }

    #[test]
    fn test_list_agents() {
        let temp_dir = tempdir().unwrap();
        let storage = StorageManager::with_base_dir(temp_dir.path().to_path_buf()).unwrap();
        let agent = tiny_agent();
        storage.save_agent("first", &agent).unwrap();
        storage.save_agent("second", &agent).unwrap();
        fs::write(temp_dir.path().join("agents").join("notes.txt"), "ignored").unwrap();
        fs::write(temp_dir.path().join("agents").join("broken.json"), "{").unwrap();

        let mut names: Vec<String> =
            storage.list_agents().unwrap().into_iter().map(|a| a.name).collect();
        names.sort();
        assert_eq!(names, vec!["first", "second"]);
        assert!(storage.list_agents().unwrap().iter().all(|a| a.t == 5));
    }
}
