//! Adapter checkpoints on disk.
//!
//! ```text
//! <output_dir>/
//!   adapters.safetensors      final adapter
//!   adapter_config.json
//!   ckpt_0050_20261016T093000_1f0c2a9e/
//!     adapters.safetensors
//!     adapter_config.json
//!   ckpt_0100_20261016T093000_1f0c2a9e/
//!     ...
//! ```
//!
//! Step directories carry the run's start time and the leading hex digits of
//! its id, so repeated runs into one output directory add checkpoints next to
//! the earlier ones.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::tokenizer::VOCAB_SIZE;
use crate::model::LoraPolicy;

pub const ADAPTER_FILE: &str = "adapters.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Metadata written next to every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub rank: usize,
    pub alpha: f64,
    pub vocab_size: usize,
    /// Training steps completed when the adapter was written.
    pub step: usize,
    pub saved_at: DateTime<Utc>,
    /// Identifies the run that produced the adapter.
    pub run_id: Uuid,
}

/// Writes the checkpoints of one run.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Directory of the checkpoint for `step` in this run.
    pub fn step_dir(&self, step: usize) -> PathBuf {
        let run = self.run_id.simple().to_string();
        self.root.join(format!(
            "ckpt_{step:04}_{}_{}",
            self.started_at.format("%Y%m%dT%H%M%S"),
            &run[..8]
        ))
    }

    /// Write a step checkpoint. Fails if the directory already exists.
    pub fn save_step(&self, policy: &LoraPolicy, step: usize) -> Result<PathBuf> {
        let dir = self.step_dir(step);
        if dir.exists() {
            bail!("checkpoint {} already exists", dir.display());
        }
        self.write(&dir, policy, step)?;
        Ok(dir)
    }

    /// Write the final adapter into the output directory root, replacing any
    /// previous final adapter.
    pub fn save_final(&self, policy: &LoraPolicy, step: usize) -> Result<PathBuf> {
        let dir = self.root.clone();
        if dir.join(ADAPTER_CONFIG_FILE).exists() {
            match load_adapter_config(&dir) {
                Ok(previous) => info!(
                    previous_run = %previous.run_id,
                    previous_step = previous.step,
                    "replacing final adapter of an earlier run"
                ),
                Err(e) => debug!(error = %e, "unreadable metadata for the existing final adapter"),
            }
        }
        self.write(&dir, policy, step)?;
        Ok(dir)
    }

    fn write(&self, dir: &Path, policy: &LoraPolicy, step: usize) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        policy.save_adapter(dir.join(ADAPTER_FILE))?;

        let config = AdapterConfig {
            rank: policy.rank(),
            alpha: policy.alpha(),
            vocab_size: VOCAB_SIZE,
            step,
            saved_at: Utc::now(),
            run_id: self.run_id,
        };
        let json = serde_json::to_string_pretty(&config)?;
        let config_path = dir.join(ADAPTER_CONFIG_FILE);
        fs::write(&config_path, json)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        info!(path = %dir.display(), step, "saved adapter checkpoint");
        Ok(())
    }

    /// Step checkpoint directories under the root, in step order.
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?
        {
            let path = entry?.path();
            let is_ckpt = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("ckpt_"));
            if is_ckpt && path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

/// Read the metadata of an adapter directory.
pub fn load_adapter_config(dir: impl AsRef<Path>) -> Result<AdapterConfig> {
    let path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Resolve an adapter argument: a directory means its `adapters.safetensors`.
pub fn resolve_adapter_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_dir() {
        path.join(ADAPTER_FILE)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::model::BigramBase;

    fn policy() -> LoraPolicy {
        LoraPolicy::new(BigramBase::seeded(&Device::Cpu).unwrap(), 2, 4.0, 0).unwrap()
    }

    fn dir_name(path: &Path) -> String {
        path.file_name().unwrap().to_str().unwrap().to_string()
    }

    #[test]
    fn test_step_dir_naming() {
        let store = CheckpointStore::new("/tmp/out");
        let dir = store.step_dir(50);
        assert_eq!(dir.parent(), Some(Path::new("/tmp/out")));

        let name = dir_name(&dir);
        let parts: Vec<&str> = name.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "ckpt");
        assert_eq!(parts[1], "0050");
        assert_eq!(parts[2].len(), "20261016T093000".len());
        assert!(parts[2].contains('T'));
        assert!(store.run_id().simple().to_string().starts_with(parts[3]));

        assert!(dir_name(&store.step_dir(12345)).starts_with("ckpt_12345_"));
    }

    #[test]
    fn test_runs_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let p = policy();
        let first = CheckpointStore::new(tmp.path());
        let second = CheckpointStore::new(tmp.path());
        assert_ne!(first.step_dir(10), second.step_dir(10));

        first.save_step(&p, 10).unwrap();
        second.save_step(&p, 10).unwrap();
        assert_eq!(second.list_checkpoints().unwrap().len(), 2);
    }

    #[test]
    fn test_save_step_writes_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let dir = store.save_step(&policy(), 5).unwrap();

        assert!(dir.join(ADAPTER_FILE).exists());
        let config = load_adapter_config(&dir).unwrap();
        assert_eq!(config.step, 5);
        assert_eq!(config.rank, 2);
        assert_eq!(config.vocab_size, VOCAB_SIZE);
        assert_eq!(config.run_id, store.run_id());
    }

    #[test]
    fn test_save_step_refuses_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store.save_step(&policy(), 10).unwrap();
        assert!(store.save_step(&policy(), 10).is_err());
    }

    #[test]
    fn test_save_final_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let p = policy();
        store.save_step(&p, 2).unwrap();
        store.save_step(&p, 1).unwrap();
        store.save_final(&p, 2).unwrap();
        store.save_final(&p, 2).unwrap();

        assert!(tmp.path().join(ADAPTER_FILE).exists());
        assert_eq!(load_adapter_config(tmp.path()).unwrap().run_id, store.run_id());
        let listed = store.list_checkpoints().unwrap();
        assert_eq!(listed, vec![store.step_dir(1), store.step_dir(2)]);
        assert_eq!(resolve_adapter_path(tmp.path()), tmp.path().join(ADAPTER_FILE));
    }

    #[test]
    fn test_list_missing_root() {
        let store = CheckpointStore::new("/nonexistent/qmd-grpo-test");
        assert!(store.list_checkpoints().unwrap().is_empty());
    }
}
