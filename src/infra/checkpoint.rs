// ============================================================
// Layer 6 — Checkpoints
// ============================================================
// A checkpoint is a snapshot of training state for one epoch.
// Plain values (epoch, swa_n, ...) are JSON; module weights and
// optimiser state are Burn records.
//
// File naming convention:
//   checkpoints/
//     checkpoint-25.json                 ← manifest: epoch, values,
//                                          list of record keys
//     checkpoint-25-state_dict.mpk.gz    ← model weights
//     checkpoint-25-optimizer.mpk.gz     ← momentum buffers
//     checkpoint-25-swa_state_dict.mpk.gz
//     ...
//     train_config.json                  ← run hyperparameters
//
// The manifest is written last, so a checkpoint whose manifest
// exists is complete. Record keys are joined with '-' because
// Burn's file recorders replace everything after the last '.'
// with their own extension.
//
// Records use NamedMpkGzFileRecorder at full precision:
// MessagePack + gzip, and type-safe on load (a mismatched
// architecture fails instead of loading garbage).
//
// Reference: Burn Book §5 (Records and Checkpointing)
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Record, Recorder},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::application::train_use_case::TrainConfig;

/// Recorder used for every record in a checkpoint
pub type CheckpointRecorder = NamedMpkGzFileRecorder<FullPrecisionSettings>;

const CONFIG_FILE: &str = "train_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    epoch:   usize,
    values:  Map<String, Value>,
    records: Vec<String>,
}

fn stem_for(epoch: usize) -> String {
    format!("checkpoint-{epoch}")
}

fn record_path(dir: &Path, stem: &str, key: &str) -> PathBuf {
    dir.join(format!("{stem}-{key}"))
}

// ─── Writer ───────────────────────────────────────────────────────────────────
/// Builds up one checkpoint entry by entry; nothing is visible
/// to readers until finish().
pub struct CheckpointWriter {
    dir:      PathBuf,
    manifest: Manifest,
}

impl CheckpointWriter {
    /// Creates `dir` if it is missing.
    pub fn new(dir: impl AsRef<Path>, epoch: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint dir '{}'", dir.display()))?;

        Ok(Self {
            dir,
            manifest: Manifest { epoch, values: Map::new(), records: Vec::new() },
        })
    }

    fn claim(&self, key: &str) -> Result<()> {
        anyhow::ensure!(key != "epoch", "'epoch' is reserved in a checkpoint");
        anyhow::ensure!(
            !key.is_empty() && !key.contains(['/', '\\', '.']),
            "invalid checkpoint key '{key}'"
        );
        anyhow::ensure!(
            !self.manifest.values.contains_key(key)
                && !self.manifest.records.iter().any(|k| k == key),
            "duplicate checkpoint key '{key}'"
        );
        Ok(())
    }

    /// Store a plain serialisable value in the manifest
    pub fn value<T: Serialize + ?Sized>(mut self, key: &str, value: &T) -> Result<Self> {
        self.claim(key)?;
        let json = serde_json::to_value(value)
            .with_context(|| format!("Cannot serialise checkpoint value '{key}'"))?;
        self.manifest.values.insert(key.to_string(), json);
        Ok(self)
    }

    /// Store any Burn record (e.g. optimiser state) in its own file
    pub fn record<B: Backend, R: Record<B>>(mut self, key: &str, record: R) -> Result<Self> {
        self.claim(key)?;
        let path = record_path(&self.dir, &stem_for(self.manifest.epoch), key);

        Recorder::<B>::record(&CheckpointRecorder::new(), record, path.clone())
            .with_context(|| format!("Failed to save record to '{}'", path.display()))?;

        self.manifest.records.push(key.to_string());
        Ok(self)
    }

    /// Store a module's parameters and buffers
    pub fn module<B: Backend, M: Module<B>>(self, key: &str, module: &M) -> Result<Self> {
        self.record::<B, M::Record>(key, module.clone().into_record())
    }

    /// Write the manifest and return the checkpoint path
    /// (`dir/checkpoint-<epoch>`, without extension).
    pub fn finish(self) -> Result<PathBuf> {
        let base = self.dir.join(stem_for(self.manifest.epoch));
        let path = base.with_extension("json");

        let json = serde_json::to_string_pretty(&self.manifest)?;
        fs::write(&path, json)
            .with_context(|| format!("Cannot write checkpoint manifest '{}'", path.display()))?;

        tracing::debug!(
            "Saved checkpoint epoch {} ({} values, {} records)",
            self.manifest.epoch,
            self.manifest.values.len(),
            self.manifest.records.len()
        );
        Ok(base)
    }
}

/// Write `dir/checkpoint-<epoch>` holding `epoch` plus whatever
/// `fill` adds.
///
/// ```ignore
/// save_checkpoint(dir, epoch, |w| {
///     w.module::<B, _>("state_dict", &model)?
///      .record::<B, _>("optimizer", optimizer.to_record::<B, M>())
/// })?;
/// ```
pub fn save_checkpoint<F>(dir: impl AsRef<Path>, epoch: usize, fill: F) -> Result<PathBuf>
where
    F: FnOnce(CheckpointWriter) -> Result<CheckpointWriter>,
{
    fill(CheckpointWriter::new(dir, epoch)?)?.finish()
}

// ─── Reader ───────────────────────────────────────────────────────────────────
/// A checkpoint opened for reading.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir:      PathBuf,
    stem:     String,
    manifest: Manifest,
}

impl Checkpoint {
    /// Accepts `dir/checkpoint-<epoch>` with or without `.json`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let manifest_path = path.as_ref().with_extension("json");
        let json = fs::read_to_string(&manifest_path).with_context(|| {
            format!("Cannot read checkpoint manifest '{}'", manifest_path.display())
        })?;
        let manifest: Manifest = serde_json::from_str(&json)
            .with_context(|| format!("Malformed checkpoint manifest '{}'", manifest_path.display()))?;

        let stem = manifest_path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("Bad checkpoint path '{}'", manifest_path.display()))?;
        let dir = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(Self { dir, stem, manifest })
    }

    pub fn epoch(&self) -> usize {
        self.manifest.epoch
    }

    pub fn has(&self, key: &str) -> bool {
        key == "epoch"
            || self.manifest.values.contains_key(key)
            || self.manifest.records.iter().any(|k| k == key)
    }

    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self
            .manifest
            .values
            .get(key)
            .with_context(|| format!("Checkpoint '{}' has no value '{key}'", self.stem))?;
        serde_json::from_value(raw.clone())
            .with_context(|| format!("Checkpoint value '{key}' has the wrong type"))
    }

    pub fn load_record<B: Backend, R: Record<B>>(&self, key: &str, device: &B::Device) -> Result<R> {
        anyhow::ensure!(
            self.manifest.records.iter().any(|k| k == key),
            "Checkpoint '{}' has no record '{key}'",
            self.stem
        );
        let path = record_path(&self.dir, &self.stem, key);
        Recorder::<B>::load(&CheckpointRecorder::new(), path.clone(), device)
            .with_context(|| format!("Cannot load record '{}'", path.display()))
    }

    /// Load `key` into `module`, which must have the saved architecture
    pub fn load_module<B: Backend, M: Module<B>>(
        &self,
        key:    &str,
        module: M,
        device: &B::Device,
    ) -> Result<M> {
        let record = self.load_record::<B, M::Record>(key, device)?;
        Ok(module.load_record(record))
    }
}

/// Open `dir/checkpoint-<epoch>` for reading.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    Checkpoint::open(path)
}

// ─── Directory manager ────────────────────────────────────────────────────────
/// Owns a checkpoint directory: epoch snapshots plus the
/// training config.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Create a new CheckpointManager.
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl Into<String>) -> Self {
        let dir = PathBuf::from(dir.into());
        fs::create_dir_all(&dir).ok();
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn writer(&self, epoch: usize) -> Result<CheckpointWriter> {
        CheckpointWriter::new(&self.dir, epoch)
    }

    pub fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(stem_for(epoch))
    }

    /// Highest-epoch complete checkpoint, if any
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Cannot list '{}'", self.dir.display()))?;

        let latest = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_prefix("checkpoint-")?
                    .strip_suffix(".json")?
                    .parse::<usize>()
                    .ok()
            })
            .max();

        Ok(latest.map(|epoch| self.checkpoint_path(epoch)))
    }

    /// Save the training configuration to JSON.
    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join(CONFIG_FILE);
        let json = serde_json::to_string_pretty(cfg)?;

        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;

        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    /// Load the configuration the checkpoints were trained with.
    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join(CONFIG_FILE);

        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. \
                 Make sure you have run 'train' before 'eval'.",
                path.display()
            )
        })?;

        Ok(serde_json::from_str(&json)?)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::{VggConfig, VggNet};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn weights(model: &VggNet<TestBackend>) -> Vec<f32> {
        model.classifier.weight.val().into_data().to_vec::<f32>().unwrap()
    }

    fn net() -> VggNet<TestBackend> {
        VggConfig::new(3, vec![4]).init(&Default::default())
    }

    #[test]
    fn test_save_and_open_checkpoint() {
        let tmp   = tempfile::tempdir().unwrap();
        let dir   = tmp.path().join("nested/ckpt");
        let model = net();

        let path = save_checkpoint(&dir, 12, |w| {
            w.value("swa_n", &3usize)?
                .value("note", "hello")?
                .module::<TestBackend, _>("state_dict", &model)
        })
        .unwrap();

        assert_eq!(path, dir.join("checkpoint-12"));
        assert!(dir.join("checkpoint-12.json").exists());
        assert!(dir.join("checkpoint-12-state_dict.mpk.gz").exists());

        let ckpt = Checkpoint::open(&path).unwrap();
        assert_eq!(ckpt.epoch(), 12);
        assert_eq!(ckpt.value::<usize>("swa_n").unwrap(), 3);
        assert_eq!(ckpt.value::<String>("note").unwrap(), "hello");
        assert!(ckpt.has("state_dict"));
        assert!(!ckpt.has("swa_state_dict"));

        let restored = ckpt
            .load_module::<TestBackend, _>("state_dict", net(), &Default::default())
            .unwrap();
        assert_eq!(weights(&restored), weights(&model));
    }

    #[test]
    fn test_open_accepts_manifest_path() {
        let tmp  = tempfile::tempdir().unwrap();
        save_checkpoint(tmp.path(), 4, Ok).unwrap();
        let ckpt = Checkpoint::open(tmp.path().join("checkpoint-4.json")).unwrap();
        assert_eq!(ckpt.epoch(), 4);
        assert!(ckpt.has("epoch"));
    }

    #[test]
    fn test_missing_entries_are_errors() {
        let tmp  = tempfile::tempdir().unwrap();
        let path = save_checkpoint(tmp.path(), 1, |w| w.value("swa_n", &1usize)).unwrap();
        let ckpt = Checkpoint::open(path).unwrap();

        assert!(ckpt.value::<usize>("nope").is_err());
        assert!(ckpt.value::<String>("swa_n").is_err());
        assert!(ckpt
            .load_module::<TestBackend, _>("state_dict", net(), &Default::default())
            .is_err());
        assert!(Checkpoint::open(tmp.path().join("checkpoint-99")).is_err());
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let w   = CheckpointWriter::new(tmp.path(), 0).unwrap();
        assert!(w.value("epoch", &5usize).is_err());

        let w = CheckpointWriter::new(tmp.path(), 0).unwrap();
        assert!(w.value("a", &1).unwrap().value("a", &2).is_err());

        let w = CheckpointWriter::new(tmp.path(), 0).unwrap();
        assert!(w.value("x.y", &1).is_err());
    }

    #[test]
    fn test_earlier_checkpoints_are_kept() {
        let tmp     = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path().to_string_lossy());
        assert_eq!(manager.latest_checkpoint().unwrap(), None);

        for epoch in [5, 20, 10] {
            manager.writer(epoch).unwrap().finish().unwrap();
        }
        // an unfinished record file must not count
        fs::write(tmp.path().join("checkpoint-30-state_dict.mpk.gz"), b"").unwrap();

        assert_eq!(manager.latest_checkpoint().unwrap(), Some(manager.checkpoint_path(20)));
        for epoch in [5, 10, 20] {
            assert_eq!(Checkpoint::open(manager.checkpoint_path(epoch)).unwrap().epoch(), epoch);
        }
    }

    #[test]
    fn test_config_roundtrip() {
        let tmp     = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(tmp.path().to_string_lossy());
        assert!(manager.load_config().is_err());

        let cfg = TrainConfig { epochs: 7, stages: vec![8, 16], ..TrainConfig::default() };
        manager.save_config(&cfg).unwrap();
        let loaded = manager.load_config().unwrap();
        assert_eq!(loaded.epochs, 7);
        assert_eq!(loaded.stages, vec![8, 16]);
    }
}
