// ============================================================
// Layer 2 — EvalUseCase
// ============================================================
// Scores a saved checkpoint on the evaluation split:
//
//   Step 1: Load train_config.json      (Layer 6 - infra)
//   Step 2: Pick the checkpoint         (Layer 6 - infra)
//   Step 3: Rebuild the datasets        (Layer 4 - data)
//   Step 4: Load weights and evaluate   (Layer 5 - ml)

use anyhow::{Context, Result};

use crate::application::train_use_case::BackendKind;
use crate::infra::checkpoint::{Checkpoint, CheckpointManager};
use crate::ml::trainer::{run_evaluation, EpochStats};

/// What to evaluate
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub checkpoint_dir: String,
    /// Explicit checkpoint; the latest one in checkpoint_dir otherwise
    pub checkpoint:     Option<String>,
    /// Evaluate swa_state_dict instead of state_dict
    pub swa:            bool,
    /// Recompute BN statistics before evaluating
    pub bn_update:      bool,
    /// Overrides the backend stored in the config
    pub backend:        Option<BackendKind>,
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub epoch: usize,
    pub key:   &'static str,
    pub stats: EpochStats,
}

pub struct EvalUseCase {
    request: EvalRequest,
}

impl EvalUseCase {
    pub fn new(request: EvalRequest) -> Self {
        Self { request }
    }

    pub fn execute(&self) -> Result<EvalReport> {
        let req = &self.request;

        // ── Step 1: Rebuild the run configuration ─────────────────────────────
        let manager = CheckpointManager::new(&req.checkpoint_dir);
        let mut cfg = manager.load_config()?;
        if let Some(backend) = req.backend {
            cfg.backend = backend;
        }

        // ── Step 2: Explicit checkpoint or the latest one ─────────────────────
        let path = match &req.checkpoint {
            Some(path) => path.into(),
            None => manager.latest_checkpoint()?.with_context(|| {
                format!("No checkpoints in '{}'. Have you run 'train' first?", req.checkpoint_dir)
            })?,
        };
        let checkpoint = Checkpoint::open(&path)?;

        let key = if req.swa { "swa_state_dict" } else { "state_dict" };
        anyhow::ensure!(
            checkpoint.has(key),
            "Checkpoint '{}' has no '{}' (was it trained with --swa?)",
            path.display(),
            key
        );

        // ── Step 3: Same split and preprocessing as training ──────────────────
        let (train_dataset, test_dataset, num_classes) = cfg.load_datasets()?;

        // ── Step 4: Evaluate (Layer 5) ────────────────────────────────────────
        let stats = run_evaluation(
            &cfg,
            &checkpoint,
            key,
            req.bn_update,
            train_dataset,
            test_dataset,
            num_classes,
        )?;

        Ok(EvalReport { epoch: checkpoint.epoch(), key, stats })
    }
}
