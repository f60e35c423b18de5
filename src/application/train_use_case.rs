// ============================================================
// Layer 2 — TrainUseCase
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Validate the config
//   Step 2: Load CIFAR images          (Layer 4 - data)
//   Step 3: Train / test split         (Layer 4 - data)
//   Step 4: Build datasets             (Layer 4 - data)
//   Step 5: Save config                (Layer 6 - infra)
//   Step 6: Run training loop          (Layer 5 - ml)
//
// Reference: Rust Book §13 (Iterators and Closures)
//            Burn Book §5 (Training)

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::data::{
    dataset::ImageDataset,
    loader::{CifarLoader, CifarVariant},
    preprocessor::{Normalization, Preprocessor},
    splitter::split_train_val,
};
use crate::domain::traits::ImageSource;
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::model::VggConfig;
use crate::ml::optim::LrSchedule;
use crate::ml::quantizer::{QuantType, Rounding};
use crate::ml::trainer::run_training;

/// Compute backend for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum BackendKind {
    /// GPU through WGPU
    Wgpu,
    /// Pure-Rust CPU backend
    Ndarray,
}

// ─── Training Configuration ──────────────────────────────────────────────────
// All hyperparameters for a training run.
// Saved next to the checkpoints so `eval` and `--resume` can
// rebuild exactly the same model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub data_dir:        String,
    pub dataset:         CifarVariant,
    pub checkpoint_dir:  String,
    pub backend:         BackendKind,

    /// Evaluate on the official test split instead of a held-out
    /// part of the training set
    pub use_test:        bool,
    pub train_fraction:  f64,
    pub seed:            u64,
    pub augment:         bool,

    pub batch_size:      usize,
    pub num_workers:     usize,
    pub epochs:          usize,
    pub lr_init:         f64,
    pub momentum:        f64,
    pub wd:              f64,

    pub swa:             bool,
    pub swa_start:       usize,
    pub swa_lr:          f64,
    pub swa_c_epochs:    usize,
    pub eval_freq:       usize,
    pub save_freq:       usize,

    pub stages:          Vec<usize>,
    pub convs_per_stage: usize,

    pub quant_type:      QuantType,
    pub rounding:        Rounding,
    /// -1 disables weight quantisation
    pub wl_weight:       i32,
    pub fl_weight:       i32,
    /// -1 disables gradient quantisation
    pub wl_grad:         i32,
    pub fl_grad:         i32,
    pub quant_bias:      bool,
    pub quant_bn:        bool,
    pub log_error:       bool,

    /// Checkpoint to resume from
    pub resume:          Option<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_dir:        "data".to_string(),
            dataset:         CifarVariant::Cifar10,
            checkpoint_dir:  "checkpoints".to_string(),
            backend:         BackendKind::Wgpu,
            use_test:        false,
            train_fraction:  0.9,
            seed:            1,
            augment:         true,
            batch_size:      128,
            num_workers:     4,
            epochs:          200,
            lr_init:         0.05,
            momentum:        0.9,
            wd:              5e-4,
            swa:             true,
            swa_start:       161,
            swa_lr:          0.01,
            swa_c_epochs:    1,
            eval_freq:       5,
            save_freq:       25,
            stages:          vec![64, 128, 256, 512],
            convs_per_stage: 2,
            quant_type:      QuantType::Block,
            rounding:        Rounding::Stochastic,
            wl_weight:       8,
            fl_weight:       8,
            wl_grad:         8,
            fl_grad:         8,
            quant_bias:      true,
            quant_bn:        true,
            log_error:       false,
            resume:          None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.epochs > 0, "epochs must be at least 1");
        anyhow::ensure!(self.batch_size > 0, "batch_size must be at least 1");
        anyhow::ensure!(self.eval_freq > 0, "eval_freq must be at least 1");
        anyhow::ensure!(self.save_freq > 0, "save_freq must be at least 1");
        anyhow::ensure!(self.swa_c_epochs > 0, "swa_c_epochs must be at least 1");
        anyhow::ensure!(!self.stages.is_empty(), "the model needs at least one stage");
        anyhow::ensure!(self.lr_init > 0.0, "lr_init must be positive");
        anyhow::ensure!(
            self.use_test || (0.0..1.0).contains(&self.train_fraction),
            "train_fraction must be in [0, 1) when holding out validation data"
        );
        if self.swa {
            anyhow::ensure!(self.swa_start > 0, "swa_start must be at least 1");
        }
        Ok(())
    }

    pub fn model_config(&self, num_classes: usize) -> VggConfig {
        VggConfig::new(num_classes, self.stages.clone())
            .with_convs_per_stage(self.convs_per_stage)
    }

    pub fn lr_schedule(&self) -> LrSchedule {
        LrSchedule {
            lr_init: self.lr_init,
            epochs:  self.epochs,
            swa:     self.swa.then_some((self.swa_start, self.swa_lr)),
        }
    }

    /// (train, test, num_classes) with the configured split and
    /// augmentation. Training images are augmented; test images
    /// are only normalised.
    pub fn load_datasets(&self) -> Result<(ImageDataset, ImageDataset, usize)> {
        tracing::info!("Loading {:?} from '{}'", self.dataset, self.data_dir);
        let loader = CifarLoader::new(&self.data_dir, self.dataset);

        let train_images = loader.load_train()?;
        let (train_images, test_images) = if self.use_test {
            tracing::info!("Using the official test split for evaluation");
            (train_images, loader.load_test()?)
        } else {
            tracing::warn!("Holding out part of the training set; pass --use-test for final numbers");
            split_train_val(train_images, self.train_fraction, Some(self.seed))
        };
        anyhow::ensure!(!train_images.is_empty(), "no training images found");
        anyhow::ensure!(!test_images.is_empty(), "no evaluation images found");
        tracing::info!("Split: {} train, {} test", train_images.len(), test_images.len());

        let norm = Normalization::for_variant(self.dataset);
        let train_pre = if self.augment {
            Preprocessor::with_augmentation(norm.clone(), 4)
        } else {
            Preprocessor::new(norm.clone())
        };

        Ok((
            ImageDataset::new(train_images, train_pre),
            ImageDataset::new(test_images, Preprocessor::new(norm)),
            loader.num_classes(),
        ))
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
// Owns the config and runs the full training pipeline.
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Execute the full training pipeline end to end
    pub fn execute(&self) -> Result<()> {
        let cfg = &self.config;

        // ── Step 1: Fail fast on impossible settings ──────────────────────────
        cfg.validate()?;

        // ── Steps 2-4: Images → split → Burn datasets ─────────────────────────
        let (train_dataset, test_dataset, num_classes) = cfg.load_datasets()?;

        // ── Step 5: Save config for eval / resume ─────────────────────────────
        let ckpt_manager = CheckpointManager::new(&cfg.checkpoint_dir);
        ckpt_manager.save_config(cfg)?;

        // ── Step 6: Run training loop (Layer 5) ───────────────────────────────
        run_training(cfg, train_dataset, test_dataset, num_classes, ckpt_manager)?;

        Ok(())
    }
}
