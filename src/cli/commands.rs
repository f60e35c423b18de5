// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the two subcommands, `train` and `eval`, and all of
// their flags.
//
// Reference: Rust Book §12 (Building a CLI Program)

use clap::{Args, Subcommand};

use crate::application::eval_use_case::EvalRequest;
use crate::application::train_use_case::{BackendKind, TrainConfig};
use crate::data::loader::CifarVariant;
use crate::ml::quantizer::{QuantType, Rounding};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a VGG-style network with low-precision SWA
    Train(TrainArgs),

    /// Evaluate a saved checkpoint
    Eval(EvalArgs),
}

/// All arguments for the `train` command.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Directory holding the extracted CIFAR binary archive
    #[arg(long, default_value = "data")]
    pub data_dir: String,

    #[arg(long, value_enum, default_value_t = CifarVariant::Cifar10)]
    pub dataset: CifarVariant,

    /// Where checkpoints, metrics.csv and scalars.csv are written
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    #[arg(long, value_enum, default_value_t = BackendKind::Wgpu)]
    pub backend: BackendKind,

    /// Evaluate on the test split instead of a validation split
    #[arg(long)]
    pub use_test: bool,

    /// Fraction of the training set kept for training without --use-test
    #[arg(long, default_value_t = 0.9)]
    pub train_fraction: f64,

    /// Seed for the validation split and loader shuffling
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Disable random crop + horizontal flip
    #[arg(long)]
    pub no_augment: bool,

    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 4)]
    pub num_workers: usize,

    #[arg(long, default_value_t = 200)]
    pub epochs: usize,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.05)]
    pub lr_init: f64,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    /// Weight decay
    #[arg(long, default_value_t = 5e-4)]
    pub wd: f64,

    /// Train without stochastic weight averaging
    #[arg(long)]
    pub no_swa: bool,

    /// Epoch (1-based) of the first SWA update
    #[arg(long, default_value_t = 161)]
    pub swa_start: usize,

    /// Constant learning rate of the SWA phase
    #[arg(long, default_value_t = 0.01)]
    pub swa_lr: f64,

    /// Average every N epochs once SWA has started
    #[arg(long, default_value_t = 1)]
    pub swa_c_epochs: usize,

    #[arg(long, default_value_t = 5)]
    pub eval_freq: usize,

    #[arg(long, default_value_t = 25)]
    pub save_freq: usize,

    /// Output channels per stage, e.g. 64,128,256,512
    #[arg(long, value_delimiter = ',', default_value = "64,128,256,512")]
    pub stages: Vec<usize>,

    #[arg(long, default_value_t = 2)]
    pub convs_per_stage: usize,

    #[arg(long, value_enum, default_value_t = QuantType::Block)]
    pub quant_type: QuantType,

    #[arg(long, value_enum, default_value_t = Rounding::Stochastic)]
    pub rounding: Rounding,

    /// Weight word length; -1 keeps full precision
    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    pub wl_weight: i32,

    /// Weight fractional bits (fixed point only)
    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    pub fl_weight: i32,

    /// Gradient word length; -1 keeps full precision
    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    pub wl_grad: i32,

    #[arg(long, default_value_t = 8, allow_negative_numbers = true)]
    pub fl_grad: i32,

    /// Leave bias parameters in full precision
    #[arg(long)]
    pub no_quant_bias: bool,

    /// Leave batch-norm parameters in full precision
    #[arg(long)]
    pub no_quant_bn: bool,

    /// Log per-parameter weight quantisation error to scalars.csv
    #[arg(long)]
    pub log_error: bool,

    /// Checkpoint to resume from (e.g. checkpoints/checkpoint-25)
    #[arg(long)]
    pub resume: Option<String>,
}

/// The application layer never sees clap types.
impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            data_dir:        a.data_dir,
            dataset:         a.dataset,
            checkpoint_dir:  a.checkpoint_dir,
            backend:         a.backend,
            use_test:        a.use_test,
            train_fraction:  a.train_fraction,
            seed:            a.seed,
            augment:         !a.no_augment,
            batch_size:      a.batch_size,
            num_workers:     a.num_workers,
            epochs:          a.epochs,
            lr_init:         a.lr_init,
            momentum:        a.momentum,
            wd:              a.wd,
            swa:             !a.no_swa,
            swa_start:       a.swa_start,
            swa_lr:          a.swa_lr,
            swa_c_epochs:    a.swa_c_epochs,
            eval_freq:       a.eval_freq,
            save_freq:       a.save_freq,
            stages:          a.stages,
            convs_per_stage: a.convs_per_stage,
            quant_type:      a.quant_type,
            rounding:        a.rounding,
            wl_weight:       a.wl_weight,
            fl_weight:       a.fl_weight,
            wl_grad:         a.wl_grad,
            fl_grad:         a.fl_grad,
            quant_bias:      !a.no_quant_bias,
            quant_bn:        !a.no_quant_bn,
            log_error:       a.log_error,
            resume:          a.resume,
        }
    }
}

/// All arguments for the `eval` command
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Directory the run was trained into
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,

    /// Checkpoint to score; defaults to the latest one
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Score the SWA weights
    #[arg(long)]
    pub swa: bool,

    /// Recompute batch-norm statistics on the training set first
    #[arg(long)]
    pub bn_update: bool,

    /// Override the backend used for training
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

impl From<EvalArgs> for EvalRequest {
    fn from(a: EvalArgs) -> Self {
        EvalRequest {
            checkpoint_dir: a.checkpoint_dir,
            checkpoint:     a.checkpoint,
            swa:            a.swa,
            bn_update:      a.bn_update,
            backend:        a.backend,
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use crate::cli::Cli;
    use crate::cli::commands::Commands;
    use crate::application::train_use_case::TrainConfig;
    use clap::Parser;

    #[test]
    fn test_train_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["swalp-train", "train"]).unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();
        let def = TrainConfig::default();

        assert_eq!(cfg.stages, def.stages);
        assert_eq!(cfg.epochs, def.epochs);
        assert_eq!(cfg.swa_start, def.swa_start);
        assert_eq!(cfg.wl_weight, def.wl_weight);
        assert_eq!(cfg.quant_type, def.quant_type);
        assert!(cfg.swa && cfg.quant_bias && cfg.quant_bn && cfg.augment);
    }

    #[test]
    fn test_train_flags() {
        let cli = Cli::try_parse_from([
            "swalp-train", "train",
            "--no-swa", "--wl-grad", "-1", "--quant-type", "fixed",
            "--stages", "8,16", "--no-quant-bn", "--backend", "ndarray",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else { panic!("expected train") };
        let cfg: TrainConfig = args.into();

        assert!(!cfg.swa);
        assert_eq!(cfg.wl_grad, -1);
        assert_eq!(cfg.stages, vec![8, 16]);
        assert!(!cfg.quant_bn);
        assert!(cfg.quant_bias);
    }

    #[test]
    fn test_eval_args() {
        let cli = Cli::try_parse_from(["swalp-train", "eval", "--swa", "--bn-update"]).unwrap();
        let Commands::Eval(args) = cli.command else { panic!("expected eval") };
        assert!(args.swa && args.bn_update);
        assert_eq!(args.checkpoint, None);
        assert_eq!(args.backend, None);
    }
}
