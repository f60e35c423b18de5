// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Two commands are supported:
//   1. `train` — low-precision SWA training on CIFAR
//   2. `eval`  — loads a checkpoint and reports test metrics
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, EvalArgs, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "swalp-train",
    version = "0.1.0",
    about = "Low-precision training with stochastic weight averaging on CIFAR."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Match on the subcommand and dispatch to the correct use case.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => Self::run_train(args),
            Commands::Eval(args)  => Self::run_eval(args),
        }
    }

    fn run_train(args: TrainArgs) -> Result<()> {
        use crate::application::train_use_case::TrainUseCase;

        tracing::info!("Starting training on data in: {}", args.data_dir);
        let checkpoint_dir = args.checkpoint_dir.clone();

        TrainUseCase::new(args.into()).execute()?;

        println!("Training complete. Checkpoints saved to '{}'.", checkpoint_dir);
        Ok(())
    }

    fn run_eval(args: EvalArgs) -> Result<()> {
        use crate::application::eval_use_case::EvalUseCase;

        let report = EvalUseCase::new(args.into()).execute()?;

        println!(
            "\nEpoch {} ({}): loss {:.4}, accuracy {:.2}%",
            report.epoch, report.key, report.stats.loss, report.stats.accuracy
        );
        Ok(())
    }
}
