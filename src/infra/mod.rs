// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Everything that touches the checkpoint directory:
//
//   checkpoint.rs — Per-epoch checkpoints (JSON manifest +
//                   Burn records) and the saved TrainConfig,
//                   so `eval` and `--resume` can rebuild the
//                   exact model.
//
//   metrics.rs    — metrics.csv (one row per epoch) and
//                   scalars.csv (tagged scalars such as the
//                   per-parameter quantisation error).
//
// Reference: Rust Book §9 (Error Handling with anyhow)
//            Burn Book §5 (Checkpointing)

/// Checkpoint writing and loading
pub mod checkpoint;

/// Training metrics CSV loggers
pub mod metrics;
