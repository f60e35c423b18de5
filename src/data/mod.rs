// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// Everything from .bin files on disk to device-ready batches.
//
//   CIFAR .bin files
//       │
//       ▼
//   CifarLoader       → decodes fixed-size records into ImageSamples
//       │
//       ▼
//   split_train_val   → optional held-out validation split
//       │
//       ▼
//   ImageDataset      → implements Burn's Dataset trait,
//       │               runs the Preprocessor on every get()
//       ▼
//   ImageBatcher      → stacks items into [N, C, H, W] tensors
//       │
//       ▼
//   DataLoader        → feeds batches to train_epoch / eval / bn_update
//
// Reference: Burn Book §4 (Datasets and Dataloaders)

/// Reads CIFAR-10 / CIFAR-100 binary batches
pub mod loader;

/// Normalisation and crop/flip augmentation
pub mod preprocessor;

/// Implements Burn's Dataset trait for labelled images
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Shuffles and splits data into train/validation sets
pub mod splitter;
