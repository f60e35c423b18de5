// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that touches model parameters lives here.
//
// What's in this layer:
//
//   traits.rs    — Seams the training helpers are written against:
//                  Classifier, NamedParameters, BatchNormLayers
//
//   model.rs     — VGG-style conv → BN → ReLU classifier
//
//   quantizer.rs — Fixed-point and block floating-point
//                  quantisers, nearest or stochastic rounding,
//                  and the name-based parameter filter
//
//   optim.rs     — Learning-rate wrapper around Burn optimisers
//                  and the SWA learning-rate schedule
//
//   swa.rs       — moving_average() and the running SWA model
//
//   bn.rs        — BatchNorm running-statistics refresh
//
//   trainer.rs   — train_epoch(), eval() and the full
//                  low-precision SWA training run
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)
//            Yang et al. (2019) SWALP: Stochastic Weight
//            Averaging in Low-Precision Training

pub mod traits;

/// VGG-style image classifier
pub mod model;

/// Low-precision number formats
pub mod quantizer;

pub mod optim;

/// Stochastic weight averaging
pub mod swa;

pub mod bn;

/// Epoch loops and the end-to-end training run
pub mod trainer;
