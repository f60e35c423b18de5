// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// The seams the rest of the system programs against.
// Neither trait mentions Burn, so both are testable
// without a backend.
//
//   ImageSource  → anything that yields labelled images
//                  (CifarLoader today)
//   ScalarWriter → anything that records tagged scalar values
//                  over time (ScalarLogger writes CSV; tests
//                  use an in-memory Vec)
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)

use anyhow::Result;

use crate::domain::image::ImageSample;

// ─── ImageSource ──────────────────────────────────────────────────────────────
/// Any component that can load a labelled image split.
pub trait ImageSource {
    /// Load the training split
    fn load_train(&self) -> Result<Vec<ImageSample>>;

    /// Load the held-out test split
    fn load_test(&self) -> Result<Vec<ImageSample>>;

    /// Number of distinct labels in this source
    fn num_classes(&self) -> usize;
}

// ─── ScalarWriter ─────────────────────────────────────────────────────────────
/// Records a named scalar at a given step (usually the epoch).
///
/// The training loop uses this to report per-parameter
/// quantisation error on the first batch of an epoch.
pub trait ScalarWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
}

/// In-memory writer, handy for tests and dry runs
impl ScalarWriter for Vec<(String, f64, usize)> {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.push((tag.to_string(), value, step));
        Ok(())
    }
}
