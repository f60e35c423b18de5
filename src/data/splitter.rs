// ============================================================
// Layer 4 — Train/Validation Splitter
// ============================================================
// Shuffles the training images and carves off a held-out
// validation set. Used when training without touching the
// official test split (`--use-test` not set).
//
// A fixed seed gives the same split on every run, which
// keeps resumed runs evaluating on the same images.
//
// Reference: rand crate documentation

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// Shuffle `samples` and split into (train, validation).
///
/// `train_fraction` is clamped to [0, 1]; `seed = None` draws
/// a fresh shuffle from the thread RNG.
pub fn split_train_val<T>(
    mut samples:    Vec<T>,
    train_fraction: f64,
    seed:           Option<u64>,
) -> (Vec<T>, Vec<T>) {
    match seed {
        Some(seed) => samples.shuffle(&mut StdRng::seed_from_u64(seed)),
        None       => samples.shuffle(&mut rand::thread_rng()),
    }

    let total    = samples.len();
    let fraction = train_fraction.clamp(0.0, 1.0);
    let split_at = ((total as f64) * fraction).round() as usize;
    let split_at = split_at.min(total);

    // After this: samples = [0..split_at], val = [split_at..total]
    let val = samples.split_off(split_at);

    tracing::debug!(
        "Dataset split: {} training, {} validation ({}% / {}%)",
        samples.len(),
        val.len(),
        (samples.len() * 100) / total.max(1),
        (val.len()     * 100) / total.max(1),
    );

    (samples, val)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_split_sizes() {
        let items: Vec<usize> = (0..100).collect();
        let (train, val)      = split_train_val(items, 0.9, None);
        assert_eq!(train.len(), 90);
        assert_eq!(val.len(),   10);
    }

    #[test]
    fn test_all_items_preserved() {
        let items: Vec<usize> = (0..50).collect();
        let (train, val)      = split_train_val(items, 0.7, Some(3));
        let mut all: Vec<usize> = train.into_iter().chain(val).collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_seeded_split_is_reproducible() {
        let a = split_train_val((0..40).collect::<Vec<u32>>(), 0.75, Some(11));
        let b = split_train_val((0..40).collect::<Vec<u32>>(), 0.75, Some(11));
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_dataset() {
        let items: Vec<usize> = Vec::new();
        let (train, val)      = split_train_val(items, 0.8, None);
        assert!(train.is_empty());
        assert!(val.is_empty());
    }

    #[test]
    fn test_fraction_is_clamped() {
        let (train, val) = split_train_val((0..10).collect::<Vec<u8>>(), 1.5, None);
        assert_eq!(train.len(), 10);
        assert!(val.is_empty());
    }
}
