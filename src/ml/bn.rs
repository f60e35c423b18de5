// ============================================================
// Layer 5 — Batch-Norm Statistics Refresh
// ============================================================
// After weight averaging the BN running statistics no longer
// match the averaged weights, so they are re-estimated with
// one pass over the training data:
//
//   1. reset running_mean ← 0, running_var ← 1
//   2. remember each layer's momentum
//   3. for a batch of size b after n inputs, set momentum to
//      b / (n + b), which turns the exponential moving
//      average into an exact cumulative mean over the epoch
//   4. forward in training mode (autodiff backend), labels unused
//   5. restore the remembered momenta
//
// Reference: Izmailov et al. (2018) Averaging Weights Leads to
//            Wider Optima and Better Generalization

use burn::tensor::backend::AutodiffBackend;

use crate::data::batcher::ImageBatch;
use crate::ml::traits::{BatchNormLayers, Classifier, RunningStats};

/// True if the model has at least one BN layer
pub fn check_bn<M: BatchNormLayers>(model: &M) -> bool {
    !model.batch_norms().is_empty()
}

/// Running mean ← zeros, running var ← ones
pub fn reset_bn(layer: &mut dyn RunningStats) {
    layer.reset_running_stats();
}

/// Momentum of every BN layer, in layer order
pub fn get_momenta<M: BatchNormLayers>(model: &M) -> Vec<f64> {
    model.batch_norms().iter().map(|bn| bn.momentum()).collect()
}

/// Inverse of get_momenta
pub fn set_momenta<M: BatchNormLayers>(model: &mut M, momenta: &[f64]) {
    for (bn, &momentum) in model.batch_norms_mut().into_iter().zip(momenta) {
        bn.set_momentum(momentum);
    }
}

/// Re-estimate BN buffers with one pass over `loader`.
/// Does nothing when the model has no BN layers.
pub fn bn_update<B, M>(loader: impl Iterator<Item = ImageBatch<B>>, model: &mut M)
where
    B: AutodiffBackend,
    M: Classifier<B> + BatchNormLayers,
{
    if !check_bn(model) {
        return;
    }

    for layer in model.batch_norms_mut() {
        reset_bn(layer);
    }
    let momenta = get_momenta(model);

    let mut n = 0usize;
    for batch in loader {
        let b = batch.batch_size();
        let momentum = b as f64 / (n + b) as f64;
        for layer in model.batch_norms_mut() {
            layer.set_momentum(momentum);
        }

        // Output is discarded; the forward pass updates the running state
        let _ = model.forward(batch.images);
        n += b;
    }

    set_momenta(model, &momenta);
    tracing::debug!("Refreshed BN statistics over {} inputs", n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::{VggConfig, VggNet};
    use burn::{
        backend::{Autodiff, NdArray},
        prelude::*,
    };

    type TestBackend = Autodiff<NdArray>;

    struct NoBn;

    impl BatchNormLayers for NoBn {
        fn batch_norms(&self) -> Vec<&dyn RunningStats> {
            Vec::new()
        }

        fn batch_norms_mut(&mut self) -> Vec<&mut dyn RunningStats> {
            Vec::new()
        }
    }

    fn batch(value: f32, n: usize, device: &<TestBackend as Backend>::Device) -> ImageBatch<TestBackend> {
        ImageBatch {
            images:  Tensor::full([n, 3, 4, 4], value, device),
            targets: Tensor::zeros([n], device),
        }
    }

    fn running_mean(model: &VggNet<TestBackend>) -> Vec<f32> {
        model.features[0].bn.running_mean.value().into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_check_bn() {
        let model: VggNet<TestBackend> = VggConfig::new(2, vec![4]).init(&Default::default());
        assert!(check_bn(&model));
        assert!(!check_bn(&NoBn));
    }

    #[test]
    fn test_momenta_roundtrip_in_layer_order() {
        let mut model: VggNet<TestBackend> = VggConfig::new(2, vec![4, 4]).init(&Default::default());
        set_momenta(&mut model, &[0.3, 0.7]);
        assert_eq!(get_momenta(&model), vec![0.3, 0.7]);
    }

    #[test]
    fn test_reset_bn() {
        let mut model: VggNet<TestBackend> = VggConfig::new(2, vec![4]).init(&Default::default());
        let device = Default::default();
        model.features[0].bn.running_mean =
            burn::module::RunningState::new(Tensor::ones([4], &device));
        reset_bn(&mut model.features[0].bn);

        assert_eq!(running_mean(&model), vec![0.0; 4]);
        let var = model.features[0].bn.running_var.value().into_data().to_vec::<f32>().unwrap();
        assert_eq!(var, vec![1.0; 4]);
    }

    #[test]
    fn test_bn_update_computes_cumulative_mean_and_restores_momentum() {
        let device = Default::default();
        let mut model: VggNet<TestBackend> = VggConfig::new(2, vec![4]).init(&device);
        let momentum_before = get_momenta(&model);

        // Reference: one pass over the concatenation of both batches
        // with momentum 1.0 gives the exact batch mean
        let mut reference = model.clone();
        set_momenta(&mut reference, &[1.0]);
        for layer in reference.batch_norms_mut() {
            reset_bn(layer);
        }
        let all = ImageBatch {
            images:  Tensor::cat(
                vec![batch(1.0, 2, &device).images, batch(-3.0, 6, &device).images],
                0,
            ),
            targets: Tensor::zeros([8], &device),
        };
        let _ = reference.forward(all.images);

        bn_update(vec![batch(1.0, 2, &device), batch(-3.0, 6, &device)].into_iter(), &mut model);

        for (got, want) in running_mean(&model).iter().zip(running_mean(&reference)) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
        assert_eq!(get_momenta(&model), momentum_before);
    }

    #[test]
    fn test_bn_update_without_bn_is_a_no_op() {
        struct Linearish;
        impl Classifier<TestBackend> for Linearish {
            fn forward(&self, images: Tensor<TestBackend, 4>) -> Tensor<TestBackend, 2> {
                panic!("forward should not run, got {:?}", images.dims());
            }
        }
        impl BatchNormLayers for Linearish {
            fn batch_norms(&self) -> Vec<&dyn RunningStats> {
                Vec::new()
            }
            fn batch_norms_mut(&mut self) -> Vec<&mut dyn RunningStats> {
                Vec::new()
            }
        }

        let device = Default::default();
        bn_update(vec![batch(0.0, 2, &device)].into_iter(), &mut Linearish);
    }
}
