// ============================================================
// Layer 5 — Model Capabilities
// ============================================================
// The training helpers never name a concrete architecture.
// They only need three things from a model:
//
//   Classifier       → images in, class logits out
//   NamedParameters  → dotted torch-style parameter names
//                      ("features.3.bn.weight") mapped to the
//                      ParamId Burn uses to key gradients
//   BatchNormLayers  → mutable access to every BN layer's
//                      running statistics and momentum
//
// Any #[derive(Module)] struct can opt in by implementing them.

use burn::{
    module::{ParamId, RunningState},
    nn::BatchNorm,
    prelude::*,
};

/// images: [batch, channels, height, width] → logits: [batch, classes]
pub trait Classifier<B: Backend> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Trainable parameters only; running statistics are buffers
/// and must not appear here.
pub trait NamedParameters {
    fn named_parameters(&self) -> Vec<(String, ParamId)>;
}

/// The mutable state of one batch-normalisation layer.
pub trait RunningStats {
    /// running_mean ← 0, running_var ← 1
    fn reset_running_stats(&mut self);

    fn momentum(&self) -> f64;

    fn set_momentum(&mut self, momentum: f64);
}

impl<B: Backend, const D: usize> RunningStats for BatchNorm<B, D> {
    fn reset_running_stats(&mut self) {
        let mean = self.running_mean.value();
        let var  = self.running_var.value();
        self.running_mean = RunningState::new(mean.zeros_like());
        self.running_var  = RunningState::new(var.ones_like());
    }

    fn momentum(&self) -> f64 {
        self.momentum
    }

    fn set_momentum(&mut self, momentum: f64) {
        self.momentum = momentum;
    }
}

/// Visits BN layers in a fixed order. An empty Vec means the
/// model has no batch normalisation.
pub trait BatchNormLayers {
    fn batch_norms(&self) -> Vec<&dyn RunningStats>;

    fn batch_norms_mut(&mut self) -> Vec<&mut dyn RunningStats>;
}
