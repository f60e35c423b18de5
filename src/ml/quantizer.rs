// ============================================================
// Layer 5 — Low-Precision Quantisers
// ============================================================
// A Quantizer maps a tensor to the nearest value representable
// in some reduced-precision number format, returning it still
// stored as f32 ("fake quantisation").
//
// Two formats are provided:
//
//   FixedPointQuantizer  wl total bits, fl fractional bits
//                        q = clamp(round(x·2^fl), -2^(wl-1), 2^(wl-1)-1) · 2^-fl
//
//   BlockQuantizer       block floating point: one shared 8-bit
//                        exponent per tensor, taken from max|x|
//                        e = clamp(floor(log2 max|x|), -128, 127)
//                        q = clamp(round(x·2^(wl-2-e)), ...) · 2^(e-(wl-2))
//
// Rounding is either round-to-nearest or stochastic
// (floor(x + u), u ~ U[0, 1)), which is unbiased in expectation
// and is what lets SGD make progress below the quantisation step.
//
// The second half of this file applies a quantiser to a model:
//   quantize_gradients → rewrites entries of GradientsParams
//   quantize_weights   → rewrites parameter tensors in place
// Both only touch parameters selected by a QuantScope.
//
// Reference: Yang et al. (2019) SWALP: Stochastic Weight Averaging
//            in Low-Precision Training

use std::collections::HashMap;

use burn::{
    module::{ModuleMapper, ModuleVisitor, ParamId},
    optim::GradientsParams,
    prelude::*,
    tensor::{backend::AutodiffBackend, Distribution},
};
use serde::{Deserialize, Serialize};

use crate::ml::traits::NamedParameters;

/// Exponent bits of the shared block exponent
const BLOCK_EXPONENT_BITS: i32 = 8;

// ─── Quantizer ────────────────────────────────────────────────────────────────
pub trait Quantizer<B: Backend> {
    fn quantize<const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Rounding {
    Nearest,
    Stochastic,
}

impl Rounding {
    /// Round every element to an integer value
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Rounding::Nearest    => x.round(),
            Rounding::Stochastic => {
                let noise = x.random_like(Distribution::Uniform(0.0, 1.0));
                (x + noise).floor()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedPointQuantizer {
    pub wl:       i32,
    pub fl:       i32,
    pub rounding: Rounding,
}

impl FixedPointQuantizer {
    pub fn new(wl: i32, fl: i32, rounding: Rounding) -> Self {
        Self { wl, fl, rounding }
    }
}

impl<B: Backend> Quantizer<B> for FixedPointQuantizer {
    fn quantize<const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let scale = 2f64.powi(self.fl);
        let bound = 2f64.powi(self.wl - 1);
        self.rounding
            .apply(tensor.mul_scalar(scale))
            .clamp(-bound, bound - 1.0)
            .div_scalar(scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockQuantizer {
    pub wl:       i32,
    pub rounding: Rounding,
}

impl BlockQuantizer {
    pub fn new(wl: i32, rounding: Rounding) -> Self {
        Self { wl, rounding }
    }

    /// Shared exponent for a block whose largest magnitude is `max_entry`
    pub fn shared_exponent(max_entry: f64) -> i32 {
        let limit = 2i32.pow(BLOCK_EXPONENT_BITS as u32 - 1);
        (max_entry.log2().floor() as i32).clamp(-limit, limit - 1)
    }
}

impl<B: Backend> Quantizer<B> for BlockQuantizer {
    fn quantize<const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let max_entry: f64 = tensor.clone().abs().max().into_scalar().elem();
        if max_entry == 0.0 || !max_entry.is_finite() {
            return tensor;
        }
        let exponent = Self::shared_exponent(max_entry);
        let bound    = 2f64.powi(self.wl - 1);
        // 2^(wl-2-e) applied as three factors: scalars reach the
        // backend as f32 and 2^(-e) alone overflows it at e = -128
        let mantissa = 2f64.powi(self.wl - 2);
        let low      = 2f64.powi(-exponent / 2);
        let high     = 2f64.powi(-exponent - (-exponent / 2));
        self.rounding
            .apply(tensor.mul_scalar(low).mul_scalar(high).mul_scalar(mantissa))
            .clamp(-bound, bound - 1.0)
            .div_scalar(mantissa)
            .div_scalar(high)
            .div_scalar(low)
    }
}

/// The number formats selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LowPrecision {
    Fixed(FixedPointQuantizer),
    Block(BlockQuantizer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum QuantType {
    Fixed,
    Block,
}

impl LowPrecision {
    /// A word length of -1 or less disables quantisation.
    /// Fixed point keeps `wl - fl` integer bits.
    pub fn from_word_length(
        quant_type: QuantType,
        wl:         i32,
        fl:         i32,
        rounding:   Rounding,
    ) -> Option<Self> {
        if wl <= -1 {
            return None;
        }
        Some(match quant_type {
            QuantType::Fixed => LowPrecision::Fixed(FixedPointQuantizer::new(wl, fl, rounding)),
            QuantType::Block => LowPrecision::Block(BlockQuantizer::new(wl, rounding)),
        })
    }
}

impl<B: Backend> Quantizer<B> for LowPrecision {
    fn quantize<const D: usize>(&self, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            LowPrecision::Fixed(q) => Quantizer::<B>::quantize(q, tensor),
            LowPrecision::Block(q) => Quantizer::<B>::quantize(q, tensor),
        }
    }
}

// ─── Parameter selection ──────────────────────────────────────────────────────
/// Which parameters get quantised.
///
/// A parameter is skipped when the second-to-last segment of its
/// name contains "bn" and `quant_bn` is off, or when its last
/// segment contains "bias" and `quant_bias` is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantScope {
    pub quant_bias: bool,
    pub quant_bn:   bool,
}

impl Default for QuantScope {
    fn default() -> Self {
        Self { quant_bias: true, quant_bn: true }
    }
}

impl QuantScope {
    pub fn includes(&self, name: &str) -> bool {
        let segments: Vec<&str> = name.split('.').collect();
        let n = segments.len();
        if !self.quant_bn && n >= 2 && segments[n - 2].contains("bn") {
            return false;
        }
        if !self.quant_bias && segments[n - 1].contains("bias") {
            return false;
        }
        true
    }

    /// ParamId → name for every selected parameter of `model`
    pub fn select<M: NamedParameters>(&self, model: &M) -> HashMap<ParamId, String> {
        model
            .named_parameters()
            .into_iter()
            .filter(|(name, _)| self.includes(name))
            .map(|(name, id)| (id, name))
            .collect()
    }
}

// ─── Gradient quantisation ────────────────────────────────────────────────────
struct GradientQuantVisitor<'a, Q> {
    targets:   &'a HashMap<ParamId, String>,
    grads:     &'a mut GradientsParams,
    quantizer: &'a Q,
}

impl<B, Q> ModuleVisitor<B> for GradientQuantVisitor<'_, Q>
where
    B: AutodiffBackend,
    Q: Quantizer<B::InnerBackend>,
{
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.targets.contains_key(&id) {
            return;
        }
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register(id, self.quantizer.quantize(grad));
        }
    }
}

/// Replace the gradient of every selected parameter with its
/// quantised value. Parameters without a gradient are left alone.
pub fn quantize_gradients<B, M, Q>(
    model:     &M,
    grads:     &mut GradientsParams,
    targets:   &HashMap<ParamId, String>,
    quantizer: &Q,
) where
    B: AutodiffBackend,
    M: Module<B>,
    Q: Quantizer<B::InnerBackend>,
{
    let mut visitor = GradientQuantVisitor { targets, grads, quantizer };
    model.visit(&mut visitor);
}

// ─── Weight quantisation ──────────────────────────────────────────────────────
struct WeightQuantMapper<'a, Q> {
    targets:   &'a HashMap<ParamId, String>,
    quantizer: &'a Q,
    errors:    Option<&'a mut Vec<(String, f64)>>,
}

impl<B, Q> ModuleMapper<B> for WeightQuantMapper<'_, Q>
where
    B: AutodiffBackend,
    Q: Quantizer<B::InnerBackend>,
{
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let Some(name) = self.targets.get(&id) else {
            return tensor;
        };
        let require_grad = tensor.is_require_grad();
        let data         = tensor.inner();
        let quantized    = self.quantizer.quantize(data.clone());

        if let Some(errors) = self.errors.as_mut() {
            let mse: f64 = (data - quantized.clone())
                .powf_scalar(2.0)
                .mean()
                .into_scalar()
                .elem();
            errors.push((name.clone(), mse));
        }

        // Detached from the graph, like overwriting p.data
        Tensor::from_inner(quantized).set_require_grad(require_grad)
    }
}

/// Overwrite every selected parameter with its quantised value.
///
/// When `errors` is given, the mean squared quantisation error of
/// each parameter is appended as (name, mse).
pub fn quantize_weights<B, M, Q>(
    model:     M,
    targets:   &HashMap<ParamId, String>,
    quantizer: &Q,
    errors:    Option<&mut Vec<(String, f64)>>,
) -> M
where
    B: AutodiffBackend,
    M: Module<B>,
    Q: Quantizer<B::InnerBackend>,
{
    let mut mapper = WeightQuantMapper { targets, quantizer, errors };
    model.map(&mut mapper)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray;

    fn values(t: Tensor<TestBackend, 1>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn tensor(v: &[f32]) -> Tensor<TestBackend, 1> {
        Tensor::from_floats(v, &Default::default())
    }

    #[test]
    fn test_fixed_point_rounds_to_grid() {
        // 8 bits, 2 fractional → step 0.25, range [-32, 31.75]
        let q = FixedPointQuantizer::new(8, 2, Rounding::Nearest);
        let out = values(Quantizer::<TestBackend>::quantize(&q, tensor(&[0.3, -0.6, 1.0])));
        assert_eq!(out, vec![0.25, -0.5, 1.0]);
    }

    #[test]
    fn test_fixed_point_saturates() {
        let q = FixedPointQuantizer::new(4, 0, Rounding::Nearest);
        let out = values(Quantizer::<TestBackend>::quantize(&q, tensor(&[100.0, -100.0])));
        assert_eq!(out, vec![7.0, -8.0]);
    }

    #[test]
    fn test_block_quantizer_uses_shared_exponent() {
        // max = 3.0 → e = 1, wl = 4 → step 2^(1-2) = 0.5
        let q = BlockQuantizer::new(4, Rounding::Nearest);
        let out = values(Quantizer::<TestBackend>::quantize(&q, tensor(&[3.0, 0.3, -1.2])));
        assert_eq!(out, vec![3.0, 0.5, -1.0]);
    }

    #[test]
    fn test_block_quantizer_clamps_top_of_range() {
        // max = 3.9 → e = 1, scaled = 7.8 → round 8 → clamp 7 → 3.5
        let q = BlockQuantizer::new(4, Rounding::Nearest);
        let out = values(Quantizer::<TestBackend>::quantize(&q, tensor(&[3.9])));
        assert_eq!(out, vec![3.5]);
    }

    #[test]
    fn test_block_quantizer_passes_zeros_through() {
        let q = BlockQuantizer::new(8, Rounding::Stochastic);
        let out = values(Quantizer::<TestBackend>::quantize(&q, tensor(&[0.0, 0.0])));
        assert_eq!(out, vec![0.0, 0.0]);
    }

    /// q = clamp(round(x·2^(wl-2-e)), -2^(wl-1), 2^(wl-1)-1) · 2^(e-(wl-2))
    fn block_reference(x: &[f32], wl: i32) -> Vec<f64> {
        let max = x.iter().fold(0.0f64, |m, v| m.max((*v as f64).abs()));
        let e     = BlockQuantizer::shared_exponent(max);
        let step  = 2f64.powi(e - (wl - 2));
        let bound = 2f64.powi(wl - 1);
        x.iter()
            .map(|v| ((*v as f64) / step).round().clamp(-bound, bound - 1.0) * step)
            .collect()
    }

    fn assert_matches_reference(input: &[f32], wl: i32) {
        let q   = BlockQuantizer::new(wl, Rounding::Nearest);
        let out = values(Quantizer::<TestBackend>::quantize(&q, tensor(input)));
        for (got, want) in out.iter().zip(block_reference(input, wl)) {
            assert!(got.is_finite(), "got {got} for {input:?}");
            assert!(
                ((*got as f64) - want).abs() <= want.abs() * 1e-6,
                "got {got}, want {want}"
            );
        }
    }

    #[test]
    fn test_block_quantizer_tiny_tensors_stay_finite() {
        // e = -127: a single 2^133 scale factor would be inf in f32
        assert_matches_reference(&[1e-38, 0.0], 8);
        // at the bottom of f32's normal range
        assert_matches_reference(&[f32::MIN_POSITIVE, -f32::MIN_POSITIVE / 3.0, 0.0], 8);
        // subnormal maximum, exponent clamped to -128
        assert_matches_reference(&[3e-39, 0.0, -1e-39], 8);
    }

    #[test]
    fn test_block_quantizer_huge_tensors_stay_finite() {
        assert_matches_reference(&[1e38, 0.0, -3e37], 8);
    }

    #[test]
    fn test_shared_exponent_is_clamped() {
        assert_eq!(BlockQuantizer::shared_exponent(1.0), 0);
        assert_eq!(BlockQuantizer::shared_exponent(0.3), -2);
        assert_eq!(BlockQuantizer::shared_exponent(f64::MAX), 127);
        assert_eq!(BlockQuantizer::shared_exponent(f64::MIN_POSITIVE), -128);
    }

    #[test]
    fn test_stochastic_rounding_stays_on_neighbouring_grid_points() {
        let q = FixedPointQuantizer::new(8, 0, Rounding::Stochastic);
        let input = tensor(&[0.5; 256]);
        let out = values(Quantizer::<TestBackend>::quantize(&q, input));
        assert!(out.iter().all(|&v| v == 0.0 || v == 1.0));
        // With 256 draws both outcomes are overwhelmingly likely
        assert!(out.iter().any(|&v| v == 0.0));
        assert!(out.iter().any(|&v| v == 1.0));
    }

    #[test]
    fn test_word_length_minus_one_disables() {
        assert!(LowPrecision::from_word_length(QuantType::Block, -1, 0, Rounding::Nearest).is_none());
        assert_eq!(
            LowPrecision::from_word_length(QuantType::Fixed, 8, 6, Rounding::Stochastic),
            Some(LowPrecision::Fixed(FixedPointQuantizer::new(8, 6, Rounding::Stochastic)))
        );
    }

    #[test]
    fn test_scope_filters_bn_and_bias() {
        let all = QuantScope::default();
        assert!(all.includes("features.0.bn.weight"));
        assert!(all.includes("classifier.bias"));

        let no_bn = QuantScope { quant_bias: true, quant_bn: false };
        assert!(!no_bn.includes("features.0.bn.weight"));
        assert!(!no_bn.includes("features.0.bn.bias"));
        assert!(no_bn.includes("features.0.conv.weight"));

        let no_bias = QuantScope { quant_bias: false, quant_bn: true };
        assert!(!no_bias.includes("features.0.conv.bias"));
        assert!(!no_bias.includes("classifier.bias"));
        assert!(no_bias.includes("features.0.bn.weight"));
        // single segment names have no module part
        assert!(no_bias.includes("scale"));
    }

    fn grad_values<const D: usize>(grads: &GradientsParams, id: ParamId) -> Vec<f32> {
        grads
            .get::<TestBackend, D>(id)
            .expect("parameter has a gradient")
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn test_quantize_gradients_only_touches_selected_params() {
        use crate::ml::model::{VggConfig, VggNet};
        use crate::ml::trainer::cross_entropy;
        type Ad = Autodiff<TestBackend>;

        let device = Default::default();
        let model: VggNet<Ad> = VggConfig::new(3, vec![4]).init(&device);
        let images  = Tensor::<Ad, 4>::random([4, 3, 4, 4], Distribution::Default, &device);
        let labels  = Tensor::<Ad, 1, Int>::from_ints([0, 1, 2, 0], &device);
        let loss    = cross_entropy(model.forward(images), labels).mul_scalar(1000.0);
        let mut grads = GradientsParams::from_grads(loss.backward(), &model);

        let conv_w = model.features[0].conv.weight.id;
        let gamma  = model.features[0].bn.gamma.id;
        let cls_w  = model.classifier.weight.id;
        let cls_b  = model.classifier.bias.as_ref().unwrap().id;

        let cls_w_before = grad_values::<2>(&grads, cls_w);
        let cls_b_before = grad_values::<1>(&grads, cls_b);
        let gamma_before = grad_values::<1>(&grads, gamma);
        assert!(cls_w_before.iter().any(|v| v.fract() != 0.0));

        // 2 bits, no fraction → {-2, -1, 0, 1}
        let q       = FixedPointQuantizer::new(2, 0, Rounding::Nearest);
        let scope   = QuantScope { quant_bias: false, quant_bn: false };
        let targets = scope.select(&model);
        quantize_gradients::<Ad, VggNet<Ad>, _>(&model, &mut grads, &targets, &q);

        let on_grid = |v: &f32| v.fract() == 0.0 && (-2.0..=1.0).contains(v);
        let cls_w_after = grad_values::<2>(&grads, cls_w);
        assert!(cls_w_after.iter().all(on_grid));
        assert_ne!(cls_w_after, cls_w_before);
        assert!(grad_values::<4>(&grads, conv_w).iter().all(on_grid));

        // excluded by scope: bias and BN gradients are untouched
        assert_eq!(grad_values::<1>(&grads, cls_b), cls_b_before);
        assert_eq!(grad_values::<1>(&grads, gamma), gamma_before);
    }

    #[test]
    fn test_quantize_weights_only_touches_selected_params() {
        use crate::ml::model::{VggConfig, VggNet};
        type Ad = Autodiff<TestBackend>;

        let device = Default::default();
        let model: VggNet<Ad> = VggConfig::new(3, vec![4]).init(&device);
        let scope   = QuantScope { quant_bias: true, quant_bn: false };
        let targets = scope.select(&model);
        assert_eq!(targets.len(), 4);

        let bn_before = model.features[0].bn.gamma.val().into_data().to_vec::<f32>().unwrap();
        let q = FixedPointQuantizer::new(4, 0, Rounding::Nearest);
        let mut errors = Vec::new();
        let model = quantize_weights(model, &targets, &q, Some(&mut errors));

        // conv weights are integers in [-8, 7] now
        let w = model.features[0].conv.weight.val().into_data().to_vec::<f32>().unwrap();
        assert!(w.iter().all(|v| v.fract() == 0.0 && (-8.0..=7.0).contains(v)));

        // BN affine params untouched
        let bn_after = model.features[0].bn.gamma.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(bn_after, bn_before);

        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|(_, mse)| *mse >= 0.0));
    }
}
