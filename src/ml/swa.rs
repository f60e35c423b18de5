// ============================================================
// Layer 5 — Stochastic Weight Averaging
// ============================================================
// moving_average(net1, net2, α):   p1 ← (1 - α)·p1 + α·p2
//
// Parameters are paired in visit order, which is the field
// declaration order of the module, so both nets must share an
// architecture. Only trainable parameters are averaged; BN
// running statistics are buffers and are rebuilt afterwards
// by bn_update().
//
// SwaAverage keeps an equal-weight running mean:
//   after n updates, swa = (w_1 + ... + w_n) / n
// by using α = 1 / (n + 1) for the (n+1)-th model.

use std::collections::HashSet;

use anyhow::Result;
use burn::{
    module::{ModuleMapper, ModuleVisitor, ParamId},
    prelude::*,
};

use crate::ml::traits::NamedParameters;

struct ParamCollector<'a, B: Backend> {
    params: &'a HashSet<ParamId>,
    values: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if self.params.contains(&id) {
            let numel = tensor.shape().num_elements();
            self.values.push(tensor.clone().detach().reshape([numel]));
        }
    }
}

struct AverageMapper<B: Backend> {
    params:  HashSet<ParamId>,
    others:  std::vec::IntoIter<Tensor<B, 1>>,
    alpha:   f64,
    matched: usize,
}

impl<B: Backend> ModuleMapper<B> for AverageMapper<B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if !self.params.contains(&id) {
            return tensor;
        }
        let Some(other) = self.others.next() else {
            return tensor;
        };
        self.matched += 1;

        let require_grad = tensor.is_require_grad();
        let dims         = tensor.dims();
        let averaged     = tensor.detach().mul_scalar(1.0 - self.alpha)
            + other.reshape(dims).mul_scalar(self.alpha);
        averaged.set_require_grad(require_grad)
    }
}

fn param_ids<M: NamedParameters>(model: &M) -> HashSet<ParamId> {
    model.named_parameters().into_iter().map(|(_, id)| id).collect()
}

/// net1 ← (1 - alpha)·net1 + alpha·net2 over trainable parameters.
///
/// Fails if the two models do not expose the same number of
/// parameters.
pub fn moving_average<B, M>(net1: M, net2: &M, alpha: f64) -> Result<M>
where
    B: Backend,
    M: Module<B> + NamedParameters,
{
    let ids2 = param_ids(net2);
    let mut collector = ParamCollector { params: &ids2, values: Vec::new() };
    net2.visit(&mut collector);
    let expected = collector.values.len();

    let ids1 = param_ids(&net1);
    anyhow::ensure!(
        ids1.len() == expected,
        "cannot average models with {} and {} parameters",
        ids1.len(),
        expected
    );

    let mut mapper = AverageMapper {
        params:  ids1,
        others:  collector.values.into_iter(),
        alpha,
        matched: 0,
    };
    let averaged = net1.map(&mut mapper);
    anyhow::ensure!(
        mapper.matched == expected,
        "averaged {} of {} parameters",
        mapper.matched,
        expected
    );

    Ok(averaged)
}

/// Equal-weight running average of models, plus how many
/// models went into it.
#[derive(Debug, Clone)]
pub struct SwaAverage<M> {
    model: M,
    n:     usize,
}

impl<M> SwaAverage<M> {
    /// `model` only provides the architecture and buffers;
    /// its weights are fully replaced by the first update.
    pub fn new(model: M) -> Self {
        Self { model, n: 0 }
    }

    /// Resume from a checkpointed average of `n` models
    pub fn from_parts(model: M, n: usize) -> Self {
        Self { model, n }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Fold `model` into the average with weight 1 / (n + 1).
    pub fn update<B>(&mut self, model: &M) -> Result<()>
    where
        B: Backend,
        M: Module<B> + NamedParameters,
    {
        let alpha  = 1.0 / (self.n as f64 + 1.0);
        self.model = moving_average(self.model.clone(), model, alpha)?;
        self.n    += 1;
        tracing::debug!("SWA average now covers {} models", self.n);
        Ok(())
    }
}
