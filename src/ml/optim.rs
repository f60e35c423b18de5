// ============================================================
// Layer 5 — Optimiser Wrapper and Learning-Rate Schedule
// ============================================================
// Burn optimisers receive the learning rate on every step()
// instead of storing it per parameter group. LrOptimizer keeps
// one learning rate for all parameter groups and hands it to
// the wrapped optimiser on each step, so the rate can be
// changed between epochs with adjust_learning_rate().
//
// The SWA schedule (Izmailov et al. 2018):
//
//   factor
//     1.0 ┤──────────╮
//         │           ╲
//     r   ┤            ╰──────────
//         └──────┬─────┬──────────▶ t = epoch / swa_start
//               0.5   0.9
//
//   r = swa_lr / lr_init when SWA is on, 0.01 otherwise.
//
// Reference: Burn Book §5 (Optimizers)

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::backend::AutodiffBackend,
    LearningRate,
};
use serde::{Deserialize, Serialize};

/// An optimiser plus the learning rate shared by all of its
/// parameter groups.
pub struct LrOptimizer<O> {
    inner: O,
    lr:    LearningRate,
}

impl<O> LrOptimizer<O> {
    pub fn new(inner: O, lr: LearningRate) -> Self {
        Self { inner, lr }
    }

    pub fn lr(&self) -> LearningRate {
        self.lr
    }

    /// One update of `model` at the current learning rate
    pub fn step<B, M>(&mut self, model: M, grads: GradientsParams) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.inner.step(self.lr, model, grads)
    }

    pub fn to_record<B, M>(&self) -> O::Record
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.inner.to_record()
    }

    /// Restore momentum buffers etc. from a checkpoint
    pub fn load_record<B, M>(self, record: O::Record) -> Self
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        Self { inner: self.inner.load_record(record), lr: self.lr }
    }
}

/// Set the learning rate of every parameter group and return it.
pub fn adjust_learning_rate<O>(optimizer: &mut LrOptimizer<O>, lr: LearningRate) -> LearningRate {
    optimizer.lr = lr;
    lr
}

/// Inputs of the SWA learning-rate schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub lr_init: f64,
    pub epochs:  usize,
    /// (swa_start, swa_lr) when SWA is enabled
    pub swa:     Option<(usize, f64)>,
}

/// Learning rate for `epoch` (0-based).
pub fn swa_learning_rate(epoch: usize, schedule: &LrSchedule) -> f64 {
    let (t, lr_ratio) = match schedule.swa {
        Some((swa_start, swa_lr)) => (
            epoch as f64 / swa_start.max(1) as f64,
            swa_lr / schedule.lr_init,
        ),
        None => (epoch as f64 / schedule.epochs.max(1) as f64, 0.01),
    };

    let factor = if t <= 0.5 {
        1.0
    } else if t <= 0.9 {
        1.0 - (1.0 - lr_ratio) * (t - 0.5) / 0.4
    } else {
        lr_ratio
    };

    schedule.lr_init * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_adjust_learning_rate_returns_new_rate() {
        let mut opt = LrOptimizer::new((), 0.1);
        assert_eq!(adjust_learning_rate(&mut opt, 0.025), 0.025);
        assert_eq!(opt.lr(), 0.025);
    }

    #[test]
    fn test_swa_schedule_phases() {
        let schedule = LrSchedule { lr_init: 0.1, epochs: 300, swa: Some((200, 0.01)) };

        // flat phase
        assert!(close(swa_learning_rate(0, &schedule), 0.1));
        assert!(close(swa_learning_rate(100, &schedule), 0.1));
        // halfway through the decay: t = 0.7
        assert!(close(swa_learning_rate(140, &schedule), 0.1 * (1.0 - 0.9 * 0.5)));
        // t = 0.9 lands on the ratio
        assert!(close(swa_learning_rate(180, &schedule), 0.01));
        // constant SWA phase
        assert!(close(swa_learning_rate(250, &schedule), 0.01));
    }

    #[test]
    fn test_schedule_without_swa_decays_to_one_percent() {
        let schedule = LrSchedule { lr_init: 0.05, epochs: 100, swa: None };
        assert!(close(swa_learning_rate(10, &schedule), 0.05));
        assert!(close(swa_learning_rate(95, &schedule), 0.0005));
    }
}
