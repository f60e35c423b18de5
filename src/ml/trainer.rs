// ============================================================
// Layer 5 — Training Loop
// ============================================================
// train_epoch → one pass over the training loader:
//     forward → loss → backward → (quantise grads) → SGD step
//     → (quantise weights)
// eval        → one pass with no gradient tracking
//
// Both return the sample-weighted mean loss and the top-1
// accuracy in percent.
//
// Key Burn insight:
//   - Training uses Autodiff<Backend>, where BatchNorm uses batch
//     statistics and updates its running buffers
//   - model.valid() returns the model on the inner backend: BN
//     uses its running buffers and no graph is recorded, which is
//     exactly eval() + no_grad
//   - argmax(1) returns [batch,1] so we flatten before .equal()
//
// run_training drives the full low-precision SWA schedule on
// top of these helpers.
//
// Reference: Burn Book §5, Yang et al. (2019) SWALP

use std::time::Instant;

use anyhow::Result;
use burn::{
    backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu},
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::{BackendKind, TrainConfig};
use crate::data::{
    batcher::{ImageBatch, ImageBatcher},
    dataset::ImageDataset,
};
use crate::domain::traits::ScalarWriter;
use crate::infra::checkpoint::{load_checkpoint, save_checkpoint, Checkpoint, CheckpointManager};
use crate::infra::metrics::{EpochMetrics, MetricsLogger, ScalarLogger};
use crate::ml::bn::bn_update;
use crate::ml::model::VggNet;
use crate::ml::optim::{adjust_learning_rate, swa_learning_rate, LrOptimizer};
use crate::ml::quantizer::{quantize_gradients, quantize_weights, LowPrecision, QuantScope, Quantizer};
use crate::ml::swa::SwaAverage;
use crate::ml::traits::{Classifier, NamedParameters};

/// Mean loss and top-1 accuracy (percent) over one pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub loss:     f64,
    pub accuracy: f64,
}

impl EpochStats {
    fn from_totals(loss_sum: f64, correct: usize, total: usize) -> Result<Self> {
        anyhow::ensure!(total > 0, "loader produced no samples");
        Ok(Self {
            loss:     loss_sum / total as f64,
            accuracy: correct as f64 / total as f64 * 100.0,
        })
    }
}

/// Cross-entropy over class logits, the default criterion
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    CrossEntropyLossConfig::new()
        .init(&logits.device())
        .forward(logits, targets)
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    // [batch, 1] → [batch]
    let predictions = logits.argmax(1).flatten::<1>(0, 1);
    predictions
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// One training epoch.
///
/// Quantisers apply only to parameters `scope` selects. With
/// `log_error` set, the weight quantiser's per-parameter MSE on
/// the first batch is written as `param-quantize_error/<name>`
/// at step `epoch`.
#[allow(clippy::too_many_arguments)]
pub fn train_epoch<B, M, O, Q, C>(
    loader:           impl Iterator<Item = ImageBatch<B>>,
    model:            M,
    criterion:        &C,
    optimizer:        &mut LrOptimizer<O>,
    weight_quantizer: Option<&Q>,
    grad_quantizer:   Option<&Q>,
    writer:           &mut dyn ScalarWriter,
    epoch:            usize,
    scope:            QuantScope,
    log_error:        bool,
) -> Result<(M, EpochStats)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B> + NamedParameters,
    O: Optimizer<M, B>,
    Q: Quantizer<B::InnerBackend>,
    C: Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1>,
{
    let targets = scope.select(&model);
    let mut model = model;

    let mut loss_sum = 0.0f64;
    let mut correct  = 0usize;
    let mut total    = 0usize;

    for (i, batch) in loader.enumerate() {
        let batch_size = batch.batch_size();

        let output = model.forward(batch.images);
        let loss   = criterion(output.clone(), batch.targets.clone());

        let loss_val: f64 = loss.clone().into_scalar().elem::<f64>();
        loss_sum += loss_val * batch_size as f64;
        correct  += count_correct(output, batch.targets);
        total    += batch_size;

        let grads     = loss.backward();
        let mut grads = GradientsParams::from_grads(grads, &model);

        if let Some(q) = grad_quantizer {
            quantize_gradients::<B, M, Q>(&model, &mut grads, &targets, q);
        }

        model = optimizer.step::<B, M>(model, grads);

        if let Some(q) = weight_quantizer {
            if log_error && i == 0 {
                let mut errors = Vec::new();
                model = quantize_weights::<B, M, Q>(model, &targets, q, Some(&mut errors));
                for (name, mse) in errors {
                    writer.add_scalar(&format!("param-quantize_error/{name}"), mse, epoch)?;
                }
            } else {
                model = quantize_weights::<B, M, Q>(model, &targets, q, None);
            }
        }
    }

    let stats = EpochStats::from_totals(loss_sum, correct, total)?;
    tracing::debug!(
        "train epoch {}: {} samples, loss={:.4}, acc={:.2}%",
        epoch, total, stats.loss, stats.accuracy
    );
    Ok((model, stats))
}

/// Evaluate without gradients.
///
/// Pass `model.valid()` and an inner-backend loader to get
/// eval-mode BatchNorm.
pub fn eval<B, M, C>(
    loader:    impl Iterator<Item = ImageBatch<B>>,
    model:     &M,
    criterion: &C,
) -> Result<EpochStats>
where
    B: Backend,
    M: Classifier<B>,
    C: Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1>,
{
    let mut loss_sum = 0.0f64;
    let mut correct  = 0usize;
    let mut total    = 0usize;

    for batch in loader {
        let batch_size = batch.batch_size();
        let output     = model.forward(batch.images);
        let loss       = criterion(output.clone(), batch.targets.clone());

        loss_sum += loss.into_scalar().elem::<f64>() * batch_size as f64;
        correct  += count_correct(output, batch.targets);
        total    += batch_size;
    }

    EpochStats::from_totals(loss_sum, correct, total)
}

// ─── Full training run ────────────────────────────────────────────────────────

pub fn run_training(
    cfg:           &TrainConfig,
    train_dataset: ImageDataset,
    test_dataset:  ImageDataset,
    num_classes:   usize,
    ckpt_manager:  CheckpointManager,
) -> Result<()> {
    match cfg.backend {
        BackendKind::Wgpu => {
            let device = WgpuDevice::default();
            tracing::info!("Using WGPU device: {:?}", device);
            train_loop::<Autodiff<Wgpu>>(cfg, train_dataset, test_dataset, num_classes, ckpt_manager, device)
        }
        BackendKind::Ndarray => {
            tracing::info!("Using NdArray CPU backend");
            train_loop::<Autodiff<NdArray>>(
                cfg, train_dataset, test_dataset, num_classes, ckpt_manager, NdArrayDevice::Cpu,
            )
        }
    }
}

fn train_loop<B: AutodiffBackend>(
    cfg:           &TrainConfig,
    train_dataset: ImageDataset,
    test_dataset:  ImageDataset,
    num_classes:   usize,
    ckpt_manager:  CheckpointManager,
    device:        B::Device,
) -> Result<()> {
    // ── Model, SWA accumulator, optimiser ─────────────────────────────────────
    let model_cfg = cfg.model_config(num_classes);
    let mut model: VggNet<B> = model_cfg.init(&device);
    let mut swa = cfg.swa.then(|| SwaAverage::new(model_cfg.init::<B>(&device)));
    tracing::info!(
        "Model ready: {} conv layers, {} parameter tensors",
        model.features.len(),
        model.named_parameters().len()
    );

    let sgd = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(cfg.momentum)
                .with_dampening(0.0),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(cfg.wd as f32)));
    let mut optimizer = LrOptimizer::new(sgd.init::<B, VggNet<B>>(), cfg.lr_init);

    // ── Quantisers ────────────────────────────────────────────────────────────
    let weight_quantizer = LowPrecision::from_word_length(
        cfg.quant_type, cfg.wl_weight, cfg.fl_weight, cfg.rounding,
    );
    let grad_quantizer = LowPrecision::from_word_length(
        cfg.quant_type, cfg.wl_grad, cfg.fl_grad, cfg.rounding,
    );
    let scope = QuantScope { quant_bias: cfg.quant_bias, quant_bn: cfg.quant_bn };
    tracing::info!("Weight quantiser: {:?}", weight_quantizer);
    tracing::info!("Gradient quantiser: {:?}", grad_quantizer);

    // ── Resume ────────────────────────────────────────────────────────────────
    let mut start_epoch = 0;
    if let Some(path) = &cfg.resume {
        let ckpt = load_checkpoint(path)?;
        start_epoch = ckpt.epoch();
        model = ckpt.load_module::<B, _>("state_dict", model, &device)?;
        optimizer = optimizer.load_record::<B, VggNet<B>>(ckpt.load_record::<B, _>("optimizer", &device)?);
        if let Some(avg) = swa.as_mut() {
            if ckpt.has("swa_state_dict") {
                let n: usize = ckpt.value("swa_n")?;
                let swa_model = ckpt.load_module::<B, _>("swa_state_dict", avg.model().clone(), &device)?;
                *avg = SwaAverage::from_parts(swa_model, n);
            }
        }
        tracing::info!("Resumed from '{}' at epoch {}", path, start_epoch);
    }

    // ── Data loaders ──────────────────────────────────────────────────────────
    // Training / BN refresh run on the autodiff backend,
    // evaluation on the inner backend (no autodiff overhead)
    let train_loader = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
        .batch_size(cfg.batch_size)
        .shuffle(cfg.seed)
        .num_workers(cfg.num_workers)
        .build(train_dataset);

    let test_loader = DataLoaderBuilder::new(ImageBatcher::<B::InnerBackend>::new(device.clone()))
        .batch_size(cfg.batch_size)
        .num_workers(cfg.num_workers)
        .build(test_dataset);

    let metrics_log     = MetricsLogger::new(&cfg.checkpoint_dir)?;
    let mut scalars     = ScalarLogger::new(&cfg.checkpoint_dir)?;
    let schedule        = cfg.lr_schedule();

    println!("{}", EpochMetrics::table_header());

    // ── Epoch loop ────────────────────────────────────────────────────────────
    for epoch in start_epoch..cfg.epochs {
        let started = Instant::now();

        let lr = adjust_learning_rate(&mut optimizer, swa_learning_rate(epoch, &schedule));
        let (trained, train_res) = train_epoch(
            train_loader.iter(),
            model,
            &cross_entropy::<B>,
            &mut optimizer,
            weight_quantizer.as_ref(),
            grad_quantizer.as_ref(),
            &mut scalars,
            epoch,
            scope,
            cfg.log_error,
        )?;
        model = trained;

        let eval_now = is_eval_epoch(epoch, cfg.epochs, cfg.eval_freq);

        let test_res = if eval_now {
            Some(eval(test_loader.iter(), &model.valid(), &cross_entropy::<B::InnerBackend>)?)
        } else {
            None
        };

        let mut swa_res = None;
        if let Some(avg) = swa.as_mut() {
            if is_swa_epoch(epoch, cfg.swa_start, cfg.swa_c_epochs) {
                avg.update::<B>(&model)?;
                if eval_now {
                    bn_update(train_loader.iter(), avg.model_mut());
                    swa_res = Some(eval(
                        test_loader.iter(),
                        &avg.model().valid(),
                        &cross_entropy::<B::InnerBackend>,
                    )?);
                }
            }
        }

        if is_save_epoch(epoch, cfg.save_freq) {
            save_state(&ckpt_manager, epoch + 1, &model, swa.as_ref(), &optimizer)?;
        }

        let row = EpochMetrics {
            epoch:    epoch + 1,
            lr,
            train:    train_res,
            test:     test_res,
            swa_test: swa_res,
            seconds:  started.elapsed().as_secs_f64(),
        };
        println!("{}", row.table_row());
        metrics_log.log(&row)?;
    }

    if needs_final_save(cfg.epochs, cfg.save_freq) {
        save_state(&ckpt_manager, cfg.epochs, &model, swa.as_ref(), &optimizer)?;
    }

    tracing::info!("Training complete!");
    Ok(())
}

// ─── Epoch schedule ──────────────────────────────────────────────────────────

/// Evaluate on the first epoch, every `eval_freq`-th epoch and the last one.
fn is_eval_epoch(epoch: usize, epochs: usize, eval_freq: usize) -> bool {
    epoch == 0 || epoch % eval_freq == eval_freq - 1 || epoch + 1 == epochs
}

/// SWA averages after `swa_start` completed epochs, then every `swa_c_epochs`.
fn is_swa_epoch(epoch: usize, swa_start: usize, swa_c_epochs: usize) -> bool {
    epoch + 1 >= swa_start && (epoch + 1 - swa_start) % swa_c_epochs == 0
}

fn is_save_epoch(epoch: usize, save_freq: usize) -> bool {
    (epoch + 1) % save_freq == 0
}

/// The last periodic save missed the final epoch
fn needs_final_save(epochs: usize, save_freq: usize) -> bool {
    epochs % save_freq != 0
}

// ─── Checkpoint evaluation ────────────────────────────────────────────────────

/// Evaluate the module stored under `key` in `checkpoint`.
/// With `refresh_bn`, BN statistics are recomputed on the
/// training set first (needed for an SWA model saved between
/// evaluations).
pub fn run_evaluation(
    cfg:           &TrainConfig,
    checkpoint:    &Checkpoint,
    key:           &str,
    refresh_bn:    bool,
    train_dataset: ImageDataset,
    test_dataset:  ImageDataset,
    num_classes:   usize,
) -> Result<EpochStats> {
    match cfg.backend {
        BackendKind::Wgpu => eval_checkpoint::<Autodiff<Wgpu>>(
            cfg, checkpoint, key, refresh_bn, train_dataset, test_dataset, num_classes,
            WgpuDevice::default(),
        ),
        BackendKind::Ndarray => eval_checkpoint::<Autodiff<NdArray>>(
            cfg, checkpoint, key, refresh_bn, train_dataset, test_dataset, num_classes,
            NdArrayDevice::Cpu,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn eval_checkpoint<B: AutodiffBackend>(
    cfg:           &TrainConfig,
    checkpoint:    &Checkpoint,
    key:           &str,
    refresh_bn:    bool,
    train_dataset: ImageDataset,
    test_dataset:  ImageDataset,
    num_classes:   usize,
    device:        B::Device,
) -> Result<EpochStats> {
    let model: VggNet<B> = cfg.model_config(num_classes).init(&device);
    let mut model = checkpoint.load_module::<B, _>(key, model, &device)?;
    tracing::info!("Loaded '{}' from checkpoint epoch {}", key, checkpoint.epoch());

    if refresh_bn {
        let train_loader = DataLoaderBuilder::new(ImageBatcher::<B>::new(device.clone()))
            .batch_size(cfg.batch_size)
            .shuffle(cfg.seed)
            .num_workers(cfg.num_workers)
            .build(train_dataset);
        bn_update(train_loader.iter(), &mut model);
    }

    let test_loader = DataLoaderBuilder::new(ImageBatcher::<B::InnerBackend>::new(device))
        .batch_size(cfg.batch_size)
        .num_workers(cfg.num_workers)
        .build(test_dataset);

    eval(test_loader.iter(), &model.valid(), &cross_entropy::<B::InnerBackend>)
}

/// checkpoint-<epoch> with state_dict, optimizer and, when SWA is
/// on, swa_state_dict + swa_n
fn save_state<B, O>(
    ckpt_manager: &CheckpointManager,
    epoch:        usize,
    model:        &VggNet<B>,
    swa:          Option<&SwaAverage<VggNet<B>>>,
    optimizer:    &LrOptimizer<O>,
) -> Result<()>
where
    B: AutodiffBackend,
    O: Optimizer<VggNet<B>, B>,
{
    let path = save_checkpoint(ckpt_manager.dir(), epoch, |w| {
        let w = w
            .module::<B, _>("state_dict", model)?
            .record::<B, _>("optimizer", optimizer.to_record::<B, VggNet<B>>())?;
        match swa {
            Some(avg) => w
                .module::<B, _>("swa_state_dict", avg.model())?
                .value("swa_n", &avg.n()),
            None => Ok(w),
        }
    })?;
    tracing::info!("Checkpoint saved to '{}'", path.display());
    Ok(())
}
