// ============================================================
// Layer 4 — Image Preprocessor
// ============================================================
// Turns a raw ImageSample into the float values the model sees.
//
// Steps (applied in order):
//   1. (train only) random crop with zero padding
//   2. (train only) random horizontal flip
//   3. Scale u8 → [0, 1]
//   4. Per-channel normalisation: (x - mean[c]) / std[c]
//
// Augmentation works on the raw u8 pixels so padded
// positions are black (0) before normalisation.
//
// Reference: rand crate documentation

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::data::loader::CifarVariant;
use crate::domain::image::ImageSample;

/// Per-channel mean / std used for normalisation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: Vec<f32>,
    pub std:  Vec<f32>,
}

impl Normalization {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }

    /// Channel statistics for the given dataset
    pub fn for_variant(variant: CifarVariant) -> Self {
        match variant {
            CifarVariant::Cifar10 => Self::new(
                vec![0.4914, 0.4822, 0.4465],
                vec![0.2023, 0.1994, 0.2010],
            ),
            CifarVariant::Cifar100 => Self::new(
                vec![0.5071, 0.4865, 0.4409],
                vec![0.2673, 0.2564, 0.2762],
            ),
        }
    }

    /// mean = 0, std = 1: pixels are only scaled to [0, 1]
    pub fn identity(channels: usize) -> Self {
        Self::new(vec![0.0; channels], vec![1.0; channels])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocessor {
    norm:    Normalization,
    augment: bool,
    padding: usize,
}

impl Preprocessor {
    /// Evaluation-time preprocessor: normalisation only
    pub fn new(norm: Normalization) -> Self {
        Self { norm, augment: false, padding: 0 }
    }

    /// Training-time preprocessor: crop + flip + normalisation
    pub fn with_augmentation(norm: Normalization, padding: usize) -> Self {
        Self { norm, augment: true, padding }
    }

    /// Full pipeline for one sample → normalised CHW floats.
    pub fn process(&self, img: &ImageSample) -> Vec<f32> {
        if self.augment {
            let augmented = self.augment_with(img, &mut rand::thread_rng());
            self.normalize(&augmented)
        } else {
            self.normalize(img)
        }
    }

    /// Scale to [0, 1] and normalise each channel plane.
    pub fn normalize(&self, img: &ImageSample) -> Vec<f32> {
        let plane = img.shape.plane();
        img.pixels
            .iter()
            .enumerate()
            .map(|(i, &p)| {
                let c = i / plane;
                (p as f32 / 255.0 - self.norm.mean[c]) / self.norm.std[c]
            })
            .collect()
    }

    /// Random crop (after zero padding) followed by a coin-flip
    /// horizontal mirror. Output has the same shape as the input.
    pub fn augment_with<R: Rng>(&self, img: &ImageSample, rng: &mut R) -> ImageSample {
        let shape = img.shape;
        let pad   = self.padding as isize;

        // Offset of the crop window inside the padded image, minus the padding
        let dy = rng.gen_range(0..=2 * pad) - pad;
        let dx = rng.gen_range(0..=2 * pad) - pad;
        let flip = rng.gen_bool(0.5);

        let mut out = vec![0u8; shape.numel()];
        for c in 0..shape.channels {
            for y in 0..shape.height {
                let sy = y as isize + dy;
                if sy < 0 || sy >= shape.height as isize {
                    continue;
                }
                for x in 0..shape.width {
                    let sx = x as isize + dx;
                    if sx < 0 || sx >= shape.width as isize {
                        continue;
                    }
                    let ox = if flip { shape.width - 1 - x } else { x };
                    out[c * shape.plane() + y * shape.width + ox] =
                        img.pixel(c, sy as usize, sx as usize);
                }
            }
        }

        ImageSample::new(out, img.label, shape)
    }
}
