// ============================================================
// Layer 4 — Image Batcher
// ============================================================
// Implements Burn's Batcher trait to convert a Vec<ImageItem>
// into device tensors.
//
// How batching works here:
//   Input:  Vec of N ImageItems, each with C*H*W values
//   Output: ImageBatch with images [N, C, H, W], targets [N]
//
//   All values are flattened into one Vec and reshaped once,
//   which is a single host → device copy per batch.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::dataset::ImageItem;

// ─── ImageBatch ───────────────────────────────────────────────────────────────
/// A batch of labelled images ready for the forward pass.
#[derive(Debug, Clone)]
pub struct ImageBatch<B: Backend> {
    /// shape: [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,

    /// Class indices, shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

// ─── ImageBatcher ─────────────────────────────────────────────────────────────
/// Holds the target device so tensors are created on the right GPU/CPU.
#[derive(Clone, Debug)]
pub struct ImageBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> ImageBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<ImageItem, ImageBatch<B>> for ImageBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ImageBatch<B> {
        let batch_size = items.len();
        // Every item in a dataset shares one shape
        let shape      = items[0].shape;

        let values: Vec<f32> = items
            .iter()
            .flat_map(|item| item.values.iter().copied())
            .collect();

        let labels: Vec<i32> = items
            .iter()
            .map(|item| item.label as i32)
            .collect();

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(values, [batch_size, shape.channels, shape.height, shape.width]),
            &self.device,
        );

        let targets = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        ImageBatch { images, targets }
    }
}
