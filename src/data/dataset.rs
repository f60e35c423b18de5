use burn::data::dataset::Dataset;
use serde::{Deserialize, Serialize};

use crate::data::preprocessor::Preprocessor;
use crate::domain::image::{ImageSample, ImageShape};

/// One preprocessed image, ready to be stacked into a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageItem {
    /// Normalised CHW values
    pub values: Vec<f32>,
    pub label:  usize,
    pub shape:  ImageShape,
}

/// Raw samples plus the preprocessing applied on every `get`.
/// With augmentation enabled each access draws a fresh crop/flip.
pub struct ImageDataset {
    samples:      Vec<ImageSample>,
    preprocessor: Preprocessor,
}

impl ImageDataset {
    pub fn new(samples: Vec<ImageSample>, preprocessor: Preprocessor) -> Self {
        Self { samples, preprocessor }
    }
}

impl Dataset<ImageItem> for ImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.samples.get(index).map(|s| ImageItem {
            values: self.preprocessor.process(s),
            label:  s.label,
            shape:  s.shape,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::preprocessor::Normalization;

    #[test]
    fn test_get_preprocesses_sample() {
        let shape   = ImageShape::new(1, 1, 2);
        let samples = vec![ImageSample::new(vec![0, 255], 3, shape)];
        let ds      = ImageDataset::new(samples, Preprocessor::new(Normalization::identity(1)));

        let item = ds.get(0).unwrap();
        assert_eq!(item.values, vec![0.0, 1.0]);
        assert_eq!(item.label, 3);
        assert!(ds.get(1).is_none());
        assert_eq!(ds.len(), 1);
    }
}
