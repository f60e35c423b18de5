// ============================================================
// Layer 3 — Labelled Image Domain Type
// ============================================================
// Represents a single labelled image exactly as it was read
// from disk: raw 8-bit pixels in channel-major (CHW) order
// plus the class index.
//
// Conversion to floats, normalisation and augmentation all
// happen later in the data layer, so this type stays cheap
// to clone and easy to test.
//
// CHW layout for a 3x32x32 CIFAR image:
//   [R(0,0) .. R(31,31), G(0,0) .. G(31,31), B(0,0) .. B(31,31)]

use serde::{Deserialize, Serialize};

/// Channel / height / width of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height:   usize,
    pub width:    usize,
}

impl ImageShape {
    /// The 3x32x32 layout shared by CIFAR-10 and CIFAR-100
    pub const CIFAR: ImageShape = ImageShape { channels: 3, height: 32, width: 32 };

    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self { channels, height, width }
    }

    /// Number of values in one image
    pub fn numel(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Number of values in one channel plane
    pub fn plane(&self) -> usize {
        self.height * self.width
    }
}

/// One labelled image as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSample {
    /// Raw pixels in CHW order, length == shape.numel()
    pub pixels: Vec<u8>,

    /// Class index in [0, num_classes)
    pub label: usize,

    pub shape: ImageShape,
}

impl ImageSample {
    pub fn new(pixels: Vec<u8>, label: usize, shape: ImageShape) -> Self {
        Self { pixels, label, shape }
    }

    /// Pixel value at (channel, row, col)
    pub fn pixel(&self, c: usize, y: usize, x: usize) -> u8 {
        self.pixels[c * self.shape.plane() + y * self.shape.width + x]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_indexing_is_chw() {
        let shape  = ImageShape::new(2, 2, 3);
        let pixels = (0..12u8).collect();
        let img    = ImageSample::new(pixels, 1, shape);

        assert_eq!(img.pixel(0, 0, 0), 0);
        assert_eq!(img.pixel(0, 1, 2), 5);
        assert_eq!(img.pixel(1, 0, 0), 6);
        assert_eq!(img.pixel(1, 1, 1), 10);
    }

    #[test]
    fn test_cifar_numel() {
        assert_eq!(ImageShape::CIFAR.numel(), 3072);
    }
}
