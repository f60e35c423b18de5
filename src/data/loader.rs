// ============================================================
// Layer 4 — CIFAR Binary Loader
// ============================================================
// Loads CIFAR-10 / CIFAR-100 from the official "binary version"
// archives (the .bin files, not the python pickles).
//
// Record layout (fixed size, no header):
//
//   CIFAR-10:   <1 x label byte> <3072 x pixel bytes>
//   CIFAR-100:  <1 x coarse label> <1 x fine label> <3072 x pixel bytes>
//
// The 3072 pixel bytes are three 32x32 planes (R, G, B), so
// they are already in the CHW order the model consumes.
//
// Expected file names inside the data directory (the extracted
// archive folder may also sit one level below it):
//
//   cifar-10-batches-bin/data_batch_{1..5}.bin, test_batch.bin
//   cifar-100-binary/train.bin, test.bin
//
// Reference: https://www.cs.toronto.edu/~kriz/cifar.html
//            Rust Book §9 (Error Handling)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::domain::image::{ImageSample, ImageShape};
use crate::domain::traits::ImageSource;

/// Which CIFAR flavour is on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum CifarVariant {
    Cifar10,
    Cifar100,
}

impl CifarVariant {
    /// Label bytes at the start of each record
    pub fn label_bytes(&self) -> usize {
        match self {
            CifarVariant::Cifar10  => 1,
            CifarVariant::Cifar100 => 2,
        }
    }

    /// Total bytes per record (labels + pixels)
    pub fn record_len(&self) -> usize {
        self.label_bytes() + ImageShape::CIFAR.numel()
    }

    pub fn num_classes(&self) -> usize {
        match self {
            CifarVariant::Cifar10  => 10,
            CifarVariant::Cifar100 => 100,
        }
    }

    fn archive_dir(&self) -> &'static str {
        match self {
            CifarVariant::Cifar10  => "cifar-10-batches-bin",
            CifarVariant::Cifar100 => "cifar-100-binary",
        }
    }

    fn train_files(&self) -> Vec<String> {
        match self {
            CifarVariant::Cifar10  => (1..=5).map(|i| format!("data_batch_{i}.bin")).collect(),
            CifarVariant::Cifar100 => vec!["train.bin".to_string()],
        }
    }

    fn test_files(&self) -> Vec<String> {
        match self {
            CifarVariant::Cifar10  => vec!["test_batch.bin".to_string()],
            CifarVariant::Cifar100 => vec!["test.bin".to_string()],
        }
    }
}

/// Loads CIFAR records from a directory of .bin files.
/// Implements the ImageSource trait from Layer 3.
pub struct CifarLoader {
    dir:     PathBuf,
    variant: CifarVariant,
}

impl CifarLoader {
    /// Point the loader at a data directory.
    /// If the extracted archive folder exists inside `dir`,
    /// that folder is used instead.
    pub fn new(dir: impl Into<PathBuf>, variant: CifarVariant) -> Self {
        let dir: PathBuf = dir.into();
        let nested = dir.join(variant.archive_dir());
        let dir = if nested.is_dir() { nested } else { dir };
        Self { dir, variant }
    }

    pub fn variant(&self) -> CifarVariant {
        self.variant
    }

    fn load_files(&self, files: &[String]) -> Result<Vec<ImageSample>> {
        let mut samples = Vec::new();
        for name in files {
            let path = self.dir.join(name);
            let batch = load_batch_file(&path, self.variant)?;
            tracing::debug!("Loaded {} images from '{}'", batch.len(), path.display());
            samples.extend(batch);
        }
        Ok(samples)
    }
}

impl ImageSource for CifarLoader {
    fn load_train(&self) -> Result<Vec<ImageSample>> {
        let samples = self.load_files(&self.variant.train_files())?;
        tracing::info!("Loaded {} training images from '{}'", samples.len(), self.dir.display());
        Ok(samples)
    }

    fn load_test(&self) -> Result<Vec<ImageSample>> {
        let samples = self.load_files(&self.variant.test_files())?;
        tracing::info!("Loaded {} test images from '{}'", samples.len(), self.dir.display());
        Ok(samples)
    }

    fn num_classes(&self) -> usize {
        self.variant.num_classes()
    }
}

/// Read one .bin file and decode every record in it.
fn load_batch_file(path: &Path, variant: CifarVariant) -> Result<Vec<ImageSample>> {
    let bytes = fs::read(path)
        .with_context(|| format!("Cannot read CIFAR batch '{}'", path.display()))?;
    parse_records(&bytes, variant)
        .with_context(|| format!("Malformed CIFAR batch '{}'", path.display()))
}

/// Decode a buffer of fixed-size CIFAR records.
///
/// For CIFAR-100 the fine label (second byte) is used.
pub fn parse_records(bytes: &[u8], variant: CifarVariant) -> Result<Vec<ImageSample>> {
    let record_len = variant.record_len();
    anyhow::ensure!(
        bytes.len() % record_len == 0,
        "buffer length {} is not a multiple of the {}-byte record size",
        bytes.len(),
        record_len
    );

    let label_bytes = variant.label_bytes();
    let num_classes = variant.num_classes();

    bytes
        .chunks_exact(record_len)
        .enumerate()
        .map(|(i, record)| {
            let label = record[label_bytes - 1] as usize;
            anyhow::ensure!(
                label < num_classes,
                "record {i} has label {label}, expected < {num_classes}"
            );
            Ok(ImageSample::new(
                record[label_bytes..].to_vec(),
                label,
                ImageShape::CIFAR,
            ))
        })
        .collect()
}
