// ============================================================
// Layer 6 — Metrics Logging
// ============================================================
// Two CSV files in the checkpoint directory:
//
//   metrics.csv — one row per epoch
//     epoch,lr,train_loss,train_acc,test_loss,test_acc,swa_loss,swa_acc,time
//     1,0.050000,1.912345,29.814000,1.612345,41.020000,,,38.21
//     2,0.050000,1.512345,44.210000,,,,,37.90
//   Test / SWA columns are empty on epochs that were not evaluated.
//
//   scalars.csv — free-form tagged scalars (ScalarWriter)
//     tag,step,value
//     param-quantize_error/features.0.conv.weight,0,0.000012
//
// Both files append across runs, so a resumed run continues the
// same log.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use serde::{Deserialize, Serialize};

use crate::domain::traits::ScalarWriter;
use crate::ml::trainer::EpochStats;

/// One row of metrics data for a single training epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// The epoch number (starts at 1)
    pub epoch: usize,

    /// Learning rate used for this epoch
    pub lr: f64,

    pub train: EpochStats,

    /// None on epochs without evaluation
    pub test: Option<EpochStats>,

    /// SWA model on the test set, when it was evaluated
    pub swa_test: Option<EpochStats>,

    /// Wall-clock seconds for the epoch
    pub seconds: f64,
}

fn cell(value: Option<f64>, precision: usize) -> String {
    value.map(|v| format!("{v:.precision$}")).unwrap_or_default()
}

impl EpochMetrics {
    pub fn table_header() -> String {
        format!(
            "{:>5} {:>9} {:>9} {:>8} {:>9} {:>8} {:>9} {:>8} {:>8}",
            "ep", "lr", "tr_loss", "tr_acc", "te_loss", "te_acc", "swa_loss", "swa_acc", "time"
        )
    }

    /// Aligned with table_header(); blanks where nothing was measured
    pub fn table_row(&self) -> String {
        format!(
            "{:>5} {:>9.4} {:>9.4} {:>8.2} {:>9} {:>8} {:>9} {:>8} {:>8.2}",
            self.epoch,
            self.lr,
            self.train.loss,
            self.train.accuracy,
            cell(self.test.map(|s| s.loss), 4),
            cell(self.test.map(|s| s.accuracy), 2),
            cell(self.swa_test.map(|s| s.loss), 4),
            cell(self.swa_test.map(|s| s.accuracy), 2),
            self.seconds,
        )
    }

    fn csv_row(&self) -> String {
        format!(
            "{},{:.6},{:.6},{:.6},{},{},{},{},{:.2}",
            self.epoch,
            self.lr,
            self.train.loss,
            self.train.accuracy,
            cell(self.test.map(|s| s.loss), 6),
            cell(self.test.map(|s| s.accuracy), 6),
            cell(self.swa_test.map(|s| s.loss), 6),
            cell(self.swa_test.map(|s| s.accuracy), 6),
            self.seconds,
        )
    }
}

/// Create `dir/name` with `header` unless it already exists
fn open_csv(dir: &Path, name: &str, header: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let csv_path = dir.join(name);

    if !csv_path.exists() {
        let mut f = fs::File::create(&csv_path)
            .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
        writeln!(f, "{header}")?;
        tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
    }

    Ok(csv_path)
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot append to '{}'", path.display()))?;
    writeln!(f, "{line}")?;
    Ok(())
}

/// Logs epoch metrics to metrics.csv.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let csv_path = open_csv(
            dir.as_ref(),
            "metrics.csv",
            "epoch,lr,train_loss,train_acc,test_loss,test_acc,swa_loss,swa_acc,time",
        )?;
        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        append_line(&self.csv_path, &m.csv_row())?;
        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, train_acc={:.2}",
            m.epoch,
            m.train.loss,
            m.train.accuracy,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

/// ScalarWriter backed by scalars.csv
pub struct ScalarLogger {
    csv_path: PathBuf,
}

impl ScalarLogger {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let csv_path = open_csv(dir.as_ref(), "scalars.csv", "tag,step,value")?;
        Ok(Self { csv_path })
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

impl ScalarWriter for ScalarLogger {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        anyhow::ensure!(!tag.contains(',') && !tag.contains('\n'), "invalid scalar tag '{tag}'");
        append_line(&self.csv_path, &format!("{tag},{step},{value:.6e}"))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn row(epoch: usize, test: Option<EpochStats>) -> EpochMetrics {
        EpochMetrics {
            epoch,
            lr:       0.05,
            train:    EpochStats { loss: 1.5, accuracy: 40.0 },
            test,
            swa_test: None,
            seconds:  12.5,
        }
    }

    #[test]
    fn test_metrics_csv_appends_with_single_header() {
        let tmp = tempfile::tempdir().unwrap();

        let logger = MetricsLogger::new(tmp.path()).unwrap();
        logger.log(&row(1, Some(EpochStats { loss: 1.25, accuracy: 55.0 }))).unwrap();

        // a second logger (resumed run) must not rewrite the header
        let logger = MetricsLogger::new(tmp.path()).unwrap();
        logger.log(&row(2, None)).unwrap();

        let text  = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,lr,"));
        assert_eq!(lines[1], "1,0.050000,1.500000,40.000000,1.250000,55.000000,,,12.50");
        assert_eq!(lines[2], "2,0.050000,1.500000,40.000000,,,,,12.50");
    }

    #[test]
    fn test_table_row_matches_header_width() {
        let header = EpochMetrics::table_header();
        let full   = row(3, Some(EpochStats { loss: 0.5, accuracy: 90.0 }));
        let blank  = row(4, None);
        assert_eq!(full.table_row().len(), header.len());
        assert_eq!(blank.table_row().len(), header.len());
    }

    #[test]
    fn test_scalar_logger_writes_tagged_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let mut scalars = ScalarLogger::new(tmp.path()).unwrap();
        scalars.add_scalar("param-quantize_error/classifier.weight", 0.25, 3).unwrap();
        assert!(scalars.add_scalar("bad,tag", 1.0, 0).is_err());

        let text = fs::read_to_string(scalars.csv_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["tag,step,value", "param-quantize_error/classifier.weight,3,2.500000e-1"]);
    }
}
