//! Sampled time series and their CSV persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::types::Timestamp;

/// One poll of a status provider: every value captured at the same instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: Timestamp,
    pub values: BTreeMap<String, f64>,
}

impl MetricSample {
    pub fn new(timestamp: Timestamp, values: BTreeMap<String, f64>) -> Self {
        Self { timestamp, values }
    }

    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

/// Growing series, owned by exactly one sampler task.
#[derive(Debug, Default)]
pub(crate) struct MetricSeries {
    samples: Vec<MetricSample>,
}

impl MetricSeries {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, sample: MetricSample) {
        self.samples.push(sample);
    }

    pub(crate) fn len(&self) -> usize {
        self.samples.len()
    }

    pub(crate) fn freeze(self) -> FrozenSeries {
        FrozenSeries(self.samples.into())
    }
}

/// Immutable, cheaply clonable series handed to the analysis side.
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenSeries(Arc<[MetricSample]>);

impl FrozenSeries {
    /// Build from already captured samples (e.g. loaded back from disk).
    /// Samples are put in chronological order.
    pub fn from_samples(mut samples: Vec<MetricSample>) -> Self {
        samples.sort_by_key(|s| s.timestamp);
        Self(samples.into())
    }

    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn samples(&self) -> &[MetricSample] {
        &self.0
    }

    /// Chronological values of one metric; samples lacking it are skipped
    pub fn values(&self, metric: &str) -> Vec<f64> {
        self.0.iter().filter_map(|s| s.get(metric)).collect()
    }

    pub fn metric_names(&self) -> BTreeSet<String> {
        self.0
            .iter()
            .flat_map(|s| s.values.keys().cloned())
            .collect()
    }

    /// `metric -> values` for every metric in the series
    pub fn columns(&self) -> BTreeMap<String, Vec<f64>> {
        let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for sample in self.0.iter() {
            for (name, value) in &sample.values {
                columns.entry(name.clone()).or_default().push(*value);
            }
        }
        columns
    }
}

// ----------------------------------------------------------------------------
// CSV persistence
// ----------------------------------------------------------------------------

const TIMESTAMP_COLUMN: &str = "timestamp";

/// Append-only CSV log. The header is taken from the first sample; every row
/// is flushed as soon as it is written so a crash loses at most one row.
#[derive(Debug)]
pub struct SeriesLog {
    path: PathBuf,
    writer: BufWriter<File>,
    columns: Option<Vec<String>>,
}

impl SeriesLog {
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            columns: None,
        })
    }

    /// Append one row. The header is fixed by the first sample; a later
    /// sample carrying a metric outside it is rejected rather than dropped.
    pub fn append(&mut self, sample: &MetricSample) -> std::io::Result<()> {
        if self.columns.is_none() {
            let columns: Vec<String> = sample.values.keys().cloned().collect();
            write!(self.writer, "{TIMESTAMP_COLUMN}")?;
            for name in &columns {
                write!(self.writer, ",{name}")?;
            }
            writeln!(self.writer)?;
            self.columns = Some(columns);
        }
        let columns = self.columns.as_deref().unwrap_or_default();
        if let Some(extra) = sample.values.keys().find(|name| !columns.contains(*name)) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("metric '{extra}' is not a column of {}", self.path.display()),
            ));
        }

        write!(self.writer, "{:.3}", sample.timestamp.as_secs_f64())?;
        for name in columns.iter() {
            match sample.values.get(name) {
                Some(value) => write!(self.writer, ",{value}")?,
                None => write!(self.writer, ",")?,
            }
        }
        writeln!(self.writer)?;
        self.writer.flush()
    }
}

/// Load a series written by [`SeriesLog`]. Empty cells are treated as absent.
pub fn read_csv(path: &Path) -> Result<FrozenSeries, ArtifactError> {
    let read_err = |message: String| ArtifactError::Read {
        path: path.to_path_buf(),
        message,
    };
    let file = File::open(path).map_err(|e| read_err(e.to_string()))?;
    let mut lines = BufReader::new(file).lines();

    let header = match lines.next() {
        Some(line) => line.map_err(|e| read_err(e.to_string()))?,
        None => return Ok(FrozenSeries::empty()),
    };
    let columns: Vec<&str> = header.trim_end().split(',').collect();
    if columns.first() != Some(&TIMESTAMP_COLUMN) {
        return Err(read_err(format!("first column must be '{TIMESTAMP_COLUMN}'")));
    }

    let mut samples = Vec::new();
    for (idx, line) in lines.enumerate() {
        let line = line.map_err(|e| read_err(e.to_string()))?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let row = idx + 2;
        let cells: Vec<&str> = line.split(',').collect();
        if cells.len() != columns.len() {
            return Err(read_err(format!(
                "row {row} has {} cells, expected {}",
                cells.len(),
                columns.len()
            )));
        }
        let secs: f64 = cells[0]
            .parse()
            .map_err(|_| read_err(format!("row {row}: bad timestamp '{}'", cells[0])))?;

        let mut values = BTreeMap::new();
        for (name, cell) in columns.iter().zip(&cells).skip(1) {
            if cell.is_empty() {
                continue;
            }
            let value: f64 = cell
                .parse()
                .map_err(|_| read_err(format!("row {row}: bad value '{cell}' for {name}")))?;
            values.insert((*name).to_string(), value);
        }
        samples.push(MetricSample::new(Timestamp::from_secs_f64(secs), values));
    }

    Ok(FrozenSeries::from_samples(samples))
}
