//! Per-session output files.
//!
//! Raw CSV series are streamed by the samplers themselves; this module derives
//! the file names and writes the summary artifacts once a session is finished.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::ArtifactError;
use crate::stats::{PerfSummary, SummaryStatistic};
use crate::{OUTFILE_PERF_COUNTERS, OUTFILE_PERF_CPU_USAGE, OUTFILE_PERF_RAW_DATA, OUTFILE_PERF_STATS};

/// File name suffix of the n-th session (1-based). The first session has none.
pub fn session_suffix(index: usize) -> String {
    if index > 1 {
        format!(".{index:02}")
    } else {
        String::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub raw_csv: PathBuf,
    pub cpu_csv: PathBuf,
    pub stats_json: PathBuf,
    pub stats_csv: PathBuf,
    pub counters_json: PathBuf,
    pub raw_json: PathBuf,
}

impl ArtifactPaths {
    pub fn for_session(dir: &Path, index: usize) -> Self {
        let suffix = session_suffix(index);
        let file = |stem: &str, ext: &str| dir.join(format!("{stem}{suffix}.{ext}"));
        Self {
            raw_csv: file(OUTFILE_PERF_RAW_DATA, "csv"),
            cpu_csv: file(OUTFILE_PERF_CPU_USAGE, "csv"),
            stats_json: file(OUTFILE_PERF_STATS, "json"),
            stats_csv: file(OUTFILE_PERF_STATS, "csv"),
            counters_json: file(OUTFILE_PERF_COUNTERS, "json"),
            raw_json: file(OUTFILE_PERF_RAW_DATA, "json"),
        }
    }

    /// Summary files produced by [`write_summary`]
    pub fn summary_files(&self) -> [&Path; 4] {
        [&self.stats_json, &self.stats_csv, &self.counters_json, &self.raw_json]
    }
}

/// Write statistics (JSON and CSV), counter deltas and the raw gauge columns.
pub fn write_summary(paths: &ArtifactPaths, summary: &PerfSummary) -> Result<(), ArtifactError> {
    write_json(&paths.stats_json, "statistics", &summary.gauges)?;
    write_stats_csv(&paths.stats_csv, summary)?;
    write_json(&paths.counters_json, "counters", &summary.counters)?;
    write_json(&paths.raw_json, "raw gauge data", &summary.gauge_data)?;

    info!(
        target: "loadgauge::artifacts",
        statistics = %paths.stats_json.display(),
        counters = %paths.counters_json.display(),
        gauges = summary.gauges.len(),
        "Summary artifacts written"
    );
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, what: &str, value: &T) -> Result<(), ArtifactError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| ArtifactError::Serialize {
        what: what.to_string(),
        message: e.to_string(),
    })?;
    ensure_parent(path)?;
    fs::write(path, text).map_err(|source| ArtifactError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// One row per gauge: `name` followed by the statistic columns
fn write_stats_csv(path: &Path, summary: &PerfSummary) -> Result<(), ArtifactError> {
    let wrap = |source| ArtifactError::Write {
        path: path.to_path_buf(),
        source,
    };
    ensure_parent(path)?;
    let file = File::create(path).map_err(wrap)?;
    write_stats_rows(&mut BufWriter::new(file), summary).map_err(wrap)
}

fn write_stats_rows(out: &mut impl Write, summary: &PerfSummary) -> std::io::Result<()> {
    write!(out, "name")?;
    for column in SummaryStatistic::COLUMNS {
        write!(out, ",{column}")?;
    }
    writeln!(out)?;
    for (name, stat) in &summary.gauges {
        write!(out, "{name}")?;
        for value in stat.row() {
            write!(out, ",{value}")?;
        }
        writeln!(out)?;
    }
    out.flush()
}

fn ensure_parent(path: &Path) -> Result<(), ArtifactError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|source| ArtifactError::Write {
                path: parent.to_path_buf(),
                source,
            })
        }
        _ => Ok(()),
    }
}
