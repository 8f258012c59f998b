//! Summary statistics over finished series.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MetricsConfig, ThresholdCheck};
use crate::error::StatsError;
use crate::series::FrozenSeries;

// ----------------------------------------------------------------------------
// Metric kinds
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Instantaneous level: summarised by its distribution
    Gauge,
    /// Monotonic cumulative count: summarised by last - first
    Counter,
}

/// Which metric names are counters. Everything else is a gauge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricCatalog {
    counters: BTreeSet<String>,
}

impl MetricCatalog {
    pub fn new<I, S>(counters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            counters: counters.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self, metric: &str) -> MetricKind {
        if self.counters.contains(metric) {
            MetricKind::Counter
        } else {
            MetricKind::Gauge
        }
    }
}

impl From<&MetricsConfig> for MetricCatalog {
    fn from(config: &MetricsConfig) -> Self {
        Self::new(config.counters.iter().cloned())
    }
}

// ----------------------------------------------------------------------------
// Descriptive statistics
// ----------------------------------------------------------------------------

/// Nearest-rank percentile of an ascending slice: `v[ceil(n * p / 100) - 1]`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (sorted.len() as f64 * p / 100.0).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    Some(sorted[idx])
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Distribution summary of a gauge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistic {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// The 50th nearest-rank percentile
    pub median: f64,
    #[serde(rename = "75th_percentile")]
    pub p75: f64,
    #[serde(rename = "90th_percentile")]
    pub p90: f64,
    #[serde(rename = "95th_percentile")]
    pub p95: f64,
    #[serde(rename = "99th_percentile")]
    pub p99: f64,
}

impl SummaryStatistic {
    /// Column order used for the CSV rendering
    pub const COLUMNS: [&'static str; 8] = [
        "min",
        "max",
        "mean",
        "median",
        "75th_percentile",
        "90th_percentile",
        "95th_percentile",
        "99th_percentile",
    ];

    pub fn from_values(values: &[f64]) -> Result<Self, StatsError> {
        if values.is_empty() {
            return Err(StatsError::insufficient("no samples to summarise"));
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let pct = |p| percentile(&sorted, p).unwrap_or_default();
        Ok(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean: mean(&sorted).unwrap_or_default(),
            median: pct(50.0),
            p75: pct(75.0),
            p90: pct(90.0),
            p95: pct(95.0),
            p99: pct(99.0),
        })
    }

    pub fn get(&self, statistic: StatisticName) -> Option<f64> {
        match statistic {
            StatisticName::Min => Some(self.min),
            StatisticName::Max => Some(self.max),
            StatisticName::Mean => Some(self.mean),
            StatisticName::Median => Some(self.median),
            StatisticName::P75 => Some(self.p75),
            StatisticName::P90 => Some(self.p90),
            StatisticName::P95 => Some(self.p95),
            StatisticName::P99 => Some(self.p99),
            StatisticName::Delta => None,
        }
    }

    /// Values in [`Self::COLUMNS`] order
    pub fn row(&self) -> [f64; 8] {
        [self.min, self.max, self.mean, self.median, self.p75, self.p90, self.p95, self.p99]
    }
}

/// `last - first` in chronological order. Resets are not detected.
pub fn counter_delta(values: &[f64]) -> Result<f64, StatsError> {
    match (values.first(), values.last()) {
        (Some(first), Some(last)) => Ok(last - first),
        _ => Err(StatsError::insufficient("counter has no samples")),
    }
}

/// Statistic selector used by threshold checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatisticName {
    Min,
    Max,
    Mean,
    Median,
    P75,
    P90,
    P95,
    P99,
    /// Counter delta
    Delta,
}

impl fmt::Display for StatisticName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatisticName::Min => "min",
            StatisticName::Max => "max",
            StatisticName::Mean => "mean",
            StatisticName::Median => "median",
            StatisticName::P75 => "p75",
            StatisticName::P90 => "p90",
            StatisticName::P95 => "p95",
            StatisticName::P99 => "p99",
            StatisticName::Delta => "delta",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Everything computed for one monitoring session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfSummary {
    pub gauges: BTreeMap<String, SummaryStatistic>,
    pub counters: BTreeMap<String, f64>,
    /// Raw gauge columns the gauge statistics were computed from
    #[serde(skip)]
    pub gauge_data: BTreeMap<String, Vec<f64>>,
}

impl PerfSummary {
    pub fn get(&self, metric: &str, statistic: StatisticName) -> Option<f64> {
        match statistic {
            StatisticName::Delta => self.counters.get(metric).copied(),
            other => self.gauges.get(metric).and_then(|s| s.get(other)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatisticsEngine {
    catalog: MetricCatalog,
}

impl StatisticsEngine {
    pub fn new(catalog: MetricCatalog) -> Self {
        Self { catalog }
    }

    /// Summarise one or more series of the same session. Columns of the same
    /// metric in several series are concatenated in argument order.
    pub fn summarize(&self, series: &[&FrozenSeries]) -> Result<PerfSummary, StatsError> {
        let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for s in series {
            for (name, values) in s.columns() {
                columns.entry(name).or_default().extend(values);
            }
        }
        if columns.values().all(Vec::is_empty) {
            return Err(StatsError::insufficient("no samples were collected"));
        }

        let mut summary = PerfSummary::default();
        for (name, values) in columns {
            if values.is_empty() {
                continue;
            }
            match self.catalog.kind(&name) {
                MetricKind::Counter => {
                    let delta = counter_delta(&values)?;
                    summary.counters.insert(name, delta);
                }
                MetricKind::Gauge => {
                    let stat = SummaryStatistic::from_values(&values)?;
                    summary.gauges.insert(name.clone(), stat);
                    summary.gauge_data.insert(name, values);
                }
            }
        }

        debug!(
            target: "loadgauge::stats",
            gauges = summary.gauges.len(),
            counters = summary.counters.len(),
            "Summary computed"
        );
        Ok(summary)
    }
}

// ----------------------------------------------------------------------------
// Threshold checks
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// Metric absent from the summary
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub metric: String,
    pub statistic: StatisticName,
    pub max: f64,
    pub actual: Option<f64>,
    pub status: CheckStatus,
}

impl CheckResult {
    pub fn log(&self) {
        match self.status {
            CheckStatus::Passed => info!(
                target: "loadgauge::checks",
                metric = %self.metric,
                statistic = %self.statistic,
                actual = ?self.actual,
                max = self.max,
                "Check passed"
            ),
            CheckStatus::Failed => warn!(
                target: "loadgauge::checks",
                metric = %self.metric,
                statistic = %self.statistic,
                actual = ?self.actual,
                max = self.max,
                "Check failed"
            ),
            CheckStatus::Skipped => debug!(
                target: "loadgauge::checks",
                metric = %self.metric,
                statistic = %self.statistic,
                "Check skipped, metric not collected"
            ),
        }
    }
}

pub fn evaluate_checks(summary: &PerfSummary, checks: &[ThresholdCheck]) -> Vec<CheckResult> {
    checks
        .iter()
        .map(|check| {
            let actual = summary.get(&check.metric, check.statistic);
            let status = match actual {
                None => CheckStatus::Skipped,
                Some(v) if v <= check.max => CheckStatus::Passed,
                Some(_) => CheckStatus::Failed,
            };
            CheckResult {
                metric: check.metric.clone(),
                statistic: check.statistic,
                max: check.max,
                actual,
                status,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::MetricSample;
    use crate::types::Timestamp;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn series(metric: &str, values: &[f64]) -> FrozenSeries {
        FrozenSeries::from_samples(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    MetricSample::new(
                        Timestamp::from_secs(i as i64),
                        BTreeMap::from([(metric.to_string(), *v)]),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_percentiles_on_hundred_values() {
        let values: Vec<f64> = (1..=100).rev().map(f64::from).collect();
        let stat = SummaryStatistic::from_values(&values).unwrap();
        assert_eq!(stat.min, 1.0);
        assert_eq!(stat.max, 100.0);
        assert_eq!(stat.mean, 50.5);
        assert_eq!(stat.median, 50.0);
        assert_eq!(stat.p75, 75.0);
        assert_eq!(stat.p90, 90.0);
        assert_eq!(stat.p95, 95.0);
        assert_eq!(stat.p99, 99.0);
    }

    #[test]
    fn test_single_value_statistics() {
        let stat = SummaryStatistic::from_values(&[42.0]).unwrap();
        assert!(stat.row().iter().all(|v| *v == 42.0));
    }

    #[test]
    fn test_empty_is_insufficient() {
        assert!(matches!(
            SummaryStatistic::from_values(&[]),
            Err(StatsError::InsufficientData { .. })
        ));
        assert!(counter_delta(&[]).is_err());
        let engine = StatisticsEngine::default();
        assert!(engine.summarize(&[&FrozenSeries::empty()]).is_err());
    }

    #[test]
    fn test_counter_delta() {
        assert_eq!(counter_delta(&[0.0, 5.0, 5.0, 10.0, 20.0]).unwrap(), 20.0);
    }

    #[test]
    fn test_engine_splits_gauges_and_counters() {
        let engine = StatisticsEngine::new(MetricCatalog::new(["received"]));
        let primary = series("received", &[100.0, 150.0, 400.0]);
        let queue = series("depth", &[3.0, 1.0, 2.0]);
        let summary = engine.summarize(&[&primary, &queue]).unwrap();

        assert_eq!(summary.counters["received"], 300.0);
        assert_eq!(summary.gauges["depth"].max, 3.0);
        assert_eq!(summary.gauge_data["depth"], vec![3.0, 1.0, 2.0]);
        assert!(!summary.gauges.contains_key("received"));
        assert_eq!(summary.get("depth", StatisticName::Median), Some(2.0));
        assert_eq!(summary.get("received", StatisticName::Delta), Some(300.0));
        assert_eq!(summary.get("received", StatisticName::Max), None);
    }

    #[test]
    fn test_summary_json_shape() {
        let stat = SummaryStatistic::from_values(&[1.0, 2.0]).unwrap();
        let json = serde_json::to_value(stat).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        for column in SummaryStatistic::COLUMNS {
            assert!(keys.contains(&column), "missing {column}");
        }
    }

    #[test]
    fn test_threshold_checks() {
        let engine = StatisticsEngine::new(MetricCatalog::new(["failed"]));
        let summary = engine
            .summarize(&[&series("swap", &[0.0, 4.0]), &series("failed", &[2.0, 3.0])])
            .unwrap();
        let checks = vec![
            ThresholdCheck { metric: "swap".into(), statistic: StatisticName::Min, max: 0.0 },
            ThresholdCheck { metric: "swap".into(), statistic: StatisticName::Max, max: 0.0 },
            ThresholdCheck { metric: "failed".into(), statistic: StatisticName::Delta, max: 0.0 },
            ThresholdCheck { metric: "absent".into(), statistic: StatisticName::Mean, max: 1.0 },
        ];
        let statuses: Vec<CheckStatus> = evaluate_checks(&summary, &checks).iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![CheckStatus::Passed, CheckStatus::Failed, CheckStatus::Failed, CheckStatus::Skipped]
        );
    }

    proptest! {
        #[test]
        fn median_is_p50_and_percentiles_are_ordered(values in prop::collection::vec(-1e6f64..1e6, 1..300)) {
            let stat = SummaryStatistic::from_values(&values).unwrap();
            let mut sorted = values.clone();
            sorted.sort_by(f64::total_cmp);
            prop_assert_eq!(stat.median, percentile(&sorted, 50.0).unwrap());
            prop_assert!(stat.min <= stat.median);
            prop_assert!(stat.median <= stat.p75);
            prop_assert!(stat.p75 <= stat.p90 && stat.p90 <= stat.p95 && stat.p95 <= stat.p99);
            prop_assert!(stat.p99 <= stat.max);
            prop_assert!(values.contains(&stat.p90));
        }
    }
}
