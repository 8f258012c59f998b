//! Queue stability analysis.
//!
//! A queue under sustained load either levels off or keeps growing. After
//! trimming warm-up and wind-down, the series is split into three windows and
//! the growth between the last two is compared with the growth between the
//! first two: a queue that is levelling off grows much less in the second step.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::stats::{mean, SummaryStatistic};
use crate::{
    DEFAULT_DISCARD_FRACTION, DEFAULT_NOISE_FLOOR, DEFAULT_RATIO_THRESHOLD,
    DEFAULT_SLOW_RATIO_THRESHOLD, MIN_TREND_SAMPLES, QUEUE_LIMIT_FRACTION,
};

// ----------------------------------------------------------------------------
// Parameters
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Growth at or below this is noise
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,

    #[serde(default = "default_ratio_threshold")]
    pub ratio_threshold: f64,

    #[serde(default = "default_slow_ratio_threshold")]
    pub slow_ratio_threshold: f64,

    /// Fraction dropped at each end before analysis
    #[serde(default = "default_discard_fraction")]
    pub discard_fraction: f64,

    /// End of the left window, as a fraction of the trimmed length
    #[serde(default = "default_left_split")]
    pub left_split: f64,

    /// End of the middle window
    #[serde(default = "default_mid_split")]
    pub mid_split: f64,

    /// End of the right window; the rest is ignored
    #[serde(default = "default_right_end")]
    pub right_end: f64,

    /// Start of the window averaged into the reported ending size
    #[serde(default = "default_ending_start")]
    pub ending_start: f64,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            noise_floor: default_noise_floor(),
            ratio_threshold: default_ratio_threshold(),
            slow_ratio_threshold: default_slow_ratio_threshold(),
            discard_fraction: default_discard_fraction(),
            left_split: default_left_split(),
            mid_split: default_mid_split(),
            right_end: default_right_end(),
            ending_start: default_ending_start(),
        }
    }
}

impl StabilityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..0.5).contains(&self.discard_fraction) {
            return Err(ConfigError::invalid_value(
                "stability.discard_fraction",
                "must be in [0, 0.5)",
            ));
        }
        if !(self.noise_floor >= 0.0) {
            return Err(ConfigError::invalid_value("stability.noise_floor", "must not be negative"));
        }
        if !(self.slow_ratio_threshold <= self.ratio_threshold) {
            return Err(ConfigError::invalid_value(
                "stability.slow_ratio_threshold",
                "must not exceed ratio_threshold",
            ));
        }
        let splits = [self.left_split, self.mid_split, self.right_end];
        let increasing = splits.windows(2).all(|w| w[0] < w[1]);
        if !(increasing && self.left_split > 0.0 && self.right_end <= 1.0) {
            return Err(ConfigError::invalid_value(
                "stability",
                "window splits must increase within (0, 1]",
            ));
        }
        if !(self.ending_start >= 0.0 && self.ending_start < self.right_end) {
            return Err(ConfigError::invalid_value(
                "stability.ending_start",
                "must be in [0, right_end)",
            ));
        }
        Ok(())
    }
}

fn default_noise_floor() -> f64 {
    DEFAULT_NOISE_FLOOR
}

fn default_ratio_threshold() -> f64 {
    DEFAULT_RATIO_THRESHOLD
}

fn default_slow_ratio_threshold() -> f64 {
    DEFAULT_SLOW_RATIO_THRESHOLD
}

fn default_discard_fraction() -> f64 {
    DEFAULT_DISCARD_FRACTION
}

fn default_left_split() -> f64 {
    0.35
}

fn default_mid_split() -> f64 {
    0.65
}

fn default_right_end() -> f64 {
    0.95
}

fn default_ending_start() -> f64 {
    0.85
}

// ----------------------------------------------------------------------------
// Verdicts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTrend {
    Stable,
    SlowlyDiverging,
    Diverging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl QueueTrend {
    pub fn severity(&self) -> Severity {
        match self {
            QueueTrend::Stable => Severity::Info,
            QueueTrend::SlowlyDiverging => Severity::Warning,
            QueueTrend::Diverging => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StabilityVerdict {
    /// Too few samples left after trimming
    InsufficientData { samples: usize },
    Assessed {
        trend: QueueTrend,
        left_mean: f64,
        mid_mean: f64,
        right_mean: f64,
        /// Absent when the growth stayed under the noise floor
        slope_ratio: Option<f64>,
        /// Mean queue size towards the end, for diverging queues
        ending_size: Option<f64>,
    },
}

impl StabilityVerdict {
    pub fn trend(&self) -> Option<QueueTrend> {
        match self {
            StabilityVerdict::InsufficientData { .. } => None,
            StabilityVerdict::Assessed { trend, .. } => Some(*trend),
        }
    }

    /// Emit the verdict at the severity it deserves. Never fails the run.
    pub fn log(&self, queue: &str) {
        match self {
            StabilityVerdict::InsufficientData { samples } => warn!(
                target: "loadgauge::stability",
                queue,
                samples,
                "Not enough data points to analyse queue growth"
            ),
            StabilityVerdict::Assessed { trend: QueueTrend::Stable, right_mean, .. } => info!(
                target: "loadgauge::stability",
                queue,
                right_mean,
                "Queue size is stable"
            ),
            StabilityVerdict::Assessed { trend: QueueTrend::SlowlyDiverging, slope_ratio, ending_size, .. } => warn!(
                target: "loadgauge::stability",
                queue,
                slope_ratio = ?slope_ratio,
                ending_size = ?ending_size,
                "Queue was increasing slowly and would probably have filled up eventually"
            ),
            StabilityVerdict::Assessed { trend: QueueTrend::Diverging, slope_ratio, ending_size, .. } => error!(
                target: "loadgauge::stability",
                queue,
                slope_ratio = ?slope_ratio,
                ending_size = ?ending_size,
                "Queue was increasing continuously and would probably have filled up"
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// Analyzer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct QueueStabilityAnalyzer {
    config: StabilityConfig,
}

impl QueueStabilityAnalyzer {
    pub fn new(config: StabilityConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Classify a chronological queue-depth series
    pub fn analyze(&self, values: &[f64]) -> StabilityVerdict {
        let cfg = &self.config;
        let discard = (values.len() as f64 * cfg.discard_fraction) as usize;
        let trimmed = &values[discard..values.len() - discard];
        let m = trimmed.len();
        if m <= MIN_TREND_SAMPLES {
            return StabilityVerdict::InsufficientData { samples: m };
        }

        let at = |fraction: f64| ((m as f64 * fraction) as usize).min(m);
        let left_end = at(cfg.left_split).max(1);
        let mid_end = at(cfg.mid_split).max(left_end + 1);
        let right_end = at(cfg.right_end).max(mid_end + 1).min(m);

        let left = mean(&trimmed[..left_end]).unwrap_or_default();
        let mid = mean(&trimmed[left_end..mid_end]).unwrap_or_default();
        let right = mean(&trimmed[mid_end..right_end]).unwrap_or(mid);

        let assessed = |trend, slope_ratio, ending_size| StabilityVerdict::Assessed {
            trend,
            left_mean: left,
            mid_mean: mid,
            right_mean: right,
            slope_ratio,
            ending_size,
        };

        if right - left <= cfg.noise_floor || right - mid <= cfg.noise_floor {
            return assessed(QueueTrend::Stable, None, None);
        }

        let rise = right - mid;
        let run = mid - left;
        let slope_ratio = if run == 0.0 {
            if rise == 0.0 {
                return assessed(QueueTrend::Stable, None, None);
            }
            f64::INFINITY
        } else {
            rise / run
        };

        let ending_start = at(cfg.ending_start);
        let ending_size = mean(&trimmed[ending_start.min(right_end)..right_end]).unwrap_or(right);

        let trend = if slope_ratio > cfg.ratio_threshold {
            QueueTrend::Diverging
        } else if slope_ratio > cfg.slow_ratio_threshold {
            QueueTrend::SlowlyDiverging
        } else {
            QueueTrend::Stable
        };
        let ending = (trend != QueueTrend::Stable).then_some(ending_size);
        assessed(trend, Some(slope_ratio), ending)
    }
}

// ----------------------------------------------------------------------------
// Queue limits
// ----------------------------------------------------------------------------

/// A queue whose typical size came close to its capacity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueLimitBreach {
    pub queue: String,
    pub statistic: &'static str,
    pub value: f64,
    pub limit: f64,
}

/// Median and mean must stay below 80% of the queue capacity
pub fn check_queue_limit(queue: &str, stat: &SummaryStatistic, max_size: f64) -> Vec<QueueLimitBreach> {
    let limit = QUEUE_LIMIT_FRACTION * max_size;
    [("median", stat.median), ("mean", stat.mean)]
        .into_iter()
        .filter(|(_, value)| *value >= limit)
        .map(|(statistic, value)| {
            warn!(
                target: "loadgauge::stability",
                queue,
                statistic,
                value,
                limit,
                "Queue size close to capacity"
            );
            QueueLimitBreach {
                queue: queue.to_string(),
                statistic,
                value,
                limit,
            }
        })
        .collect()
}
