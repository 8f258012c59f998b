//! # loadgauge - Load Generation & Queue Stability Telemetry
//!
//! Drives synthetic traffic at a target aggregate rate against a system under
//! test while a background sampler records its internal gauges, then turns the
//! captured series into summary statistics and a queue stability verdict.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               LOADGAUGE                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  SOURCES → FACTORY → LOAD GENERATOR → SINK            (send loop)        │
//! │  STATUS PROVIDER → SAMPLER → SERIES (frozen on join)  (poll loop)        │
//! │  FROZEN SERIES → STATISTICS ENGINE / STABILITY ANALYZER → ARTIFACTS      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The generator and the samplers run as independent tokio tasks. Analysis only
//! ever sees a [`series::FrozenSeries`], which can only be obtained by joining
//! a stopped sampler.

#![warn(rust_2018_idioms)]

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod generator;
pub mod logging;
pub mod provider;
pub mod sampler;
pub mod series;
pub mod session;
pub mod sink;
pub mod stability;
pub mod stats;
pub mod types;

pub use error::{PerfError, PerfResult};
pub use factory::{EventFactory, FactoryDescriptor, FactoryRegistry};
pub use generator::{GeneratorReport, LoadGenerator, StopSignal};
pub use sampler::{MetricsSampler, SamplerHandle, SamplerOutcome, StatusProvider};
pub use series::{FrozenSeries, MetricSample};
pub use sink::{ResourceKind, SendRequest, Sink, SinkError};
pub use stability::{QueueStabilityAnalyzer, QueueTrend, StabilityVerdict};
pub use stats::{MetricCatalog, MetricKind, PerfSummary, StatisticsEngine};
pub use types::{SourceId, SourceSet, Timestamp};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_FULL_NAME: &str = "loadgauge performance harness";

// ----------------------------------------------------------------------------
// Load Generation
// ----------------------------------------------------------------------------

/// Ceiling on events assembled in one scheduling tick
pub const MAX_BATCH_SIZE: usize = 2000;

/// Window in which a transiently failing sink call keeps being retried (seconds)
pub const DEFAULT_RETRY_WINDOW_SECS: u64 = 60;

/// Pause between retries of a transiently failing sink call (milliseconds)
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Cadence of generator progress lines (seconds)
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 5;

/// Default processing mode header value
pub const DEFAULT_PROCESSING_MODE: &str = "CEP";

/// Header carrying the processing mode on every sink request
pub const PROCESSING_MODE_HEADER: &str = "X-Cumulocity-Processing-Mode";

/// Greppable line printed once the publisher is about to enter its send loop
pub const STARTUP_LINE_PREFIX: &str = "Started publishing";

/// Prefix of the line printed when the publisher dies
pub const FATAL_LINE_PREFIX: &str = "ERROR: publisher failed:";

// ----------------------------------------------------------------------------
// Sampling
// ----------------------------------------------------------------------------

/// Default polling interval of the primary sampler (milliseconds)
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 2000;

/// Minimum allowed polling interval (milliseconds)
pub const MIN_POLLING_INTERVAL_MS: u64 = 10;

/// Default timeout for HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Stability Analysis
// ----------------------------------------------------------------------------

/// Growth below this many queue entries is treated as noise
pub const DEFAULT_NOISE_FLOOR: f64 = 200.0;

/// Slope ratio above which a queue is reported as diverging
pub const DEFAULT_RATIO_THRESHOLD: f64 = 0.5;

/// Slope ratio above which a queue is reported as slowly diverging
pub const DEFAULT_SLOW_RATIO_THRESHOLD: f64 = 0.2;

/// Fraction of samples dropped at each end of the series
pub const DEFAULT_DISCARD_FRACTION: f64 = 0.2;

/// Trimmed series must be longer than this to be analysed
pub const MIN_TREND_SAMPLES: usize = 5;

/// Queue means above this fraction of the queue capacity are reported
pub const QUEUE_LIMIT_FRACTION: f64 = 0.8;

// ----------------------------------------------------------------------------
// Artifacts
// ----------------------------------------------------------------------------

pub const OUTFILE_PERF_RAW_DATA: &str = "perf_raw_data";
pub const OUTFILE_PERF_CPU_USAGE: &str = "perf_cpuusage";
pub const OUTFILE_PERF_STATS: &str = "perf_statistics";
pub const OUTFILE_PERF_COUNTERS: &str = "perf_counters";
