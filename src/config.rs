//! Configuration management.
//!
//! - TOML file parsing via figment
//! - `LOADGAUGE_` environment overrides (`__` separates nested keys)
//! - Validation after extraction
//! - Sensible defaults reproducing the standard diagnostics metric set

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::provider::{DerivedField, EndpointSpec, FieldSpec};
use crate::sampler::FailurePolicy;
use crate::stability::StabilityConfig;
use crate::stats::StatisticName;
use crate::{
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_POLLING_INTERVAL_MS, DEFAULT_PROGRESS_INTERVAL_SECS,
    DEFAULT_RETRY_BACKOFF_MS, DEFAULT_RETRY_WINDOW_SECS, MAX_BATCH_SIZE, MIN_POLLING_INTERVAL_MS,
};

// ----------------------------------------------------------------------------
// Root configuration
// ----------------------------------------------------------------------------

/// Root configuration for a load generation / monitoring run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub generator: GeneratorSettings,

    #[serde(default)]
    pub sampler: SamplerSettings,

    /// Metric kinds; names not listed as counters are gauges
    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub stability: StabilityConfig,

    /// Queue-depth gauges to run the stability analysis on
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueSpec>,

    /// Advisory threshold checks evaluated against the summary
    #[serde(default = "default_checks")]
    pub checks: Vec<ThresholdCheck>,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            connection: ConnectionConfig::default(),
            generator: GeneratorSettings::default(),
            sampler: SamplerSettings::default(),
            metrics: MetricsConfig::default(),
            stability: StabilityConfig::default(),
            queues: default_queues(),
            checks: default_checks(),
            output: OutputConfig::default(),
        }
    }
}

impl PerfConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOADGAUGE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (no environment overrides)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.generator.validate()?;
        self.sampler.validate()?;
        self.stability.validate()?;

        for queue in &self.queues {
            if let Some(max) = queue.max_size {
                if !(max.is_finite() && max > 0.0) {
                    return Err(ConfigError::invalid_value(
                        format!("queues.{}.max_size", queue.metric),
                        "must be a positive number",
                    ));
                }
            }
        }

        for check in &self.checks {
            if check.statistic == StatisticName::Delta && !self.metrics.is_counter(&check.metric) {
                return Err(ConfigError::invalid_value(
                    format!("checks.{}", check.metric),
                    "the delta statistic only exists for counter metrics",
                ));
            }
        }

        Ok(())
    }

    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include file and line in log records
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Skip TLS certificate verification (test tenants commonly use
    /// self-signed certificates)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            accept_invalid_certs: false,
        }
    }
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// Generator
// ----------------------------------------------------------------------------

/// Tunables of the send loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSettings {
    /// Upper bound on events assembled in one tick
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How long a transiently failing call keeps being retried
    #[serde(default = "default_retry_window", with = "humantime_serde")]
    pub retry_window: Duration,

    /// Pause between two attempts of a transiently failing call
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Cadence of progress log lines
    #[serde(default = "default_progress_interval", with = "humantime_serde")]
    pub progress_interval: Duration,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            retry_window: default_retry_window(),
            retry_backoff: default_retry_backoff(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl GeneratorSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid_value(
                "generator.max_batch_size",
                "must be at least 1",
            ));
        }
        if self.retry_backoff.is_zero() {
            return Err(ConfigError::invalid_value(
                "generator.retry_backoff",
                "must be greater than zero",
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                "generator.progress_interval",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn default_max_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_retry_window() -> Duration {
    Duration::from_secs(DEFAULT_RETRY_WINDOW_SECS)
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS)
}

// ----------------------------------------------------------------------------
// Sampler
// ----------------------------------------------------------------------------

/// Primary status endpoints plus an optional companion sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSettings {
    #[serde(default = "default_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointSpec>,

    /// Fields computed as the sum of other fields of the same sample
    #[serde(default = "default_derived")]
    pub derived: Vec<DerivedField>,

    #[serde(default = "default_companion")]
    pub companion: Option<CompanionSettings>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            endpoints: default_endpoints(),
            derived: default_derived(),
            companion: default_companion(),
        }
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling_interval < Duration::from_millis(MIN_POLLING_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "sampler.polling_interval",
                format!("must be at least {MIN_POLLING_INTERVAL_MS}ms"),
            ));
        }
        if self.endpoints.is_empty() {
            return Err(ConfigError::invalid_value(
                "sampler.endpoints",
                "at least one status endpoint is required",
            ));
        }
        let mut names: Vec<&str> = self
            .endpoints
            .iter()
            .flat_map(|e| e.fields.iter().map(|f| f.name.as_str()))
            .chain(self.derived.iter().map(|d| d.name.as_str()))
            .collect();
        for name in &names {
            validate_metric_name(name)?;
        }
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::invalid_value(
                "sampler.endpoints",
                format!("metric '{}' is defined more than once", dup[0]),
            ));
        }
        if let Some(companion) = &self.companion {
            validate_metric_name(&companion.metric)?;
            if companion.polling_interval < Duration::from_millis(MIN_POLLING_INTERVAL_MS) {
                return Err(ConfigError::invalid_value(
                    "sampler.companion.polling_interval",
                    format!("must be at least {MIN_POLLING_INTERVAL_MS}ms"),
                ));
            }
        }
        Ok(())
    }
}

/// Metric names end up as CSV column headers.
fn validate_metric_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.contains([',', '"', '\n', '\r']) || name == "timestamp" {
        return Err(ConfigError::invalid_value(
            "sampler.endpoints",
            format!("'{name}' is not a valid metric name"),
        ));
    }
    Ok(())
}

/// Second, independent sampler polling a single scalar endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionSettings {
    pub path: String,

    /// Cheap request used to decide whether the companion can run at all
    #[serde(default)]
    pub probe_path: Option<String>,

    pub metric: String,

    #[serde(default = "default_companion_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    #[serde(default = "default_companion_policy")]
    pub failure_policy: FailurePolicy,
}

fn default_polling_interval() -> Duration {
    Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS)
}

fn default_companion_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_companion_policy() -> FailurePolicy {
    FailurePolicy::Continue
}

fn field(name: &str, pointers: &[&str]) -> FieldSpec {
    FieldSpec {
        name: name.into(),
        pointers: pointers.iter().map(|p| p.to_string()).collect(),
    }
}

fn default_endpoints() -> Vec<EndpointSpec> {
    vec![
        EndpointSpec {
            path: "/service/cep/diagnostics/correlator/status".into(),
            fields: vec![
                field("memory_usage_corr", &["/physicalMemoryMB"]),
                field("correlator_iq_size", &["/numQueuedInput"]),
                field("correlator_oq_size", &["/numOutEventsQueued"]),
                field("correlator_swap_read_write", &["/swapPagesRead", "/swapPagesWrite"]),
                field("correlator_num_output_sent", &["/numOutEventsSent"]),
                field("correlator_num_input_received", &["/numReceived"]),
            ],
        },
        EndpointSpec {
            path: "/service/cep/diagnostics/apamaCtrlStatus".into(),
            fields: vec![
                field("memory_usage_apctrl", &["/apama_ctrl_physical_mb"]),
                field("cep_proxy_requests_started", &["/cep_proxy_request_counts/*/requestsStarted"]),
                field("cep_proxy_requests_completed", &["/cep_proxy_request_counts/*/requestsCompleted"]),
                field("cep_proxy_requests_failed", &["/cep_proxy_request_counts/*/requestsFailed"]),
            ],
        },
    ]
}

fn default_derived() -> Vec<DerivedField> {
    vec![DerivedField {
        name: "total_memory_usage".into(),
        sum_of: vec!["memory_usage_corr".into(), "memory_usage_apctrl".into()],
    }]
}

fn default_companion() -> Option<CompanionSettings> {
    Some(CompanionSettings {
        path: "/service/cep/diagnostics/cpuUsageMillicores?sampleDurationMSec=2000".into(),
        probe_path: Some("/service/cep/diagnostics/cpuUsageMillicores?sampleDurationMSec=10".into()),
        metric: "cpu_usage_milli".into(),
        polling_interval: default_companion_interval(),
        failure_policy: default_companion_policy(),
    })
}

// ----------------------------------------------------------------------------
// Metrics, queues, checks
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Cumulative metrics summarised as last - first
    #[serde(default = "default_counters")]
    pub counters: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { counters: default_counters() }
    }
}

impl MetricsConfig {
    pub fn is_counter(&self, name: &str) -> bool {
        self.counters.iter().any(|c| c == name)
    }
}

fn default_counters() -> Vec<String> {
    [
        "correlator_num_input_received",
        "correlator_num_output_sent",
        "cep_proxy_requests_started",
        "cep_proxy_requests_completed",
        "cep_proxy_requests_failed",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// A queue-depth gauge subject to stability analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Human label used in log lines ("input", "output")
    pub label: String,
    pub metric: String,
    /// Queue capacity; mean and median above 80% of it are reported
    #[serde(default)]
    pub max_size: Option<f64>,
}

fn default_queues() -> Vec<QueueSpec> {
    vec![
        QueueSpec {
            label: "input".into(),
            metric: "correlator_iq_size".into(),
            max_size: Some(20_000.0),
        },
        QueueSpec {
            label: "output".into(),
            metric: "correlator_oq_size".into(),
            max_size: Some(10_000.0),
        },
    ]
}

/// `statistic(metric) <= max`, evaluated after the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub metric: String,
    pub statistic: StatisticName,
    pub max: f64,
}

fn default_checks() -> Vec<ThresholdCheck> {
    vec![
        ThresholdCheck {
            metric: "correlator_swap_read_write".into(),
            statistic: StatisticName::Min,
            max: 0.0,
        },
        ThresholdCheck {
            metric: "cep_proxy_requests_failed".into(),
            statistic: StatisticName::Delta,
            max: 0.0,
        },
    ]
}

// ----------------------------------------------------------------------------
// Output
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving raw series and statistics files
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: default_output_dir() }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("perf-output")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults() {
        let config = PerfConfig::default();
        assert_eq!(config.generator.max_batch_size, MAX_BATCH_SIZE);
        assert_eq!(config.generator.retry_window, Duration::from_secs(60));
        assert_eq!(config.generator.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.sampler.polling_interval, Duration::from_secs(2));
        assert!(config.metrics.is_counter("correlator_num_input_received"));
        assert!(!config.metrics.is_counter("correlator_iq_size"));
        assert_eq!(config.queues.len(), 2);
        assert_eq!(config.queues[0].metric, "correlator_iq_size");
        assert_eq!(config.checks.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_config_lists_queues_and_checks() {
        let rendered = PerfConfig::generate_default_config();
        assert!(rendered.contains("correlator_iq_size"));
        assert!(rendered.contains("cep_proxy_requests_failed"));
    }

    #[test]
    fn test_rejects_zero_companion_interval() {
        let err = PerfConfig::from_str(
            r#"
            [sampler.companion]
            path = "/cpu"
            metric = "cpu"
            polling_interval = "0s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "sampler.companion.polling_interval"
        ));
    }

    #[test]
    fn test_default_config_round_trips() {
        let rendered = PerfConfig::generate_default_config();
        let parsed = PerfConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed, PerfConfig::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = PerfConfig::from_str(
            r#"
            [generator]
            max_batch_size = 50
            retry_window = "5s"

            [stability]
            noise_floor = 10.0
            "#,
        )
        .unwrap();
        assert_eq!(config.generator.max_batch_size, 50);
        assert_eq!(config.generator.retry_window, Duration::from_secs(5));
        assert_eq!(config.generator.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.stability.noise_floor, 10.0);
        assert_eq!(config.stability.ratio_threshold, 0.5);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = PerfConfig::from_str("[generator]\nmax_batch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "generator.max_batch_size"));
    }

    #[test]
    fn test_rejects_short_polling_interval() {
        let err = PerfConfig::from_str("[sampler]\npolling_interval = \"1ms\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "sampler.polling_interval"));
    }

    #[test]
    fn test_rejects_duplicate_metric_names() {
        let err = PerfConfig::from_str(
            r#"
            [[sampler.endpoints]]
            path = "/a"
            fields = [
                { name = "depth", pointers = ["/x"] },
                { name = "depth", pointers = ["/y"] },
            ]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_rejects_delta_check_on_gauge() {
        let err = PerfConfig::from_str(
            r#"
            [[checks]]
            metric = "correlator_iq_size"
            statistic = "delta"
            max = 0.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("counter"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PerfConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadgauge.toml");
        std::fs::write(&path, "[output]\ndir = \"results\"\n").unwrap();
        let config = PerfConfig::load(&path).unwrap();
        assert_eq!(config.output.dir, PathBuf::from("results"));
    }
}
