//! Monitoring sessions.
//!
//! A session runs a primary sampler and, when its endpoint answers, a
//! companion sampler. Finishing the session stops and joins both, then always
//! runs the finalisation step over whatever was captured: statistics,
//! artifacts, queue stability verdicts and threshold checks.

use std::sync::Arc;
use std::time::Duration;

use futures::future::OptionFuture;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{self, ArtifactPaths};
use crate::config::{PerfConfig, QueueSpec, ThresholdCheck};
use crate::connection::PlatformClient;
use crate::error::ConfigError;
use crate::provider::{JsonStatusProvider, ScalarStatusProvider};
use crate::sampler::{FailurePolicy, MetricsSampler, SamplerHandle, SamplerOutcome, StatusProvider};
use crate::series::FrozenSeries;
use crate::stability::{check_queue_limit, QueueLimitBreach, QueueStabilityAnalyzer, QueueTrend, StabilityVerdict};
use crate::stats::{evaluate_checks, CheckResult, CheckStatus, MetricCatalog, PerfSummary, StatisticsEngine};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Finalisation
// ----------------------------------------------------------------------------

/// Stability verdict and capacity findings for one configured queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueReport {
    pub label: String,
    pub metric: String,
    pub verdict: StabilityVerdict,
    pub limit_breaches: Vec<QueueLimitBreach>,
}

/// Outcome of a finished session. Everything in here is advisory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub session_id: Option<Uuid>,
    pub samples: usize,
    pub summary: Option<PerfSummary>,
    /// Why no summary could be computed
    pub stats_error: Option<String>,
    pub queues: Vec<QueueReport>,
    pub checks: Vec<CheckResult>,
    pub sampler_failures: Vec<String>,
    pub artifact_error: Option<String>,
}

impl SessionReport {
    /// True when no queue diverged, no limit was breached and no check failed
    pub fn is_clean(&self) -> bool {
        let queues_ok = self
            .queues
            .iter()
            .all(|q| q.limit_breaches.is_empty() && q.verdict.trend() != Some(QueueTrend::Diverging));
        let checks_ok = self.checks.iter().all(|c| c.status != CheckStatus::Failed);
        queues_ok && checks_ok
    }
}

/// Analysis settings applied to every finished session
#[derive(Debug, Clone)]
pub struct Finalizer {
    engine: StatisticsEngine,
    analyzer: QueueStabilityAnalyzer,
    queues: Vec<QueueSpec>,
    checks: Vec<ThresholdCheck>,
}

impl Finalizer {
    pub fn new(
        engine: StatisticsEngine,
        analyzer: QueueStabilityAnalyzer,
        queues: Vec<QueueSpec>,
        checks: Vec<ThresholdCheck>,
    ) -> Self {
        Self {
            engine,
            analyzer,
            queues,
            checks,
        }
    }

    pub fn from_config(config: &PerfConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            StatisticsEngine::new(MetricCatalog::from(&config.metrics)),
            QueueStabilityAnalyzer::new(config.stability.clone())?,
            config.queues.clone(),
            config.checks.clone(),
        ))
    }

    /// Summarise the series and write the summary artifacts when `paths` is
    /// given. Never fails: problems end up in the report.
    pub fn run(&self, series: &[&FrozenSeries], paths: Option<&ArtifactPaths>) -> SessionReport {
        let mut report = SessionReport {
            samples: series.iter().map(|s| s.len()).sum(),
            ..SessionReport::default()
        };

        let summary = match self.engine.summarize(series) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(target: "loadgauge::session", error = %e, "No statistics for this session");
                report.stats_error = Some(e.to_string());
                return report;
            }
        };

        if let Some(paths) = paths {
            if let Err(e) = artifacts::write_summary(paths, &summary) {
                error!(target: "loadgauge::artifacts", error = %e, "Failed to write summary artifacts");
                report.artifact_error = Some(e.to_string());
            }
        }

        for queue in &self.queues {
            let values = summary.gauge_data.get(&queue.metric).map(Vec::as_slice).unwrap_or_default();
            let verdict = self.analyzer.analyze(values);
            verdict.log(&queue.label);

            let limit_breaches = match (queue.max_size, summary.gauges.get(&queue.metric)) {
                (Some(max_size), Some(stat)) => check_queue_limit(&queue.label, stat, max_size),
                _ => Vec::new(),
            };
            report.queues.push(QueueReport {
                label: queue.label.clone(),
                metric: queue.metric.clone(),
                verdict,
                limit_breaches,
            });
        }

        report.checks = evaluate_checks(&summary, &self.checks);
        for check in &report.checks {
            check.log();
        }

        report.summary = Some(summary);
        report
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Provider and cadence of the optional second sampler
pub struct CompanionSampler {
    pub provider: Arc<dyn StatusProvider>,
    pub interval: Duration,
    pub policy: FailurePolicy,
}

#[derive(Debug)]
pub struct MonitoringSession {
    id: Uuid,
    started: Timestamp,
    paths: ArtifactPaths,
    primary: SamplerHandle,
    companion: Option<SamplerHandle>,
}

impl MonitoringSession {
    /// Start sampling. The companion is only started if its probe succeeds.
    pub async fn start(
        primary: Arc<dyn StatusProvider>,
        interval: Duration,
        companion: Option<CompanionSampler>,
        paths: ArtifactPaths,
    ) -> Self {
        let id = Uuid::new_v4();
        info!(
            target: "loadgauge::session",
            session = %id,
            raw_data = %paths.raw_csv.display(),
            "Starting monitoring session"
        );

        let primary = MetricsSampler::new(primary, interval)
            .with_log(&paths.raw_csv)
            .start();

        let companion = match companion {
            Some(spec) => match spec.provider.probe().await {
                Ok(()) => Some(
                    MetricsSampler::new(spec.provider, spec.interval)
                        .with_log(&paths.cpu_csv)
                        .with_failure_policy(spec.policy)
                        .start(),
                ),
                Err(e) => {
                    info!(target: "loadgauge::session", session = %id, error = %e, "Unable to monitor CPU usage");
                    None
                }
            },
            None => None,
        };

        Self {
            id,
            started: Timestamp::now(),
            paths,
            primary,
            companion,
        }
    }

    /// Build the providers described by the configuration and start sampling
    pub async fn from_config(config: &PerfConfig, client: &PlatformClient, index: usize) -> Self {
        let settings = &config.sampler;
        let primary = Arc::new(JsonStatusProvider::new(
            "status",
            client.clone(),
            settings.endpoints.clone(),
            settings.derived.clone(),
        ));
        let companion = settings.companion.as_ref().map(|c| {
            let mut provider = ScalarStatusProvider::new(&c.metric, client.clone(), &c.path);
            if let Some(probe) = &c.probe_path {
                provider = provider.with_probe(probe);
            }
            CompanionSampler {
                provider: Arc::new(provider),
                interval: c.polling_interval,
                policy: c.failure_policy,
            }
        });
        let paths = ArtifactPaths::for_session(&config.output.dir, index);
        Self::start(primary, settings.polling_interval, companion, paths).await
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub fn has_companion(&self) -> bool {
        self.companion.is_some()
    }

    /// True once the primary sampler has stopped by itself
    pub fn primary_finished(&self) -> bool {
        self.primary.is_finished()
    }

    /// Stop both samplers, join each independently and finalise.
    pub async fn finish(self, finalizer: &Finalizer) -> SessionReport {
        self.primary.stop();
        if let Some(companion) = &self.companion {
            companion.stop();
        }

        let companion: OptionFuture<_> = self.companion.map(SamplerHandle::join).into();
        let (primary, companion) = futures::join!(self.primary.join(), companion);

        let sampler_failures: Vec<String> = std::iter::once(&primary)
            .chain(companion.as_ref())
            .filter_map(|outcome: &SamplerOutcome| outcome.failure.as_ref().map(|e| e.to_string()))
            .collect();

        let mut series = vec![&primary.series];
        if let Some(outcome) = &companion {
            series.push(&outcome.series);
        }

        info!(
            target: "loadgauge::session",
            session = %self.id,
            duration = %humantime::format_duration(Timestamp::now().duration_since(self.started)),
            primary_samples = primary.series.len(),
            companion_samples = companion.as_ref().map_or(0, |c| c.series.len()),
            "Monitoring session stopped"
        );

        let mut report = finalizer.run(&series, Some(&self.paths));
        report.session_id = Some(self.id);
        report.sampler_failures = sampler_failures;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerfConfig;
    use crate::error::SamplerError;
    use crate::provider::ScriptedProvider;
    use crate::stats::StatisticName;
    use std::collections::BTreeMap;

    fn finalizer() -> Finalizer {
        let config = PerfConfig::from_str(
            r#"
            [metrics]
            counters = ["received"]

            [[queues]]
            label = "input"
            metric = "depth"
            max_size = 100000.0

            [[checks]]
            metric = "received"
            statistic = "delta"
            max = 1000.0
            "#,
        )
        .unwrap();
        Finalizer::from_config(&config).unwrap()
    }

    fn growing_queue() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::from_fn("status", |n| {
            Ok(BTreeMap::from([
                ("depth".to_string(), 500.0 * n as f64),
                ("received".to_string(), 10.0 * n as f64),
            ]))
        }))
    }

    fn cpu(probe_ok: bool) -> CompanionSampler {
        let provider = ScriptedProvider::from_fn("cpu_usage_milli", |n| {
            Ok(BTreeMap::from([("cpu_usage_milli".to_string(), 100.0 + n as f64)]))
        });
        let provider = if probe_ok { provider } else { provider.failing_probe() };
        CompanionSampler {
            provider: Arc::new(provider),
            interval: Duration::from_secs(1),
            policy: FailurePolicy::Continue,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_finalises_both_samplers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::for_session(dir.path(), 1);
        let session =
            MonitoringSession::start(growing_queue(), Duration::from_secs(1), Some(cpu(true)), paths.clone()).await;
        assert!(session.has_companion());

        tokio::time::sleep(Duration::from_millis(29_500)).await;
        let report = session.finish(&finalizer()).await;

        assert!(report.sampler_failures.is_empty());
        assert_eq!(report.samples, 60);
        let summary = report.summary.as_ref().unwrap();
        assert_eq!(summary.get("received", StatisticName::Delta), Some(290.0));
        assert!(summary.gauges.contains_key("cpu_usage_milli"));

        assert_eq!(report.queues[0].verdict.trend(), Some(QueueTrend::Diverging));
        assert!(!report.is_clean());
        assert_eq!(report.checks[0].status, CheckStatus::Passed);

        assert!(paths.raw_csv.exists());
        assert!(paths.cpu_csv.exists());
        assert!(paths.summary_files().iter().all(|p| p.exists()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_skips_companion() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::for_session(dir.path(), 2);
        let session =
            MonitoringSession::start(growing_queue(), Duration::from_secs(1), Some(cpu(false)), paths.clone()).await;
        assert!(!session.has_companion());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let report = session.finish(&finalizer()).await;
        assert_eq!(report.samples, 3);
        assert!(!paths.cpu_csv.exists());
        assert!(paths.stats_json.to_string_lossy().ends_with("perf_statistics.02.json"));
        assert!(matches!(
            report.queues[0].verdict,
            StabilityVerdict::InsufficientData { samples: 3 }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_failure_still_finalises() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::for_session(dir.path(), 1);
        let provider = Arc::new(ScriptedProvider::from_fn("status", |n| {
            if n == 3 {
                Err(SamplerError::fetch_failed("/status", "502 bad gateway"))
            } else {
                Ok(BTreeMap::from([("depth".to_string(), n as f64)]))
            }
        }));
        let session = MonitoringSession::start(provider, Duration::from_secs(1), None, paths.clone()).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(session.primary_finished());
        let report = session.finish(&finalizer()).await;

        assert_eq!(report.sampler_failures.len(), 1);
        assert_eq!(report.samples, 3);
        assert_eq!(report.summary.unwrap().gauges["depth"].max, 2.0);
        assert!(paths.stats_json.exists());
    }

    #[test]
    fn test_empty_series_reports_insufficient_data() {
        let report = finalizer().run(&[&FrozenSeries::empty()], None);
        assert!(report.summary.is_none());
        assert!(report.stats_error.is_some());
        assert!(report.is_clean());
    }
}
