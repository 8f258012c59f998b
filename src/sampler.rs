//! Background metrics sampler.
//!
//! One tokio task per sampler polls its [`StatusProvider`], stamps the result
//! and appends it to a series the task owns outright. Nothing else can see the
//! series until the task has finished and [`SamplerHandle::join`] hands it
//! over frozen.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::SamplerError;
use crate::generator::StopSignal;
use crate::series::{FrozenSeries, MetricSample, MetricSeries, SeriesLog};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Provider trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait StatusProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One atomic snapshot of every metric this provider knows about
    async fn poll(&self) -> Result<BTreeMap<String, f64>, SamplerError>;

    /// Cheap availability check made before a sampler is started
    async fn probe(&self) -> Result<(), SamplerError> {
        Ok(())
    }
}

/// What a sampler does when a poll fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop sampling; the series collected so far is kept
    #[default]
    Abort,
    /// Log the failure and poll again after the usual interval
    Continue,
}

// ----------------------------------------------------------------------------
// Sampler
// ----------------------------------------------------------------------------

pub struct MetricsSampler {
    provider: Arc<dyn StatusProvider>,
    interval: Duration,
    log_path: Option<PathBuf>,
    policy: FailurePolicy,
}

impl std::fmt::Debug for MetricsSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSampler")
            .field("provider", &self.provider.name())
            .field("interval", &self.interval)
            .field("log_path", &self.log_path)
            .field("policy", &self.policy)
            .finish()
    }
}

impl MetricsSampler {
    pub fn new(provider: Arc<dyn StatusProvider>, interval: Duration) -> Self {
        Self {
            provider,
            interval,
            log_path: None,
            policy: FailurePolicy::Abort,
        }
    }

    /// Persist each sample to a CSV file as it is taken
    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Spawn the polling task. Must be called inside a tokio runtime.
    pub fn start(self) -> SamplerHandle {
        let name = self.provider.name().to_string();
        let stop = StopSignal::new();
        let task = tokio::spawn(sampling_loop(
            self.provider,
            self.interval,
            self.log_path,
            self.policy,
            stop.clone(),
        ));

        info!(
            target: "loadgauge::sampler",
            provider = %name,
            interval_ms = self.interval.as_millis() as u64,
            "Sampler started"
        );

        SamplerHandle { name, stop, task }
    }
}

async fn sampling_loop(
    provider: Arc<dyn StatusProvider>,
    interval: Duration,
    log_path: Option<PathBuf>,
    policy: FailurePolicy,
    stop: StopSignal,
) -> SamplerOutcome {
    let mut series = MetricSeries::new();
    let mut polls: u64 = 0;

    let mut log = match log_path.map(SeriesLog::create).transpose() {
        Ok(log) => log,
        Err(e) => {
            error!(target: "loadgauge::sampler", provider = provider.name(), error = %e, "Cannot create sample log");
            return SamplerOutcome {
                series: series.freeze(),
                failure: Some(SamplerError::Persist(e)),
                polls,
            };
        }
    };

    let mut failure = None;
    while !stop.is_stopped() {
        polls += 1;
        match provider.poll().await {
            Ok(values) => {
                let sample = MetricSample::new(Timestamp::now(), values);
                let persisted = log.as_mut().map_or(Ok(()), |log| log.append(&sample));
                series.push(sample);
                if let Err(e) = persisted {
                    error!(target: "loadgauge::sampler", provider = provider.name(), error = %e, "Cannot persist sample, stopping sampler");
                    failure = Some(SamplerError::Persist(e));
                    break;
                }
            }
            Err(e) => match policy {
                FailurePolicy::Abort => {
                    error!(
                        target: "loadgauge::sampler",
                        provider = provider.name(),
                        samples = series.len(),
                        error = %e,
                        "Poll failed, stopping sampler"
                    );
                    failure = Some(e);
                    break;
                }
                FailurePolicy::Continue => {
                    warn!(target: "loadgauge::sampler", provider = provider.name(), error = %e, "Poll failed");
                }
            },
        }

        if !stop.is_stopped() {
            sleep(interval).await;
        }
    }

    debug!(
        target: "loadgauge::sampler",
        provider = provider.name(),
        samples = series.len(),
        polls,
        "Sampling loop finished"
    );

    SamplerOutcome {
        series: series.freeze(),
        failure,
        polls,
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Everything a finished sampler leaves behind
#[derive(Debug)]
pub struct SamplerOutcome {
    pub series: FrozenSeries,
    /// Error that ended sampling early, if any
    pub failure: Option<SamplerError>,
    /// Poll attempts, successful or not
    pub polls: u64,
}

#[derive(Debug)]
pub struct SamplerHandle {
    name: String,
    stop: StopSignal,
    task: JoinHandle<SamplerOutcome>,
}

impl SamplerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request termination. Takes effect before the next poll, so it can take
    /// up to one interval plus one poll.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task and take its series. A task that panicked yields an
    /// empty series and a `TaskFailed` error.
    pub async fn join(self) -> SamplerOutcome {
        match self.task.await {
            Ok(outcome) => {
                info!(
                    target: "loadgauge::sampler",
                    provider = %self.name,
                    samples = outcome.series.len(),
                    failed = outcome.failure.is_some(),
                    "Sampler joined"
                );
                outcome
            }
            Err(e) => {
                error!(target: "loadgauge::sampler", provider = %self.name, error = %e, "Sampler task died");
                SamplerOutcome {
                    series: FrozenSeries::empty(),
                    failure: Some(SamplerError::TaskFailed {
                        name: self.name,
                        message: e.to_string(),
                    }),
                    polls: 0,
                }
            }
        }
    }

    pub async fn stop_and_join(self) -> SamplerOutcome {
        self.stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;

    fn depth_provider(fail_at: Option<u64>) -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::from_fn("depth", move |n| {
            if Some(n) == fail_at {
                return Err(SamplerError::fetch_failed("/status", "connection reset"));
            }
            Ok(BTreeMap::from([("depth".to_string(), n as f64)]))
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_until_stopped() {
        let handle = MetricsSampler::new(depth_provider(None), Duration::from_secs(1)).start();
        sleep(Duration::from_millis(3500)).await;
        let outcome = handle.stop_and_join().await;
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.series.values("depth"), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(outcome.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_keeps_partial_series() {
        let handle = MetricsSampler::new(depth_provider(Some(2)), Duration::from_secs(1)).start();
        sleep(Duration::from_secs(10)).await;
        assert!(handle.is_finished());
        let outcome = handle.join().await;
        assert!(matches!(outcome.failure, Some(SamplerError::FetchFailed { .. })));
        assert_eq!(outcome.series.values("depth"), vec![0.0, 1.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continue_policy_skips_failed_polls() {
        let handle = MetricsSampler::new(depth_provider(Some(1)), Duration::from_secs(1))
            .with_failure_policy(FailurePolicy::Continue)
            .start();
        sleep(Duration::from_millis(2500)).await;
        let outcome = handle.stop_and_join().await;
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.series.values("depth"), vec![0.0, 2.0]);
        assert_eq!(outcome.polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persists_rows_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let handle = MetricsSampler::new(depth_provider(None), Duration::from_secs(1))
            .with_log(&path)
            .start();
        sleep(Duration::from_millis(1500)).await;

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3, "header plus two flushed rows: {text}");

        let outcome = handle.stop_and_join().await;
        let reloaded = crate::series::read_csv(&path).unwrap();
        assert_eq!(reloaded.values("depth"), outcome.series.values("depth"));
    }

    #[tokio::test]
    async fn test_bad_log_path_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let handle = MetricsSampler::new(depth_provider(None), Duration::from_secs(1))
            .with_log(blocker.join("raw.csv"))
            .start();
        let outcome = handle.join().await;
        assert!(matches!(outcome.failure, Some(SamplerError::Persist(_))));
        assert!(outcome.series.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metric_outside_logged_columns_stops_sampler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let provider = Arc::new(ScriptedProvider::from_fn("status", |n| {
            let mut values = BTreeMap::from([("depth".to_string(), n as f64)]);
            if n >= 2 {
                values.insert("late".to_string(), 1.0);
            }
            Ok(values)
        }));
        let handle = MetricsSampler::new(provider, Duration::from_secs(1)).with_log(&path).start();
        sleep(Duration::from_secs(10)).await;
        assert!(handle.is_finished());

        let outcome = handle.join().await;
        assert!(matches!(outcome.failure, Some(SamplerError::Persist(_))));
        assert_eq!(outcome.series.values("late"), vec![1.0]);
        assert_eq!(crate::series::read_csv(&path).unwrap().values("depth"), vec![0.0, 1.0]);
    }
}
