//! Rate-tracking load generator.
//!
//! Every tick computes how many events should have been forwarded by now,
//! `ceil(rate * elapsed) - total_sent`, and sends that many (capped) in one
//! batch. A slow sink therefore produces larger batches instead of a falling
//! rate, and the cap keeps a long stall from turning into one huge burst.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::config::GeneratorSettings;
use crate::error::{ConfigError, PerfError};
use crate::factory::EventFactory;
use crate::sink::{send_with_retry, Delivery, ResourceKind, RetryPolicy, SendRequest, Sink};
use crate::types::SourceSet;

// ----------------------------------------------------------------------------
// Stop signal
// ----------------------------------------------------------------------------

/// Cooperative stop flag. Checked once per tick; a tick in progress (including
/// its retries) is finished first.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    StopRequested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::DurationElapsed => write!(f, "duration elapsed"),
            StopReason::StopRequested => write!(f, "stop requested"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratorReport {
    /// Events handed to the sink, delivered or abandoned
    pub total_sent: u64,
    pub delivered: u64,
    /// Events in calls dropped after the retry window expired
    pub abandoned: u64,
    pub batches: u64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub stop_reason: StopReason,
}

impl GeneratorReport {
    pub fn achieved_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_sent as f64 / secs
        } else {
            0.0
        }
    }

    pub fn mean_batch_size(&self) -> f64 {
        if self.batches > 0 {
            self.total_sent as f64 / self.batches as f64
        } else {
            0.0
        }
    }
}

// ----------------------------------------------------------------------------
// Generator
// ----------------------------------------------------------------------------

pub struct LoadGenerator {
    sources: SourceSet,
    per_source_rate: f64,
    duration: Option<Duration>,
    factory: Box<dyn EventFactory>,
    sink: Arc<dyn Sink>,
    resource: ResourceKind,
    processing_mode: String,
    send_interval: Duration,
    settings: GeneratorSettings,
    stop: StopSignal,
}

impl fmt::Debug for LoadGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadGenerator")
            .field("sources", &self.sources.len())
            .field("per_source_rate", &self.per_source_rate)
            .field("duration", &self.duration)
            .field("factory", &self.factory.name())
            .field("resource", &self.resource)
            .field("processing_mode", &self.processing_mode)
            .finish_non_exhaustive()
    }
}

impl LoadGenerator {
    /// Fails when the rate is not a finite positive number or the duration is
    /// zero.
    pub fn new(
        sources: SourceSet,
        per_source_rate: f64,
        duration: Option<Duration>,
        factory: Box<dyn EventFactory>,
        sink: Arc<dyn Sink>,
        resource: ResourceKind,
        processing_mode: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if !(per_source_rate.is_finite() && per_source_rate > 0.0) {
            return Err(ConfigError::invalid_value(
                "per_source_rate",
                format!("must be a positive number, got {per_source_rate}"),
            ));
        }
        if duration.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid_value("duration", "must be greater than zero"));
        }
        let aggregate_rate = sources.len() as f64 * per_source_rate;
        let send_interval = Duration::try_from_secs_f64(1.0 / aggregate_rate).map_err(|_| {
            ConfigError::invalid_value("per_source_rate", format!("rate {per_source_rate} is too small"))
        })?;
        Ok(Self {
            sources,
            per_source_rate,
            duration,
            factory,
            sink,
            resource,
            processing_mode: processing_mode.into(),
            send_interval,
            settings: GeneratorSettings::default(),
            stop: StopSignal::new(),
        })
    }

    pub fn with_settings(mut self, settings: GeneratorSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    /// Handle for stopping the generator from another task
    pub fn stop_handle(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn aggregate_rate(&self) -> f64 {
        self.sources.len() as f64 * self.per_source_rate
    }

    /// The greppable line announcing the start of a publishing run
    pub fn startup_line(&self) -> String {
        let sources: Vec<&str> = self.sources.iter().map(|s| s.as_str()).collect();
        format!(
            "{} {} with rate of {} objects per source per second, with processing mode {} to sources: {:?}",
            crate::STARTUP_LINE_PREFIX,
            self.resource.type_name(),
            self.per_source_rate,
            self.processing_mode,
            sources
        )
    }

    /// Run until the duration elapses or a stop is requested. Only a permanent
    /// sink failure ends the run with an error.
    pub async fn run(self) -> Result<GeneratorReport, PerfError> {
        let aggregate_rate = self.aggregate_rate();
        let LoadGenerator {
            sources,
            duration,
            mut factory,
            sink,
            resource,
            processing_mode,
            send_interval,
            settings,
            stop,
            ..
        } = self;

        let retry = RetryPolicy {
            window: settings.retry_window,
            backoff: settings.retry_backoff,
        };
        let batching = sink.supports_batch(resource.path());

        let started = Instant::now();
        // back-dated by one interval so the first tick sends immediately
        let schedule_origin = started.checked_sub(send_interval).unwrap_or(started);
        let finish = duration.map(|d| started + d);

        let mut cursor = sources.cursor();
        let mut total_sent: u64 = 0;
        let mut delivered: u64 = 0;
        let mut abandoned: u64 = 0;
        let mut batches: u64 = 0;
        let mut last_progress = started;

        info!(
            target: "loadgauge::generator",
            sources = sources.len(),
            aggregate_rate,
            resource = resource.path(),
            factory = factory.name(),
            batching,
            "Load generator started"
        );

        let stop_reason = loop {
            if stop.is_stopped() {
                break StopReason::StopRequested;
            }
            let tick_start = Instant::now();
            if finish.is_some_and(|f| tick_start >= f) {
                break StopReason::DurationElapsed;
            }

            let elapsed = tick_start.duration_since(schedule_origin).as_secs_f64();
            // epsilon keeps exact boundaries from rounding up one event early
            let target = (aggregate_rate * elapsed - 1e-9).ceil().max(0.0) as u64;
            let due = target.saturating_sub(total_sent).min(settings.max_batch_size as u64);

            if due > 0 {
                let now = Utc::now();
                let mut batch: Vec<JsonValue> = Vec::with_capacity(due as usize);
                for _ in 0..due {
                    let source = cursor.next_source();
                    if let Some(payload) = factory.create_event(source, now) {
                        batch.push(payload);
                    }
                }

                let batch_len = batch.len() as u64;
                if batch_len > 0 {
                    let requests = if batching {
                        vec![SendRequest::batch(resource, &processing_mode, batch)]
                    } else {
                        batch
                            .into_iter()
                            .map(|payload| SendRequest::single(resource, &processing_mode, payload))
                            .collect()
                    };

                    for request in &requests {
                        let objects = request.object_count(resource) as u64;
                        match send_with_retry(sink.as_ref(), request, &retry).await {
                            Ok(Delivery::Delivered { .. }) => delivered += objects,
                            Ok(Delivery::Abandoned { .. }) => abandoned += objects,
                            Err(e) => {
                                error!(
                                    target: "loadgauge::generator",
                                    error = %e,
                                    total_sent,
                                    "Permanent sink failure, stopping generator"
                                );
                                return Err(e.into());
                            }
                        }
                    }
                }

                // abandoned calls count as sent: they are not re-scheduled
                total_sent += batch_len;
                batches += 1;

                if tick_start.duration_since(last_progress) >= settings.progress_interval {
                    let run_secs = tick_start.duration_since(schedule_origin).as_secs_f64();
                    info!(
                        target: "loadgauge::generator",
                        total_sent,
                        rate = total_sent as f64 / run_secs,
                        mean_batch_size = total_sent as f64 / batches as f64,
                        abandoned,
                        "Progress"
                    );
                    last_progress = tick_start;
                }
            }

            let next_tick = tick_start + send_interval;
            if next_tick > Instant::now() {
                sleep_until(next_tick).await;
            } else {
                debug!(target: "loadgauge::generator", "Tick overran its interval");
            }
        };

        let report = GeneratorReport {
            total_sent,
            delivered,
            abandoned,
            batches,
            elapsed: started.elapsed(),
            stop_reason,
        };

        info!(
            target: "loadgauge::generator",
            total_sent = report.total_sent,
            delivered = report.delivered,
            abandoned = report.abandoned,
            achieved_rate = report.achieved_rate(),
            mean_batch_size = report.mean_batch_size(),
            reason = %report.stop_reason,
            "Load generator finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FixedFactory;
    use crate::sink::MemorySink;
    use crate::error::SinkError;
    use serde_json::json;

    fn generator(
        sources: &[&str],
        rate: f64,
        duration: Option<Duration>,
        sink: Arc<MemorySink>,
        resource: ResourceKind,
    ) -> LoadGenerator {
        LoadGenerator::new(
            SourceSet::new(sources.iter().copied()).unwrap(),
            rate,
            duration,
            Box::new(FixedFactory::new(json!({"type": "t"}))),
            sink,
            resource,
            "CEP",
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_rate() {
        let sources = SourceSet::new(["a"]).unwrap();
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let result = LoadGenerator::new(
                sources.clone(),
                rate,
                None,
                Box::new(FixedFactory::new(json!({}))),
                Arc::new(MemorySink::new()),
                ResourceKind::Event,
                "CEP",
            );
            assert!(result.is_err(), "rate {rate} accepted");
        }
    }

    #[test]
    fn test_startup_line() {
        let gen = generator(&["101", "102"], 2.5, None, Arc::new(MemorySink::new()), ResourceKind::Event);
        assert_eq!(
            gen.startup_line(),
            "Started publishing event with rate of 2.5 objects per source per second, with processing mode CEP to sources: [\"101\", \"102\"]"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_sends_immediately() {
        let sink = Arc::new(MemorySink::new());
        let gen = generator(&["a"], 1.0, Some(Duration::from_millis(10)), sink.clone(), ResourceKind::Event);
        let report = gen.run().await.unwrap();
        assert_eq!(report.total_sent, 1);
        assert_eq!(sink.call_count(), 1);
        assert_eq!(report.stop_reason, StopReason::DurationElapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_measurements() {
        let sink = Arc::new(MemorySink::new());
        let gen = generator(&["a", "b"], 10.0, Some(Duration::from_secs(2)), sink.clone(), ResourceKind::Measurement);
        let report = gen.run().await.unwrap();
        assert_eq!(report.total_sent, 40);
        assert_eq!(report.delivered, 40);
        assert_eq!(report.batches, 40);
        for request in sink.requests() {
            assert!(request.payload["measurements"].is_array());
            assert_eq!(request.resource_path, "/measurement/measurements");
            assert_eq!(request.processing_mode, "CEP");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_cap_defers_backlog() {
        // sink stalls 2s on the first call: the backlog is sent in capped batches
        let sink = Arc::new(
            MemorySink::new()
                .with_script(vec![Err(SinkError::from_status(503, "x")); 4]),
        );
        let gen = generator(&["a"], 100.0, Some(Duration::from_secs(3)), sink.clone(), ResourceKind::Measurement)
            .with_settings(GeneratorSettings {
                max_batch_size: 50,
                ..GeneratorSettings::default()
            })
            .unwrap();
        let report = gen.run().await.unwrap();
        for request in sink.requests() {
            assert!(request.object_count(ResourceKind::Measurement) <= 50);
        }
        assert!(report.total_sent <= 300);
        assert!(report.total_sent >= 250, "caught up to {}", report.total_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_signal_ends_run() {
        let sink = Arc::new(MemorySink::new());
        let gen = generator(&["a"], 5.0, None, sink.clone(), ResourceKind::Event);
        let stop = gen.stop_handle();
        let task = tokio::spawn(gen.run());
        tokio::time::sleep(Duration::from_secs(2)).await;
        stop.stop();
        let report = task.await.unwrap().unwrap();
        assert_eq!(report.stop_reason, StopReason::StopRequested);
        assert!((10..=12).contains(&report.total_sent), "sent {}", report.total_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_ends_run() {
        let sink = Arc::new(MemorySink::new().with_fallback(Err(SinkError::from_status(400, "bad"))));
        let gen = generator(&["a"], 1.0, None, sink.clone(), ResourceKind::Alarm);
        let err = gen.run().await.unwrap_err();
        assert!(matches!(err, PerfError::Sink(SinkError::Permanent { status: Some(400), .. })));
        assert_eq!(sink.call_count(), 1);
    }
}
