//! Destinations for generated events, and the bounded retry around them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::connection::PlatformClient;
use crate::error::ConfigError;
use crate::{DEFAULT_RETRY_BACKOFF_MS, DEFAULT_RETRY_WINDOW_SECS, PROCESSING_MODE_HEADER};

pub use crate::error::SinkError;

// ----------------------------------------------------------------------------
// Resource kinds
// ----------------------------------------------------------------------------

/// The resource collections the generator knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Measurement,
    Event,
    Alarm,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [ResourceKind::Measurement, ResourceKind::Event, ResourceKind::Alarm];

    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let normalized = path.trim().trim_end_matches('/');
        Self::ALL
            .into_iter()
            .find(|kind| kind.path() == normalized)
            .ok_or_else(|| ConfigError::UnsupportedResource { path: path.to_string() })
    }

    pub fn path(&self) -> &'static str {
        match self {
            ResourceKind::Measurement => "/measurement/measurements",
            ResourceKind::Event => "/event/events",
            ResourceKind::Alarm => "/alarm/alarms",
        }
    }

    /// Content type of a request to this resource
    pub fn content_type(&self) -> &'static str {
        match self {
            ResourceKind::Measurement => "application/vnd.com.nsn.cumulocity.measurementcollection+json",
            ResourceKind::Event => "application/vnd.com.nsn.cumulocity.event+json",
            ResourceKind::Alarm => "application/vnd.com.nsn.cumulocity.alarm+json",
        }
    }

    /// Key wrapping a list of objects in a batched payload
    pub fn collection_key(&self) -> &'static str {
        match self {
            ResourceKind::Measurement => "measurements",
            ResourceKind::Event => "events",
            ResourceKind::Alarm => "alarms",
        }
    }

    pub fn supports_batch(&self) -> bool {
        matches!(self, ResourceKind::Measurement)
    }

    /// Human readable name used in the startup line
    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceKind::Measurement => "measurements",
            ResourceKind::Event => "event",
            ResourceKind::Alarm => "alarm",
        }
    }
}

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub resource_path: String,
    pub content_type: String,
    pub processing_mode: String,
    pub payload: JsonValue,
}

impl SendRequest {
    /// A request carrying one object
    pub fn single(kind: ResourceKind, processing_mode: &str, payload: JsonValue) -> Self {
        Self {
            resource_path: kind.path().to_string(),
            content_type: kind.content_type().to_string(),
            processing_mode: processing_mode.to_string(),
            payload,
        }
    }

    /// A request carrying `{ <collection key>: [payloads..] }`
    pub fn batch(kind: ResourceKind, processing_mode: &str, payloads: Vec<JsonValue>) -> Self {
        let mut wrapper = serde_json::Map::with_capacity(1);
        wrapper.insert(kind.collection_key().to_string(), JsonValue::Array(payloads));
        Self::single(kind, processing_mode, JsonValue::Object(wrapper))
    }

    /// Number of objects carried by this request
    pub fn object_count(&self, kind: ResourceKind) -> usize {
        self.payload
            .get(kind.collection_key())
            .and_then(JsonValue::as_array)
            .map_or(1, Vec::len)
    }
}

// ----------------------------------------------------------------------------
// Sink trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<(), SinkError>;

    /// Whether several objects can be sent to `resource_path` in one call
    fn supports_batch(&self, resource_path: &str) -> bool {
        ResourceKind::from_path(resource_path)
            .map(|kind| kind.supports_batch())
            .unwrap_or(false)
    }
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Arc<S> {
    async fn send(&self, request: &SendRequest) -> Result<(), SinkError> {
        (**self).send(request).await
    }

    fn supports_batch(&self, resource_path: &str) -> bool {
        (**self).supports_batch(resource_path)
    }
}

// ----------------------------------------------------------------------------
// Retry
// ----------------------------------------------------------------------------

/// Fixed-backoff retry bounded by a window measured from the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub window: Duration,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_RETRY_WINDOW_SECS),
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// How a call ended when it did not end in a permanent failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    /// Transient failures for the whole retry window; the call was dropped
    Abandoned { attempts: u32 },
}

impl Delivery {
    pub fn attempts(&self) -> u32 {
        match self {
            Delivery::Delivered { attempts } | Delivery::Abandoned { attempts } => *attempts,
        }
    }
}

/// Send one request, retrying transient failures until the window closes.
/// Permanent failures are returned immediately.
pub async fn send_with_retry<S: Sink + ?Sized>(
    sink: &S,
    request: &SendRequest,
    policy: &RetryPolicy,
) -> Result<Delivery, SinkError> {
    let first_attempt = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match sink.send(request).await {
            Ok(()) => {
                if attempts > 1 {
                    debug!(
                        target: "loadgauge::sink",
                        attempts,
                        resource = %request.resource_path,
                        "Call succeeded after retries"
                    );
                }
                return Ok(Delivery::Delivered { attempts });
            }
            Err(e) if e.is_transient() => {
                if first_attempt.elapsed() >= policy.window {
                    error!(
                        target: "loadgauge::sink",
                        attempts,
                        window_secs = policy.window.as_secs_f64(),
                        resource = %request.resource_path,
                        error = %e,
                        "Giving up on call after retry window expired"
                    );
                    return Ok(Delivery::Abandoned { attempts });
                }
                warn!(
                    target: "loadgauge::sink",
                    attempt = attempts,
                    status = ?e.status(),
                    error = %e,
                    "Transient failure, retrying"
                );
                sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ----------------------------------------------------------------------------
// HTTP sink
// ----------------------------------------------------------------------------

/// Posts requests to the platform REST API.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: PlatformClient,
}

impl HttpSink {
    pub fn new(client: PlatformClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, request: &SendRequest) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&request.resource_path)
            .header(reqwest::header::CONTENT_TYPE, request.content_type.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .header(PROCESSING_MODE_HEADER, request.processing_mode.as_str())
            .json(&request.payload)
            .send()
            .await
            .map_err(|e| SinkError::permanent(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::from_status(status.as_u16(), truncate(&body, 512)))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Log sink
// ----------------------------------------------------------------------------

/// Dry-run sink: logs each request and reports success.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn send(&self, request: &SendRequest) -> Result<(), SinkError> {
        info!(
            target: "loadgauge::sink::dry_run",
            resource = %request.resource_path,
            processing_mode = %request.processing_mode,
            payload = %request.payload,
            "Would send"
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Memory sink
// ----------------------------------------------------------------------------

/// Records every request in memory. Responses can be scripted: each call pops
/// the next scripted result, and once the script is exhausted the fallback
/// result is returned.
#[derive(Debug)]
pub struct MemorySink {
    requests: Mutex<Vec<SendRequest>>,
    script: Mutex<std::collections::VecDeque<Result<(), SinkError>>>,
    fallback: Mutex<Result<(), SinkError>>,
    batching: bool,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            script: Mutex::new(Default::default()),
            fallback: Mutex::new(Ok(())),
            batching: true,
        }
    }

    /// Never report batch support, forcing one call per event
    pub fn without_batching(mut self) -> Self {
        self.batching = false;
        self
    }

    pub fn with_script<I>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = Result<(), SinkError>>,
    {
        self.script.lock().extend(responses);
        self
    }

    pub fn with_fallback(self, response: Result<(), SinkError>) -> Self {
        *self.fallback.lock() = response;
        self
    }

    pub fn requests(&self) -> Vec<SendRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn send(&self, request: &SendRequest) -> Result<(), SinkError> {
        self.requests.lock().push(request.clone());
        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => self.fallback.lock().clone(),
        }
    }

    fn supports_batch(&self, resource_path: &str) -> bool {
        self.batching
            && ResourceKind::from_path(resource_path)
                .map(|kind| kind.supports_batch())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_kinds() {
        assert_eq!(ResourceKind::from_path("/measurement/measurements").unwrap(), ResourceKind::Measurement);
        assert_eq!(ResourceKind::from_path("/event/events/").unwrap(), ResourceKind::Event);
        assert_eq!(ResourceKind::from_path("/alarm/alarms").unwrap(), ResourceKind::Alarm);
        assert!(matches!(
            ResourceKind::from_path("/inventory/managedObjects"),
            Err(ConfigError::UnsupportedResource { .. })
        ));
        assert!(ResourceKind::Measurement.supports_batch());
        assert!(!ResourceKind::Alarm.supports_batch());
        assert!(ResourceKind::Measurement.content_type().ends_with("measurementcollection+json"));
    }

    #[test]
    fn test_batch_request_shape() {
        let req = SendRequest::batch(ResourceKind::Measurement, "CEP", vec![json!({"a": 1}), json!({"a": 2})]);
        assert_eq!(req.payload, json!({"measurements": [{"a": 1}, {"a": 2}]}));
        assert_eq!(req.object_count(ResourceKind::Measurement), 2);
        let single = SendRequest::single(ResourceKind::Event, "PERSISTENT", json!({"type": "x"}));
        assert_eq!(single.object_count(ResourceKind::Event), 1);
        assert_eq!(single.processing_mode, "PERSISTENT");
    }

    #[test]
    fn test_default_batch_support_follows_resource() {
        assert!(LogSink.supports_batch("/measurement/measurements"));
        assert!(!LogSink.supports_batch("/event/events"));
        assert!(!LogSink.supports_batch("/nope"));
        assert!(!MemorySink::new().without_batching().supports_batch("/measurement/measurements"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let sink = MemorySink::new().with_script(vec![
            Err(SinkError::from_status(503, "busy")),
            Err(SinkError::from_status(503, "busy")),
            Err(SinkError::from_status(503, "busy")),
        ]);
        let req = SendRequest::single(ResourceKind::Event, "CEP", json!({}));
        let started = Instant::now();
        let outcome = send_with_retry(&sink, &req, &RetryPolicy::default()).await.unwrap();
        assert_eq!(outcome, Delivery::Delivered { attempts: 4 });
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_abandons_after_window() {
        let sink = MemorySink::new().with_fallback(Err(SinkError::from_status(500, "down")));
        let req = SendRequest::single(ResourceKind::Alarm, "CEP", json!({}));
        let policy = RetryPolicy {
            window: Duration::from_secs(2),
            backoff: Duration::from_millis(500),
        };
        let outcome = send_with_retry(&sink, &req, &policy).await.unwrap();
        // attempts at 0.0, 0.5, 1.0, 1.5, 2.0
        assert_eq!(outcome, Delivery::Abandoned { attempts: 5 });
        assert_eq!(sink.call_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let sink = MemorySink::new().with_fallback(Err(SinkError::from_status(401, "denied")));
        let req = SendRequest::single(ResourceKind::Event, "CEP", json!({}));
        let err = send_with_retry(&sink, &req, &RetryPolicy::default()).await.unwrap_err();
        assert_eq!(err.status(), Some(401));
        assert_eq!(sink.call_count(), 1);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
