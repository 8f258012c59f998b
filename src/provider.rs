//! Status providers: where sampled values come from.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::connection::PlatformClient;
use crate::error::SamplerError;
use crate::sampler::StatusProvider;

// ----------------------------------------------------------------------------
// Field extraction
// ----------------------------------------------------------------------------

/// One metric read from a JSON status document: the sum of every pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// JSON pointers; a `*` segment sums over all children at that level
    pub pointers: Vec<String>,
}

/// A status endpoint and the fields read from its response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub path: String,
    pub fields: Vec<FieldSpec>,
}

/// A metric computed as the sum of other metrics of the same sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub name: String,
    pub sum_of: Vec<String>,
}

/// Lenient numeric coercion: numbers, numeric strings and booleans count,
/// anything else (including NaN) is 0.
pub fn coerce_number(value: &JsonValue) -> f64 {
    let number = match value {
        JsonValue::Number(n) => n.as_f64().unwrap_or(0.0),
        JsonValue::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        JsonValue::Bool(b) => f64::from(u8::from(*b)),
        _ => 0.0,
    };
    if number.is_nan() {
        0.0
    } else {
        number
    }
}

/// Resolve a pointer, summing over `*` segments. Missing paths yield 0.
pub fn resolve_pointer(document: &JsonValue, pointer: &str) -> f64 {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect();
    resolve_segments(document, &segments)
}

fn resolve_segments(value: &JsonValue, segments: &[String]) -> f64 {
    let Some((head, rest)) = segments.split_first() else {
        return coerce_number(value);
    };
    if head == "*" {
        return match value {
            JsonValue::Object(map) => map.values().map(|v| resolve_segments(v, rest)).sum(),
            JsonValue::Array(items) => items.iter().map(|v| resolve_segments(v, rest)).sum(),
            _ => 0.0,
        };
    }
    let child = match value {
        JsonValue::Object(map) => map.get(head.as_str()),
        JsonValue::Array(items) => head.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    };
    child.map_or(0.0, |v| resolve_segments(v, rest))
}

/// Apply field specs to a status document
pub fn extract_fields(document: &JsonValue, fields: &[FieldSpec], out: &mut BTreeMap<String, f64>) {
    for field in fields {
        let value = field.pointers.iter().map(|p| resolve_pointer(document, p)).sum();
        out.insert(field.name.clone(), value);
    }
}

/// Add derived fields; unknown inputs count as 0
pub fn apply_derived(derived: &[DerivedField], values: &mut BTreeMap<String, f64>) {
    for field in derived {
        let sum = field
            .sum_of
            .iter()
            .map(|name| values.get(name).copied().unwrap_or(0.0))
            .sum();
        values.insert(field.name.clone(), sum);
    }
}

// ----------------------------------------------------------------------------
// HTTP providers
// ----------------------------------------------------------------------------

async fn fetch_text(client: &PlatformClient, path: &str) -> Result<String, SamplerError> {
    let response = client
        .get(path)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| SamplerError::fetch_failed(path, e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(SamplerError::fetch_failed(path, format!("status {status}")));
    }
    response
        .text()
        .await
        .map_err(|e| SamplerError::fetch_failed(path, e.to_string()))
}

/// Polls JSON status documents and flattens them into named gauges.
#[derive(Debug, Clone)]
pub struct JsonStatusProvider {
    name: String,
    client: PlatformClient,
    endpoints: Vec<EndpointSpec>,
    derived: Vec<DerivedField>,
}

impl JsonStatusProvider {
    pub fn new(
        name: impl Into<String>,
        client: PlatformClient,
        endpoints: Vec<EndpointSpec>,
        derived: Vec<DerivedField>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            endpoints,
            derived,
        }
    }
}

#[async_trait]
impl StatusProvider for JsonStatusProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<BTreeMap<String, f64>, SamplerError> {
        let mut values = BTreeMap::new();
        for endpoint in &self.endpoints {
            let body = fetch_text(&self.client, &endpoint.path).await?;
            let document: JsonValue = serde_json::from_str(&body)
                .map_err(|e| SamplerError::invalid_response(&endpoint.path, e.to_string()))?;
            extract_fields(&document, &endpoint.fields, &mut values);
        }
        apply_derived(&self.derived, &mut values);
        Ok(values)
    }
}

/// Polls an endpoint whose body is a single number.
#[derive(Debug, Clone)]
pub struct ScalarStatusProvider {
    metric: String,
    client: PlatformClient,
    path: String,
    probe_path: Option<String>,
}

impl ScalarStatusProvider {
    pub fn new(metric: impl Into<String>, client: PlatformClient, path: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            client,
            path: path.into(),
            probe_path: None,
        }
    }

    pub fn with_probe(mut self, path: impl Into<String>) -> Self {
        self.probe_path = Some(path.into());
        self
    }

    async fn read(&self, path: &str) -> Result<f64, SamplerError> {
        let body = fetch_text(&self.client, path).await?;
        let value: f64 = body
            .trim()
            .parse()
            .map_err(|_| SamplerError::invalid_response(path, format!("not a number: '{}'", body.trim())))?;
        Ok(value)
    }
}

#[async_trait]
impl StatusProvider for ScalarStatusProvider {
    fn name(&self) -> &str {
        &self.metric
    }

    async fn poll(&self) -> Result<BTreeMap<String, f64>, SamplerError> {
        let value = self.read(&self.path).await?;
        Ok(BTreeMap::from([(self.metric.clone(), value)]))
    }

    async fn probe(&self) -> Result<(), SamplerError> {
        let path = self.probe_path.as_deref().unwrap_or(&self.path);
        self.read(path).await.map(|_| ())
    }
}

// ----------------------------------------------------------------------------
// Scripted provider
// ----------------------------------------------------------------------------

type PollFn = dyn Fn(u64) -> Result<BTreeMap<String, f64>, SamplerError> + Send + Sync;

/// Provider driven by a closure of the poll index (0, 1, 2, ...).
/// Used for offline runs and tests.
pub struct ScriptedProvider {
    name: String,
    script: Box<PollFn>,
    polls: AtomicU64,
    probe_ok: bool,
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("name", &self.name)
            .field("polls", &self.polls.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ScriptedProvider {
    pub fn from_fn<F>(name: impl Into<String>, script: F) -> Self
    where
        F: Fn(u64) -> Result<BTreeMap<String, f64>, SamplerError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            script: Box::new(script),
            polls: AtomicU64::new(0),
            probe_ok: true,
        }
    }

    /// Replays a fixed list of values for one metric, then fails
    pub fn from_values(metric: impl Into<String>, values: Vec<f64>) -> Self {
        let metric = metric.into();
        let name = metric.clone();
        Self::from_fn(name, move |n| {
            values
                .get(n as usize)
                .map(|v| BTreeMap::from([(metric.clone(), *v)]))
                .ok_or_else(|| SamplerError::fetch_failed("script", "script exhausted"))
        })
    }

    pub fn failing_probe(mut self) -> Self {
        self.probe_ok = false;
        self
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StatusProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self) -> Result<BTreeMap<String, f64>, SamplerError> {
        let n = self.polls.fetch_add(1, Ordering::Relaxed);
        (self.script)(n)
    }

    async fn probe(&self) -> Result<(), SamplerError> {
        if self.probe_ok {
            Ok(())
        } else {
            Err(SamplerError::fetch_failed(&self.name, "probe failed"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_coerce_number() {
        assert_eq!(coerce_number(&json!(12.5)), 12.5);
        assert_eq!(coerce_number(&json!("7")), 7.0);
        assert_eq!(coerce_number(&json!("NaN")), 0.0);
        assert_eq!(coerce_number(&json!("n/a")), 0.0);
        assert_eq!(coerce_number(&json!(null)), 0.0);
        assert_eq!(coerce_number(&json!(true)), 1.0);
        assert_eq!(coerce_number(&json!({"a": 1})), 0.0);
    }

    #[test]
    fn test_pointer_resolution() {
        let doc = json!({
            "numQueuedInput": 42,
            "cep_proxy_request_counts": {
                "a": {"requestsStarted": 3, "requestsFailed": 1},
                "b": {"requestsStarted": "4"},
            },
            "list": [10, 20],
        });
        assert_eq!(resolve_pointer(&doc, "/numQueuedInput"), 42.0);
        assert_eq!(resolve_pointer(&doc, "/cep_proxy_request_counts/*/requestsStarted"), 7.0);
        assert_eq!(resolve_pointer(&doc, "/cep_proxy_request_counts/*/requestsFailed"), 1.0);
        assert_eq!(resolve_pointer(&doc, "/list/1"), 20.0);
        assert_eq!(resolve_pointer(&doc, "/list/*"), 30.0);
        assert_eq!(resolve_pointer(&doc, "/missing/deep"), 0.0);
    }

    #[test]
    fn test_extract_and_derive() {
        let corr = json!({"physicalMemoryMB": 300, "swapPagesRead": 1, "swapPagesWrite": 2});
        let ctrl = json!({"apama_ctrl_physical_mb": 120.5});
        let mut values = BTreeMap::new();
        extract_fields(
            &corr,
            &[
                FieldSpec { name: "memory_usage_corr".into(), pointers: vec!["/physicalMemoryMB".into()] },
                FieldSpec {
                    name: "swap".into(),
                    pointers: vec!["/swapPagesRead".into(), "/swapPagesWrite".into()],
                },
            ],
            &mut values,
        );
        extract_fields(
            &ctrl,
            &[FieldSpec { name: "memory_usage_apctrl".into(), pointers: vec!["/apama_ctrl_physical_mb".into()] }],
            &mut values,
        );
        apply_derived(
            &[DerivedField {
                name: "total_memory_usage".into(),
                sum_of: vec!["memory_usage_corr".into(), "memory_usage_apctrl".into()],
            }],
            &mut values,
        );
        assert_eq!(values["swap"], 3.0);
        assert_eq!(values["total_memory_usage"], 420.5);
    }

    #[tokio::test]
    async fn test_scripted_provider() {
        let provider = ScriptedProvider::from_values("depth", vec![1.0, 2.0]);
        assert_eq!(provider.poll().await.unwrap()["depth"], 1.0);
        assert_eq!(provider.poll().await.unwrap()["depth"], 2.0);
        assert!(provider.poll().await.is_err());
        assert_eq!(provider.polls(), 3);
        assert!(provider.probe().await.is_ok());
        assert!(ScriptedProvider::from_values("x", vec![]).failing_probe().probe().await.is_err());
    }
}
