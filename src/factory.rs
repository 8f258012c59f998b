//! Event factories and the registry that resolves them by name.
//!
//! A factory turns `(source, time)` into an opaque JSON payload, or into
//! nothing when the scenario wants that source to stay silent for a while.
//! Factories are stateful (per-source counters live inside them) and are
//! driven by exactly one generator task, so they take `&mut self`.

use std::collections::BTreeMap;
use std::fmt;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::ConfigError;
use crate::types::{format_event_time, SourceId};

pub trait EventFactory: Send {
    /// Registry name, for log lines
    fn name(&self) -> &str;

    fn create_event(&mut self, source: &SourceId, time: DateTime<Utc>) -> Option<JsonValue>;
}

impl fmt::Debug for dyn EventFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventFactory({})", self.name())
    }
}

fn measurement(
    source: &SourceId,
    time: DateTime<Utc>,
    measurement_type: &str,
    fragment: &str,
    series: &str,
    value: f64,
) -> JsonValue {
    let mut body = json!({
        "time": format_event_time(time),
        "type": measurement_type,
        "source": { "id": source.as_str() },
    });
    let mut fragment_body = serde_json::Map::with_capacity(1);
    fragment_body.insert(series.to_string(), json!({ "value": value }));
    body[fragment] = JsonValue::Object(fragment_body);
    body
}

// ----------------------------------------------------------------------------
// Constructor parameter access
// ----------------------------------------------------------------------------

/// Positional view over a descriptor's `constructorParams`
struct Params<'a> {
    factory: &'a str,
    values: &'a [JsonValue],
}

impl<'a> Params<'a> {
    fn new(factory: &'a str, values: &'a [JsonValue]) -> Self {
        Self { factory, values }
    }

    fn expect_len(&self, min: usize, max: usize) -> Result<(), ConfigError> {
        let len = self.values.len();
        if len < min || len > max {
            let expected = if min == max {
                format!("{min}")
            } else {
                format!("{min} to {max}")
            };
            return Err(ConfigError::factory_params(
                self.factory,
                format!("expected {expected} parameters, got {len}"),
            ));
        }
        Ok(())
    }

    fn str_or(&self, idx: usize, default: &'a str) -> Result<&'a str, ConfigError> {
        match self.values.get(idx) {
            None | Some(JsonValue::Null) => Ok(default),
            Some(JsonValue::String(s)) => Ok(s.as_str()),
            Some(other) => Err(ConfigError::factory_params(
                self.factory,
                format!("parameter {idx} must be a string, got {other}"),
            )),
        }
    }

    fn positive(&self, idx: usize) -> Result<f64, ConfigError> {
        let value = self
            .values
            .get(idx)
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| {
                ConfigError::factory_params(self.factory, format!("parameter {idx} must be a number"))
            })?;
        if !(value.is_finite() && value > 0.0) {
            return Err(ConfigError::factory_params(
                self.factory,
                format!("parameter {idx} must be positive, got {value}"),
            ));
        }
        Ok(value)
    }
}

// ----------------------------------------------------------------------------
// default
// ----------------------------------------------------------------------------

/// Random measurement in `[0, 100)` for every call.
#[derive(Debug)]
pub struct DefaultFactory {
    measurement_type: String,
    rng: StdRng,
}

impl DefaultFactory {
    pub const NAME: &'static str = "default";

    pub fn new(measurement_type: impl Into<String>) -> Self {
        Self {
            measurement_type: measurement_type.into(),
            rng: StdRng::from_entropy(),
        }
    }

    fn from_params(params: &[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> {
        let p = Params::new(Self::NAME, params);
        p.expect_len(0, 1)?;
        Ok(Box::new(Self::new(p.str_or(0, "my_measurement")?)))
    }
}

impl Default for DefaultFactory {
    fn default() -> Self {
        Self::new("my_measurement")
    }
}

impl EventFactory for DefaultFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_event(&mut self, source: &SourceId, time: DateTime<Utc>) -> Option<JsonValue> {
        let value = self.rng.gen_range(0.0..100.0);
        Some(measurement(source, time, &self.measurement_type, "my_fragment", "my_series", value))
    }
}

// ----------------------------------------------------------------------------
// fixed
// ----------------------------------------------------------------------------

/// Same payload every time, stamped with the source and time of the call.
#[derive(Debug, Clone)]
pub struct FixedFactory {
    template: JsonValue,
}

impl FixedFactory {
    pub const NAME: &'static str = "fixed";

    pub fn new(template: JsonValue) -> Self {
        Self { template }
    }

    fn from_params(params: &[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> {
        let p = Params::new(Self::NAME, params);
        p.expect_len(0, 1)?;
        let template = params.first().cloned().unwrap_or_else(|| json!({ "type": "fixed" }));
        if !template.is_object() {
            return Err(ConfigError::factory_params(Self::NAME, "payload template must be a JSON object"));
        }
        Ok(Box::new(Self::new(template)))
    }
}

impl EventFactory for FixedFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_event(&mut self, source: &SourceId, time: DateTime<Utc>) -> Option<JsonValue> {
        let mut payload = self.template.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("time".into(), JsonValue::String(format_event_time(time)));
            obj.insert("source".into(), json!({ "id": source.as_str() }));
        }
        Some(payload)
    }
}

// ----------------------------------------------------------------------------
// abnormal-mean
// ----------------------------------------------------------------------------

/// Values close to a desired mean; now and then one source gets a spike that
/// moves its windowed mean to the abnormal target, followed by a compensating
/// low value on its next turn.
#[derive(Debug)]
pub struct AbnormalMeanFactory {
    measurement_type: String,
    fragment: String,
    series: String,
    /// Fraction of all measurements that should trigger a deviation
    spike_fraction: f64,
    /// Measurements per source inside the moving window
    window_size: f64,
    counts: AHashMap<SourceId, u64>,
    last: AHashMap<SourceId, f64>,
    rng: StdRng,
}

impl AbnormalMeanFactory {
    pub const NAME: &'static str = "abnormal-mean";
    pub const TARGET_SPIKE_RATE: f64 = 2.0;
    pub const DESIRED_MEAN: f64 = 100.0;
    pub const ABNORMAL_MEAN: f64 = 102.0;

    pub fn new(
        measurement_type: impl Into<String>,
        fragment: impl Into<String>,
        series: impl Into<String>,
        window: f64,
        num_sources: f64,
        per_source_rate: f64,
    ) -> Self {
        Self {
            measurement_type: measurement_type.into(),
            fragment: fragment.into(),
            series: series.into(),
            spike_fraction: Self::TARGET_SPIKE_RATE / (num_sources * per_source_rate),
            window_size: window * per_source_rate,
            counts: AHashMap::new(),
            last: AHashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn from_params(params: &[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> {
        let p = Params::new(Self::NAME, params);
        p.expect_len(6, 6)?;
        Ok(Box::new(Self::new(
            p.str_or(0, "c8y_Measurement")?,
            p.str_or(1, "c8y_Fragment")?,
            p.str_or(2, "c8y_Series")?,
            p.positive(3)?,
            p.positive(4)?,
            p.positive(5)?,
        )))
    }

    fn next_value(&mut self, count: u64, last: f64) -> f64 {
        if last > Self::ABNORMAL_MEAN {
            return Self::DESIRED_MEAN - (last - Self::DESIRED_MEAN);
        }
        if count > 0 && self.rng.gen::<f64>() < self.spike_fraction {
            // one value leaves the window once it is full
            let window = (count as f64).min(self.window_size - 1.0).max(0.0);
            return Self::ABNORMAL_MEAN + window * (Self::ABNORMAL_MEAN - Self::DESIRED_MEAN);
        }
        Self::DESIRED_MEAN + (self.rng.gen::<f64>() - 0.5) / 10.0
    }
}

impl EventFactory for AbnormalMeanFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_event(&mut self, source: &SourceId, time: DateTime<Utc>) -> Option<JsonValue> {
        let count = self.counts.get(source).copied().unwrap_or(0);
        self.counts.insert(source.clone(), count + 1);
        let last = self.last.get(source).copied().unwrap_or(0.0);

        let value = self.next_value(count, last);
        self.last.insert(source.clone(), value);

        Some(measurement(source, time, &self.measurement_type, &self.fragment, &self.series, value))
    }
}

// ----------------------------------------------------------------------------
// intermittent
// ----------------------------------------------------------------------------

/// Sends for two thirds of each cycle and stays silent for the remaining
/// third, so that "missing measurement" detection fires.
#[derive(Debug)]
pub struct IntermittentFactory {
    measurement_type: String,
    /// Creations per source before toggling between sending and silence
    toggle_count: u64,
    counts: AHashMap<SourceId, u64>,
    rng: StdRng,
}

impl IntermittentFactory {
    pub const NAME: &'static str = "intermittent";
    /// Missing-measurement checks run every minute
    pub const MIN_SILENCE_SECS: f64 = 60.0;
    pub const SETTLE_SECS: f64 = 70.0;

    pub fn new(measurement_type: impl Into<String>, per_source_rate: f64, time_period_secs: f64) -> Self {
        let period = time_period_secs.max(Self::MIN_SILENCE_SECS) + Self::SETTLE_SECS;
        let toggle_count = ((period * per_source_rate).round() as u64).max(1);
        Self {
            measurement_type: measurement_type.into(),
            toggle_count,
            counts: AHashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn toggle_count(&self) -> u64 {
        self.toggle_count
    }

    fn from_params(params: &[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> {
        let p = Params::new(Self::NAME, params);
        p.expect_len(3, 3)?;
        Ok(Box::new(Self::new(p.str_or(0, "c8y_Measurement")?, p.positive(1)?, p.positive(2)?)))
    }
}

impl EventFactory for IntermittentFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_event(&mut self, source: &SourceId, time: DateTime<Utc>) -> Option<JsonValue> {
        let count = match self.counts.get(source) {
            Some(count) => *count,
            None => self.rng.gen_range(0..=3 * self.toggle_count),
        };
        self.counts.insert(source.clone(), count + 1);

        if (count / self.toggle_count) % 3 == 1 {
            return None;
        }
        let value = self.rng.gen_range(0.0..100.0);
        Some(measurement(
            source,
            time,
            &self.measurement_type,
            "measurement_frag",
            "measurement_series",
            value,
        ))
    }
}

// ----------------------------------------------------------------------------
// geofence
// ----------------------------------------------------------------------------

const INSIDE_FENCE: [(f64, f64); 4] = [(2.0, 2.0), (3.0, 3.0), (1.978, 3.75), (2.78, 3.335)];
const OUTSIDE_FENCE: [(f64, f64); 4] = [(0.78, -29.78), (-1.22, -24.98), (5.0, 5.0), (6.0, 7.94)];

/// Position events that move each source in and out of a fence.
#[derive(Debug)]
pub struct GeofenceFactory {
    /// Creations per source for one outside/inside cycle
    cycle: u64,
    counts: AHashMap<SourceId, u64>,
    rng: StdRng,
}

impl GeofenceFactory {
    pub const NAME: &'static str = "geofence";
    pub const TARGET_ALARM_RATE: f64 = 2.0;

    /// `trigger == "both"` fires on entry and exit, so each cycle is held twice
    /// as long to keep the alarm rate.
    pub fn new(per_source_rate: f64, total_sources: f64, trigger: &str) -> Self {
        let mut cycle = per_source_rate * total_sources / Self::TARGET_ALARM_RATE;
        if trigger == "both" {
            cycle *= 2.0;
        }
        let cycle = if cycle < 2.0 { 2 } else { cycle as u64 };
        Self {
            cycle,
            counts: AHashMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn from_params(params: &[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> {
        let p = Params::new(Self::NAME, params);
        p.expect_len(2, 3)?;
        Ok(Box::new(Self::new(p.positive(0)?, p.positive(1)?, p.str_or(2, "entering")?)))
    }

    fn pick(&mut self, fence: &[(f64, f64)]) -> (f64, f64) {
        let lng = fence.choose(&mut self.rng).map_or(0.0, |p| p.0);
        let lat = fence.choose(&mut self.rng).map_or(0.0, |p| p.1);
        (lng, lat)
    }

    fn is_outside(&self, count: u64) -> bool {
        ((count % self.cycle) as f64) < self.cycle as f64 / 2.0
    }
}

impl EventFactory for GeofenceFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_event(&mut self, source: &SourceId, time: DateTime<Utc>) -> Option<JsonValue> {
        let count = match self.counts.get(source) {
            Some(count) => *count,
            None => self.rng.gen_range(0..=self.cycle),
        };
        self.counts.insert(source.clone(), count + 1);

        let (lng, lat) = if self.is_outside(count) {
            self.pick(&OUTSIDE_FENCE)
        } else {
            self.pick(&INSIDE_FENCE)
        };

        Some(json!({
            "time": format_event_time(time),
            "type": "position",
            "text": "Position update",
            "source": { "id": source.as_str() },
            "c8y_Position": { "lng": lng, "lat": lat },
        }))
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// `{"className": name, "constructorParams": [...]}` as handed over on the
/// command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryDescriptor {
    #[serde(rename = "className", alias = "name")]
    pub class_name: String,
    #[serde(rename = "constructorParams", default)]
    pub constructor_params: Vec<JsonValue>,
}

impl FactoryDescriptor {
    pub fn new(class_name: impl Into<String>, constructor_params: Vec<JsonValue>) -> Self {
        Self {
            class_name: class_name.into(),
            constructor_params,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let descriptor: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidDescriptor { message: e.to_string() })?;
        if descriptor.class_name.trim().is_empty() {
            return Err(ConfigError::InvalidDescriptor {
                message: "className must not be empty".into(),
            });
        }
        Ok(descriptor)
    }
}

pub type FactoryConstructor =
    Box<dyn Fn(&[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> + Send + Sync>;

struct Registration {
    summary: &'static str,
    constructor: FactoryConstructor,
}

/// Name -> constructor table
pub struct FactoryRegistry {
    entries: BTreeMap<String, Registration>,
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FactoryRegistry {
    pub fn empty() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Registry holding every factory shipped with the crate
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(
            DefaultFactory::NAME,
            "random measurement in [0, 100); params: [type?]",
            DefaultFactory::from_params,
        );
        registry.register(
            FixedFactory::NAME,
            "constant payload stamped with source and time; params: [template?]",
            FixedFactory::from_params,
        );
        registry.register(
            AbnormalMeanFactory::NAME,
            "values around 100 with periodic mean deviations; params: [type, fragment, series, window_secs, sources, rate]",
            AbnormalMeanFactory::from_params,
        );
        registry.register(
            IntermittentFactory::NAME,
            "measurements with periodic silence; params: [type, rate, time_period_secs]",
            IntermittentFactory::from_params,
        );
        registry.register(
            GeofenceFactory::NAME,
            "position events in and out of a fence; params: [rate, sources, trigger?]",
            GeofenceFactory::from_params,
        );
        registry
    }

    /// Register (or replace) a constructor under `name`
    pub fn register<F>(&mut self, name: &str, summary: &'static str, constructor: F)
    where
        F: Fn(&[JsonValue]) -> Result<Box<dyn EventFactory>, ConfigError> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Registration {
                summary,
                constructor: Box::new(constructor),
            },
        );
    }

    pub fn create(&self, descriptor: &FactoryDescriptor) -> Result<Box<dyn EventFactory>, ConfigError> {
        let entry = self.entries.get(descriptor.class_name.as_str()).ok_or_else(|| {
            ConfigError::UnknownFactory {
                name: descriptor.class_name.clone(),
                registered: self.names().join(", "),
            }
        })?;
        (entry.constructor)(&descriptor.constructor_params)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// `(name, summary)` pairs in name order
    pub fn describe(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.entries.iter().map(|(name, reg)| (name.as_str(), reg.summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_default_factory_payload() {
        let mut factory = DefaultFactory::default();
        let payload = factory.create_event(&SourceId::new("42"), t0()).unwrap();
        assert_eq!(payload["source"]["id"], "42");
        assert_eq!(payload["time"], "2024-01-01T00:00:00.000Z");
        assert_eq!(payload["type"], "my_measurement");
        let value = payload["my_fragment"]["my_series"]["value"].as_f64().unwrap();
        assert!((0.0..100.0).contains(&value));
    }

    #[test]
    fn test_fixed_factory_stamps_source() {
        let mut factory = FixedFactory::new(json!({"type": "t", "text": "hello"}));
        let payload = factory.create_event(&SourceId::new("a"), t0()).unwrap();
        assert_eq!(
            payload,
            json!({"type": "t", "text": "hello", "time": "2024-01-01T00:00:00.000Z", "source": {"id": "a"}})
        );
    }

    #[test]
    fn test_abnormal_mean_compensates_spikes() {
        // one source at 1/s: every non-first creation may spike
        let mut factory = AbnormalMeanFactory::new("t", "f", "s", 10.0, 1.0, 1.0).with_seed(7);
        let source = SourceId::new("dev");
        let values: Vec<f64> = (0..200)
            .map(|_| {
                let payload = factory.create_event(&source, t0()).unwrap();
                payload["f"]["s"]["value"].as_f64().unwrap()
            })
            .collect();

        assert!((values[0] - 100.0).abs() <= 0.05, "first value is never a spike");
        for pair in values.windows(2) {
            if pair[0] > AbnormalMeanFactory::ABNORMAL_MEAN {
                assert_eq!(pair[1], 200.0 - pair[0]);
                assert!(pair[0] <= 102.0 + 9.0 * 2.0, "window bounded by window size - 1");
            }
        }
    }

    #[test]
    fn test_intermittent_skips_one_third() {
        let mut factory = IntermittentFactory::new("t", 1.0, 10.0).with_seed(3);
        assert_eq!(factory.toggle_count(), 130);
        let source = SourceId::new("dev");
        let total = 3 * 130 * 4;
        let sent = (0..total)
            .filter(|_| factory.create_event(&source, t0()).is_some())
            .count();
        assert_eq!(sent, total * 2 / 3);
    }

    #[test]
    fn test_geofence_alternates_sides() {
        let mut factory = GeofenceFactory::new(1.0, 4.0, "entering").with_seed(11);
        let source = SourceId::new("dev");
        let mut inside = 0;
        for _ in 0..8 {
            let payload = factory.create_event(&source, t0()).unwrap();
            assert_eq!(payload["type"], "position");
            let lng = payload["c8y_Position"]["lng"].as_f64().unwrap();
            if INSIDE_FENCE.iter().any(|p| p.0 == lng) {
                inside += 1;
            }
        }
        // cycle of 2: one inside, one outside per cycle
        assert_eq!(inside, 4);
    }

    #[test]
    fn test_registry_resolves_builtin_factories() {
        let registry = FactoryRegistry::builtin();
        assert_eq!(registry.names(), vec!["abnormal-mean", "default", "fixed", "geofence", "intermittent"]);

        let descriptor = FactoryDescriptor::from_json(
            r#"{"className": "intermittent", "constructorParams": ["c8y_Temp", 2, 30]}"#,
        )
        .unwrap();
        let factory = registry.create(&descriptor).unwrap();
        assert_eq!(factory.name(), "intermittent");
    }

    #[test]
    fn test_registry_errors() {
        let registry = FactoryRegistry::builtin();
        let err = registry.create(&FactoryDescriptor::new("nope", vec![])).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFactory { ref registered, .. } if registered.contains("default")));

        let err = registry
            .create(&FactoryDescriptor::new("geofence", vec![json!("fast"), json!(2)]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFactoryParams { .. }));

        let err = registry
            .create(&FactoryDescriptor::new("abnormal-mean", vec![json!("t")]))
            .unwrap_err();
        assert!(err.to_string().contains("expected 6 parameters"));

        assert!(FactoryDescriptor::from_json(r#"{"className": ""}"#).is_err());
        assert!(FactoryDescriptor::from_json("[]").is_err());
    }

    #[test]
    fn test_registry_accepts_custom_constructor() {
        let mut registry = FactoryRegistry::empty();
        registry.register("silent", "never emits", |_| {
            struct Silent;
            impl EventFactory for Silent {
                fn name(&self) -> &str {
                    "silent"
                }
                fn create_event(&mut self, _: &SourceId, _: DateTime<Utc>) -> Option<JsonValue> {
                    None
                }
            }
            Ok(Box::new(Silent) as Box<dyn EventFactory>)
        });
        let mut factory = registry.create(&FactoryDescriptor::new("silent", vec![])).unwrap();
        assert!(factory.create_event(&SourceId::new("x"), t0()).is_none());
    }
}
