//! Core value types shared by the generator, the sampler and the analysis side.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ConfigError;

// ----------------------------------------------------------------------------
// Timestamps
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Build from fractional seconds, the representation used in the raw CSV.
    /// An f64 only carries microseconds at epoch scale, so the fraction is
    /// rounded to whole microseconds.
    pub fn from_secs_f64(secs: f64) -> Self {
        let whole = secs.floor();
        let micros = ((secs - whole) * 1e6).round() as i64;
        Self(whole as i64 * 1_000_000_000 + micros * 1_000)
    }

    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000_000
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

/// Formats an event time the way the platform expects it: ISO-8601, UTC,
/// millisecond precision, `Z` suffix.
pub fn format_event_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ----------------------------------------------------------------------------
// Sources
// ----------------------------------------------------------------------------

/// Opaque identity of a logical emitter (a device, an entity).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(CompactString);

impl SourceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(CompactString::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(CompactString::from(s))
    }
}

/// Fixed, ordered, non-empty sequence of sources for one generator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSet {
    sources: Vec<SourceId>,
}

impl SourceSet {
    pub fn new<I, S>(sources: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        let sources: Vec<SourceId> = sources.into_iter().map(Into::into).collect();
        if sources.is_empty() {
            return Err(ConfigError::invalid_value("sources", "at least one source is required"));
        }
        Ok(Self { sources })
    }

    /// Parse the JSON list handed over on the command line, e.g. `["101","102"]`.
    /// Numeric identifiers are accepted and stringified.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let parsed: Vec<JsonValue> = serde_json::from_str(json).map_err(|e| {
            ConfigError::invalid_value("sources", format!("expected a JSON list: {e}"))
        })?;
        let ids = parsed
            .into_iter()
            .map(|v| match v {
                JsonValue::String(s) => Ok(SourceId::from(s)),
                JsonValue::Number(n) => Ok(SourceId::from(n.to_string())),
                other => Err(ConfigError::invalid_value(
                    "sources",
                    format!("unsupported source identifier: {other}"),
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ids)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceId> {
        self.sources.iter()
    }

    pub fn cursor(&self) -> RoundRobin<'_> {
        RoundRobin { sources: &self.sources, next: 0 }
    }
}

/// Round-robin cursor over a [`SourceSet`]; wraps to the first source after
/// the last one.
#[derive(Debug, Clone)]
pub struct RoundRobin<'a> {
    sources: &'a [SourceId],
    next: usize,
}

impl<'a> RoundRobin<'a> {
    pub fn next_source(&mut self) -> &'a SourceId {
        if self.next >= self.sources.len() {
            self.next = 0;
        }
        let source = &self.sources[self.next];
        self.next += 1;
        source
    }
}
