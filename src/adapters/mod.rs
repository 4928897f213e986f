pub mod network_quality;
pub mod ping;
pub mod speedtest;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Parsed result of one successful run of one tool.
///
/// Metrics absent from `metrics` were not reported by that run; the maps are
/// ordered so serialized records are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeasurementRecord {
    /// 1-based run index within the tool's sample series.
    pub run: u32,
    /// UTC start time of the invocation that produced this record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    pub metrics: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl MeasurementRecord {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    /// Insert a metric, ignoring non-finite values.
    pub fn set_metric(&mut self, name: &str, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.metrics.insert(name.to_string(), v);
        }
    }

    pub fn set_meta(&mut self, key: &str, value: Option<String>) {
        if let Some(v) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.metadata.insert(key.to_string(), v);
        }
    }
}

/// Output that no known schema variant could extract a metric from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub tool: &'static str,
    pub reason: String,
}

impl ParseFailure {
    pub fn new(tool: &'static str, reason: impl Into<String>) -> Self {
        Self {
            tool,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unrecognized {} output: {}", self.tool, self.reason)
    }
}

impl std::error::Error for ParseFailure {}

/// Normalizes tool-specific output into a [`MeasurementRecord`].
pub trait ToolAdapter: Send + Sync {
    /// Stable tool name used as the record key (e.g., "speedtest").
    fn name(&self) -> &'static str;

    /// Metric names this adapter can produce. Used for report ordering.
    fn supported_metrics(&self) -> &'static [&'static str];

    /// Parse captured output. A result with no metrics is a failure.
    fn parse(&self, stdout: &str, stderr: &str) -> Result<MeasurementRecord, ParseFailure>;
}

/// Source unit of a raw value; conversion targets are Mbps, ms, percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    BitsPerSec,
    BytesPerSec,
    Millis,
    Percent,
    Rpm,
    Count,
}

impl Unit {
    pub fn normalize(self, raw: f64) -> f64 {
        match self {
            Unit::BitsPerSec => raw / 1_000_000.0,
            Unit::BytesPerSec => raw * 8.0 / 1_000_000.0,
            Unit::Millis | Unit::Percent | Unit::Rpm | Unit::Count => raw,
        }
    }
}

/// One metric and the ordered JSON paths it has been published under.
pub struct JsonField {
    pub metric: &'static str,
    pub aliases: &'static [(&'static str, Unit)],
}

/// Resolve a dotted path (`download.latency.iqm`) in a JSON value.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |v, key| v.get(key))
}

/// Numeric value of a JSON number or numeric string.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

/// First alias that resolves to a number, normalized to the target unit.
pub fn first_number(root: &Value, aliases: &[(&str, Unit)]) -> Option<f64> {
    aliases
        .iter()
        .find_map(|(path, unit)| lookup(root, path).and_then(as_number).map(|v| unit.normalize(v)))
}

/// First alias that resolves to a scalar, rendered as a string.
pub fn first_string(root: &Value, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|path| match lookup(root, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Apply a field table to a JSON document.
pub fn extract_fields(root: &Value, fields: &[JsonField], record: &mut MeasurementRecord) {
    for field in fields {
        record.set_metric(field.metric, first_number(root, field.aliases));
    }
}

/// Parse a decimal that may use a comma separator (`18,5`).
pub fn parse_decimal(s: &str) -> Option<f64> {
    let s = s.trim();
    s.parse::<f64>()
        .ok()
        .or_else(|| s.replace(',', ".").parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Convert a throughput value with a textual unit to Mbps.
///
/// Bit units (`bps`, `Kbps`, `Mbit/s`) scale directly; byte units (`B/s`,
/// `MB/s`, `MBps`) are multiplied by 8 first. Returns None for unknown units.
pub fn throughput_to_mbps(value: f64, unit: &str) -> Option<f64> {
    let unit = unit.trim();
    let first = unit.chars().next()?.to_ascii_lowercase();
    let (mbps, rest) = match first {
        'k' => (value / 1e3, &unit[1..]),
        'm' => (value, &unit[1..]),
        'g' => (value * 1e3, &unit[1..]),
        't' => (value * 1e6, &unit[1..]),
        'b' => (value / 1e6, unit),
        _ => return None,
    };
    let rest_lower = rest.to_ascii_lowercase();
    if !rest_lower.starts_with('b') {
        return None;
    }
    let bytes = rest.starts_with('B') && !rest_lower.starts_with("bit");
    Some(if bytes { mbps * 8.0 } else { mbps })
}
