use super::{
    extract_fields, first_string, parse_decimal, throughput_to_mbps, JsonField,
    MeasurementRecord, ParseFailure, ToolAdapter, Unit,
};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Adapter for the responsiveness-under-load tester (`networkQuality`).
///
/// The summary text differs across OS releases. Recognised lines:
///
/// - `Downlink capacity: 811.422 Mbps` (older: `Download capacity`, any of
///   bps/Kbps/Mbps/Gbps, optionally followed by `(Accuracy: High)`)
/// - `Responsiveness: High (2213 RPM)` (single, pre-split releases)
/// - `Downlink Responsiveness: High (1456 RPM)`
/// - `Uplink Responsiveness: Medium (137.003 milliseconds | 437 RPM)`
/// - `Idle Latency: 29.625 milliseconds` (optionally `| 2025 RPM`)
///
/// `networkQuality -c` prints JSON instead; its throughput fields are in
/// bits/sec.
pub struct NetworkQualityAdapter;

impl NetworkQualityAdapter {
    pub fn new() -> Self {
        NetworkQualityAdapter
    }
}

impl Default for NetworkQualityAdapter {
    fn default() -> Self {
        Self::new()
    }
}

const SUPPORTED_METRICS: &[&str] = &[
    "downlink_mbps",
    "uplink_mbps",
    "responsiveness_rpm",
    "responsiveness_ms",
    "downlink_responsiveness_rpm",
    "downlink_responsiveness_ms",
    "uplink_responsiveness_rpm",
    "uplink_responsiveness_ms",
    "idle_latency_ms",
];

const JSON_FIELDS: &[JsonField] = &[
    JsonField {
        metric: "downlink_mbps",
        aliases: &[
            ("dl_throughput", Unit::BitsPerSec),
            ("downlink_throughput", Unit::BitsPerSec),
        ],
    },
    JsonField {
        metric: "uplink_mbps",
        aliases: &[
            ("ul_throughput", Unit::BitsPerSec),
            ("uplink_throughput", Unit::BitsPerSec),
        ],
    },
    JsonField {
        metric: "responsiveness_rpm",
        aliases: &[("responsiveness", Unit::Rpm)],
    },
    JsonField {
        metric: "downlink_responsiveness_rpm",
        aliases: &[("dl_responsiveness", Unit::Rpm)],
    },
    JsonField {
        metric: "uplink_responsiveness_rpm",
        aliases: &[("ul_responsiveness", Unit::Rpm)],
    },
    JsonField {
        metric: "idle_latency_ms",
        aliases: &[("base_rtt", Unit::Millis), ("idle_latency", Unit::Millis)],
    },
];

/// `<label>: <number> <unit>`, newer label first.
static DOWNLINK_CAPACITY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?im)^\s*downlink\s+capacity\s*:\s*([\d.,]+)\s*([A-Za-z]+(?:/s)?)").unwrap(),
        Regex::new(r"(?im)^\s*download\s+capacity\s*:\s*([\d.,]+)\s*([A-Za-z]+(?:/s)?)").unwrap(),
    ]
});
static UPLINK_CAPACITY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?im)^\s*uplink\s+capacity\s*:\s*([\d.,]+)\s*([A-Za-z]+(?:/s)?)").unwrap(),
        Regex::new(r"(?im)^\s*upload\s+capacity\s*:\s*([\d.,]+)\s*([A-Za-z]+(?:/s)?)").unwrap(),
    ]
});

static RESPONSIVENESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(downlink|uplink)?\s*responsiveness\s*:[^(\n]*\(([^)\n]*)\)").unwrap()
});
static RPM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d.,]+)\s*RPM").unwrap());
static MILLIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d.,]+)\s*(?:milliseconds|ms)\b").unwrap());
static IDLE_LATENCY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*idle\s+latency\s*:\s*([\d.,]+)\s*(?:milliseconds|ms)\b").unwrap()
});

/// Capacity converted to Mbps, from the first pattern that matches.
fn capacity(text: &str, patterns: &[Regex]) -> Option<f64> {
    patterns.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let value = parse_decimal(&caps[1])?;
        throughput_to_mbps(value, &caps[2])
    })
}

fn parse_text(text: &str, record: &mut MeasurementRecord) {
    record.set_metric("downlink_mbps", capacity(text, &DOWNLINK_CAPACITY));
    record.set_metric("uplink_mbps", capacity(text, &UPLINK_CAPACITY));

    for caps in RESPONSIVENESS_LINE.captures_iter(text) {
        let inner = &caps[2];
        let rpm = RPM.captures(inner).and_then(|c| parse_decimal(&c[1]));
        let ms = MILLIS.captures(inner).and_then(|c| parse_decimal(&c[1]));
        let prefix = match caps.get(1).map(|m| m.as_str().to_ascii_lowercase()) {
            Some(dir) if dir == "downlink" => "downlink_responsiveness",
            Some(dir) if dir == "uplink" => "uplink_responsiveness",
            _ => "responsiveness",
        };
        record.set_metric(&format!("{prefix}_rpm"), rpm);
        record.set_metric(&format!("{prefix}_ms"), ms);
    }

    let idle = IDLE_LATENCY
        .captures(text)
        .and_then(|c| parse_decimal(&c[1]));
    record.set_metric("idle_latency_ms", idle);
}

impl ToolAdapter for NetworkQualityAdapter {
    fn name(&self) -> &'static str {
        "network_quality"
    }

    fn supported_metrics(&self) -> &'static [&'static str] {
        SUPPORTED_METRICS
    }

    fn parse(&self, stdout: &str, stderr: &str) -> Result<MeasurementRecord, ParseFailure> {
        let mut record = MeasurementRecord::default();

        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(doc) if doc.is_object() => {
                extract_fields(&doc, JSON_FIELDS, &mut record);
                record.set_meta("interface", first_string(&doc, &["interface_name"]));
                record.set_meta("os_version", first_string(&doc, &["os_version"]));
            }
            _ => {
                let text = format!("{stdout}\n{stderr}");
                parse_text(&text, &mut record);
            }
        }

        if record.metrics.is_empty() {
            return Err(ParseFailure::new(
                self.name(),
                "no capacity, responsiveness or latency lines found",
            ));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> MeasurementRecord {
        NetworkQualityAdapter::new().parse(text, "").unwrap()
    }

    #[test]
    fn test_split_responsiveness_with_millis() {
        let text = "\
==== SUMMARY ====
Uplink capacity: 41.295 Mbps
Downlink capacity: 811.422 Mbps
Uplink Responsiveness: Medium (137.003 milliseconds | 437 RPM)
Downlink Responsiveness: High (40.55 milliseconds | 1479 RPM)
Idle Latency: 29.625 milliseconds | 2025 RPM
";
        let r = parse(text);
        assert_eq!(r.metric("downlink_mbps"), Some(811.422));
        assert_eq!(r.metric("uplink_mbps"), Some(41.295));
        assert_eq!(r.metric("uplink_responsiveness_ms"), Some(137.003));
        assert_eq!(r.metric("uplink_responsiveness_rpm"), Some(437.0));
        assert_eq!(r.metric("downlink_responsiveness_ms"), Some(40.55));
        assert_eq!(r.metric("downlink_responsiveness_rpm"), Some(1479.0));
        assert_eq!(r.metric("idle_latency_ms"), Some(29.625));
        assert_eq!(r.metric("responsiveness_rpm"), None);
    }

    #[test]
    fn test_split_responsiveness_rpm_only() {
        let text = "\
==== SUMMARY ====
Uplink capacity: 43.234 Mbps
Downlink capacity: 353.212 Mbps
Uplink Responsiveness: Medium (438 RPM)
Downlink Responsiveness: High (1456 RPM)
Idle Latency: 28.375 milliseconds
";
        let r = parse(text);
        assert_eq!(r.metric("uplink_responsiveness_rpm"), Some(438.0));
        assert_eq!(r.metric("uplink_responsiveness_ms"), None);
        assert_eq!(r.metric("downlink_responsiveness_rpm"), Some(1456.0));
        assert_eq!(r.metric("idle_latency_ms"), Some(28.375));
    }

    #[test]
    fn test_single_responsiveness_line() {
        let text = "\
==== SUMMARY ====
Upload capacity: 19.024 Mbps
Download capacity: 1.2 Gbps
Upload flows: 12
Download flows: 12
Responsiveness: High (2213 RPM)
";
        let r = parse(text);
        assert_eq!(r.metric("downlink_mbps"), Some(1200.0));
        assert_eq!(r.metric("uplink_mbps"), Some(19.024));
        assert_eq!(r.metric("responsiveness_rpm"), Some(2213.0));
        assert_eq!(r.metric("responsiveness_ms"), None);
        assert_eq!(r.metric("idle_latency_ms"), None);
    }

    #[test]
    fn test_single_responsiveness_line_with_millis() {
        let text = "\
==== SUMMARY ====
Uplink capacity: 41.295 Mbps
Downlink capacity: 811.422 Mbps
Responsiveness: Medium (158.188 milliseconds | 379 RPM)
Idle Latency: 29.625 milliseconds | 2025 RPM
";
        let r = parse(text);
        assert_eq!(r.metric("responsiveness_rpm"), Some(379.0));
        assert_eq!(r.metric("responsiveness_ms"), Some(158.188));
        assert_eq!(r.metric("downlink_mbps"), Some(811.422));
        assert_eq!(r.metric("idle_latency_ms"), Some(29.625));
        assert_eq!(r.metric("downlink_responsiveness_ms"), None);
    }

    #[test]
    fn test_accuracy_suffix_and_kbps() {
        let text = "Uplink capacity: 512 Kbps (Accuracy: Low)\nDownlink capacity: 20.5 Mbps (Accuracy: High)\n";
        let r = parse(text);
        assert_eq!(r.metric("uplink_mbps"), Some(0.512));
        assert_eq!(r.metric("downlink_mbps"), Some(20.5));
    }

    #[test]
    fn test_older_download_label() {
        let r = parse("Download capacity: 95.5 Mbps\nUpload capacity: 10 Mbps\n");
        assert_eq!(r.metric("downlink_mbps"), Some(95.5));
        assert_eq!(r.metric("uplink_mbps"), Some(10.0));
    }

    #[test]
    fn test_summary_on_stderr() {
        let r = NetworkQualityAdapter::new()
            .parse("", "Downlink capacity: 100.0 Mbps\n")
            .unwrap();
        assert_eq!(r.metric("downlink_mbps"), Some(100.0));
    }

    #[test]
    fn test_json_variant_bits_per_sec() {
        let json = r#"{"base_rtt": 28.375, "dl_flows": 12, "dl_throughput": 353212000, "interface_name": "en0", "responsiveness": 1456, "ul_flows": 12, "ul_throughput": 43234000, "os_version": "Version 14.4"}"#;
        let r = parse(json);
        assert!((r.metric("downlink_mbps").unwrap() - 353.212).abs() < 1e-9);
        assert!((r.metric("uplink_mbps").unwrap() - 43.234).abs() < 1e-9);
        assert_eq!(r.metric("responsiveness_rpm"), Some(1456.0));
        assert_eq!(r.metric("idle_latency_ms"), Some(28.375));
        assert_eq!(r.metadata["interface"], "en0");
    }

    #[test]
    fn test_unrecognised_output_is_failure() {
        let err = NetworkQualityAdapter::new()
            .parse("Error: could not connect to server", "")
            .unwrap_err();
        assert_eq!(err.tool, "network_quality");
    }
}
