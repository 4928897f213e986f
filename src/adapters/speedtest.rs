use super::{
    extract_fields, first_string, JsonField, MeasurementRecord, ParseFailure, ToolAdapter, Unit,
};
use serde_json::Value;

/// Adapter for the throughput tester's JSON output.
///
/// Two schema families are recognised through per-field alias lists:
///
/// - The official CLI (`speedtest -f json`): bandwidth in **bytes/sec** under
///   `download.bandwidth`, a nested `ping` object, `packetLoss` in percent,
///   loaded latency under `download.latency.iqm`.
/// - The legacy community CLI (`speedtest-cli --json`): `download`/`upload`
///   as plain numbers in **bits/sec**, `ping` as a number, ISP under `client`.
///
/// The official CLI may print `{"type":"log",...}` lines before the result;
/// the last `"type":"result"` object wins, otherwise the last JSON object.
pub struct SpeedtestAdapter;

impl SpeedtestAdapter {
    pub fn new() -> Self {
        SpeedtestAdapter
    }
}

impl Default for SpeedtestAdapter {
    fn default() -> Self {
        Self::new()
    }
}

const FIELDS: &[JsonField] = &[
    JsonField {
        metric: "download_mbps",
        aliases: &[
            ("download.bandwidth", Unit::BytesPerSec),
            ("download", Unit::BitsPerSec),
            ("download_bps", Unit::BitsPerSec),
        ],
    },
    JsonField {
        metric: "upload_mbps",
        aliases: &[
            ("upload.bandwidth", Unit::BytesPerSec),
            ("upload", Unit::BitsPerSec),
            ("upload_bps", Unit::BitsPerSec),
        ],
    },
    JsonField {
        metric: "idle_latency_ms",
        aliases: &[
            ("ping.latency", Unit::Millis),
            ("ping", Unit::Millis),
            ("latency", Unit::Millis),
        ],
    },
    JsonField {
        metric: "jitter_ms",
        aliases: &[("ping.jitter", Unit::Millis), ("jitter", Unit::Millis)],
    },
    JsonField {
        metric: "low_latency_ms",
        aliases: &[("ping.low", Unit::Millis)],
    },
    JsonField {
        metric: "high_latency_ms",
        aliases: &[("ping.high", Unit::Millis)],
    },
    JsonField {
        metric: "download_latency_ms",
        aliases: &[
            ("download.latency.iqm", Unit::Millis),
            ("download.latency", Unit::Millis),
        ],
    },
    JsonField {
        metric: "upload_latency_ms",
        aliases: &[
            ("upload.latency.iqm", Unit::Millis),
            ("upload.latency", Unit::Millis),
        ],
    },
    JsonField {
        metric: "packet_loss_pct",
        aliases: &[
            ("packetLoss", Unit::Percent),
            ("packet_loss", Unit::Percent),
        ],
    },
    JsonField {
        metric: "download_bytes",
        aliases: &[("download.bytes", Unit::Count), ("bytes_received", Unit::Count)],
    },
    JsonField {
        metric: "upload_bytes",
        aliases: &[("upload.bytes", Unit::Count), ("bytes_sent", Unit::Count)],
    },
];

const SUPPORTED_METRICS: &[&str] = &[
    "download_mbps",
    "upload_mbps",
    "idle_latency_ms",
    "jitter_ms",
    "low_latency_ms",
    "high_latency_ms",
    "download_latency_ms",
    "upload_latency_ms",
    "packet_loss_pct",
    "download_bytes",
    "upload_bytes",
];

/// Pick the result document out of possibly multi-line output.
fn result_document(stdout: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(stdout.trim()) {
        if v.is_object() {
            return Some(v);
        }
    }

    let objects: Vec<Value> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(Value::is_object)
        .collect();

    let result = objects
        .iter()
        .rposition(|o| o.get("type").and_then(Value::as_str) == Some("result"));
    match result {
        Some(i) => objects.into_iter().nth(i),
        None => objects.into_iter().last(),
    }
}

fn server_location(doc: &Value) -> Option<String> {
    let place = first_string(doc, &["server.location", "server.name"]);
    let country = first_string(doc, &["server.country"]);
    let parts: Vec<String> = [place, country].into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

impl ToolAdapter for SpeedtestAdapter {
    fn name(&self) -> &'static str {
        "speedtest"
    }

    fn supported_metrics(&self) -> &'static [&'static str] {
        SUPPORTED_METRICS
    }

    fn parse(&self, stdout: &str, _stderr: &str) -> Result<MeasurementRecord, ParseFailure> {
        let doc = result_document(stdout)
            .ok_or_else(|| ParseFailure::new(self.name(), "no JSON object in output"))?;

        if doc.get("type").and_then(Value::as_str) == Some("log") {
            let message = first_string(&doc, &["message"]).unwrap_or_default();
            return Err(ParseFailure::new(
                self.name(),
                format!("tool logged instead of a result: {message}"),
            ));
        }

        let mut record = MeasurementRecord::default();
        extract_fields(&doc, FIELDS, &mut record);

        if record.metrics.is_empty() {
            return Err(ParseFailure::new(
                self.name(),
                "JSON object has no recognised measurement fields",
            ));
        }

        record.set_meta("server_id", first_string(&doc, &["server.id"]));
        record.set_meta("server_name", first_string(&doc, &["server.name", "server.sponsor"]));
        record.set_meta("server_host", first_string(&doc, &["server.host"]));
        record.set_meta("server_location", server_location(&doc));
        record.set_meta("isp", first_string(&doc, &["isp", "client.isp"]));
        record.set_meta(
            "external_ip",
            first_string(&doc, &["interface.externalIp", "client.ip"]),
        );
        record.set_meta("result_url", first_string(&doc, &["result.url", "share"]));

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFICIAL: &str = r#"{"type":"result","timestamp":"2024-05-01T10:00:00Z","ping":{"jitter":0.412,"latency":9.871,"low":9.2,"high":11.03},"download":{"bandwidth":101250000,"bytes":1215000000,"elapsed":12006,"latency":{"iqm":24.5,"low":10.1,"high":60.2,"jitter":3.4}},"upload":{"bandwidth":5000000,"bytes":60000000,"elapsed":12001,"latency":{"iqm":40.25}},"packetLoss":0.5,"isp":"Example Fiber","interface":{"internalIp":"192.168.1.10","name":"en0","externalIp":"203.0.113.7"},"server":{"id":12345,"host":"speed.example.net","port":8080,"name":"Example Net","location":"Amsterdam","country":"Netherlands"},"result":{"id":"abc","url":"https://www.speedtest.net/result/c/abc"}}"#;

    const LEGACY: &str = r#"{"download": 93847293.2, "upload": 11832000.0, "ping": 14.2, "server": {"url": "http://speed.example.org/upload.php", "name": "Utrecht", "country": "Netherlands", "sponsor": "Example ISP", "id": "4321", "host": "speed.example.org:8080"}, "timestamp": "2024-05-01T10:00:00Z", "bytes_sent": 15000000, "bytes_received": 120000000, "share": null, "client": {"ip": "198.51.100.4", "isp": "Legacy Cable"}}"#;

    fn approx(a: Option<f64>, b: f64) {
        let a = a.expect("metric present");
        assert!((a - b).abs() < 1e-6, "{a} != {b}");
    }

    #[test]
    fn test_official_schema_bytes_converted() {
        let r = SpeedtestAdapter::new().parse(OFFICIAL, "").unwrap();
        approx(r.metric("download_mbps"), 101_250_000.0 * 8.0 / 1e6);
        approx(r.metric("upload_mbps"), 40.0);
        approx(r.metric("idle_latency_ms"), 9.871);
        approx(r.metric("jitter_ms"), 0.412);
        approx(r.metric("low_latency_ms"), 9.2);
        approx(r.metric("high_latency_ms"), 11.03);
        approx(r.metric("download_latency_ms"), 24.5);
        approx(r.metric("upload_latency_ms"), 40.25);
        approx(r.metric("packet_loss_pct"), 0.5);
        approx(r.metric("download_bytes"), 1_215_000_000.0);
        assert_eq!(r.metadata["server_id"], "12345");
        assert_eq!(r.metadata["server_host"], "speed.example.net");
        assert_eq!(r.metadata["server_location"], "Amsterdam, Netherlands");
        assert_eq!(r.metadata["isp"], "Example Fiber");
        assert_eq!(r.metadata["external_ip"], "203.0.113.7");
        assert!(r.metadata["result_url"].contains("speedtest.net"));
    }

    #[test]
    fn test_legacy_schema_bits_not_multiplied() {
        let r = SpeedtestAdapter::new().parse(LEGACY, "").unwrap();
        approx(r.metric("download_mbps"), 93_847_293.2 / 1e6);
        approx(r.metric("upload_mbps"), 11.832);
        approx(r.metric("idle_latency_ms"), 14.2);
        assert_eq!(r.metric("jitter_ms"), None);
        assert_eq!(r.metric("packet_loss_pct"), None);
        approx(r.metric("download_bytes"), 120_000_000.0);
        assert_eq!(r.metadata["server_id"], "4321");
        assert_eq!(r.metadata["server_name"], "Utrecht");
        assert_eq!(r.metadata["isp"], "Legacy Cable");
        assert_eq!(r.metadata["external_ip"], "198.51.100.4");
        assert!(!r.metadata.contains_key("result_url"));
    }

    #[test]
    fn test_missing_packet_loss_left_absent() {
        let doc = r#"{"type":"result","ping":{"latency":10.0},"download":{"bandwidth":1000000},"upload":{"bandwidth":500000}}"#;
        let r = SpeedtestAdapter::new().parse(doc, "").unwrap();
        assert_eq!(r.metric("packet_loss_pct"), None);
        approx(r.metric("download_mbps"), 8.0);
        approx(r.metric("upload_mbps"), 4.0);
    }

    #[test]
    fn test_log_lines_before_result() {
        let out = format!(
            "{}\n{}\n",
            r#"{"type":"log","timestamp":"x","message":"Configuration - Couldn't resolve host name","level":"warning"}"#,
            OFFICIAL
        );
        let r = SpeedtestAdapter::new().parse(&out, "").unwrap();
        approx(r.metric("idle_latency_ms"), 9.871);
    }

    #[test]
    fn test_only_log_line_is_failure() {
        let out = r#"{"type":"log","level":"error","message":"Cannot open socket"}"#;
        let err = SpeedtestAdapter::new().parse(out, "").unwrap_err();
        assert!(err.reason.contains("Cannot open socket"));
    }

    #[test]
    fn test_non_json_is_failure() {
        let err = SpeedtestAdapter::new()
            .parse("Speedtest by Ookla\n   Server: foo", "")
            .unwrap_err();
        assert_eq!(err.tool, "speedtest");
    }

    #[test]
    fn test_json_without_fields_is_failure() {
        assert!(SpeedtestAdapter::new()
            .parse(r#"{"type":"result","server":{"id":1}}"#, "")
            .is_err());
    }
}
