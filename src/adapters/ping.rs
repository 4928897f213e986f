use super::{parse_decimal, MeasurementRecord, ParseFailure, ToolAdapter};
use regex::Regex;
use std::sync::LazyLock;

/// Adapter for the system `ping` summary.
///
/// Handles BSD/macOS (`round-trip min/avg/max/stddev`), Linux iputils
/// (`rtt min/avg/max/mdev`, `+N errors` in the packet line), busybox, and
/// Windows (`Packets: Sent = 4, Received = 4, Lost = 0 (0% loss)`) output.
/// Decimal commas from non-English locales are accepted.
///
/// `jitter_approx_ms` is not reported by ping itself: it is the mean absolute
/// difference between consecutive per-packet RTTs of one run, and is kept
/// under a separate name from tool-native `jitter_ms`.
pub struct PingAdapter;

impl PingAdapter {
    pub fn new() -> Self {
        PingAdapter
    }
}

impl Default for PingAdapter {
    fn default() -> Self {
        Self::new()
    }
}

const SUPPORTED_METRICS: &[&str] = &[
    "packet_loss_pct",
    "packets_sent",
    "packets_received",
    "rtt_min_ms",
    "rtt_avg_ms",
    "rtt_max_ms",
    "rtt_stddev_ms",
    "rtt_median_ms",
    "jitter_approx_ms",
];

static UNIX_PACKETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\d+)\s+packets\s+transmitted,\s+(\d+)\s+(?:packets\s+)?received(?:[^%\n]*?(\d[\d.,]*)%\s+packet\s+loss)?",
    )
    .unwrap()
});
static WINDOWS_PACKETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Sent\s*=\s*(\d+),\s*Received\s*=\s*(\d+),\s*Lost\s*=\s*\d+\s*\((\d+)%").unwrap()
});
static UNIX_RTT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:round-trip|rtt)[^=\n]*=\s*([\d.,]+)/([\d.,]+)/([\d.,]+)(?:/([\d.,]+))?\s*ms",
    )
    .unwrap()
});
static WINDOWS_RTT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Minimum\s*=\s*(\d+)\s*ms,\s*Maximum\s*=\s*(\d+)\s*ms,\s*Average\s*=\s*(\d+)\s*ms")
        .unwrap()
});
static PACKET_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)time\s*[=<]\s*([\d.,]+)\s*ms").unwrap());

/// Per-packet RTTs in reply order.
pub fn packet_rtts(text: &str) -> Vec<f64> {
    PACKET_TIME
        .captures_iter(text)
        .filter_map(|c| parse_decimal(&c[1]))
        .collect()
}

/// Mean absolute delta between consecutive RTTs. None with fewer than two.
pub fn approximate_jitter(rtts: &[f64]) -> Option<f64> {
    if rtts.len() < 2 {
        return None;
    }
    let total: f64 = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    Some(total / (rtts.len() - 1) as f64)
}

fn median_of(values: &[f64]) -> Option<f64> {
    crate::aggregate::median(values.to_vec())
}

/// (sent, received, loss_pct) from whichever summary format is present.
fn packet_counts(text: &str) -> Option<(f64, f64, f64)> {
    if let Some(c) = UNIX_PACKETS.captures(text) {
        let sent: f64 = c[1].parse().ok()?;
        let received: f64 = c[2].parse().ok()?;
        let loss = c
            .get(3)
            .and_then(|m| parse_decimal(m.as_str()))
            .or_else(|| loss_from_counts(sent, received))?;
        return Some((sent, received, loss));
    }
    let c = WINDOWS_PACKETS.captures(text)?;
    Some((c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?))
}

fn loss_from_counts(sent: f64, received: f64) -> Option<f64> {
    (sent > 0.0).then(|| (sent - received).max(0.0) / sent * 100.0)
}

impl ToolAdapter for PingAdapter {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn supported_metrics(&self) -> &'static [&'static str] {
        SUPPORTED_METRICS
    }

    fn parse(&self, stdout: &str, stderr: &str) -> Result<MeasurementRecord, ParseFailure> {
        let text = format!("{stdout}\n{stderr}");
        let mut record = MeasurementRecord::default();

        if let Some((sent, received, loss)) = packet_counts(&text) {
            record.set_metric("packets_sent", Some(sent));
            record.set_metric("packets_received", Some(received));
            record.set_metric("packet_loss_pct", Some(loss));
        }

        if let Some(c) = UNIX_RTT.captures(&text) {
            record.set_metric("rtt_min_ms", parse_decimal(&c[1]));
            record.set_metric("rtt_avg_ms", parse_decimal(&c[2]));
            record.set_metric("rtt_max_ms", parse_decimal(&c[3]));
            record.set_metric("rtt_stddev_ms", c.get(4).and_then(|m| parse_decimal(m.as_str())));
        } else if let Some(c) = WINDOWS_RTT.captures(&text) {
            record.set_metric("rtt_min_ms", parse_decimal(&c[1]));
            record.set_metric("rtt_max_ms", parse_decimal(&c[2]));
            record.set_metric("rtt_avg_ms", parse_decimal(&c[3]));
        }

        let rtts = packet_rtts(&text);
        if !rtts.is_empty() {
            if record.metric("rtt_avg_ms").is_none() {
                let min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
                let max = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
                record.set_metric("rtt_min_ms", Some(min));
                record.set_metric("rtt_avg_ms", Some(avg));
                record.set_metric("rtt_max_ms", Some(max));
            }
            record.set_metric("rtt_median_ms", median_of(&rtts));
            record.set_metric("jitter_approx_ms", approximate_jitter(&rtts));
        }

        if record.metrics.is_empty() {
            return Err(ParseFailure::new(
                self.name(),
                "no packet statistics or reply times found",
            ));
        }
        Ok(record)
    }
}
