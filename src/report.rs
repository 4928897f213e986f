//! Plain-text session summary, printed to stdout and appended to the log.

use crate::adapters::network_quality::NetworkQualityAdapter;
use crate::adapters::ping::PingAdapter;
use crate::adapters::speedtest::SpeedtestAdapter;
use crate::adapters::ToolAdapter;
use crate::aggregate::{AggregatedMetric, MetricClass};
use crate::record::{SessionRecord, ToolSummary};
use crate::runner::ToolState;

const TIP: &str = "Run 3-5 samples and compare medians. Wide run-to-run spread means something else is loading the link.";

fn format_table(rows: &[(String, String)]) -> String {
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    rows.iter()
        .map(|(k, v)| format!("  {k:<width$} : {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn section_title(summary: &ToolSummary) -> String {
    match (summary.tool.as_str(), summary.target.as_deref()) {
        ("speedtest", _) => "Speedtest (throughput)".to_string(),
        ("network_quality", _) => "networkQuality (responsiveness)".to_string(),
        ("ping", Some(target)) => format!("Ping {target}"),
        (tool, Some(target)) => format!("{tool} {target}"),
        (tool, None) => tool.to_string(),
    }
}

/// Metric names in display order: every metric the adapter declares, then
/// any extras the record carries.
fn metric_order(summary: &ToolSummary) -> Vec<&str> {
    let declared: &[&str] = match summary.tool.as_str() {
        "speedtest" => SpeedtestAdapter::new().supported_metrics(),
        "network_quality" => NetworkQualityAdapter::new().supported_metrics(),
        "ping" => PingAdapter::new().supported_metrics(),
        _ => &[],
    };
    let mut order: Vec<&str> = declared.to_vec();
    order.extend(
        summary
            .metrics
            .keys()
            .map(String::as_str)
            .filter(|m| !declared.contains(m)),
    );
    order
}

fn format_metric(name: &str, metric: &AggregatedMetric) -> String {
    let class = MetricClass::of(name);
    let decimals = class.decimals() as usize;
    let unit = class.unit();
    let total = metric.contributed + metric.omitted;
    let value = match unit {
        "" => format!("{:.decimals$}", metric.median),
        "%" => format!("{:.decimals$}%", metric.median),
        u => format!("{:.decimals$} {u}", metric.median),
    };
    let note = if name == "jitter_approx_ms" {
        ", approx. from RTT deltas"
    } else {
        ""
    };
    format!("{value} ({}/{} runs{note})", metric.contributed, total)
}

fn render_tool(summary: &ToolSummary) -> String {
    let mut out = format!("{}\n", section_title(summary));

    if summary.status == ToolState::Unavailable {
        let reason = summary.reason.as_deref().unwrap_or("no usable runs");
        out.push_str(&format!("  unavailable ({reason})\n"));
        return out;
    }

    let mut rows: Vec<(String, String)> = Vec::new();
    rows.push((
        "status".to_string(),
        format!(
            "{} ({}/{} runs succeeded)",
            match summary.status {
                ToolState::Ok => "ok",
                ToolState::Partial => "partial",
                _ => "unavailable",
            },
            summary.runs_succeeded,
            summary.runs_attempted
        ),
    ));
    for (key, value) in &summary.server {
        rows.push((key.clone(), value.clone()));
    }
    for name in metric_order(summary) {
        let value = match summary.metrics.get(name) {
            Some(metric) => format_metric(name, metric),
            None => "unavailable".to_string(),
        };
        rows.push((name.to_string(), value));
    }
    out.push_str(&format_table(&rows));
    out.push('\n');

    for failure in &summary.failures {
        out.push_str(&format!(
            "  run {} failed: {:?} - {}\n",
            failure.run, failure.kind, failure.detail
        ));
    }
    out
}

/// Render the full session summary block.
pub fn render(record: &SessionRecord) -> String {
    let env = &record.environment;
    let unknown = || "unknown".to_string();
    let mut env_rows = vec![
        ("Host".to_string(), env.hostname.clone().unwrap_or_else(unknown)),
        ("OS".to_string(), env.os.clone().unwrap_or_else(unknown)),
        ("Arch".to_string(), env.arch.clone()),
        ("Interface".to_string(), env.interface.clone().unwrap_or_else(unknown)),
        ("Local IP".to_string(), env.local_ip.clone().unwrap_or_else(unknown)),
    ];
    if let Some(ms) = env.dns_lookup_ms {
        env_rows.push(("DNS lookup".to_string(), format!("{ms:.2} ms")));
    }
    if let Some(ip) = &env.public_ip {
        env_rows.push(("Public IP".to_string(), ip.clone()));
    }
    if let Some(isp) = &env.isp {
        env_rows.push(("ISP/Org".to_string(), isp.clone()));
    }
    if let Some(loc) = &env.location {
        env_rows.push(("Location".to_string(), loc.clone()));
    }

    let mut out = format!("=== net-speedtest {} ===\n", record.timestamp);
    out.push_str("Environment\n");
    out.push_str(&format_table(&env_rows));
    out.push_str("\n\n");

    for summary in &record.tools {
        out.push_str(&render_tool(summary));
        out.push('\n');
    }

    out.push_str("Tip\n");
    out.push_str(&format!("  {TIP}\n"));
    out
}
