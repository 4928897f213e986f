//! Session record assembly.
//!
//! Combines the environment snapshot, per-tool summaries and the effective
//! configuration into one [`SessionRecord`]. Assembly is pure: identical
//! inputs serialize to identical bytes, since every map is a `BTreeMap` and
//! every struct has a fixed field order.

use crate::adapters::MeasurementRecord;
use crate::aggregate::{self, AggregatedMetric};
use crate::config::Config;
use crate::environment::EnvironmentSnapshot;
use crate::runner::{RunFailure, ToolRun, ToolState};
use chrono::{DateTime, FixedOffset, SecondsFormat};
use serde::Serialize;
use std::collections::BTreeMap;

/// Bumped only for removals or renames; added fields keep the version.
pub const SCHEMA_VERSION: u32 = 1;

/// Aggregated view of one tool (or one ping target).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSummary {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: ToolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub runs_attempted: u32,
    pub runs_succeeded: u32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub server: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, AggregatedMetric>,
    pub samples: Vec<MeasurementRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RunFailure>,
}

impl ToolSummary {
    /// Aggregate a finished run series.
    pub fn from_run(run: &ToolRun) -> Self {
        let metrics = if run.state == ToolState::Unavailable {
            BTreeMap::new()
        } else {
            aggregate::aggregate(&run.records, run.attempted)
        };
        let server = run
            .records
            .first()
            .map(|r| r.metadata.clone())
            .unwrap_or_default();

        ToolSummary {
            tool: run.tool.to_string(),
            target: run.target.clone(),
            status: run.state,
            reason: run.reason.clone(),
            runs_attempted: run.attempted,
            runs_succeeded: run.records.len() as u32,
            server,
            metrics,
            samples: run.records.clone(),
            failures: run.failures.clone(),
        }
    }

    pub fn median(&self, metric: &str) -> Option<f64> {
        self.metrics.get(metric).map(|m| m.median)
    }
}

/// The unit appended to the machine-readable sink, once per session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub schema_version: u32,
    pub timestamp: String,
    pub environment: EnvironmentSnapshot,
    pub tools: Vec<ToolSummary>,
    pub config: Config,
}

impl SessionRecord {
    pub fn tool(&self, name: &str) -> Option<&ToolSummary> {
        self.tools.iter().find(|t| t.tool == name)
    }

    pub fn ping(&self, target: &str) -> Option<&ToolSummary> {
        self.tools
            .iter()
            .find(|t| t.tool == "ping" && t.target.as_deref() == Some(target))
    }

    /// Single-line JSON form for the JSONL sink.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Build the session record. `started_at` is the session start capture time.
pub fn assemble(
    started_at: DateTime<FixedOffset>,
    environment: EnvironmentSnapshot,
    runs: &[ToolRun],
    config: &Config,
) -> SessionRecord {
    SessionRecord {
        schema_version: SCHEMA_VERSION,
        timestamp: started_at.to_rfc3339_opts(SecondsFormat::Secs, false),
        environment,
        tools: runs.iter().map(ToolSummary::from_run).collect(),
        config: config.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run: u32, metrics: &[(&str, f64)], meta: &[(&str, &str)]) -> MeasurementRecord {
        MeasurementRecord {
            run,
            started_at: None,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            metadata: meta
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn speedtest_run() -> ToolRun {
        ToolRun {
            tool: "speedtest",
            target: None,
            state: ToolState::Partial,
            attempted: 3,
            records: vec![
                record(1, &[("download_mbps", 800.0), ("upload_mbps", 40.0)], &[("server_id", "42")]),
                record(3, &[("download_mbps", 820.0)], &[("server_id", "43")]),
            ],
            failures: vec![],
            reason: None,
            raw_outputs: vec![],
        }
    }

    fn timestamp() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00+02:00").unwrap()
    }

    fn environment() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            hostname: Some("studio".into()),
            arch: "aarch64".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary_from_partial_run() {
        let s = ToolSummary::from_run(&speedtest_run());
        assert_eq!(s.status, ToolState::Partial);
        assert_eq!(s.runs_attempted, 3);
        assert_eq!(s.runs_succeeded, 2);
        assert_eq!(s.median("download_mbps"), Some(810.0));
        assert_eq!(s.metrics["download_mbps"].omitted, 1);
        assert_eq!(s.metrics["upload_mbps"].contributed, 1);
        assert_eq!(s.metrics["upload_mbps"].omitted, 2);
        assert_eq!(s.server["server_id"], "42");
        assert_eq!(s.samples.len(), 2);
    }

    #[test]
    fn test_unavailable_tool_has_no_metrics() {
        let run = ToolRun::disabled("network_quality", None);
        let s = ToolSummary::from_run(&run);
        assert_eq!(s.status, ToolState::Unavailable);
        assert!(s.metrics.is_empty());
        assert!(s.samples.is_empty());
    }

    #[test]
    fn test_assemble_is_deterministic() {
        let config = Config::default();
        let runs = vec![speedtest_run(), ToolRun::disabled("network_quality", None)];
        let a = assemble(timestamp(), environment(), &runs, &config);
        let b = assemble(timestamp(), environment(), &runs, &config);
        assert_eq!(a.to_json_line().unwrap(), b.to_json_line().unwrap());
    }

    #[test]
    fn test_serialized_field_order_and_shape() {
        let rec = assemble(timestamp(), environment(), &[speedtest_run()], &Config::default());
        let line = rec.to_json_line().unwrap();

        assert!(!line.contains('\n'));
        assert!(line.starts_with(r#"{"schema_version":1,"timestamp":"2024-05-01T10:00:00+02:00","environment":"#));
        let env_pos = line.find("\"environment\"").unwrap();
        let tools_pos = line.find("\"tools\"").unwrap();
        let config_pos = line.find("\"config\"").unwrap();
        assert!(env_pos < tools_pos && tools_pos < config_pos);

        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["tools"][0]["status"], "partial");
        assert_eq!(v["tools"][0]["metrics"]["download_mbps"]["median"], 810.0);
        assert_eq!(v["tools"][0]["metrics"]["download_mbps"]["contributed"], 2);
        assert!(v["environment"].get("public_ip").is_none());
        assert_eq!(v["config"]["session"]["runs"], 1);
    }

    #[test]
    fn test_lookup_helpers() {
        let mut ping = ToolRun::disabled("ping", Some("1.1.1.1".into()));
        ping.reason = None;
        let rec = assemble(
            timestamp(),
            environment(),
            &[speedtest_run(), ping],
            &Config::default(),
        );
        assert!(rec.tool("speedtest").is_some());
        assert!(rec.ping("1.1.1.1").is_some());
        assert!(rec.ping("8.8.8.8").is_none());
    }
}
