//! Median aggregation of repeated samples.
//!
//! Each metric is reduced independently: values present in some runs and
//! absent in others aggregate over the runs that reported them. A metric no
//! run reported is left out of the result entirely rather than written as 0.

use crate::adapters::MeasurementRecord;
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregate of one metric over the runs of one tool.
///
/// `contributed + omitted == attempted` for the tool that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedMetric {
    pub median: f64,
    pub contributed: u32,
    pub omitted: u32,
}

/// Metric families with a declared rounding precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricClass {
    Throughput,
    Latency,
    Loss,
    Rpm,
    Count,
}

impl MetricClass {
    /// Classify a metric by its unit suffix.
    pub fn of(metric: &str) -> Self {
        if metric.ends_with("_mbps") {
            MetricClass::Throughput
        } else if metric.ends_with("_ms") {
            MetricClass::Latency
        } else if metric.ends_with("_pct") {
            MetricClass::Loss
        } else if metric.ends_with("_rpm") {
            MetricClass::Rpm
        } else {
            MetricClass::Count
        }
    }

    pub fn decimals(self) -> u32 {
        match self {
            MetricClass::Throughput | MetricClass::Latency | MetricClass::Loss => 2,
            MetricClass::Rpm | MetricClass::Count => 0,
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            MetricClass::Throughput => "Mbps",
            MetricClass::Latency => "ms",
            MetricClass::Loss => "%",
            MetricClass::Rpm => "RPM",
            MetricClass::Count => "",
        }
    }
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Standard median: middle element, or mean of the two middle elements.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Aggregate every metric observed in `records` over `attempted` runs.
///
/// Runs that failed outright contribute nothing, so they count as omitted
/// for every metric alongside successful runs that lacked the field.
pub fn aggregate(records: &[MeasurementRecord], attempted: u32) -> BTreeMap<String, AggregatedMetric> {
    let mut values: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in records {
        for (name, value) in &record.metrics {
            values.entry(name.as_str()).or_default().push(*value);
        }
    }

    values
        .into_iter()
        .filter_map(|(name, vals)| {
            let contributed = vals.len() as u32;
            let m = median(vals)?;
            let decimals = MetricClass::of(name).decimals();
            Some((
                name.to_string(),
                AggregatedMetric {
                    median: round_to(m, decimals),
                    contributed,
                    omitted: attempted.saturating_sub(contributed),
                },
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run: u32, metrics: &[(&str, f64)]) -> MeasurementRecord {
        MeasurementRecord {
            run,
            started_at: None,
            metrics: metrics.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_median_odd() {
        assert_eq!(median(vec![10.0, 20.0, 30.0]), Some(20.0));
        assert_eq!(median(vec![30.0, 10.0, 20.0]), Some(20.0));
    }

    #[test]
    fn test_median_even_averages_middle_pair() {
        assert_eq!(median(vec![10.0, 20.0, 30.0, 40.0]), Some(25.0));
    }

    #[test]
    fn test_median_empty_is_none() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![f64::NAN]), None);
    }

    #[test]
    fn test_median_single_value() {
        assert_eq!(median(vec![7.5]), Some(7.5));
    }

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to(811.4229, 2), 811.42);
        assert_eq!(round_to(1456.6, 0), 1457.0);
        assert_eq!(round_to(1.0 / 3.0, 2), 0.33);
    }

    #[test]
    fn test_metric_class_from_suffix() {
        assert_eq!(MetricClass::of("download_mbps"), MetricClass::Throughput);
        assert_eq!(MetricClass::of("jitter_approx_ms"), MetricClass::Latency);
        assert_eq!(MetricClass::of("packet_loss_pct"), MetricClass::Loss);
        assert_eq!(MetricClass::of("responsiveness_rpm"), MetricClass::Rpm);
        assert_eq!(MetricClass::of("packets_sent"), MetricClass::Count);
        assert_eq!(MetricClass::Latency.decimals(), 2);
    }

    #[test]
    fn test_aggregate_all_runs_contribute() {
        let records = vec![
            record(1, &[("download_mbps", 800.0)]),
            record(2, &[("download_mbps", 820.0)]),
            record(3, &[("download_mbps", 810.0)]),
        ];
        let agg = aggregate(&records, 3);
        let dl = &agg["download_mbps"];
        assert_eq!(dl.median, 810.0);
        assert_eq!(dl.contributed, 3);
        assert_eq!(dl.omitted, 0);
    }

    #[test]
    fn test_aggregate_partial_metric_presence() {
        // Run 2 failed entirely; run 3 lacked packet loss.
        let records = vec![
            record(1, &[("download_mbps", 100.0), ("packet_loss_pct", 0.0)]),
            record(3, &[("download_mbps", 200.0)]),
        ];
        let agg = aggregate(&records, 3);

        let dl = &agg["download_mbps"];
        assert_eq!(dl.median, 150.0);
        assert_eq!(dl.contributed, 2);
        assert_eq!(dl.omitted, 1);

        let loss = &agg["packet_loss_pct"];
        assert_eq!(loss.median, 0.0);
        assert_eq!(loss.contributed, 1);
        assert_eq!(loss.omitted, 2);
    }

    #[test]
    fn test_aggregate_independent_of_record_order() {
        let a = vec![
            record(1, &[("x_ms", 3.0)]),
            record(2, &[("x_ms", 1.0)]),
            record(4, &[("x_ms", 2.0)]),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(aggregate(&a, 5), aggregate(&b, 5));
        assert_eq!(aggregate(&a, 5)["x_ms"].median, 2.0);
    }

    #[test]
    fn test_aggregate_unobserved_metric_absent() {
        let agg = aggregate(&[record(1, &[("download_mbps", 1.0)])], 1);
        assert!(!agg.contains_key("upload_mbps"));
        assert!(aggregate(&[], 3).is_empty());
    }

    #[test]
    fn test_aggregate_counts_invariant() {
        let records = vec![
            record(1, &[("a_ms", 1.0), ("b_ms", 2.0)]),
            record(2, &[("a_ms", 1.0)]),
        ];
        for (_, m) in aggregate(&records, 4) {
            assert_eq!(m.contributed + m.omitted, 4);
        }
    }
}
