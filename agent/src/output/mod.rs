//! Export and console output

use crate::analysis::{ConnectivityBucket, ConnectivitySummary};
use anyhow::{Context, Result};
use linkwatch_model::Metric;
use std::fmt::Write as _;
use std::path::Path;

/// Export metrics as CSV. Absent values are left empty.
pub fn export_csv(metrics: &[Metric], output_path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(output_path)
        .with_context(|| format!("Failed to create {:?}", output_path))?;

    writer.write_record([
        "timestamp",
        "source",
        "host",
        "latency_ms",
        "jitter_ms",
        "packet_loss_pct",
        "connectivity_status",
        "download_bps",
        "upload_bps",
        "server_location",
        "isp",
        "external_ip",
        "internal_ip",
    ])?;

    for m in metrics {
        writer.write_record([
            m.timestamp.to_rfc3339(),
            m.source.to_string(),
            m.host.clone().unwrap_or_default(),
            m.latency_ms.map(|v| format!("{:.2}", v)).unwrap_or_default(),
            m.jitter_ms.map(|v| format!("{:.2}", v)).unwrap_or_default(),
            m.packet_loss_pct.map(|v| format!("{:.2}", v)).unwrap_or_default(),
            m.connectivity_status.map(|s| s.to_string()).unwrap_or_default(),
            m.download_bandwidth_bps.map(|v| v.to_string()).unwrap_or_default(),
            m.upload_bandwidth_bps.map(|v| v.to_string()).unwrap_or_default(),
            m.server_location.clone().unwrap_or_default(),
            m.isp.clone().unwrap_or_default(),
            m.external_ip.clone().unwrap_or_default(),
            m.internal_ip.clone().unwrap_or_default(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

/// Plain-text connectivity report, one line per bucket
pub fn connectivity_report(buckets: &[ConnectivityBucket], summary: &ConnectivitySummary) -> String {
    let mut out = String::new();
    for b in buckets {
        let _ = writeln!(
            out,
            "{}  {:<8}  {:>4} checks  {:>6.2}% up  {:>6.2}% degraded",
            b.timestamp.format("%Y-%m-%d %H:%M"),
            b.status,
            b.total,
            b.uptime_percentage,
            b.degraded_percentage
        );
    }
    let _ = writeln!(
        out,
        "Total: {} checks, {} up, {} degraded, {} down, {:.2}% uptime",
        summary.total_checks, summary.up, summary.degraded, summary.down, summary.uptime_percentage
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::summarize;
    use chrono::{TimeZone, Utc};
    use linkwatch_model::{ConnectivityStatus, MetricSource};

    #[test]
    fn test_export_csv_leaves_absent_fields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");

        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut probe = Metric::new(ts, MetricSource::Probe);
        probe.host = Some("8.8.8.8".into());
        probe.latency_ms = Some(15.5);
        probe.connectivity_status = Some(ConnectivityStatus::Up);

        export_csv(&[probe], &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("timestamp,source,host,latency_ms"));
        assert_eq!(
            lines[1],
            "2024-05-01T10:00:00+00:00,probe,8.8.8.8,15.50,,,up,,,,,,"
        );
    }

    #[test]
    fn test_connectivity_report() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let buckets = vec![
            ConnectivityBucket::from_counts(t, 10, 0, 0),
            ConnectivityBucket::from_counts(t + chrono::Duration::hours(1), 8, 2, 0),
        ];
        let report = connectivity_report(&buckets, &summarize(&buckets));
        assert!(report.contains("2024-05-01 11:00  down"));
        assert!(report.ends_with("Total: 20 checks, 18 up, 0 degraded, 2 down, 90.00% uptime\n"));
    }
}
