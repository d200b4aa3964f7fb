use meshprobe::{ExperimentReport, Metric, PointSummary};
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;

/// Write JSON string to stdout or a file.
pub fn write_output(json: &str, output_path: Option<&str>) -> Result<(), String> {
    match output_path {
        Some(path) => {
            std::fs::write(Path::new(path), json)
                .map_err(|e| format!("Failed to write output file '{}': {}", path, e))
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(json.as_bytes())
                .and_then(|_| handle.write_all(b"\n"))
                .map_err(|e| format!("Failed to write to stdout: {}", e))
        }
    }
}

/// Serialize a value to JSON (pretty or compact).
pub fn to_json<T: serde::Serialize>(value: &T, compact: bool) -> Result<String, String> {
    if compact {
        serde_json::to_string(value).map_err(|e| format!("JSON serialization failed: {}", e))
    } else {
        serde_json::to_string_pretty(value)
            .map_err(|e| format!("JSON serialization failed: {}", e))
    }
}

/// The metric a summary table shows for each kind of experiment
pub fn headline_metric(experiment: &str) -> Metric {
    match experiment {
        "encryption" => Metric::EncryptionMs,
        "throughput" => Metric::ThroughputPerSec,
        "round_trip" | "reliability" => Metric::RoundTripMs,
        _ => Metric::TotalLatencyMs,
    }
}

/// Plain-text table of one report's summaries
pub fn format_summary_table(report: &ExperimentReport) -> String {
    let metric = headline_metric(&report.experiment);
    let mut table = String::new();

    let _ = writeln!(
        table,
        "{} experiment {}{}",
        report.experiment,
        report.id,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    let _ = writeln!(table, "Metric: {}\n", metric.label());
    let _ = writeln!(
        table,
        "  {:<20} {:>6} {:>6} {:>8} {:>10} {:>10} {:>10} {:>10}",
        "Point", "Tried", "OK", "Loss %", "Min", "Median", "Mean", "Max"
    );
    let _ = writeln!(table, "  {}", "-".repeat(88));

    for summary in &report.summaries {
        let _ = writeln!(table, "  {}", format_row(summary, metric));
    }

    if report.summaries.is_empty() {
        let _ = writeln!(table, "  (no data)");
    }
    table
}

fn format_row(summary: &PointSummary, metric: Metric) -> String {
    let stats = match summary.metrics.get(&metric) {
        Some(stat) => format!(
            "{:>10.2} {:>10.2} {:>10.2} {:>10.2}",
            stat.min, stat.median, stat.mean, stat.max
        ),
        None => format!("{:>10} {:>10} {:>10} {:>10}", "-", "-", "-", "-"),
    };
    format!(
        "{:<20} {:>6} {:>6} {:>8.2} {}",
        summary.key.to_string(),
        summary.attempted,
        summary.succeeded,
        summary.loss_pct,
        stats
    )
}
