//! Cross-runtime benchmark comparison
//!
//! The two runtimes never share process or state: each produces its own
//! summary JSON, the candidate in-process and the baseline via a blocking
//! subprocess invocation of its own executable. A missing or failed side
//! degrades to "N/A" rows; it never aborts the comparison.
//!
//! Ratio direction is deliberately asymmetric: latency speedup is
//! baseline/candidate (lower latency wins), throughput ratio is
//! candidate/baseline (higher throughput wins). Both read as "how many times
//! better the candidate is"; collapsing them into one formula would invert
//! half the table.

use crate::bench::BenchmarkSummary;
use std::fmt;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

/// Run the baseline runtime's executable to completion and read back the
/// summary it wrote. Non-zero exit or an unreadable summary is a missing
/// result, not an error; there are no retries.
pub fn run_external(command: &mut Command, summary_path: &Path) -> Option<BenchmarkSummary> {
    let status = match command.status() {
        Ok(status) => status,
        Err(err) => {
            warn!(error = %err, "external runtime failed to launch");
            return None;
        }
    };
    if !status.success() {
        warn!(code = ?status.code(), "external runtime exited non-zero");
        return None;
    }
    match BenchmarkSummary::load(summary_path) {
        Ok(summary) => {
            info!(mode = %summary.model_version, "external summary loaded");
            Some(summary)
        }
        Err(err) => {
            warn!(path = %summary_path.display(), error = %err, "external summary unreadable");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    LowerIsBetter,
    HigherIsBetter,
}

#[derive(Debug, Clone)]
pub struct ComparisonRow {
    pub metric: &'static str,
    pub candidate: Option<f64>,
    pub baseline: Option<f64>,
    /// Candidate advantage factor; >1 means the candidate wins this metric
    pub ratio: Option<f64>,
}

impl ComparisonRow {
    fn build(
        metric: &'static str,
        candidate: Option<f64>,
        baseline: Option<f64>,
        direction: Direction,
    ) -> Self {
        let ratio = match (candidate, baseline) {
            (Some(c), Some(b)) if c > 0.0 && b > 0.0 => Some(match direction {
                Direction::LowerIsBetter => b / c,
                Direction::HigherIsBetter => c / b,
            }),
            _ => None,
        };
        Self { metric, candidate, baseline, ratio }
    }
}

/// Side-by-side report over two optional summaries.
#[derive(Debug, Clone)]
pub struct ComparisonReport {
    pub candidate_mode: Option<String>,
    pub baseline_mode: Option<String>,
    pub rows: Vec<ComparisonRow>,
}

impl ComparisonReport {
    pub fn build(
        candidate: Option<&BenchmarkSummary>,
        baseline: Option<&BenchmarkSummary>,
    ) -> Self {
        let latency_metrics: [(&'static str, fn(&BenchmarkSummary) -> f64); 5] = [
            ("averageLatencyMs", |s| s.average_latency_ms),
            ("medianLatencyMs", |s| s.median_latency_ms),
            ("p95LatencyMs", |s| s.p95_latency_ms),
            ("minLatencyMs", |s| s.min_latency_ms),
            ("maxLatencyMs", |s| s.max_latency_ms),
        ];

        let mut rows = Vec::with_capacity(latency_metrics.len() + 2);
        for (metric, get) in latency_metrics {
            rows.push(ComparisonRow::build(
                metric,
                candidate.map(get),
                baseline.map(get),
                Direction::LowerIsBetter,
            ));
        }
        rows.push(ComparisonRow::build(
            "charactersPerSecond",
            candidate.map(|s| s.characters_per_second),
            baseline.map(|s| s.characters_per_second),
            Direction::HigherIsBetter,
        ));
        rows.push(ComparisonRow {
            metric: "totalEntitiesExtracted",
            candidate: candidate.map(|s| s.total_entities_extracted as f64),
            baseline: baseline.map(|s| s.total_entities_extracted as f64),
            ratio: None,
        });

        Self {
            candidate_mode: candidate.map(|s| s.model_version.clone()),
            baseline_mode: baseline.map(|s| s.model_version.clone()),
            rows,
        }
    }
}

fn cell(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}", v),
        None => "N/A".to_string(),
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let candidate = self.candidate_mode.as_deref().unwrap_or("N/A");
        let baseline = self.baseline_mode.as_deref().unwrap_or("N/A");
        writeln!(
            f,
            "{:<24} {:>12} {:>12} {:>10}",
            "metric", candidate, baseline, "speedup"
        )?;
        for row in &self.rows {
            let speedup = match row.ratio {
                Some(r) => format!("{:.2}x", r),
                None => "N/A".to_string(),
            };
            writeln!(
                f,
                "{:<24} {:>12} {:>12} {:>10}",
                row.metric,
                cell(row.candidate),
                cell(row.baseline),
                speedup
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn summary(mode: &str, latency: f64, chars_per_sec: f64) -> BenchmarkSummary {
        BenchmarkSummary {
            model_version: mode.into(),
            samples: 3,
            iterations_per_sample: 5,
            total_requests: 15,
            average_latency_ms: latency,
            median_latency_ms: latency,
            p95_latency_ms: latency * 1.5,
            min_latency_ms: latency * 0.5,
            max_latency_ms: latency * 2.0,
            characters_per_second: chars_per_sec,
            total_entities_extracted: 12,
        }
    }

    fn row<'a>(report: &'a ComparisonReport, metric: &str) -> &'a ComparisonRow {
        report.rows.iter().find(|r| r.metric == metric).unwrap()
    }

    #[test]
    fn test_latency_speedup_is_baseline_over_candidate() {
        let candidate = summary("local", 10.0, 100.0);
        let baseline = summary("external", 20.0, 100.0);
        let report = ComparisonReport::build(Some(&candidate), Some(&baseline));

        let avg = row(&report, "averageLatencyMs");
        assert!((avg.ratio.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_ratio_is_inverted() {
        // 100 chars/s vs 50 chars/s favors the candidate at 2.0x
        let candidate = summary("local", 10.0, 100.0);
        let baseline = summary("external", 10.0, 50.0);
        let report = ComparisonReport::build(Some(&candidate), Some(&baseline));

        let throughput = row(&report, "charactersPerSecond");
        assert!((throughput.ratio.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_baseline_degrades_to_na() {
        let candidate = summary("local", 10.0, 100.0);
        let report = ComparisonReport::build(Some(&candidate), None);

        assert!(report.baseline_mode.is_none());
        for r in &report.rows {
            assert!(r.baseline.is_none());
            assert!(r.ratio.is_none());
        }
        let rendered = report.to_string();
        assert!(rendered.contains("N/A"));
    }

    #[test]
    fn test_entities_row_has_no_ratio() {
        let candidate = summary("local", 10.0, 100.0);
        let baseline = summary("external", 10.0, 100.0);
        let report = ComparisonReport::build(Some(&candidate), Some(&baseline));
        assert!(row(&report, "totalEntitiesExtracted").ratio.is_none());
    }

    #[test]
    fn test_run_external_nonzero_exit_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.json");
        summary("external", 10.0, 100.0).save(&path).unwrap();

        let mut command = Command::new("false");
        assert!(run_external(&mut command, &path).is_none());
    }

    #[test]
    fn test_run_external_reads_summary_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.json");
        summary("external", 10.0, 100.0).save(&path).unwrap();

        let mut command = Command::new("true");
        let loaded = run_external(&mut command, &path).unwrap();
        assert_eq!(loaded.model_version, "external");
    }

    #[test]
    fn test_run_external_missing_summary_is_none() {
        let dir = tempdir().unwrap();
        let mut command = Command::new("true");
        assert!(run_external(&mut command, &dir.path().join("absent.json")).is_none());
    }
}
