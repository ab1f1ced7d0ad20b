//! Benchmark harness
//!
//! Runs one target over the sample corpus: configurable warmup passes are
//! discarded, measured passes record wall-clock latency and extracted entity
//! counts. Everything is sequential, sample by sample, so per-sample latency
//! stays attributable to a single workload unit.

use crate::runtime::{NoopTap, ReferenceRuntime};
use crate::samples::Sample;
use crate::spans::{find_valid_spans, select_spans};
use serde::{Deserialize, Serialize};
use span_bridge_core::error::{Error, Result};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct HarnessConfig {
    /// Measured passes per sample
    pub iterations: usize,
    /// Discarded warmup passes per sample
    pub warmup: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self { iterations: 5, warmup: 1 }
    }
}

/// Anything the harness can time: one call processes one sample and reports
/// how many entities it extracted.
pub trait BenchTarget {
    fn mode(&self) -> &str;
    fn process(&mut self, sample: &Sample) -> Result<usize>;
}

/// Per-run aggregate, written as camelCase JSON. This layout is shared with
/// the companion runtime's own benchmark output so the two files diff
/// directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkSummary {
    pub model_version: String,
    pub samples: usize,
    pub iterations_per_sample: usize,
    pub total_requests: usize,
    pub average_latency_ms: f64,
    pub median_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub characters_per_second: f64,
    pub total_entities_extracted: usize,
}

impl BenchmarkSummary {
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Linear-interpolated percentile over an ascending-sorted slice.
///
/// The rank estimate is `q * (n - 1)`; a fractional rank interpolates
/// between the two neighboring samples.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Run the full workload through one target.
///
/// A sample whose warmup or measured pass fails is logged and excluded; its
/// partial timings are discarded. The run fails only when no sample
/// completes at all.
pub fn run_benchmark<T: BenchTarget>(
    target: &mut T,
    samples: &[Sample],
    config: &HarnessConfig,
) -> Result<BenchmarkSummary> {
    let mut latencies_ms: Vec<f64> = Vec::new();
    let mut total_chars = 0usize;
    let mut total_entities = 0usize;
    let mut completed_samples = 0usize;

    'samples: for sample in samples {
        for _ in 0..config.warmup {
            if let Err(err) = target.process(sample) {
                warn!(sample = %sample.id, error = %err, "warmup failed, sample excluded");
                continue 'samples;
            }
        }

        let mut sample_latencies = Vec::with_capacity(config.iterations);
        let mut sample_entities = 0usize;
        for _ in 0..config.iterations {
            let start = Instant::now();
            match target.process(sample) {
                Ok(entities) => {
                    sample_latencies.push(start.elapsed().as_secs_f64() * 1000.0);
                    sample_entities += entities;
                }
                Err(err) => {
                    warn!(sample = %sample.id, error = %err, "measured pass failed, sample excluded");
                    continue 'samples;
                }
            }
        }

        debug!(sample = %sample.id, passes = sample_latencies.len(), "sample measured");
        total_chars += sample.text.chars().count() * config.iterations;
        total_entities += sample_entities;
        latencies_ms.extend(sample_latencies);
        completed_samples += 1;
    }

    if latencies_ms.is_empty() {
        return Err(Error::Runtime(format!(
            "benchmark '{}' completed no samples",
            target.mode()
        )));
    }

    let mut sorted = latencies_ms.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let total_seconds: f64 = latencies_ms.iter().sum::<f64>() / 1000.0;

    Ok(BenchmarkSummary {
        model_version: target.mode().to_string(),
        samples: completed_samples,
        iterations_per_sample: config.iterations,
        total_requests: completed_samples * config.iterations,
        average_latency_ms: latencies_ms.iter().sum::<f64>() / latencies_ms.len() as f64,
        median_latency_ms: median(&sorted),
        p95_latency_ms: percentile(&sorted, 0.95),
        min_latency_ms: sorted[0],
        max_latency_ms: sorted[sorted.len() - 1],
        characters_per_second: if total_seconds > 0.0 {
            total_chars as f64 / total_seconds
        } else {
            0.0
        },
        total_entities_extracted: total_entities,
    })
}

/// Bench target over any reference runtime: tokenize, encode, score every
/// label, select spans.
pub struct RuntimeTarget<R: ReferenceRuntime> {
    runtime: R,
    mode: String,
    max_seq_len: usize,
}

impl<R: ReferenceRuntime> RuntimeTarget<R> {
    pub fn new(runtime: R, mode: impl Into<String>) -> Self {
        Self { runtime, mode: mode.into(), max_seq_len: 512 }
    }
}

impl<R: ReferenceRuntime> BenchTarget for RuntimeTarget<R> {
    fn mode(&self) -> &str {
        &self.mode
    }

    fn process(&mut self, sample: &Sample) -> Result<usize> {
        let encoding = self.runtime.tokenizer().encode(&sample.text, self.max_seq_len);
        let hidden = self.runtime.encode_hidden(&encoding, &mut NoopTap)?;

        let mut candidates = Vec::new();
        if encoding.text_len() > 0 {
            for label in &sample.labels {
                let scores = self.runtime.score_spans(&hidden, &encoding, label, &mut NoopTap)?;
                candidates.extend(find_valid_spans(
                    scores.data(),
                    encoding.text_len(),
                    self.runtime.max_width(),
                    sample.threshold,
                    label,
                ));
            }
        }
        Ok(select_spans(candidates).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::seed_samples;
    use crate::testkit::DeterministicRuntime;
    use tempfile::tempdir;

    #[test]
    fn test_percentile_linear_interpolation() {
        let sorted = [10.0, 20.0, 30.0, 40.0, 100.0];
        // rank = 0.95 * 4 = 3.8 -> 40 + 0.8 * 60
        assert!((percentile(&sorted, 0.95) - 88.0).abs() < 1e-9);
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 1.0), 100.0);
    }

    #[test]
    fn test_percentile_degenerate_inputs() {
        assert_eq!(percentile(&[], 0.95), 0.0);
        assert_eq!(percentile(&[42.0], 0.95), 42.0);
    }

    #[test]
    fn test_median_even_and_odd() {
        assert_eq!(median(&[1.0, 3.0, 5.0]), 3.0);
        assert_eq!(median(&[1.0, 3.0, 5.0, 7.0]), 4.0);
    }

    #[test]
    fn test_run_benchmark_totals() {
        let mut target = RuntimeTarget::new(DeterministicRuntime::new(), "local");
        let config = HarnessConfig { iterations: 3, warmup: 1 };
        let summary = run_benchmark(&mut target, &seed_samples(), &config).unwrap();

        assert_eq!(summary.model_version, "local");
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.iterations_per_sample, 3);
        assert_eq!(summary.total_requests, 9);
        assert!(summary.min_latency_ms <= summary.median_latency_ms);
        assert!(summary.median_latency_ms <= summary.max_latency_ms);
        assert!(summary.characters_per_second > 0.0);
    }

    #[test]
    fn test_failing_sample_excluded_not_fatal() {
        let runtime = DeterministicRuntime::new().with_failure_on("techcorp");
        let mut target = RuntimeTarget::new(runtime, "local");
        let summary =
            run_benchmark(&mut target, &seed_samples(), &HarnessConfig::default()).unwrap();

        // news_multi contains the marker token and drops out
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.total_requests, 10);
    }

    #[test]
    fn test_all_samples_failing_is_an_error() {
        let runtime = DeterministicRuntime::new().with_failure_on("the");
        let mut target = RuntimeTarget::new(runtime, "local");
        let mut samples = seed_samples();
        samples.retain(|s| s.id == "technical_doc");
        assert!(run_benchmark(&mut target, &samples, &HarnessConfig::default()).is_err());
    }

    #[test]
    fn test_summary_wire_format_is_camel_case() {
        let summary = BenchmarkSummary {
            model_version: "local".into(),
            samples: 1,
            iterations_per_sample: 2,
            total_requests: 2,
            average_latency_ms: 1.0,
            median_latency_ms: 1.0,
            p95_latency_ms: 1.0,
            min_latency_ms: 1.0,
            max_latency_ms: 1.0,
            characters_per_second: 10.0,
            total_entities_extracted: 3,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"modelVersion\""));
        assert!(json.contains("\"iterationsPerSample\""));
        assert!(json.contains("\"p95LatencyMs\""));
        assert!(json.contains("\"charactersPerSecond\""));
        assert!(json.contains("\"totalEntitiesExtracted\""));
    }

    #[test]
    fn test_summary_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let mut target = RuntimeTarget::new(DeterministicRuntime::new(), "local");
        let written =
            run_benchmark(&mut target, &seed_samples(), &HarnessConfig::default()).unwrap();
        written.save(&path).unwrap();

        let loaded = BenchmarkSummary::load(&path).unwrap();
        assert_eq!(loaded.total_requests, written.total_requests);
        assert_eq!(loaded.model_version, written.model_version);
    }
}
