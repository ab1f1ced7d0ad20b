//! Benchmark sample corpus
//!
//! One JSON record per line: required id/text/labels, optional threshold
//! defaulting to 0.4. Samples are read-only after load and shared across all
//! benchmark iterations.

use serde::{Deserialize, Serialize};
use span_bridge_core::error::{Error, Result};
use std::fs;
use std::path::Path;

pub const DEFAULT_THRESHOLD: f32 = 0.4;

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub text: String,
    pub labels: Vec<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

impl Sample {
    fn validate(&self, line: usize) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::ParseError(format!("sample at line {} has an empty id", line)));
        }
        if self.text.is_empty() {
            return Err(Error::ParseError(format!(
                "sample '{}' at line {} has an empty text",
                self.id, line
            )));
        }
        if self.labels.is_empty() {
            return Err(Error::ParseError(format!(
                "sample '{}' at line {} has no labels",
                self.id, line
            )));
        }
        Ok(())
    }
}

/// Parse a JSONL corpus. Blank lines are skipped; a malformed or incomplete
/// record is a fatal parse error naming the offending line.
pub fn parse_samples(contents: &str) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let number = index + 1;
        let sample: Sample = serde_json::from_str(line).map_err(|e| {
            Error::ParseError(format!("invalid sample record at line {}: {}", number, e))
        })?;
        sample.validate(number)?;
        samples.push(sample);
    }
    Ok(samples)
}

pub fn load_samples(path: &Path) -> Result<Vec<Sample>> {
    let contents = fs::read_to_string(path)?;
    parse_samples(&contents)
}

/// Write a corpus as JSONL, one record per line.
pub fn write_samples(path: &Path, samples: &[Sample]) -> Result<()> {
    let mut out = String::new();
    for sample in samples {
        out.push_str(&serde_json::to_string(sample)?);
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// The seed corpus used when no sample file is supplied.
pub fn seed_samples() -> Vec<Sample> {
    vec![
        Sample {
            id: "news_short".into(),
            text: "John Smith joined Apple Inc. as vice president of engineering".into(),
            labels: vec!["person".into(), "organization".into()],
            threshold: DEFAULT_THRESHOLD,
        },
        Sample {
            id: "news_multi".into(),
            text: "Sarah Johnson and John Smith founded TechCorp in San Francisco last year"
                .into(),
            labels: vec!["person".into(), "organization".into(), "location".into()],
            threshold: DEFAULT_THRESHOLD,
        },
        Sample {
            id: "technical_doc".into(),
            text: "The API endpoint returns JSON data with OAuth authentication enabled".into(),
            labels: vec!["technology".into(), "protocol".into()],
            threshold: 0.3,
        },
    ]
}
