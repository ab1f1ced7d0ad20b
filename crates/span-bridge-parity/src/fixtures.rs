//! Parity fixture generation
//!
//! Fixtures capture, for a fixed ordered case set, everything the companion
//! runtime needs to verify itself offline: tokenizer output, encoder hidden
//! states, and the selected entities, each compared under the tolerances
//! recorded in the fixture metadata. The comparing test suite reads its
//! tolerances from the file; they are never hard-coded on the consuming side.

use crate::runtime::{NoopTap, ReferenceRuntime};
use crate::spans::{find_valid_spans, resolve_entity, select_spans, PredictedEntity};
use serde::{Deserialize, Serialize};
use span_bridge_core::error::Result;
use span_bridge_core::tensor::Tensor;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const GENERATOR_VERSION: &str = "1.0.0";

/// One fixture input: text, candidate labels, detection threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSpec {
    pub id: String,
    pub text: String,
    pub labels: Vec<String>,
    pub threshold: f32,
}

impl CaseSpec {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        labels: &[&str],
        threshold: f32,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            threshold,
        }
    }
}

/// The fixed case set. Ordering is part of the fixture contract; callers may
/// append cases but never reorder or shuffle.
pub fn canonical_cases() -> Vec<CaseSpec> {
    vec![
        CaseSpec::new(
            "simple_person",
            "John Smith works at Apple Inc.",
            &["person", "organization"],
            0.4,
        ),
        CaseSpec::new(
            "multi_entity",
            "Sarah Johnson and John Smith founded TechCorp in San Francisco",
            &["person", "organization", "location"],
            0.4,
        ),
        CaseSpec::new(
            "technical",
            "The API endpoint returns JSON data with OAuth authentication",
            &["technology", "protocol"],
            0.3,
        ),
        CaseSpec::new("empty", "", &["person"], 0.4),
        CaseSpec::new(
            "long_text",
            "John Smith works at Apple Inc. Sarah Johnson works at TechCorp. \
             John Smith and Sarah Johnson founded TechCorp in San Francisco",
            &["person", "organization", "location"],
            0.4,
        ),
    ]
}

/// Per-field comparison tolerances. Zero means exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSpec {
    pub token_ids: f32,
    pub attention_mask: f32,
    pub hidden_states: f32,
    pub entity_scores: f32,
}

impl Default for ToleranceSpec {
    fn default() -> Self {
        Self { token_ids: 0.0, attention_mask: 0.0, hidden_states: 1e-4, entity_scores: 0.01 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureMetadata {
    pub model: String,
    pub hidden_size: usize,
    pub generator_version: String,
    pub tolerances: ToleranceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerOutput {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub tokens: Vec<String>,
}

/// Hidden-state capture: values plus the shape needed to reinterpret them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderOutput {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl EncoderOutput {
    fn from_tensor(tensor: &Tensor) -> Self {
        Self { shape: tensor.shape().dims().to_vec(), values: tensor.data().to_vec() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureCase {
    pub id: String,
    pub text: String,
    pub labels: Vec<String>,
    pub threshold: f32,
    pub tokenizer: TokenizerOutput,
    pub encoder: EncoderOutput,
    pub entities: Vec<PredictedEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    pub metadata: FixtureMetadata,
    pub cases: Vec<FixtureCase>,
}

impl FixtureFile {
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

/// Drives a reference runtime over a case set and records the results.
pub struct FixtureGenerator<R: ReferenceRuntime> {
    runtime: R,
    tolerances: ToleranceSpec,
    max_seq_len: usize,
}

impl<R: ReferenceRuntime> FixtureGenerator<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime, tolerances: ToleranceSpec::default(), max_seq_len: 512 }
    }

    pub fn with_tolerances(mut self, tolerances: ToleranceSpec) -> Self {
        self.tolerances = tolerances;
        self
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Generate fixtures for all cases, in input order. A failing case is
    /// logged and excluded; it never aborts the remaining cases.
    pub fn generate(&self, cases: &[CaseSpec]) -> FixtureFile {
        let mut captured = Vec::with_capacity(cases.len());
        for case in cases {
            match self.generate_case(case) {
                Ok(fixture) => {
                    debug!(case = %case.id, entities = fixture.entities.len(), "case captured");
                    captured.push(fixture);
                }
                Err(err) => {
                    warn!(case = %case.id, error = %err, "case failed, excluded from fixtures");
                }
            }
        }

        FixtureFile {
            metadata: FixtureMetadata {
                model: self.runtime.model_id().to_string(),
                hidden_size: self.runtime.hidden_size(),
                generator_version: GENERATOR_VERSION.to_string(),
                tolerances: self.tolerances,
            },
            cases: captured,
        }
    }

    fn generate_case(&self, case: &CaseSpec) -> Result<FixtureCase> {
        let encoding = self.runtime.tokenizer().encode(&case.text, self.max_seq_len);
        let hidden = self.runtime.encode_hidden(&encoding, &mut NoopTap)?;

        // Raw scores only; the formatted extraction result is never captured.
        let mut candidates = Vec::new();
        if encoding.text_len() > 0 {
            for label in &case.labels {
                let scores = self.runtime.score_spans(&hidden, &encoding, label, &mut NoopTap)?;
                candidates.extend(find_valid_spans(
                    scores.data(),
                    encoding.text_len(),
                    self.runtime.max_width(),
                    case.threshold,
                    label,
                ));
            }
        }
        let entities: Vec<PredictedEntity> = select_spans(candidates)
            .iter()
            .map(|span| resolve_entity(span, &encoding, &case.text))
            .collect();

        Ok(FixtureCase {
            id: case.id.clone(),
            text: case.text.clone(),
            labels: case.labels.clone(),
            threshold: case.threshold,
            tokenizer: TokenizerOutput {
                input_ids: encoding.input_ids.clone(),
                attention_mask: encoding.attention_mask.clone(),
                tokens: encoding.tokens.clone(),
            },
            encoder: EncoderOutput::from_tensor(&hidden),
            entities,
        })
    }
}
