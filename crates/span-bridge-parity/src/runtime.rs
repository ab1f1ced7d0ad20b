//! Reference-runtime seam
//!
//! The fixture generator and benchmark harness never touch model internals
//! directly: they drive a [`ReferenceRuntime`], a capability interface
//! resolved once at load time. Intermediate tensors are observable through
//! the [`TapSink`] callback at fixed tap points; the default sink is a no-op,
//! so uninstrumented runs pay nothing and nothing is ever patched globally.

use span_bridge_core::error::{Error, Result};
use span_bridge_core::ops;
use span_bridge_core::tensor::{Shape, Tensor};
use span_bridge_core::tokenizer::{Encoding, WordTokenizer};
use span_bridge_export::{LoadedModel, Module};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Checkpoint layout generation, selected by configuration before any load
/// attempt. V2 checkpoints carry the count-embedding transformer stack; V1
/// checkpoints do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeVersion {
    V1,
    V2,
}

/// Extraction points where intermediate tensors can be observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapPoint {
    Embeddings,
    HiddenStates,
    SpanScores,
}

impl TapPoint {
    pub fn name(&self) -> &'static str {
        match self {
            TapPoint::Embeddings => "embeddings",
            TapPoint::HiddenStates => "hidden_states",
            TapPoint::SpanScores => "span_scores",
        }
    }
}

/// Callback invoked with intermediate tensors at defined extraction points.
pub trait TapSink {
    fn record(&mut self, point: TapPoint, tensor: &Tensor);
}

/// The default sink: observes nothing.
pub struct NoopTap;

impl TapSink for NoopTap {
    fn record(&mut self, _point: TapPoint, _tensor: &Tensor) {}
}

/// Captures every tapped tensor, keyed by tap point name, for offline
/// inspection of a single case.
#[derive(Default)]
pub struct TapRecorder {
    captures: BTreeMap<&'static str, Tensor>,
}

impl TapRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, point: TapPoint) -> Option<&Tensor> {
        self.captures.get(point.name())
    }

    pub fn len(&self) -> usize {
        self.captures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captures.is_empty()
    }

    /// Write every capture to one JSON file, keyed by tap point name, with
    /// shape and values spelled out for offline inspection.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut dump = BTreeMap::new();
        for (point, tensor) in &self.captures {
            dump.insert(
                *point,
                serde_json::json!({
                    "shape": tensor.shape().dims(),
                    "values": tensor.data(),
                }),
            );
        }
        fs::write(path, serde_json::to_string_pretty(&dump)?)?;
        Ok(())
    }
}

impl TapSink for TapRecorder {
    fn record(&mut self, point: TapPoint, tensor: &Tensor) {
        self.captures.insert(point.name(), tensor.clone());
    }
}

/// Capability interface every reference runtime must satisfy.
///
/// All capabilities are resolved when the runtime is constructed; a model
/// missing one fails fast there with a diagnostic, never during generation.
pub trait ReferenceRuntime {
    fn model_id(&self) -> &str;
    fn hidden_size(&self) -> usize;
    fn max_width(&self) -> usize;
    fn tokenizer(&self) -> &WordTokenizer;

    /// Encoder forward pass over one encoding, including special tokens.
    /// Output is `[token_count, hidden_size]`.
    fn encode_hidden(&self, encoding: &Encoding, tap: &mut dyn TapSink) -> Result<Tensor>;

    /// Raw span score grid for one label: `[text_len, max_width]`, row-major.
    /// Never the formatted extraction result. `text_len` must be nonzero.
    fn score_spans(
        &self,
        hidden: &Tensor,
        encoding: &Encoding,
        label: &str,
        tap: &mut dyn TapSink,
    ) -> Result<Tensor>;
}

/// The fused reference model driven directly, before any rewriting. This is
/// the ground-truth side of every parity comparison.
pub struct FusedModelRuntime {
    model: LoadedModel,
    tokenizer: WordTokenizer,
    version: RuntimeVersion,
}

impl FusedModelRuntime {
    /// Resolve all required capabilities up front. The version is part of the
    /// configuration: a layout mismatch is a hard error here, not a fallback.
    pub fn new(model: LoadedModel, version: RuntimeVersion) -> Result<Self> {
        let tokenizer = model.tokenizer.clone().ok_or_else(|| {
            Error::MissingSubmodule(format!(
                "model '{}' carries no tokenizer; the reference runtime cannot tokenize fixtures",
                model.model_id
            ))
        })?;
        match (version, model.count_embed_transformer.is_some()) {
            (RuntimeVersion::V1, true) => {
                return Err(Error::UnsupportedArchitecture(format!(
                    "model '{}' is a v2 checkpoint (count-embedding transformer present); select RuntimeVersion::V2",
                    model.model_id
                )));
            }
            (RuntimeVersion::V2, false) => {
                return Err(Error::UnsupportedArchitecture(format!(
                    "model '{}' is a v1 checkpoint (no count-embedding transformer); select RuntimeVersion::V1",
                    model.model_id
                )));
            }
            _ => {}
        }
        Ok(Self { model, tokenizer, version })
    }

    pub fn version(&self) -> RuntimeVersion {
        self.version
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    fn embed(&self, input_ids: &[u32]) -> Result<Tensor> {
        let hidden = self.model.hidden_size;
        let mut data = Vec::with_capacity(input_ids.len() * hidden);
        for &id in input_ids {
            let id = id as usize;
            if id >= self.model.vocab_size {
                return Err(Error::InvalidShape(format!(
                    "Token id {} out of range for vocabulary of {}",
                    id, self.model.vocab_size
                )));
            }
            data.extend_from_slice(&self.model.embedding.data()[id * hidden..(id + 1) * hidden]);
        }
        Tensor::new("embeddings", Shape::new(vec![input_ids.len(), hidden]), data)
    }

    /// Mean of the embedding rows of the label's tokens.
    fn label_representation(&self, label: &str) -> Result<Vec<f32>> {
        let encoding = self.tokenizer.encode(label, 16);
        let ids: Vec<u32> = encoding.input_ids[1..encoding.input_ids.len() - 1].to_vec();
        let hidden = self.model.hidden_size;
        let mut rep = vec![0.0f32; hidden];
        if ids.is_empty() {
            return Ok(rep);
        }
        let rows = self.embed(&ids)?;
        for row in rows.data().chunks_exact(hidden) {
            for (r, v) in rep.iter_mut().zip(row) {
                *r += v;
            }
        }
        for r in rep.iter_mut() {
            *r /= ids.len() as f32;
        }
        Ok(rep)
    }
}

impl ReferenceRuntime for FusedModelRuntime {
    fn model_id(&self) -> &str {
        &self.model.model_id
    }

    fn hidden_size(&self) -> usize {
        self.model.hidden_size
    }

    fn max_width(&self) -> usize {
        self.model.max_width
    }

    fn tokenizer(&self) -> &WordTokenizer {
        &self.tokenizer
    }

    fn encode_hidden(&self, encoding: &Encoding, tap: &mut dyn TapSink) -> Result<Tensor> {
        let embedded = self.embed(&encoding.input_ids)?;
        tap.record(TapPoint::Embeddings, &embedded);

        let mut hidden = embedded;
        for layer in &self.model.encoder_layers {
            hidden = layer.forward(&hidden)?;
        }
        let hidden = self.model.encoder_norm.forward(&hidden)?;
        tap.record(TapPoint::HiddenStates, &hidden);
        Ok(hidden)
    }

    fn score_spans(
        &self,
        hidden: &Tensor,
        encoding: &Encoding,
        label: &str,
        tap: &mut dyn TapSink,
    ) -> Result<Tensor> {
        let text_len = encoding.text_len();
        let dim = self.model.hidden_size;
        if text_len == 0 {
            return Err(Error::InvalidShape("cannot score spans of an empty text".into()));
        }
        if hidden.shape().rows() < text_len + 2 || hidden.shape().last_dim() != dim {
            return Err(Error::InvalidShape(format!(
                "Hidden states {:?} do not cover {} text tokens plus specials",
                hidden.shape().dims(),
                text_len
            )));
        }

        // Text token rows, specials stripped
        let text_rows = Tensor::new(
            "text_hidden",
            Shape::new(vec![text_len, dim]),
            hidden.data()[dim..dim * (text_len + 1)].to_vec(),
        )?;
        let starts = self.model.span_project_start.forward(&text_rows)?;
        let ends = self.model.span_project_end.forward(&text_rows)?;
        let proj_dim = starts.shape().last_dim();

        let label_rep = self.label_representation(label)?;
        let scale = 1.0 / (dim as f32).sqrt();

        let width = self.model.max_width;
        let mut scores = Vec::with_capacity(text_len * width);
        for s in 0..text_len {
            for w in 0..width {
                let e = (s + w).min(text_len - 1);
                let mut pair = Vec::with_capacity(2 * proj_dim);
                pair.extend_from_slice(&starts.data()[s * proj_dim..(s + 1) * proj_dim]);
                pair.extend_from_slice(&ends.data()[e * proj_dim..(e + 1) * proj_dim]);
                let pair = Tensor::new("span.pair", Shape::new(vec![1, 2 * proj_dim]), pair)?;
                let rep = self.model.span_out_project.forward(&pair)?;

                let mut logit = 0.0;
                for (a, b) in rep.data().iter().zip(label_rep.iter()) {
                    logit += a * b;
                }
                let mut score = [logit * scale];
                ops::sigmoid_inplace(&mut score);
                scores.push(score[0]);
            }
        }

        let scores = Tensor::new("span_scores", Shape::new(vec![text_len, width]), scores)?;
        tap.record(TapPoint::SpanScores, &scores);
        Ok(scores)
    }
}
