//! Test support: a tiny fused model and a fully deterministic runtime.
//!
//! Used by this crate's unit and integration tests and by the benchmark
//! harness's own benches. Nothing here is part of the parity contract.

use crate::runtime::{ReferenceRuntime, TapPoint, TapSink};
use span_bridge_core::error::{Error, Result};
use span_bridge_core::tensor::{Shape, Tensor};
use span_bridge_core::tokenizer::{Encoding, WordTokenizer};
use span_bridge_export::{
    FusedSelfAttention, FusedTransformerLayer, LayerNorm, Linear, LoadedModel, Projection,
    ReducedTransformer,
};

pub fn fill(n: usize, seed: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32 * 0.29 + seed) % 1.6) - 0.8).collect()
}

fn linear(role: &str, out: usize, input: usize, seed: f32) -> Linear {
    let weight = Tensor::new("w", Shape::new(vec![out, input]), fill(out * input, seed))
        .expect("static test shape");
    let bias =
        Tensor::new("b", Shape::new(vec![out]), fill(out, seed + 0.5)).expect("static test shape");
    Linear::new(role, weight, Some(bias)).expect("static test shape")
}

fn projection(role: &str, input: usize, hidden: usize, output: usize, seed: f32) -> Projection {
    Projection::new(
        linear(&format!("{}_fc1", role), hidden, input, seed),
        linear(&format!("{}_fc2", role), output, hidden, seed + 0.25),
    )
    .expect("static test shape")
}

fn layer_norm(role: &str, dim: usize) -> LayerNorm {
    let gamma = Tensor::new("g", Shape::new(vec![dim]), vec![1.0; dim]).expect("static test shape");
    let beta = Tensor::new("b", Shape::new(vec![dim]), vec![0.0; dim]).expect("static test shape");
    LayerNorm::new(role, gamma, beta, 1e-5).expect("static test shape")
}

fn fused_layer(role: &str, embed: usize) -> FusedTransformerLayer {
    FusedTransformerLayer {
        role: role.to_string(),
        self_attn: FusedSelfAttention {
            role: format!("{}_attn", role),
            embed_dim: embed,
            num_heads: 2,
            batch_first: true,
            in_proj_weight: Tensor::new(
                "w",
                Shape::new(vec![3 * embed, embed]),
                fill(3 * embed * embed, 0.17),
            )
            .expect("static test shape"),
            in_proj_bias: Tensor::new("b", Shape::new(vec![3 * embed]), fill(3 * embed, 0.43))
                .expect("static test shape"),
            out_proj: linear(&format!("{}_attn_out", role), embed, embed, 0.29),
        },
        norm1: layer_norm(&format!("{}_n1", role), embed),
        norm2: layer_norm(&format!("{}_n2", role), embed),
        linear1: linear(&format!("{}_l1", role), 2 * embed, embed, 0.53),
        linear2: linear(&format!("{}_l2", role), embed, 2 * embed, 0.67),
        dropout_p: 0.0,
    }
}

pub fn test_vocabulary() -> Vec<&'static str> {
    vec![
        "john", "smith", "sarah", "johnson", "works", "at", "apple", "inc.", "founded",
        "techcorp", "in", "san", "francisco", "person", "organization", "location", "the",
        "and",
    ]
}

/// A small but structurally complete fused model.
pub fn tiny_loaded_model(with_count_transformer: bool) -> LoadedModel {
    let hidden = 8;
    let vocab = test_vocabulary().len() + 4;
    let count_embed_transformer = with_count_transformer.then(|| ReducedTransformer {
        role: "count_embed_transformer".into(),
        in_projector: linear("count_in_projector", 4, hidden, 0.61),
        layers: vec![fused_layer("count_layer0", 4)],
        out_projector: projection("count_out_projector", 4 + hidden, hidden, hidden, 0.73),
    });

    LoadedModel {
        model_id: "span-extractor-tiny".into(),
        hidden_size: hidden,
        max_width: 3,
        max_count: 4,
        vocab_size: vocab,
        embedding: Tensor::new(
            "embedding",
            Shape::new(vec![vocab, hidden]),
            fill(vocab * hidden, 0.07),
        )
        .expect("static test shape"),
        encoder_layers: vec![fused_layer("layer0", hidden)],
        encoder_norm: layer_norm("encoder_final_norm", hidden),
        span_project_start: projection("start", hidden, hidden, hidden, 0.11),
        span_project_end: projection("end", hidden, hidden, hidden, 0.21),
        span_out_project: projection("span_out", 2 * hidden, hidden, hidden, 0.31),
        classifier: projection("classifier", hidden, hidden, 1, 0.41),
        count_predictor: projection("count_predictor", hidden, hidden, 5, 0.51),
        count_embed_transformer,
        count_embed_projection: projection("count_embed", hidden, hidden, hidden, 0.81),
        tokenizer: Some(WordTokenizer::from_words(test_vocabulary())),
    }
}

/// A runtime whose outputs depend only on its inputs: hidden states and span
/// scores are computed from token ids and positions with no trained weights.
/// Optionally fails on texts containing a marker token, to exercise the
/// per-case error isolation paths.
pub struct DeterministicRuntime {
    tokenizer: WordTokenizer,
    hidden_size: usize,
    max_width: usize,
    fail_on: Option<String>,
}

impl DeterministicRuntime {
    pub fn new() -> Self {
        Self {
            tokenizer: WordTokenizer::from_words(test_vocabulary()),
            hidden_size: 8,
            max_width: 3,
            fail_on: None,
        }
    }

    /// Fail `encode_hidden` for any text containing the given word.
    pub fn with_failure_on(mut self, token: impl Into<String>) -> Self {
        self.fail_on = Some(token.into());
        self
    }

    fn score_for(start: usize, width: usize, label: &str) -> f32 {
        let label_sum: usize = label.bytes().map(|b| b as usize).sum();
        ((start * 31 + width * 17 + label_sum * 13) % 100) as f32 / 100.0
    }
}

impl Default for DeterministicRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceRuntime for DeterministicRuntime {
    fn model_id(&self) -> &str {
        "deterministic-test"
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn max_width(&self) -> usize {
        self.max_width
    }

    fn tokenizer(&self) -> &WordTokenizer {
        &self.tokenizer
    }

    fn encode_hidden(&self, encoding: &Encoding, tap: &mut dyn TapSink) -> Result<Tensor> {
        if let Some(marker) = &self.fail_on {
            if encoding.text_tokens.iter().any(|t| t.eq_ignore_ascii_case(marker)) {
                return Err(Error::Runtime(format!("marker token '{}' hit", marker)));
            }
        }
        let dim = self.hidden_size;
        let data: Vec<f32> = encoding
            .input_ids
            .iter()
            .flat_map(|&id| {
                (0..dim).map(move |col| ((id as usize * 31 + col * 7) % 13) as f32 / 13.0 - 0.5)
            })
            .collect();
        let hidden = Tensor::new(
            "hidden_states",
            Shape::new(vec![encoding.input_ids.len(), dim]),
            data,
        )?;
        tap.record(TapPoint::HiddenStates, &hidden);
        Ok(hidden)
    }

    fn score_spans(
        &self,
        _hidden: &Tensor,
        encoding: &Encoding,
        label: &str,
        tap: &mut dyn TapSink,
    ) -> Result<Tensor> {
        let text_len = encoding.text_len();
        if text_len == 0 {
            return Err(Error::InvalidShape("cannot score spans of an empty text".into()));
        }
        let mut scores = Vec::with_capacity(text_len * self.max_width);
        for start in 0..text_len {
            for width in 0..self.max_width {
                scores.push(Self::score_for(start, width, label));
            }
        }
        let scores =
            Tensor::new("span_scores", Shape::new(vec![text_len, self.max_width]), scores)?;
        tap.record(TapPoint::SpanScores, &scores);
        Ok(scores)
    }
}
