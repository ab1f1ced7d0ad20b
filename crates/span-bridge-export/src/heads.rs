//! Architectural heads of the extraction model
//!
//! The model is exported as independent artifacts, one per head: encoder,
//! span representation, classifier, count predictor and count embedding.
//! Each head knows how to run itself on a synthetic input and how to trace
//! itself into a static graph; tracing always cross-checks the described
//! output shape against a real forward pass before the artifact is persisted.

use crate::graph::{GraphInput, OpKind, StaticGraph};
use crate::module::{concat_last_dim, LayerNorm, Module, Projection};
use crate::rewriter::{
    rewrite_reduced_transformer, rewrite_transformer_layer, FusedTransformerLayer,
    ReducedTransformer, RewriteOutcome, RewrittenReducedTransformer, RewrittenTransformerLayer,
};
use serde::{Deserialize, Serialize};
use span_bridge_core::error::{Error, Result};
use span_bridge_core::tensor::{Shape, Tensor};
use span_bridge_core::tokenizer::WordTokenizer;
use tracing::warn;

/// Static shape bounds baked into every exported artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShapeLimits {
    pub max_seq_len: usize,
    pub max_schema_tokens: usize,
    pub hidden_size: usize,
    pub max_width: usize,
}

impl ShapeLimits {
    /// Number of span slots in the statically shaped span tensor.
    pub fn span_cap(&self) -> usize {
        self.max_seq_len * self.max_width
    }
}

/// Manifest entry describing one head's I/O contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmoduleDescriptor {
    pub name: String,
    pub inputs: Vec<GraphInput>,
    pub output_shape: Vec<usize>,
    pub decomposed: bool,
}

/// A head that can be traced and persisted as one artifact.
pub trait ExportHead {
    fn name(&self) -> &'static str;
    fn descriptor(&self, limits: &ShapeLimits) -> SubmoduleDescriptor;
    fn trace(&self, limits: &ShapeLimits) -> Result<StaticGraph>;
}

fn check_traced_shape(name: &str, described: &[usize], actual: &[usize]) -> Result<()> {
    if described != actual {
        return Err(Error::InvalidShape(format!(
            "Head '{}' trace disagrees with forward pass: described {:?}, computed {:?}",
            name, described, actual
        )));
    }
    Ok(())
}

/// Token encoder: embedding lookup plus the rewritten transformer stack.
#[derive(Debug)]
pub struct EncoderHead {
    /// `[vocab_size, hidden_size]`
    embedding: Tensor,
    layers: Vec<RewrittenTransformerLayer>,
    norm: LayerNorm,
    vocab_size: usize,
    hidden_size: usize,
}

impl EncoderHead {
    pub fn forward(&self, input_ids: &[u32]) -> Result<Tensor> {
        let seq_len = input_ids.len();
        let mut data = Vec::with_capacity(seq_len * self.hidden_size);
        for &id in input_ids {
            let id = id as usize;
            if id >= self.vocab_size {
                return Err(Error::InvalidShape(format!(
                    "Token id {} out of range for vocabulary of {}",
                    id, self.vocab_size
                )));
            }
            let row = &self.embedding.data()[id * self.hidden_size..(id + 1) * self.hidden_size];
            data.extend_from_slice(row);
        }
        let mut hidden =
            Tensor::new("hidden_states", Shape::new(vec![seq_len, self.hidden_size]), data)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        self.norm.forward(&hidden)
    }
}

impl ExportHead for EncoderHead {
    fn name(&self) -> &'static str {
        "encoder"
    }

    fn descriptor(&self, limits: &ShapeLimits) -> SubmoduleDescriptor {
        SubmoduleDescriptor {
            name: self.name().to_string(),
            inputs: vec![GraphInput {
                name: "input_ids".into(),
                shape: vec![1, limits.max_seq_len],
                dtype: "int32".into(),
            }],
            output_shape: vec![limits.max_seq_len, self.hidden_size],
            decomposed: true,
        }
    }

    fn trace(&self, limits: &ShapeLimits) -> Result<StaticGraph> {
        let seq = limits.max_seq_len;
        let mut graph = StaticGraph::new(self.name());
        graph.push_input("input_ids", &[1, seq], "int32");

        graph.bind_param(&self.embedding)?;
        graph.push_op(
            OpKind::Embedding {
                table: self.embedding.name().to_string(),
                vocab_size: self.vocab_size,
                dim: self.hidden_size,
            },
            vec![seq, self.hidden_size],
        );

        let mut shape = vec![seq, self.hidden_size];
        for layer in &self.layers {
            shape = layer.describe(&mut graph, &shape)?;
        }
        shape = self.norm.describe(&mut graph, &shape)?;
        graph.output_shape = shape.clone();

        let out = self.forward(&vec![0u32; seq])?;
        check_traced_shape(self.name(), &shape, out.shape().dims())?;
        Ok(graph)
    }
}

/// Span representation head: start/end token projections gathered per span
/// slot and mixed by an output projection. The span tensor is statically
/// shaped `[max_seq_len, max_width, out]`; invalid slots carry clamped end
/// gathers and are masked downstream by validity checks.
#[derive(Debug)]
pub struct SpanRepHead {
    project_start: Projection,
    project_end: Projection,
    out_project: Projection,
    hidden_size: usize,
    max_width: usize,
}

impl SpanRepHead {
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        if hidden.shape().last_dim() != self.hidden_size {
            return Err(Error::InvalidShape(format!(
                "Span head expects hidden size {}, got {:?}",
                self.hidden_size,
                hidden.shape().dims()
            )));
        }
        let seq_len = hidden.shape().rows();
        let starts = self.project_start.forward(hidden)?;
        let ends = self.project_end.forward(hidden)?;
        let dim = starts.shape().last_dim();

        let out_dim = self.out_project.fc2().out_features();
        let mut output = Vec::with_capacity(seq_len * self.max_width * out_dim);
        for s in 0..seq_len {
            for w in 0..self.max_width {
                // End tokens past the sequence clamp to the last position;
                // those slots are invalid and filtered at selection time.
                let e = (s + w).min(seq_len - 1);
                let start_row = Tensor::new(
                    "span.start",
                    Shape::new(vec![1, dim]),
                    starts.data()[s * dim..(s + 1) * dim].to_vec(),
                )?;
                let end_row = Tensor::new(
                    "span.end",
                    Shape::new(vec![1, dim]),
                    ends.data()[e * dim..(e + 1) * dim].to_vec(),
                )?;
                let joined = concat_last_dim("span.pair", &start_row, &end_row)?;
                let mixed = self.out_project.forward(&joined)?;
                output.extend_from_slice(mixed.data());
            }
        }
        Tensor::new(
            "span_reps",
            Shape::new(vec![seq_len, self.max_width, out_dim]),
            output,
        )
    }
}

impl ExportHead for SpanRepHead {
    fn name(&self) -> &'static str {
        "span_rep"
    }

    fn descriptor(&self, limits: &ShapeLimits) -> SubmoduleDescriptor {
        SubmoduleDescriptor {
            name: self.name().to_string(),
            inputs: vec![GraphInput {
                name: "hidden_states".into(),
                shape: vec![limits.max_seq_len, self.hidden_size],
                dtype: "float32".into(),
            }],
            output_shape: vec![
                limits.max_seq_len,
                self.max_width,
                self.out_project.fc2().out_features(),
            ],
            decomposed: true,
        }
    }

    fn trace(&self, limits: &ShapeLimits) -> Result<StaticGraph> {
        let seq = limits.max_seq_len;
        let cap = seq * self.max_width;
        let proj_dim = self.project_start.fc2().out_features();
        let out_dim = self.out_project.fc2().out_features();

        let mut graph = StaticGraph::new(self.name());
        graph.push_input("hidden_states", &[seq, self.hidden_size], "float32");
        graph.push_input("span_start_indices", &[cap], "int32");
        graph.push_input("span_end_indices", &[cap], "int32");

        self.project_start.describe(&mut graph, &[seq, self.hidden_size])?;
        self.project_end.describe(&mut graph, &[seq, self.hidden_size])?;
        graph.push_op(
            OpKind::GatherRows { indices: "span_start_indices".into() },
            vec![cap, proj_dim],
        );
        graph.push_op(
            OpKind::GatherRows { indices: "span_end_indices".into() },
            vec![cap, proj_dim],
        );
        graph.push_op(OpKind::Concat { axis: -1 }, vec![cap, 2 * proj_dim]);
        self.out_project.describe(&mut graph, &[cap, 2 * proj_dim])?;
        graph.push_op(
            OpKind::Reshape { shape: vec![seq, self.max_width, out_dim] },
            vec![seq, self.max_width, out_dim],
        );
        graph.output_shape = vec![seq, self.max_width, out_dim];

        let hidden = Tensor::zeros("hidden", Shape::new(vec![seq, self.hidden_size]))?;
        let out = self.forward(&hidden)?;
        check_traced_shape(self.name(), &graph.output_shape, out.shape().dims())?;
        Ok(graph)
    }
}

/// Entity-type classifier over schema token embeddings.
#[derive(Debug)]
pub struct ClassifierHead {
    proj: Projection,
    hidden_size: usize,
}

impl ClassifierHead {
    pub fn forward(&self, schema: &Tensor) -> Result<Tensor> {
        self.proj.forward(schema)
    }
}

impl ExportHead for ClassifierHead {
    fn name(&self) -> &'static str {
        "classifier"
    }

    fn descriptor(&self, limits: &ShapeLimits) -> SubmoduleDescriptor {
        SubmoduleDescriptor {
            name: self.name().to_string(),
            inputs: vec![GraphInput {
                name: "schema_embeddings".into(),
                shape: vec![limits.max_schema_tokens, self.hidden_size],
                dtype: "float32".into(),
            }],
            output_shape: vec![limits.max_schema_tokens, self.proj.fc2().out_features()],
            decomposed: true,
        }
    }

    fn trace(&self, limits: &ShapeLimits) -> Result<StaticGraph> {
        let rows = limits.max_schema_tokens;
        let mut graph = StaticGraph::new(self.name());
        graph.push_input("schema_embeddings", &[rows, self.hidden_size], "float32");
        let shape = self.proj.describe(&mut graph, &[rows, self.hidden_size])?;
        graph.output_shape = shape.clone();

        let input = Tensor::zeros("schema", Shape::new(vec![rows, self.hidden_size]))?;
        let out = self.forward(&input)?;
        check_traced_shape(self.name(), &shape, out.shape().dims())?;
        Ok(graph)
    }
}

/// Entity-count predictor over the pooled sequence representation.
#[derive(Debug)]
pub struct CountPredictorHead {
    proj: Projection,
    hidden_size: usize,
    max_count: usize,
}

impl CountPredictorHead {
    pub fn forward(&self, pooled: &Tensor) -> Result<Tensor> {
        let logits = self.proj.forward(pooled)?;
        let mut data = logits.data().to_vec();
        span_bridge_core::ops::softmax_rows(
            &mut data,
            logits.shape().rows(),
            logits.shape().last_dim(),
        )?;
        Tensor::new("count_probs", logits.shape().clone(), data)
    }
}

impl ExportHead for CountPredictorHead {
    fn name(&self) -> &'static str {
        "count_predictor"
    }

    fn descriptor(&self, _limits: &ShapeLimits) -> SubmoduleDescriptor {
        SubmoduleDescriptor {
            name: self.name().to_string(),
            inputs: vec![GraphInput {
                name: "pooled".into(),
                shape: vec![1, self.hidden_size],
                dtype: "float32".into(),
            }],
            // One probability per count class, zero through max_count
            output_shape: vec![1, self.max_count + 1],
            decomposed: true,
        }
    }

    fn trace(&self, _limits: &ShapeLimits) -> Result<StaticGraph> {
        let mut graph = StaticGraph::new(self.name());
        graph.push_input("pooled", &[1, self.hidden_size], "float32");
        let shape = self.proj.describe(&mut graph, &[1, self.hidden_size])?;
        graph.push_op(OpKind::Softmax { axis: -1 }, shape.clone());
        graph.output_shape = shape.clone();

        let input = Tensor::zeros("pooled", Shape::new(vec![1, self.hidden_size]))?;
        let out = self.forward(&input)?;
        check_traced_shape(self.name(), &shape, out.shape().dims())?;
        Ok(graph)
    }
}

/// Count embedding head. Its optional reduced-transformer stack is only
/// present in newer checkpoints; when absent the head ships as a plain
/// projection and the manifest marks it not decomposed.
#[derive(Debug)]
pub struct CountEmbedHead {
    transformer: Option<RewrittenReducedTransformer>,
    projection: Projection,
    hidden_size: usize,
    max_count: usize,
    reason: Option<String>,
}

impl CountEmbedHead {
    pub fn decomposed(&self) -> bool {
        self.transformer.is_some()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn forward(&self, embeddings: &Tensor) -> Result<Tensor> {
        let mixed = match &self.transformer {
            Some(t) => t.forward(embeddings)?,
            None => embeddings.clone(),
        };
        self.projection.forward(&mixed)
    }
}

impl ExportHead for CountEmbedHead {
    fn name(&self) -> &'static str {
        "count_embed"
    }

    fn descriptor(&self, _limits: &ShapeLimits) -> SubmoduleDescriptor {
        SubmoduleDescriptor {
            name: self.name().to_string(),
            inputs: vec![GraphInput {
                name: "count_embeddings".into(),
                shape: vec![self.max_count + 1, self.hidden_size],
                dtype: "float32".into(),
            }],
            output_shape: vec![self.max_count + 1, self.projection.fc2().out_features()],
            decomposed: self.decomposed(),
        }
    }

    fn trace(&self, _limits: &ShapeLimits) -> Result<StaticGraph> {
        let rows = self.max_count + 1;
        let mut graph = StaticGraph::new(self.name());
        graph.push_input("count_embeddings", &[rows, self.hidden_size], "float32");

        let mut shape = vec![rows, self.hidden_size];
        if let Some(t) = &self.transformer {
            shape = t.describe(&mut graph, &shape)?;
        }
        shape = self.projection.describe(&mut graph, &shape)?;
        graph.output_shape = shape.clone();

        let input = Tensor::zeros("counts", Shape::new(vec![rows, self.hidden_size]))?;
        let out = self.forward(&input)?;
        check_traced_shape(self.name(), &shape, out.shape().dims())?;
        Ok(graph)
    }
}

/// The reference model as loaded, with its fused submodules intact.
#[derive(Debug)]
pub struct LoadedModel {
    pub model_id: String,
    pub hidden_size: usize,
    pub max_width: usize,
    pub max_count: usize,
    pub vocab_size: usize,
    /// `[vocab_size, hidden_size]`
    pub embedding: Tensor,
    pub encoder_layers: Vec<FusedTransformerLayer>,
    pub encoder_norm: LayerNorm,
    pub span_project_start: Projection,
    pub span_project_end: Projection,
    pub span_out_project: Projection,
    pub classifier: Projection,
    pub count_predictor: Projection,
    pub count_embed_transformer: Option<ReducedTransformer>,
    pub count_embed_projection: Projection,
    pub tokenizer: Option<WordTokenizer>,
}

impl LoadedModel {
    fn validate(&self) -> Result<()> {
        if self.embedding.shape().dims() != [self.vocab_size, self.hidden_size] {
            return Err(Error::InvalidShape(format!(
                "Embedding table is {:?}, expected [{}, {}]",
                self.embedding.shape().dims(),
                self.vocab_size,
                self.hidden_size
            )));
        }
        if self.encoder_norm.dim() != self.hidden_size {
            return Err(Error::InvalidShape(format!(
                "Encoder norm dim {} disagrees with hidden size {}",
                self.encoder_norm.dim(),
                self.hidden_size
            )));
        }
        Ok(())
    }
}

/// The fully rewritten model, ready to trace and persist.
#[derive(Debug)]
pub struct ExportModel {
    pub model_id: String,
    pub hidden_size: usize,
    pub max_width: usize,
    pub max_count: usize,
    pub encoder: EncoderHead,
    pub span_rep: SpanRepHead,
    pub classifier: ClassifierHead,
    pub count_predictor: CountPredictorHead,
    pub count_embed: CountEmbedHead,
    pub tokenizer: Option<WordTokenizer>,
}

impl ExportModel {
    /// Rewrite every fused submodule of a loaded model. The source model is
    /// not consumed or modified; all weights are cloned into rewritten forms.
    pub fn from_loaded(model: &LoadedModel) -> Result<Self> {
        model.validate()?;

        let layers = model
            .encoder_layers
            .iter()
            .map(rewrite_transformer_layer)
            .collect::<Result<Vec<_>>>()?;

        let count_embed_outcome = match &model.count_embed_transformer {
            Some(fused) => match rewrite_reduced_transformer(fused) {
                Ok(rewritten) => RewriteOutcome::Decomposed(rewritten),
                Err(err) => {
                    warn!(error = %err, "count embedding transformer left fused");
                    RewriteOutcome::Unchanged { reason: err.to_string() }
                }
            },
            None => RewriteOutcome::Unchanged {
                reason: "checkpoint has no count embedding transformer".to_string(),
            },
        };
        let (transformer, reason) = match count_embed_outcome {
            RewriteOutcome::Decomposed(t) => (Some(t), None),
            RewriteOutcome::Unchanged { reason } => (None, Some(reason)),
        };

        Ok(Self {
            model_id: model.model_id.clone(),
            hidden_size: model.hidden_size,
            max_width: model.max_width,
            max_count: model.max_count,
            encoder: EncoderHead {
                embedding: model.embedding.renamed("token_embedding"),
                layers,
                norm: model.encoder_norm.cloned_as("encoder_norm")?,
                vocab_size: model.vocab_size,
                hidden_size: model.hidden_size,
            },
            span_rep: SpanRepHead {
                project_start: model.span_project_start.cloned_as("project_start")?,
                project_end: model.span_project_end.cloned_as("project_end")?,
                out_project: model.span_out_project.cloned_as("out_project")?,
                hidden_size: model.hidden_size,
                max_width: model.max_width,
            },
            classifier: ClassifierHead {
                proj: model.classifier.cloned_as("classifier")?,
                hidden_size: model.hidden_size,
            },
            count_predictor: CountPredictorHead {
                proj: model.count_predictor.cloned_as("count_predictor")?,
                hidden_size: model.hidden_size,
                max_count: model.max_count,
            },
            count_embed: CountEmbedHead {
                transformer,
                projection: model.count_embed_projection.cloned_as("count_embed_projection")?,
                hidden_size: model.hidden_size,
                max_count: model.max_count,
                reason,
            },
            tokenizer: model.tokenizer.clone(),
        })
    }

    pub fn heads(&self) -> Vec<&dyn ExportHead> {
        vec![
            &self.encoder,
            &self.span_rep,
            &self.classifier,
            &self.count_predictor,
            &self.count_embed,
        ]
    }
}
