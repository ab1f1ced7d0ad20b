//! Fused-module rewriting
//!
//! The reference model packs query/key/value into one fused `in_proj` matrix
//! and hides the transformer layer's arithmetic inside opaque submodules.
//! The target graph format only understands primitive ops, so each fused form
//! is rewritten into an unfused equivalent by slicing and cloning the trained
//! weights. The rewrite never mutates the source module, and the unfused
//! forward must agree with the fused forward to float precision.

use crate::graph::{OpKind, StaticGraph};
use crate::module::{concat_last_dim, LayerNorm, Linear, Module, Projection};
use span_bridge_core::error::{Error, Result};
use span_bridge_core::ops;
use span_bridge_core::tensor::{Shape, Tensor};

/// Result of attempting to rewrite an optional submodule.
#[derive(Debug)]
pub enum RewriteOutcome<T> {
    Decomposed(T),
    /// The submodule was absent or not in a rewritable form; the manifest
    /// records it as not decomposed.
    Unchanged { reason: String },
}

/// Multi-head self-attention with the packed `in_proj` parameterization.
#[derive(Debug, Clone)]
pub struct FusedSelfAttention {
    pub role: String,
    pub embed_dim: usize,
    pub num_heads: usize,
    /// Layout convention of the source module. Single-sequence `[S, E]`
    /// inputs share row-major storage under both conventions, so the flag
    /// is carried through the rewrite rather than acted on.
    pub batch_first: bool,
    /// `[3 * embed_dim, embed_dim]`, rows ordered query, key, value
    pub in_proj_weight: Tensor,
    /// `[3 * embed_dim]`
    pub in_proj_bias: Tensor,
    pub out_proj: Linear,
}

impl FusedSelfAttention {
    pub fn head_dim(&self) -> usize {
        self.embed_dim / self.num_heads
    }

    /// Reference forward pass through the packed projection. Used to check
    /// the unfused rewrite numerically.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let embed = self.embed_dim;
        if input.shape().last_dim() != embed {
            return Err(Error::InvalidShape(format!(
                "Attention '{}' expects embed dim {}, got {:?}",
                self.role,
                embed,
                input.shape().dims()
            )));
        }
        let seq_len = input.shape().rows();

        let mut qkv = vec![0.0f32; seq_len * 3 * embed];
        ops::linear(
            input.data(),
            self.in_proj_weight.data(),
            Some(self.in_proj_bias.data()),
            &mut qkv,
            seq_len,
            embed,
            3 * embed,
        )?;

        let mut q = vec![0.0f32; seq_len * embed];
        let mut k = vec![0.0f32; seq_len * embed];
        let mut v = vec![0.0f32; seq_len * embed];
        for s in 0..seq_len {
            let row = &qkv[s * 3 * embed..(s + 1) * 3 * embed];
            q[s * embed..(s + 1) * embed].copy_from_slice(&row[..embed]);
            k[s * embed..(s + 1) * embed].copy_from_slice(&row[embed..2 * embed]);
            v[s * embed..(s + 1) * embed].copy_from_slice(&row[2 * embed..]);
        }

        let context = attention_core(&q, &k, &v, seq_len, self.num_heads, self.head_dim())?;
        let context =
            Tensor::new(format!("{}.context", self.role), input.shape().clone(), context)?;
        self.out_proj.forward(&context)
    }
}

/// Self-attention with separate query/key/value projections.
#[derive(Debug, Clone)]
pub struct UnfusedSelfAttention {
    pub role: String,
    pub embed_dim: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub batch_first: bool,
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
}

impl Module for UnfusedSelfAttention {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.shape().last_dim() != self.embed_dim {
            return Err(Error::InvalidShape(format!(
                "Attention '{}' expects embed dim {}, got {:?}",
                self.role,
                self.embed_dim,
                input.shape().dims()
            )));
        }
        let seq_len = input.shape().rows();

        let q = self.q_proj.forward(input)?;
        let k = self.k_proj.forward(input)?;
        let v = self.v_proj.forward(input)?;

        let context =
            attention_core(q.data(), k.data(), v.data(), seq_len, self.num_heads, self.head_dim)?;
        let context =
            Tensor::new(format!("{}.context", self.role), input.shape().clone(), context)?;
        self.out_proj.forward(&context)
    }

    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>> {
        let seq_len = input_shape.iter().rev().skip(1).product::<usize>().max(1);
        let scale = 1.0 / (self.head_dim as f32).sqrt();

        self.q_proj.describe(graph, input_shape)?;
        self.k_proj.describe(graph, input_shape)?;
        self.v_proj.describe(graph, input_shape)?;

        graph.push_op(
            OpKind::Reshape { shape: vec![seq_len, self.num_heads, self.head_dim] },
            vec![seq_len, self.num_heads, self.head_dim],
        );
        graph.push_op(
            OpKind::Permute { axes: vec![1, 0, 2] },
            vec![self.num_heads, seq_len, self.head_dim],
        );
        graph.push_op(
            OpKind::MatMul { transpose_rhs: true, scale: Some(scale) },
            vec![self.num_heads, seq_len, seq_len],
        );
        graph.push_op(OpKind::Softmax { axis: -1 }, vec![self.num_heads, seq_len, seq_len]);
        graph.push_op(
            OpKind::MatMul { transpose_rhs: false, scale: None },
            vec![self.num_heads, seq_len, self.head_dim],
        );
        graph.push_op(
            OpKind::Permute { axes: vec![1, 0, 2] },
            vec![seq_len, self.num_heads, self.head_dim],
        );
        graph.push_op(
            OpKind::Reshape { shape: input_shape.to_vec() },
            input_shape.to_vec(),
        );
        self.out_proj.describe(graph, input_shape)
    }
}

/// Scaled dot-product attention over per-head slices of `[seq, embed]`
/// buffers. Scale is `1 / sqrt(head_dim)`.
fn attention_core(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    seq_len: usize,
    num_heads: usize,
    head_dim: usize,
) -> Result<Vec<f32>> {
    let embed = num_heads * head_dim;
    if q.len() != seq_len * embed || k.len() != q.len() || v.len() != q.len() {
        return Err(Error::InvalidShape(format!(
            "Attention buffers disagree: q={} k={} v={} expected {}",
            q.len(),
            k.len(),
            v.len(),
            seq_len * embed
        )));
    }
    let scale = 1.0 / (head_dim as f32).sqrt();

    let mut context = vec![0.0f32; seq_len * embed];
    let mut scores = vec![0.0f32; seq_len * seq_len];
    for h in 0..num_heads {
        let offset = h * head_dim;
        for i in 0..seq_len {
            for j in 0..seq_len {
                let mut dot = 0.0;
                for d in 0..head_dim {
                    dot += q[i * embed + offset + d] * k[j * embed + offset + d];
                }
                scores[i * seq_len + j] = dot * scale;
            }
        }
        ops::softmax_rows(&mut scores, seq_len, seq_len)?;
        for i in 0..seq_len {
            for d in 0..head_dim {
                let mut sum = 0.0;
                for j in 0..seq_len {
                    sum += scores[i * seq_len + j] * v[j * embed + offset + d];
                }
                context[i * embed + offset + d] = sum;
            }
        }
    }
    Ok(context)
}

/// Slice the packed projection into separate query/key/value layers.
///
/// The packed weight stacks the three projections row-wise: rows
/// `[0, E)` are query, `[E, 2E)` key, `[2E, 3E)` value.
pub fn decompose_attention(fused: &FusedSelfAttention) -> Result<UnfusedSelfAttention> {
    let embed = fused.embed_dim;
    if fused.in_proj_weight.shape().dims() != [3 * embed, embed] {
        return Err(Error::UnsupportedArchitecture(format!(
            "Attention '{}' packed weight is {:?}, expected [{}, {}]",
            fused.role,
            fused.in_proj_weight.shape().dims(),
            3 * embed,
            embed
        )));
    }
    if fused.in_proj_bias.numel() != 3 * embed {
        return Err(Error::InvalidShape(format!(
            "Attention '{}' packed bias has {} elements, expected {}",
            fused.role,
            fused.in_proj_bias.numel(),
            3 * embed
        )));
    }
    if embed % fused.num_heads != 0 {
        return Err(Error::UnsupportedArchitecture(format!(
            "Attention '{}' embed dim {} not divisible by {} heads",
            fused.role, embed, fused.num_heads
        )));
    }

    let slice_proj = |index: usize, name: &str| -> Result<Linear> {
        let w_start = index * embed * embed;
        let weight = Tensor::new(
            "w",
            Shape::new(vec![embed, embed]),
            fused.in_proj_weight.data()[w_start..w_start + embed * embed].to_vec(),
        )?;
        let b_start = index * embed;
        let bias = Tensor::new(
            "b",
            Shape::new(vec![embed]),
            fused.in_proj_bias.data()[b_start..b_start + embed].to_vec(),
        )?;
        Linear::new(format!("{}_{}", fused.role, name), weight, Some(bias))
    };

    Ok(UnfusedSelfAttention {
        role: fused.role.clone(),
        embed_dim: embed,
        num_heads: fused.num_heads,
        head_dim: embed / fused.num_heads,
        batch_first: fused.batch_first,
        q_proj: slice_proj(0, "q_proj")?,
        k_proj: slice_proj(1, "k_proj")?,
        v_proj: slice_proj(2, "v_proj")?,
        out_proj: fused.out_proj.cloned_as(format!("{}_out_proj", fused.role))?,
    })
}

/// Post-norm transformer encoder layer in its fused form.
#[derive(Debug, Clone)]
pub struct FusedTransformerLayer {
    pub role: String,
    pub self_attn: FusedSelfAttention,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
    pub linear1: Linear,
    pub linear2: Linear,
    pub dropout_p: f32,
}

/// The rewritten layer: unfused attention, explicit residuals and norms.
#[derive(Debug, Clone)]
pub struct RewrittenTransformerLayer {
    pub role: String,
    pub self_attn: UnfusedSelfAttention,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
    pub linear1: Linear,
    pub linear2: Linear,
}

impl FusedTransformerLayer {
    /// Reference forward for parity checks against the rewritten layer.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let attn = self.self_attn.forward(input)?;
        let mut x1 = input.data().to_vec();
        ops::add_inplace(&mut x1, attn.data())?;
        let x1 = Tensor::new(format!("{}.res1", self.role), input.shape().clone(), x1)?;
        let x1 = self.norm1.forward(&x1)?;

        let hidden = self.linear1.forward(&x1)?;
        let mut activated = hidden.data().to_vec();
        ops::relu_inplace(&mut activated);
        let activated = Tensor::new(hidden.name().to_string(), hidden.shape().clone(), activated)?;
        let ffn = self.linear2.forward(&activated)?;

        let mut x2 = x1.data().to_vec();
        ops::add_inplace(&mut x2, ffn.data())?;
        let x2 = Tensor::new(format!("{}.res2", self.role), x1.shape().clone(), x2)?;
        self.norm2.forward(&x2)
    }
}

impl Module for RewrittenTransformerLayer {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let attn = self.self_attn.forward(input)?;
        let mut x1 = input.data().to_vec();
        ops::add_inplace(&mut x1, attn.data())?;
        let x1 = Tensor::new(format!("{}.res1", self.role), input.shape().clone(), x1)?;
        let x1 = self.norm1.forward(&x1)?;

        let hidden = self.linear1.forward(&x1)?;
        let mut activated = hidden.data().to_vec();
        ops::relu_inplace(&mut activated);
        let activated = Tensor::new(hidden.name().to_string(), hidden.shape().clone(), activated)?;
        let ffn = self.linear2.forward(&activated)?;

        let mut x2 = x1.data().to_vec();
        ops::add_inplace(&mut x2, ffn.data())?;
        let x2 = Tensor::new(format!("{}.res2", self.role), x1.shape().clone(), x2)?;
        self.norm2.forward(&x2)
    }

    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>> {
        self.self_attn.describe(graph, input_shape)?;
        graph.push_op(OpKind::Add, input_shape.to_vec());
        self.norm1.describe(graph, input_shape)?;

        let hidden_shape = self.linear1.describe(graph, input_shape)?;
        graph.push_op(OpKind::Relu, hidden_shape.clone());
        self.linear2.describe(graph, &hidden_shape)?;
        graph.push_op(OpKind::Add, input_shape.to_vec());
        self.norm2.describe(graph, input_shape)
    }
}

/// Rewrite one fused layer. All trained weights are cloned; the fused source
/// stays usable for the numeric cross-check afterwards.
pub fn rewrite_transformer_layer(fused: &FusedTransformerLayer) -> Result<RewrittenTransformerLayer> {
    Ok(RewrittenTransformerLayer {
        role: fused.role.clone(),
        self_attn: decompose_attention(&fused.self_attn)?,
        norm1: fused.norm1.cloned_as(format!("{}_norm1", fused.role))?,
        norm2: fused.norm2.cloned_as(format!("{}_norm2", fused.role))?,
        linear1: fused.linear1.cloned_as(format!("{}_linear1", fused.role))?,
        linear2: fused.linear2.cloned_as(format!("{}_linear2", fused.role))?,
    })
}

/// Fused form of the downscaled transformer used by the count-embedding head:
/// a projector into a reduced width, a stack of encoder layers, and an output
/// projection over the concatenation of the reduced output with the original
/// input (a skip connection across the whole stack).
#[derive(Debug, Clone)]
pub struct ReducedTransformer {
    pub role: String,
    pub in_projector: Linear,
    pub layers: Vec<FusedTransformerLayer>,
    pub out_projector: Projection,
}

#[derive(Debug, Clone)]
pub struct RewrittenReducedTransformer {
    pub role: String,
    pub in_projector: Linear,
    pub layers: Vec<RewrittenTransformerLayer>,
    pub out_projector: Projection,
}

impl ReducedTransformer {
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut y = self.in_projector.forward(input)?;
        for layer in &self.layers {
            y = layer.forward(&y)?;
        }
        let joined = concat_last_dim(format!("{}.skip", self.role), &y, input)?;
        self.out_projector.forward(&joined)
    }
}

impl Module for RewrittenReducedTransformer {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut y = self.in_projector.forward(input)?;
        for layer in &self.layers {
            y = layer.forward(&y)?;
        }
        let joined = concat_last_dim(format!("{}.skip", self.role), &y, input)?;
        self.out_projector.forward(&joined)
    }

    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = self.in_projector.describe(graph, input_shape)?;
        for layer in &self.layers {
            shape = layer.describe(graph, &shape)?;
        }
        let reduced_dim = shape.last().copied().unwrap_or(0);
        let input_dim = input_shape.last().copied().unwrap_or(0);
        let mut joined = shape.clone();
        *joined.last_mut().ok_or_else(|| {
            Error::InvalidShape(format!(
                "Reduced transformer '{}' traced with empty shape",
                self.role
            ))
        })? = reduced_dim + input_dim;
        graph.push_op(OpKind::Concat { axis: -1 }, joined.clone());
        self.out_projector.describe(graph, &joined)
    }
}

pub fn rewrite_reduced_transformer(
    fused: &ReducedTransformer,
) -> Result<RewrittenReducedTransformer> {
    let layers = fused
        .layers
        .iter()
        .map(rewrite_transformer_layer)
        .collect::<Result<Vec<_>>>()?;
    Ok(RewrittenReducedTransformer {
        role: fused.role.clone(),
        in_projector: fused.in_projector.cloned_as(format!("{}_in_projector", fused.role))?,
        layers,
        out_projector: fused.out_projector.cloned_as(&format!("{}_out_projector", fused.role))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small deterministic pseudo-random fill, enough to exercise every slice
    // of the packed projection without real randomness.
    fn fill(n: usize, seed: f32) -> Vec<f32> {
        (0..n).map(|i| ((i as f32 * 0.7 + seed) % 2.0) - 1.0).collect()
    }

    fn fused_attention(embed: usize, heads: usize) -> FusedSelfAttention {
        let out_w =
            Tensor::new("w", Shape::new(vec![embed, embed]), fill(embed * embed, 0.3)).unwrap();
        let out_b = Tensor::new("b", Shape::new(vec![embed]), fill(embed, 0.9)).unwrap();
        FusedSelfAttention {
            role: "layer0_attn".into(),
            embed_dim: embed,
            num_heads: heads,
            batch_first: true,
            in_proj_weight: Tensor::new(
                "in_proj.weight",
                Shape::new(vec![3 * embed, embed]),
                fill(3 * embed * embed, 0.1),
            )
            .unwrap(),
            in_proj_bias: Tensor::new(
                "in_proj.bias",
                Shape::new(vec![3 * embed]),
                fill(3 * embed, 0.5),
            )
            .unwrap(),
            out_proj: Linear::new("out_proj", out_w, Some(out_b)).unwrap(),
        }
    }

    fn fused_layer(embed: usize, heads: usize, ffn: usize) -> FusedTransformerLayer {
        let gamma = Tensor::new("g", Shape::new(vec![embed]), fill(embed, 1.1)).unwrap();
        let beta = Tensor::new("b", Shape::new(vec![embed]), fill(embed, 0.2)).unwrap();
        let w1 = Tensor::new("w1", Shape::new(vec![ffn, embed]), fill(ffn * embed, 0.4)).unwrap();
        let b1 = Tensor::new("b1", Shape::new(vec![ffn]), fill(ffn, 0.6)).unwrap();
        let w2 = Tensor::new("w2", Shape::new(vec![embed, ffn]), fill(embed * ffn, 0.8)).unwrap();
        let b2 = Tensor::new("b2", Shape::new(vec![embed]), fill(embed, 1.3)).unwrap();
        FusedTransformerLayer {
            role: "layer0".into(),
            self_attn: fused_attention(embed, heads),
            norm1: LayerNorm::new("n1", gamma.clone(), beta.clone(), 1e-5).unwrap(),
            norm2: LayerNorm::new("n2", gamma, beta, 1e-5).unwrap(),
            linear1: Linear::new("l1", w1, Some(b1)).unwrap(),
            linear2: Linear::new("l2", w2, Some(b2)).unwrap(),
            dropout_p: 0.1,
        }
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() <= tol, "index {}: {} vs {}", i, x, y);
        }
    }

    #[test]
    fn test_unfused_attention_matches_fused() {
        let fused = fused_attention(8, 2);
        let unfused = decompose_attention(&fused).unwrap();
        let input = Tensor::new("x", Shape::new(vec![5, 8]), fill(40, 0.25)).unwrap();

        let a = fused.forward(&input).unwrap();
        let b = unfused.forward(&input).unwrap();
        assert_close(a.data(), b.data(), 1e-5);
    }

    #[test]
    fn test_decompose_slices_rows_in_qkv_order() {
        let fused = fused_attention(4, 2);
        let unfused = decompose_attention(&fused).unwrap();
        let packed = fused.in_proj_weight.data();
        assert_eq!(unfused.q_proj.weight().data(), &packed[..16]);
        assert_eq!(unfused.k_proj.weight().data(), &packed[16..32]);
        assert_eq!(unfused.v_proj.weight().data(), &packed[32..48]);

        let bias = fused.in_proj_bias.data();
        assert_eq!(unfused.q_proj.bias().unwrap().data(), &bias[..4]);
        assert_eq!(unfused.v_proj.bias().unwrap().data(), &bias[8..12]);
    }

    #[test]
    fn test_decompose_rejects_indivisible_heads() {
        let mut fused = fused_attention(6, 2);
        fused.num_heads = 4;
        assert!(matches!(
            decompose_attention(&fused),
            Err(Error::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn test_decompose_keeps_source_intact() {
        let fused = fused_attention(4, 2);
        let before = fused.in_proj_weight.data().to_vec();
        let _ = decompose_attention(&fused).unwrap();
        assert_eq!(fused.in_proj_weight.data(), &before[..]);
    }

    #[test]
    fn test_rewritten_layer_matches_fused() {
        let fused = fused_layer(8, 2, 16);
        let rewritten = rewrite_transformer_layer(&fused).unwrap();
        let input = Tensor::new("x", Shape::new(vec![3, 8]), fill(24, 0.45)).unwrap();

        let a = fused.forward(&input).unwrap();
        let b = rewritten.forward(&input).unwrap();
        assert_close(a.data(), b.data(), 1e-4);
    }

    #[test]
    fn test_rewritten_reduced_transformer_matches_fused() {
        let hidden = 8;
        let reduced = 4;
        let in_w = Tensor::new(
            "w",
            Shape::new(vec![reduced, hidden]),
            fill(reduced * hidden, 0.15),
        )
        .unwrap();
        let fc1_w = Tensor::new(
            "w",
            Shape::new(vec![hidden, reduced + hidden]),
            fill(hidden * (reduced + hidden), 0.35),
        )
        .unwrap();
        let fc2_w =
            Tensor::new("w", Shape::new(vec![hidden, hidden]), fill(hidden * hidden, 0.55))
                .unwrap();
        let fused = ReducedTransformer {
            role: "count_embed".into(),
            in_projector: Linear::new("in_projector", in_w, None).unwrap(),
            layers: vec![fused_layer(reduced, 2, 8)],
            out_projector: Projection::new(
                Linear::new("op_fc1", fc1_w, None).unwrap(),
                Linear::new("op_fc2", fc2_w, None).unwrap(),
            )
            .unwrap(),
        };

        let rewritten = rewrite_reduced_transformer(&fused).unwrap();
        let input = Tensor::new("x", Shape::new(vec![3, hidden]), fill(3 * hidden, 0.65)).unwrap();
        let a = fused.forward(&input).unwrap();
        let b = rewritten.forward(&input).unwrap();
        assert_close(a.data(), b.data(), 1e-4);
    }

    #[test]
    fn test_layer_describe_binds_unique_params() {
        let fused = fused_layer(8, 2, 16);
        let rewritten = rewrite_transformer_layer(&fused).unwrap();
        let mut graph = StaticGraph::new("encoder");
        rewritten.describe(&mut graph, &[3, 8]).unwrap();
        // q/k/v/out weights+biases, two norms, two ffn linears
        assert_eq!(graph.params().len(), 16);
    }
}
