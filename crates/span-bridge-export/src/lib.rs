//! Export tooling for span-bridge
//!
//! Rewrites the reference model's fused submodules into primitive,
//! numerically-equivalent forms, traces each architectural head to a static
//! graph, and persists the converted artifacts plus the export manifest the
//! companion runtime's loader consumes.

pub mod graph;
pub mod heads;
pub mod module;
pub mod pipeline;
pub mod rewriter;
pub mod weights;

pub use graph::{GraphInput, OpKind, OpRecord, StaticGraph};
pub use heads::{ExportHead, ExportModel, LoadedModel, ShapeLimits, SubmoduleDescriptor};
pub use module::{BiRecurrent, LayerNorm, Linear, Module, Projection, RecurrentDirection};
pub use pipeline::{run_export, ComputeProfile, ExportConfig, ExportManifest, HeadSelection};
pub use rewriter::{
    decompose_attention, rewrite_reduced_transformer, rewrite_transformer_layer,
    FusedSelfAttention, FusedTransformerLayer, ReducedTransformer, RewriteOutcome,
    RewrittenReducedTransformer, RewrittenTransformerLayer, UnfusedSelfAttention,
};
pub use weights::{export_span_head, SpanHeadMetadata, SpanHeadWeights};
