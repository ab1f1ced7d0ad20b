//! Static graph trace of a decomposed submodule
//!
//! A trace is the ordered list of primitive operations a submodule's forward
//! pass performs, with the output shape of every step and the trained
//! parameters it binds. It is produced in evaluation mode (no gradient state,
//! no randomness) and persisted as `graph.json` plus one headerless binary
//! file per parameter. The manifest, not the graph layout, is the contract
//! the companion loader depends on.

use serde::{Deserialize, Serialize};
use span_bridge_core::error::{Error, Result};
use span_bridge_core::serialize::{write_tensor, Precision};
use span_bridge_core::tensor::Tensor;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// One primitive operation in a traced graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    /// Row lookup into an embedding table by integer ids
    Embedding { table: String, vocab_size: usize, dim: usize },
    Linear { role: String, in_features: usize, out_features: usize, bias: bool },
    LayerNorm { role: String, dim: usize, eps: f32 },
    Relu,
    Softmax { axis: i32 },
    Sigmoid,
    Reshape { shape: Vec<usize> },
    Permute { axes: Vec<usize> },
    MatMul { transpose_rhs: bool, scale: Option<f32> },
    Add,
    Concat { axis: i32 },
    /// Row gather from the running value by an integer index input
    GatherRows { indices: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    pub op: OpKind,
    pub output_shape: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRecord {
    pub name: String,
    pub file: String,
    pub shape: Vec<usize>,
}

/// Serialized form of a persisted graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub name: String,
    pub precision: Precision,
    pub compute_profile: String,
    pub inputs: Vec<GraphInput>,
    pub ops: Vec<OpRecord>,
    pub output_shape: Vec<usize>,
    pub parameters: Vec<ParamRecord>,
}

/// A traced submodule: inputs, op sequence, bound parameters.
#[derive(Debug)]
pub struct StaticGraph {
    pub name: String,
    pub inputs: Vec<GraphInput>,
    pub ops: Vec<OpRecord>,
    pub output_shape: Vec<usize>,
    params: Vec<Tensor>,
    param_names: HashSet<String>,
}

impl StaticGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            ops: Vec::new(),
            output_shape: Vec::new(),
            params: Vec::new(),
            param_names: HashSet::new(),
        }
    }

    pub fn push_input(&mut self, name: impl Into<String>, shape: &[usize], dtype: &str) {
        self.inputs.push(GraphInput {
            name: name.into(),
            shape: shape.to_vec(),
            dtype: dtype.to_string(),
        });
    }

    pub fn push_op(&mut self, op: OpKind, output_shape: Vec<usize>) {
        self.ops.push(OpRecord { op, output_shape });
    }

    /// Bind a trained parameter. Tensor names must be unique within one
    /// artifact.
    pub fn bind_param(&mut self, tensor: &Tensor) -> Result<()> {
        if !self.param_names.insert(tensor.name().to_string()) {
            return Err(Error::Runtime(format!(
                "Duplicate tensor name in graph '{}': {}",
                self.name,
                tensor.name()
            )));
        }
        self.params.push(tensor.clone());
        Ok(())
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    /// Write the graph description and all parameter payloads into `dir`.
    pub fn persist(&self, dir: &Path, precision: Precision, compute_profile: &str) -> Result<()> {
        fs::create_dir_all(dir)?;

        let mut parameters = Vec::with_capacity(self.params.len());
        for tensor in &self.params {
            let file = write_tensor(tensor, &dir.join(format!("{}.bin", tensor.name())), precision)?;
            parameters.push(ParamRecord {
                name: tensor.name().to_string(),
                file,
                shape: tensor.shape().dims().to_vec(),
            });
        }

        let document = GraphDocument {
            name: self.name.clone(),
            precision,
            compute_profile: compute_profile.to_string(),
            inputs: self.inputs.clone(),
            ops: self.ops.clone(),
            output_shape: self.output_shape.clone(),
            parameters,
        };
        let json = serde_json::to_string_pretty(&document)?;
        fs::write(dir.join("graph.json"), json)?;
        Ok(())
    }
}
