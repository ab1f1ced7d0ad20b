//! Primitive evaluation-mode modules
//!
//! These are the building blocks the rewriter decomposes fused submodules
//! into. Every module does two things with the same structure: `forward`
//! evaluates the operation on a real tensor, `describe` replays the identical
//! operation sequence into a [`StaticGraph`], so the persisted trace is by
//! construction the computation that was validated numerically.

use crate::graph::{OpKind, StaticGraph};
use span_bridge_core::error::{Error, Result};
use span_bridge_core::ops;
use span_bridge_core::tensor::{Shape, Tensor};

/// An evaluation-mode module that can both run and trace itself.
pub trait Module {
    /// Run the forward pass on a real input.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Append this module's ops and parameters to a graph under construction,
    /// returning the output shape for the given input shape.
    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>>;
}

/// Affine projection with weights stored `[out_features, in_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    role: String,
    weight: Tensor,
    bias: Option<Tensor>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// `role` is the stable logical name; parameter tensors are renamed
    /// `<role>.weight` / `<role>.bias` at construction so the artifact naming
    /// never depends on what the source model called them.
    pub fn new(role: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let role = role.into();
        if weight.shape().ndim() != 2 {
            return Err(Error::InvalidShape(format!(
                "Linear '{}' weight must be 2-D, got {:?}",
                role,
                weight.shape().dims()
            )));
        }
        let out_features = weight.shape().dims()[0];
        let in_features = weight.shape().dims()[1];
        if let Some(ref b) = bias {
            if b.numel() != out_features {
                return Err(Error::InvalidShape(format!(
                    "Linear '{}' bias has {} elements, expected {}",
                    role,
                    b.numel(),
                    out_features
                )));
            }
        }
        let weight = weight.renamed(format!("{}.weight", role));
        let bias = bias.map(|b| b.renamed(format!("{}.bias", role)));
        Ok(Self { role, weight, bias, in_features, out_features })
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Deep copy under a new role, keeping the source module intact.
    pub fn cloned_as(&self, role: impl Into<String>) -> Result<Self> {
        Self::new(role, self.weight.clone(), self.bias.clone())
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.shape().last_dim() != self.in_features {
            return Err(Error::InvalidShape(format!(
                "Linear '{}' expects last dim {}, got {:?}",
                self.role,
                self.in_features,
                input.shape().dims()
            )));
        }
        let rows = input.shape().rows();
        let mut output = vec![0.0f32; rows * self.out_features];
        ops::linear(
            input.data(),
            self.weight.data(),
            self.bias.as_ref().map(|b| b.data()),
            &mut output,
            rows,
            self.in_features,
            self.out_features,
        )?;

        let mut dims = input.shape().dims().to_vec();
        *dims.last_mut().ok_or_else(|| {
            Error::InvalidShape(format!("Linear '{}' input shape is empty", self.role))
        })? = self.out_features;
        Tensor::new(format!("{}.out", self.role), Shape::new(dims), output)
    }

    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>> {
        graph.bind_param(&self.weight)?;
        if let Some(ref bias) = self.bias {
            graph.bind_param(bias)?;
        }
        let mut out = input_shape.to_vec();
        *out.last_mut().ok_or_else(|| {
            Error::InvalidShape(format!("Linear '{}' traced with empty shape", self.role))
        })? = self.out_features;
        graph.push_op(
            OpKind::Linear {
                role: self.role.clone(),
                in_features: self.in_features,
                out_features: self.out_features,
                bias: self.bias.is_some(),
            },
            out.clone(),
        );
        Ok(out)
    }
}

/// Layer normalization over the last dimension.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    role: String,
    weight: Tensor,
    bias: Tensor,
    eps: f32,
    dim: usize,
}

impl LayerNorm {
    pub fn new(role: impl Into<String>, weight: Tensor, bias: Tensor, eps: f32) -> Result<Self> {
        let role = role.into();
        if weight.numel() != bias.numel() {
            return Err(Error::InvalidShape(format!(
                "LayerNorm '{}' weight/bias disagree: {} vs {}",
                role,
                weight.numel(),
                bias.numel()
            )));
        }
        let dim = weight.numel();
        let weight = weight.renamed(format!("{}.weight", role));
        let bias = bias.renamed(format!("{}.bias", role));
        Ok(Self { role, weight, bias, eps, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn cloned_as(&self, role: impl Into<String>) -> Result<Self> {
        Self::new(role, self.weight.clone(), self.bias.clone(), self.eps)
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if input.shape().last_dim() != self.dim {
            return Err(Error::InvalidShape(format!(
                "LayerNorm '{}' expects last dim {}, got {:?}",
                self.role,
                self.dim,
                input.shape().dims()
            )));
        }
        let mut data = input.data().to_vec();
        ops::layer_norm_rows(
            &mut data,
            input.shape().rows(),
            self.dim,
            self.weight.data(),
            self.bias.data(),
            self.eps,
        )?;
        Tensor::new(format!("{}.out", self.role), input.shape().clone(), data)
    }

    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>> {
        graph.bind_param(&self.weight)?;
        graph.bind_param(&self.bias)?;
        graph.push_op(
            OpKind::LayerNorm { role: self.role.clone(), dim: self.dim, eps: self.eps },
            input_shape.to_vec(),
        );
        Ok(input_shape.to_vec())
    }
}

/// Two-layer projection block: fc1 -> ReLU -> fc2.
///
/// The source block carries a dropout between the activation and fc2; in
/// evaluation mode dropout is the identity, so it never appears in the trace.
#[derive(Debug, Clone)]
pub struct Projection {
    fc1: Linear,
    fc2: Linear,
}

impl Projection {
    pub fn new(fc1: Linear, fc2: Linear) -> Result<Self> {
        if fc1.out_features() != fc2.in_features() {
            return Err(Error::InvalidShape(format!(
                "Projection '{}' -> '{}' feature mismatch: {} vs {}",
                fc1.role(),
                fc2.role(),
                fc1.out_features(),
                fc2.in_features()
            )));
        }
        Ok(Self { fc1, fc2 })
    }

    pub fn fc1(&self) -> &Linear {
        &self.fc1
    }

    pub fn fc2(&self) -> &Linear {
        &self.fc2
    }

    pub fn cloned_as(&self, role: &str) -> Result<Self> {
        Self::new(
            self.fc1.cloned_as(format!("{}_fc1", role))?,
            self.fc2.cloned_as(format!("{}_fc2", role))?,
        )
    }
}

impl Module for Projection {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(input)?;
        let mut data = hidden.data().to_vec();
        ops::relu_inplace(&mut data);
        let activated = Tensor::new(hidden.name().to_string(), hidden.shape().clone(), data)?;
        self.fc2.forward(&activated)
    }

    fn describe(&self, graph: &mut StaticGraph, input_shape: &[usize]) -> Result<Vec<usize>> {
        let hidden_shape = self.fc1.describe(graph, input_shape)?;
        graph.push_op(OpKind::Relu, hidden_shape.clone());
        self.fc2.describe(graph, &hidden_shape)
    }
}

/// Trained parameters for one direction of a gated recurrent layer.
#[derive(Debug, Clone)]
pub struct RecurrentDirection {
    pub weight_ih: Tensor,
    pub weight_hh: Tensor,
    pub bias_ih: Tensor,
    pub bias_hh: Tensor,
}

/// Parameter holder for a (bi)directional recurrent module.
///
/// Not a [`Module`]: the recurrent span head is exported as raw weights plus
/// metadata rather than traced, so only its parameters matter here.
#[derive(Debug, Clone)]
pub struct BiRecurrent {
    pub role: String,
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub forward_dir: RecurrentDirection,
    pub backward_dir: Option<RecurrentDirection>,
}

impl BiRecurrent {
    pub fn bidirectional(&self) -> bool {
        self.backward_dir.is_some()
    }
}

/// Concatenate two tensors along the last dimension. Leading dims must match.
pub fn concat_last_dim(name: impl Into<String>, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let rows_a = a.shape().rows();
    let rows_b = b.shape().rows();
    if rows_a != rows_b || a.shape().dims()[..a.shape().ndim() - 1] != b.shape().dims()[..b.shape().ndim() - 1]
    {
        return Err(Error::InvalidShape(format!(
            "Concat leading dims disagree: {:?} vs {:?}",
            a.shape().dims(),
            b.shape().dims()
        )));
    }
    let da = a.shape().last_dim();
    let db = b.shape().last_dim();
    let mut data = Vec::with_capacity(a.numel() + b.numel());
    for row in 0..rows_a {
        data.extend_from_slice(&a.data()[row * da..(row + 1) * da]);
        data.extend_from_slice(&b.data()[row * db..(row + 1) * db]);
    }
    let mut dims = a.shape().dims().to_vec();
    *dims.last_mut().ok_or_else(|| Error::InvalidShape("Concat of scalar shapes".into()))? =
        da + db;
    Tensor::new(name, Shape::new(dims), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_2x3() -> Linear {
        // weight [3, 2]
        let weight = Tensor::new(
            "w",
            Shape::new(vec![3, 2]),
            vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0],
        )
        .unwrap();
        let bias = Tensor::new("b", Shape::new(vec![3]), vec![0.5, -0.5, 0.0]).unwrap();
        Linear::new("fc", weight, Some(bias)).unwrap()
    }

    #[test]
    fn test_linear_forward_shape_and_values() {
        let layer = linear_2x3();
        let input = Tensor::new("x", Shape::new(vec![1, 2]), vec![1.0, 1.0]).unwrap();
        let out = layer.forward(&input).unwrap();
        assert_eq!(out.shape().dims(), &[1, 3]);
        assert_eq!(out.data(), &[1.5, 0.5, 2.0]);
    }

    #[test]
    fn test_linear_renames_params_to_role() {
        let layer = linear_2x3();
        assert_eq!(layer.weight().name(), "fc.weight");
        assert_eq!(layer.bias().unwrap().name(), "fc.bias");
    }

    #[test]
    fn test_linear_describe_matches_forward_shape() {
        let layer = linear_2x3();
        let mut graph = StaticGraph::new("t");
        let out = layer.describe(&mut graph, &[4, 2]).unwrap();
        assert_eq!(out, vec![4, 3]);
        assert_eq!(graph.params().len(), 2);
        assert_eq!(graph.ops.len(), 1);
    }

    #[test]
    fn test_linear_rejects_bad_input_dim() {
        let layer = linear_2x3();
        let input = Tensor::new("x", Shape::new(vec![1, 3]), vec![0.0; 3]).unwrap();
        assert!(layer.forward(&input).is_err());
    }

    #[test]
    fn test_layer_norm_identity_params() {
        let gamma = Tensor::new("g", Shape::new(vec![4]), vec![1.0; 4]).unwrap();
        let beta = Tensor::new("b", Shape::new(vec![4]), vec![0.0; 4]).unwrap();
        let norm = LayerNorm::new("norm", gamma, beta, 1e-5).unwrap();
        let input = Tensor::new("x", Shape::new(vec![1, 4]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = norm.forward(&input).unwrap();
        let mean: f32 = out.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
    }

    #[test]
    fn test_projection_relu_between_layers() {
        // fc1 flips sign so ReLU zeroes everything, fc2 adds a bias
        let w1 = Tensor::new("w1", Shape::new(vec![2, 2]), vec![-1.0, 0.0, 0.0, -1.0]).unwrap();
        let fc1 = Linear::new("p_fc1", w1, None).unwrap();
        let w2 = Tensor::new("w2", Shape::new(vec![1, 2]), vec![1.0, 1.0]).unwrap();
        let b2 = Tensor::new("b2", Shape::new(vec![1]), vec![7.0]).unwrap();
        let fc2 = Linear::new("p_fc2", w2, Some(b2)).unwrap();
        let proj = Projection::new(fc1, fc2).unwrap();

        let input = Tensor::new("x", Shape::new(vec![1, 2]), vec![3.0, 5.0]).unwrap();
        let out = proj.forward(&input).unwrap();
        assert_eq!(out.data(), &[7.0]);
    }

    #[test]
    fn test_projection_rejects_feature_mismatch() {
        let w1 = Tensor::new("w1", Shape::new(vec![3, 2]), vec![0.0; 6]).unwrap();
        let fc1 = Linear::new("a", w1, None).unwrap();
        let w2 = Tensor::new("w2", Shape::new(vec![1, 4]), vec![0.0; 4]).unwrap();
        let fc2 = Linear::new("b", w2, None).unwrap();
        assert!(Projection::new(fc1, fc2).is_err());
    }

    #[test]
    fn test_concat_last_dim() {
        let a = Tensor::new("a", Shape::new(vec![2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::new("b", Shape::new(vec![2, 1]), vec![9.0, 8.0]).unwrap();
        let c = concat_last_dim("c", &a, &b).unwrap();
        assert_eq!(c.shape().dims(), &[2, 3]);
        assert_eq!(c.data(), &[1.0, 2.0, 9.0, 3.0, 4.0, 8.0]);
    }

    #[test]
    fn test_cloned_as_keeps_source() {
        let layer = linear_2x3();
        let copy = layer.cloned_as("other").unwrap();
        assert_eq!(layer.weight().name(), "fc.weight");
        assert_eq!(copy.weight().name(), "other.weight");
        assert_eq!(copy.weight().data(), layer.weight().data());
    }
}
