use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tensor shape (dimensions)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Size of the last dimension. Zero for an empty shape.
    pub fn last_dim(&self) -> usize {
        self.0.last().copied().unwrap_or(0)
    }

    /// Product of all but the last dimension.
    pub fn rows(&self) -> usize {
        if self.0.len() < 2 {
            1
        } else {
            self.0[..self.0.len() - 1].iter().product()
        }
    }

    /// Validates shape dimensions
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidShape("Shape cannot be empty".into()));
        }
        if self.0.contains(&0) {
            return Err(Error::InvalidShape("Shape dimensions must be > 0".into()));
        }
        Ok(())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

/// Immutable named f32 tensor.
///
/// Invariant: the shape product always equals the element count; names are
/// unique within one export artifact (enforced when a graph binds parameters).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    name: String,
    shape: Shape,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Shape, data: Vec<f32>) -> Result<Self> {
        shape.validate()?;
        if shape.numel() != data.len() {
            return Err(Error::InvalidShape(format!(
                "Shape {:?} implies {} elements, got {}",
                shape.dims(),
                shape.numel(),
                data.len()
            )));
        }
        Ok(Self { name: name.into(), shape, data })
    }

    pub fn zeros(name: impl Into<String>, shape: Shape) -> Result<Self> {
        let numel = shape.numel();
        Self::new(name, shape, vec![0.0; numel])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Same payload under a different semantic name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self { name: name.into(), shape: self.shape.clone(), data: self.data.clone() }
    }

    /// Same payload reinterpreted with a compatible shape.
    pub fn reshaped(&self, shape: Shape) -> Result<Self> {
        shape.validate()?;
        if shape.numel() != self.data.len() {
            return Err(Error::InvalidShape(format!(
                "Cannot reshape {} elements to {:?}",
                self.data.len(),
                shape.dims()
            )));
        }
        Ok(Self { name: self.name.clone(), shape, data: self.data.clone() })
    }
}
