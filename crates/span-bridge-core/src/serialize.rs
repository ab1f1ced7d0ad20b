//! Binary tensor serialization
//!
//! Payloads are raw little-endian floats in row-major order with no header
//! and no padding; the shape is recovered from the separately stored metadata
//! record, never from the file itself. The logical-role to file-path binding
//! (`project_start_fc1.weight.bin` etc.) is stable across export runs so the
//! manifest format stays backward compatible.

use crate::error::{Error, Result};
use crate::tensor::{Shape, Tensor};
use half::f16;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Weight precision for converted artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
}

impl Precision {
    pub fn label(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
        }
    }

    /// Bytes per element on disk.
    pub fn element_size(&self) -> usize {
        match self {
            Precision::Fp32 => 4,
            Precision::Fp16 => 2,
        }
    }
}

/// Write one tensor as a headerless little-endian payload.
///
/// Returns the file name (not the full path), which is what metadata records
/// store.
pub fn write_tensor(tensor: &Tensor, path: &Path, precision: Precision) -> Result<String> {
    let mut bytes = Vec::with_capacity(tensor.numel() * precision.element_size());
    match precision {
        Precision::Fp32 => {
            for &v in tensor.data() {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        Precision::Fp16 => {
            for &v in tensor.data() {
                bytes.extend_from_slice(&f16::from_f32(v).to_le_bytes());
            }
        }
    }
    fs::write(path, bytes)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Runtime(format!("Invalid tensor path: {}", path.display())))?;
    Ok(name.to_string())
}

/// Read a tensor back given its recorded shape.
pub fn read_tensor(
    path: &Path,
    name: impl Into<String>,
    shape: Shape,
    precision: Precision,
) -> Result<Tensor> {
    let bytes = fs::read(path)?;
    let expected = shape.numel() * precision.element_size();
    if bytes.len() != expected {
        return Err(Error::InvalidShape(format!(
            "Tensor file {} holds {} bytes, shape {:?} expects {}",
            path.display(),
            bytes.len(),
            shape.dims(),
            expected
        )));
    }
    let data: Vec<f32> = match precision {
        Precision::Fp32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Precision::Fp16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
    };
    Tensor::new(name, shape, data)
}

/// Metadata record for one exported linear layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRecord {
    pub weight: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<String>,
    pub in_features: usize,
    pub out_features: usize,
}

/// Metadata record for a two-layer projection block (fc1 -> ReLU -> fc2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub fc1: LinearRecord,
    pub fc2: LinearRecord,
}

/// Metadata record for one direction of a recurrent layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentDirectionRecord {
    pub weight_ih: String,
    pub weight_hh: String,
    pub bias: String,
}

/// Metadata record for a (bi)directional single-layer recurrent module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentRecord {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    pub forward: RecurrentDirectionRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backward: Option<RecurrentDirectionRecord>,
}

/// Borrowed view of one recurrent direction's trained parameters.
#[derive(Debug, Clone, Copy)]
pub struct RecurrentTensors<'a> {
    pub weight_ih: &'a Tensor,
    pub weight_hh: &'a Tensor,
    pub bias_ih: &'a Tensor,
    pub bias_hh: &'a Tensor,
}

/// Writes named tensors into one artifact directory.
pub struct TensorWriter {
    dir: PathBuf,
    precision: Precision,
}

impl TensorWriter {
    pub fn new(dir: impl Into<PathBuf>, precision: Precision) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, precision })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_tensor(&self, tensor: &Tensor, file_name: &str) -> Result<String> {
        write_tensor(tensor, &self.dir.join(file_name), self.precision)
    }

    /// Export one linear layer as `<role>.weight.bin` / `<role>.bias.bin`.
    ///
    /// The bias file is omitted when the layer has no bias.
    pub fn save_linear(
        &self,
        role: &str,
        weight: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<LinearRecord> {
        if weight.shape().ndim() != 2 {
            return Err(Error::InvalidShape(format!(
                "Linear weight for '{}' must be 2-D, got {:?}",
                role,
                weight.shape().dims()
            )));
        }
        let out_features = weight.shape().dims()[0];
        let in_features = weight.shape().dims()[1];

        let weight_file = self.save_tensor(weight, &format!("{}.weight.bin", role))?;
        let bias_file = match bias {
            Some(bias) => {
                if bias.numel() != out_features {
                    return Err(Error::InvalidShape(format!(
                        "Linear bias for '{}' has {} elements, expected {}",
                        role,
                        bias.numel(),
                        out_features
                    )));
                }
                Some(self.save_tensor(bias, &format!("{}.bias.bin", role))?)
            }
            None => None,
        };

        Ok(LinearRecord { weight: weight_file, bias: bias_file, in_features, out_features })
    }

    /// Export a bidirectional single-layer recurrent module, split by
    /// direction.
    ///
    /// Each direction's input-bias and hidden-bias are summed into one bias
    /// tensor before serialization: the gated-recurrent affine transform
    /// always adds the two at use time, so they are never serialized
    /// separately and re-added downstream.
    pub fn save_recurrent(
        &self,
        prefix: &str,
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        forward: RecurrentTensors<'_>,
        backward: Option<RecurrentTensors<'_>>,
    ) -> Result<RecurrentRecord> {
        if num_layers != 1 {
            return Err(Error::UnsupportedArchitecture(format!(
                "Recurrent module '{}' has {} layers; the export format has no layer-stacking convention",
                prefix, num_layers
            )));
        }

        let forward_record = self.save_recurrent_direction(prefix, "forward", forward)?;
        let backward_record = match backward {
            Some(tensors) => Some(self.save_recurrent_direction(prefix, "backward", tensors)?),
            None => None,
        };

        Ok(RecurrentRecord {
            input_size,
            hidden_size,
            num_layers,
            bidirectional: backward_record.is_some(),
            forward: forward_record,
            backward: backward_record,
        })
    }

    fn save_recurrent_direction(
        &self,
        prefix: &str,
        direction: &str,
        tensors: RecurrentTensors<'_>,
    ) -> Result<RecurrentDirectionRecord> {
        if tensors.bias_ih.numel() != tensors.bias_hh.numel() {
            return Err(Error::InvalidShape(format!(
                "Recurrent '{}' {} biases disagree: {} vs {}",
                prefix,
                direction,
                tensors.bias_ih.numel(),
                tensors.bias_hh.numel()
            )));
        }

        let summed: Vec<f32> = tensors
            .bias_ih
            .data()
            .iter()
            .zip(tensors.bias_hh.data().iter())
            .map(|(a, b)| a + b)
            .collect();
        let bias = Tensor::new(
            format!("{}_{}.bias", prefix, direction),
            tensors.bias_ih.shape().clone(),
            summed,
        )?;

        let weight_ih = self
            .save_tensor(tensors.weight_ih, &format!("{}_{}.weight_ih.bin", prefix, direction))?;
        let weight_hh = self
            .save_tensor(tensors.weight_hh, &format!("{}_{}.weight_hh.bin", prefix, direction))?;
        let bias_file = self.save_tensor(&bias, &format!("{}_{}.bias.bin", prefix, direction))?;

        Ok(RecurrentDirectionRecord { weight_ih, weight_hh, bias: bias_file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip_fp32_exact() {
        let dir = tempdir().unwrap();
        let t = Tensor::new(
            "w",
            Shape::new(vec![2, 3]),
            vec![1.0, -2.5, 3.25, 0.0, f32::MIN_POSITIVE, 1e30],
        )
        .unwrap();
        let path = dir.path().join("w.bin");
        write_tensor(&t, &path, Precision::Fp32).unwrap();
        let back = read_tensor(&path, "w", Shape::new(vec![2, 3]), Precision::Fp32).unwrap();
        assert_eq!(back.data(), t.data());
    }

    #[test]
    fn test_roundtrip_fp16_within_epsilon() {
        let dir = tempdir().unwrap();
        let t = Tensor::new("w", Shape::new(vec![4]), vec![0.5, -0.25, 1.0, 2.0]).unwrap();
        let path = dir.path().join("w.bin");
        write_tensor(&t, &path, Precision::Fp16).unwrap();
        let back = read_tensor(&path, "w", Shape::new(vec![4]), Precision::Fp16).unwrap();
        // These values are exactly representable in f16
        assert_eq!(back.data(), t.data());
    }

    #[test]
    fn test_read_rejects_shape_mismatch() {
        let dir = tempdir().unwrap();
        let t = Tensor::new("w", Shape::new(vec![4]), vec![1.0; 4]).unwrap();
        let path = dir.path().join("w.bin");
        write_tensor(&t, &path, Precision::Fp32).unwrap();
        assert!(read_tensor(&path, "w", Shape::new(vec![5]), Precision::Fp32).is_err());
    }

    #[test]
    fn test_save_linear_naming_and_features() {
        let dir = tempdir().unwrap();
        let writer = TensorWriter::new(dir.path(), Precision::Fp32).unwrap();
        let weight = Tensor::new("fc.weight", Shape::new(vec![3, 2]), vec![0.0; 6]).unwrap();
        let bias = Tensor::new("fc.bias", Shape::new(vec![3]), vec![0.0; 3]).unwrap();

        let record = writer.save_linear("project_start_fc1", &weight, Some(&bias)).unwrap();
        assert_eq!(record.weight, "project_start_fc1.weight.bin");
        assert_eq!(record.bias.as_deref(), Some("project_start_fc1.bias.bin"));
        assert_eq!(record.in_features, 2);
        assert_eq!(record.out_features, 3);
        assert!(dir.path().join("project_start_fc1.weight.bin").exists());
    }

    #[test]
    fn test_save_linear_without_bias_omits_file() {
        let dir = tempdir().unwrap();
        let writer = TensorWriter::new(dir.path(), Precision::Fp32).unwrap();
        let weight = Tensor::new("fc.weight", Shape::new(vec![2, 2]), vec![0.0; 4]).unwrap();
        let record = writer.save_linear("head", &weight, None).unwrap();
        assert!(record.bias.is_none());
        assert!(!dir.path().join("head.bias.bin").exists());
    }

    #[test]
    fn test_recurrent_bias_sum() {
        let dir = tempdir().unwrap();
        let writer = TensorWriter::new(dir.path(), Precision::Fp32).unwrap();
        let weight_ih = Tensor::new("ih", Shape::new(vec![2, 2]), vec![0.0; 4]).unwrap();
        let weight_hh = Tensor::new("hh", Shape::new(vec![2, 2]), vec![0.0; 4]).unwrap();
        let bias_ih = Tensor::new("b_ih", Shape::new(vec![2]), vec![1.0, 2.0]).unwrap();
        let bias_hh = Tensor::new("b_hh", Shape::new(vec![2]), vec![3.0, 4.0]).unwrap();

        let record = writer
            .save_recurrent(
                "rnn",
                2,
                2,
                1,
                RecurrentTensors {
                    weight_ih: &weight_ih,
                    weight_hh: &weight_hh,
                    bias_ih: &bias_ih,
                    bias_hh: &bias_hh,
                },
                None,
            )
            .unwrap();

        let bias = read_tensor(
            &dir.path().join(&record.forward.bias),
            "bias",
            Shape::new(vec![2]),
            Precision::Fp32,
        )
        .unwrap();
        assert_eq!(bias.data(), &[4.0, 6.0]);
        assert!(!record.bidirectional);
    }

    #[test]
    fn test_recurrent_rejects_multi_layer() {
        let dir = tempdir().unwrap();
        let writer = TensorWriter::new(dir.path(), Precision::Fp32).unwrap();
        let w = Tensor::new("w", Shape::new(vec![2, 2]), vec![0.0; 4]).unwrap();
        let b = Tensor::new("b", Shape::new(vec![2]), vec![0.0; 2]).unwrap();
        let err = writer
            .save_recurrent(
                "rnn",
                2,
                2,
                2,
                RecurrentTensors { weight_ih: &w, weight_hh: &w, bias_ih: &b, bias_hh: &b },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(_)));
    }
}
