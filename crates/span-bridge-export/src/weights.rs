//! Raw span-head weight export
//!
//! The recurrent span head is not traced: it ships as headerless binary
//! weight files plus a `metadata.json` that records shapes, feature sizes and
//! the file-name binding for every layer. The downstream runtime reimplements
//! the recurrence and only needs the trained parameters.

use crate::module::{BiRecurrent, Projection, RecurrentDirection};
use serde::{Deserialize, Serialize};
use span_bridge_core::error::Result;
use span_bridge_core::serialize::{
    Precision, ProjectionRecord, RecurrentRecord, RecurrentTensors, TensorWriter,
};
use span_bridge_core::tokenizer::SpecialTokens;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

pub const METADATA_FILE: &str = "metadata.json";

/// Trained parameters of the recurrent span head.
#[derive(Debug)]
pub struct SpanHeadWeights {
    pub project_start: Projection,
    pub project_end: Projection,
    pub out_project: Projection,
    pub prompt_projection: Projection,
    pub rnn: BiRecurrent,
}

/// Everything the runtime needs to rebuild the span head from raw files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanHeadMetadata {
    pub model: String,
    pub hidden_size: usize,
    pub max_width: usize,
    pub cls_token_id: u32,
    pub sep_token_id: u32,
    pub pad_token_id: u32,
    pub layers: BTreeMap<String, ProjectionRecord>,
    pub rnn: RecurrentRecord,
}

impl SpanHeadMetadata {
    pub fn load(dir: &Path) -> Result<Self> {
        let contents = fs::read_to_string(dir.join(METADATA_FILE))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

fn save_projection(
    writer: &TensorWriter,
    name: &str,
    projection: &Projection,
) -> Result<ProjectionRecord> {
    let fc1 = writer.save_linear(
        &format!("{}_fc1", name),
        projection.fc1().weight(),
        projection.fc1().bias(),
    )?;
    let fc2 = writer.save_linear(
        &format!("{}_fc2", name),
        projection.fc2().weight(),
        projection.fc2().bias(),
    )?;
    Ok(ProjectionRecord { fc1, fc2 })
}

fn direction_tensors(direction: &RecurrentDirection) -> RecurrentTensors<'_> {
    RecurrentTensors {
        weight_ih: &direction.weight_ih,
        weight_hh: &direction.weight_hh,
        bias_ih: &direction.bias_ih,
        bias_hh: &direction.bias_hh,
    }
}

/// Dump the span head into `dir` and write its metadata record.
///
/// Weights always go out at full precision: the head is small and the
/// downstream recurrence is the numerically touchiest part of the model.
pub fn export_span_head(
    weights: &SpanHeadWeights,
    model: &str,
    hidden_size: usize,
    max_width: usize,
    special_tokens: &SpecialTokens,
    dir: &Path,
) -> Result<SpanHeadMetadata> {
    let writer = TensorWriter::new(dir, Precision::Fp32)?;

    let mut layers = BTreeMap::new();
    layers.insert(
        "project_start".to_string(),
        save_projection(&writer, "project_start", &weights.project_start)?,
    );
    layers.insert(
        "project_end".to_string(),
        save_projection(&writer, "project_end", &weights.project_end)?,
    );
    layers.insert(
        "out_project".to_string(),
        save_projection(&writer, "out_project", &weights.out_project)?,
    );
    layers.insert(
        "prompt_projection".to_string(),
        save_projection(&writer, "prompt_projection", &weights.prompt_projection)?,
    );

    let rnn = writer.save_recurrent(
        &weights.rnn.role,
        weights.rnn.input_size,
        weights.rnn.hidden_size,
        weights.rnn.num_layers,
        direction_tensors(&weights.rnn.forward_dir),
        weights.rnn.backward_dir.as_ref().map(direction_tensors),
    )?;

    let metadata = SpanHeadMetadata {
        model: model.to_string(),
        hidden_size,
        max_width,
        cls_token_id: special_tokens.cls_token_id,
        sep_token_id: special_tokens.sep_token_id,
        pad_token_id: special_tokens.pad_token_id,
        layers,
        rnn,
    };
    let json = serde_json::to_string_pretty(&metadata)?;
    fs::write(dir.join(METADATA_FILE), json)?;
    info!(model, dir = %dir.display(), "span head exported");
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heads::testutil::{fill, projection};
    use span_bridge_core::error::Error;
    use span_bridge_core::serialize::read_tensor;
    use span_bridge_core::tensor::{Shape, Tensor};
    use tempfile::tempdir;

    fn direction(seed: f32, input: usize, hidden: usize) -> RecurrentDirection {
        RecurrentDirection {
            weight_ih: Tensor::new(
                "w_ih",
                Shape::new(vec![3 * hidden, input]),
                fill(3 * hidden * input, seed),
            )
            .unwrap(),
            weight_hh: Tensor::new(
                "w_hh",
                Shape::new(vec![3 * hidden, hidden]),
                fill(3 * hidden * hidden, seed + 0.1),
            )
            .unwrap(),
            bias_ih: Tensor::new("b_ih", Shape::new(vec![3 * hidden]), fill(3 * hidden, seed + 0.2))
                .unwrap(),
            bias_hh: Tensor::new("b_hh", Shape::new(vec![3 * hidden]), fill(3 * hidden, seed + 0.3))
                .unwrap(),
        }
    }

    fn span_head(num_layers: usize, bidirectional: bool) -> SpanHeadWeights {
        let hidden = 8;
        SpanHeadWeights {
            project_start: projection("project_start", hidden, hidden, hidden),
            project_end: projection("project_end", hidden, hidden, hidden),
            out_project: projection("out_project", 2 * hidden, hidden, hidden),
            prompt_projection: projection("prompt_projection", hidden, hidden, hidden),
            rnn: BiRecurrent {
                role: "rnn".into(),
                input_size: hidden,
                hidden_size: hidden / 2,
                num_layers,
                forward_dir: direction(0.11, hidden, hidden / 2),
                backward_dir: bidirectional.then(|| direction(0.77, hidden, hidden / 2)),
            },
        }
    }

    #[test]
    fn test_export_writes_metadata_and_weights() {
        let dir = tempdir().unwrap();
        let weights = span_head(1, true);
        let metadata = export_span_head(
            &weights,
            "span-head-test",
            8,
            12,
            &SpecialTokens::default(),
            dir.path(),
        )
        .unwrap();

        assert_eq!(metadata.layers.len(), 4);
        assert!(metadata.rnn.bidirectional);
        assert!(dir.path().join(METADATA_FILE).exists());
        assert!(dir.path().join("project_start_fc1.weight.bin").exists());
        assert!(dir.path().join("rnn_forward.weight_ih.bin").exists());
        assert!(dir.path().join("rnn_backward.bias.bin").exists());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let weights = span_head(1, false);
        let written = export_span_head(
            &weights,
            "span-head-test",
            8,
            12,
            &SpecialTokens::default(),
            dir.path(),
        )
        .unwrap();
        let loaded = SpanHeadMetadata::load(dir.path()).unwrap();
        assert_eq!(loaded.model, written.model);
        assert_eq!(loaded.rnn.hidden_size, 4);
        assert!(loaded.rnn.backward.is_none());
    }

    #[test]
    fn test_exported_bias_is_summed() {
        let dir = tempdir().unwrap();
        let weights = span_head(1, false);
        let metadata = export_span_head(
            &weights,
            "span-head-test",
            8,
            12,
            &SpecialTokens::default(),
            dir.path(),
        )
        .unwrap();

        let bias = read_tensor(
            &dir.path().join(&metadata.rnn.forward.bias),
            "bias",
            Shape::new(vec![12]),
            Precision::Fp32,
        )
        .unwrap();
        let expected: Vec<f32> = weights
            .rnn
            .forward_dir
            .bias_ih
            .data()
            .iter()
            .zip(weights.rnn.forward_dir.bias_hh.data().iter())
            .map(|(a, b)| a + b)
            .collect();
        assert_eq!(bias.data(), &expected[..]);
    }

    #[test]
    fn test_multi_layer_recurrence_is_fatal() {
        let dir = tempdir().unwrap();
        let weights = span_head(2, true);
        let err = export_span_head(
            &weights,
            "span-head-test",
            8,
            12,
            &SpecialTokens::default(),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedArchitecture(_)));
    }
}
