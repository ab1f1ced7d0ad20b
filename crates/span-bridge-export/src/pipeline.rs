//! Conversion pipeline
//!
//! Drives the full export: rewrite (done by [`ExportModel::from_loaded`]),
//! trace each selected head, persist the artifacts, and write the manifest
//! the companion loader reads. Every artifact lives in its own directory
//! under the output root, keyed by head name in the manifest.

use crate::heads::{ExportModel, ShapeLimits, SubmoduleDescriptor};
use serde::{Deserialize, Serialize};
use span_bridge_core::error::{Error, Result};
use span_bridge_core::serialize::Precision;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "export_manifest.json";

/// Compute units the converted artifacts are allowed to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeProfile {
    All,
    CpuOnly,
    CpuAndGpu,
    CpuAndNpu,
}

impl ComputeProfile {
    pub fn label(&self) -> &'static str {
        match self {
            ComputeProfile::All => "all",
            ComputeProfile::CpuOnly => "cpu_only",
            ComputeProfile::CpuAndGpu => "cpu_and_gpu",
            ComputeProfile::CpuAndNpu => "cpu_and_npu",
        }
    }
}

/// Which heads to convert. Partial exports are for iterating on one head
/// without re-converting the encoder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeadSelection {
    pub encoder: bool,
    pub span_rep: bool,
    pub classifier: bool,
    pub count_predictor: bool,
    pub count_embed: bool,
}

impl Default for HeadSelection {
    fn default() -> Self {
        Self {
            encoder: true,
            span_rep: true,
            classifier: true,
            count_predictor: true,
            count_embed: true,
        }
    }
}

impl HeadSelection {
    pub fn only(name: &str) -> Self {
        let mut selection = Self {
            encoder: false,
            span_rep: false,
            classifier: false,
            count_predictor: false,
            count_embed: false,
        };
        match name {
            "encoder" => selection.encoder = true,
            "span_rep" => selection.span_rep = true,
            "classifier" => selection.classifier = true,
            "count_predictor" => selection.count_predictor = true,
            "count_embed" => selection.count_embed = true,
            _ => {}
        }
        selection
    }

    pub fn includes(&self, name: &str) -> bool {
        match name {
            "encoder" => self.encoder,
            "span_rep" => self.span_rep,
            "classifier" => self.classifier,
            "count_predictor" => self.count_predictor,
            "count_embed" => self.count_embed,
            _ => false,
        }
    }
}

/// Export configuration.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    pub max_seq_len: usize,
    pub max_schema_tokens: usize,
    pub precision: Precision,
    pub compute_profile: ComputeProfile,
    pub heads: HeadSelection,
    pub export_tokenizer: bool,
}

impl ExportConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_seq_len: 512,
            max_schema_tokens: 32,
            precision: Precision::Fp32,
            compute_profile: ComputeProfile::All,
            heads: HeadSelection::default(),
            export_tokenizer: true,
        }
    }
}

/// The manifest written next to the artifacts. Keys are a stable contract:
/// the loader resolves artifacts by head name and refuses manifests with
/// missing required entries, so names never change across export versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub model_id: String,
    pub max_seq_len: usize,
    pub max_schema_tokens: usize,
    pub max_width: usize,
    pub hidden_size: usize,
    pub max_count: usize,
    pub precision: Precision,
    pub compute_profile: ComputeProfile,
    /// Head name to artifact directory, relative to the manifest
    pub artifacts: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokenizer_dir: Option<String>,
    pub submodules: Vec<SubmoduleDescriptor>,
}

impl ExportManifest {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path).map_err(|e| {
            Error::Runtime(format!("Cannot read manifest {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Convert every selected head and write the manifest.
///
/// Each head is traced (which cross-checks described shapes against a real
/// forward pass) and persisted into `output_dir/<head>/`. A head excluded by
/// the selection leaves no artifact entry in the manifest at all.
pub fn run_export(model: &ExportModel, config: &ExportConfig) -> Result<ExportManifest> {
    fs::create_dir_all(&config.output_dir)?;
    let limits = ShapeLimits {
        max_seq_len: config.max_seq_len,
        max_schema_tokens: config.max_schema_tokens,
        hidden_size: model.hidden_size,
        max_width: model.max_width,
    };

    let mut artifacts = BTreeMap::new();
    let mut submodules = Vec::new();
    for head in model.heads() {
        let name = head.name();
        if !config.heads.includes(name) {
            info!(head = name, "head excluded from export");
            continue;
        }
        info!(head = name, "tracing head");
        let graph = head.trace(&limits)?;
        let dir = config.output_dir.join(name);
        graph.persist(&dir, config.precision, config.compute_profile.label())?;
        info!(head = name, params = graph.params().len(), "artifact written");

        artifacts.insert(name.to_string(), name.to_string());
        submodules.push(head.descriptor(&limits));
    }

    let tokenizer_dir = if config.export_tokenizer {
        match &model.tokenizer {
            Some(tokenizer) => {
                let dir = config.output_dir.join("tokenizer");
                fs::create_dir_all(&dir)?;
                tokenizer.save_vocab(&dir.join("vocab.json"))?;
                Some("tokenizer".to_string())
            }
            None => {
                // Tokenizer export is best effort; the loader falls back to
                // its bundled vocabulary when the directory is absent.
                warn!("model carries no tokenizer, skipping tokenizer export");
                None
            }
        }
    } else {
        None
    };

    let manifest = ExportManifest {
        model_id: model.model_id.clone(),
        max_seq_len: config.max_seq_len,
        max_schema_tokens: config.max_schema_tokens,
        max_width: model.max_width,
        hidden_size: model.hidden_size,
        max_count: model.max_count,
        precision: config.precision,
        compute_profile: config.compute_profile,
        artifacts,
        tokenizer_dir,
        submodules,
    };
    manifest.save(&config.output_dir)?;
    info!(model = %manifest.model_id, heads = manifest.artifacts.len(), "export complete");
    Ok(manifest)
}
