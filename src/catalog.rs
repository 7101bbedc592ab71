use std::fs::File;
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{AcquireError, Result};

/// Model family, which determines the canonical file set a bundle must
/// provide once extracted (see `layout`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFamily {
    /// Encoder/decoder/joiner transducer models (zipformer and friends).
    Transducer,
    /// Whisper exports, which ship no joiner.
    Whisper,
    /// Single-file paraformer models.
    Paraformer,
}

/// Immutable description of one downloadable model bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub family: ModelFamily,
    pub display_name: String,
    #[serde(default)]
    pub approx_size_bytes: u64,
    pub source_url: String,
}

/// Lookup table of known models, injected into the pipeline at
/// construction time. Custom models are plain descriptors inserted with
/// [`Catalog::insert`]; there is no separate "custom by name" identity.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<ModelDescriptor>,
}

impl Catalog {
    #[must_use]
    pub fn new(entries: Vec<ModelDescriptor>) -> Self {
        Self { entries }
    }

    /// Catalog of well-known sherpa-onnx release bundles.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(BUILTIN_MODELS.clone())
    }

    /// Load a catalog table from a JSON array of descriptors.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let entries: Vec<ModelDescriptor> = serde_json::from_reader(file)
            .map_err(|e| AcquireError::Catalog(format!("invalid catalog file: {e}")))?;
        Ok(Self::new(entries))
    }

    pub fn insert(&mut self, descriptor: ModelDescriptor) {
        if let Some(existing) = self.entries.iter_mut().find(|m| m.id == descriptor.id) {
            *existing = descriptor;
        } else {
            self.entries.push(descriptor);
        }
    }

    #[must_use]
    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|m| m.id == model_id)
    }

    pub fn require(&self, model_id: &str) -> Result<&ModelDescriptor> {
        self.get(model_id)
            .ok_or_else(|| AcquireError::UnknownModel(model_id.to_string()))
    }

    #[must_use]
    pub fn entries(&self) -> &[ModelDescriptor] {
        &self.entries
    }
}

static BUILTIN_MODELS: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    vec![
        ModelDescriptor {
            id: "sherpa-onnx-streaming-zipformer-en-20M-2023-02-17".into(),
            family: ModelFamily::Transducer,
            display_name: "Streaming Zipformer (English, 20M)".into(),
            approx_size_bytes: 127_887_156,
            source_url: "https://github.com/k2-fsa/sherpa-onnx/releases/download/asr-models/sherpa-onnx-streaming-zipformer-en-20M-2023-02-17.tar.bz2".into(),
        },
        ModelDescriptor {
            id: "sherpa-onnx-streaming-zipformer-en-2023-06-26".into(),
            family: ModelFamily::Transducer,
            display_name: "Streaming Zipformer (English)".into(),
            approx_size_bytes: 310_414_022,
            source_url: "https://github.com/k2-fsa/sherpa-onnx/releases/download/asr-models/sherpa-onnx-streaming-zipformer-en-2023-06-26.tar.bz2".into(),
        },
        ModelDescriptor {
            id: "sherpa-onnx-whisper-tiny.en".into(),
            family: ModelFamily::Whisper,
            display_name: "Whisper Tiny (English)".into(),
            approx_size_bytes: 113_233_233,
            source_url: "https://github.com/k2-fsa/sherpa-onnx/releases/download/asr-models/sherpa-onnx-whisper-tiny.en.tar.bz2".into(),
        },
        ModelDescriptor {
            id: "sherpa-onnx-paraformer-zh-2023-09-14".into(),
            family: ModelFamily::Paraformer,
            display_name: "Paraformer (Chinese + English)".into(),
            approx_size_bytes: 239_852_550,
            source_url: "https://github.com/k2-fsa/sherpa-onnx/releases/download/asr-models/sherpa-onnx-paraformer-zh-2023-09-14.tar.bz2".into(),
        },
    ]
});
