use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::catalog::ModelFamily;
use crate::error::Result;

/// Logical role of a file within an extracted model bundle.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "kebab-case")]
pub enum ModelRole {
    Encoder,
    Decoder,
    Joiner,
    Tokens,
    /// Single-graph families (paraformer) ship one `model.onnx`.
    Model,
}

impl ModelRole {
    /// File name the recognition engine expects inside the model root.
    #[must_use]
    pub fn canonical_name(self) -> &'static str {
        match self {
            ModelRole::Encoder => "encoder.onnx",
            ModelRole::Decoder => "decoder.onnx",
            ModelRole::Joiner => "joiner.onnx",
            ModelRole::Tokens => "tokens.txt",
            ModelRole::Model => "model.onnx",
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            ModelRole::Encoder => "encoder",
            ModelRole::Decoder => "decoder",
            ModelRole::Joiner => "joiner",
            ModelRole::Tokens => "tokens",
            ModelRole::Model => "model",
        }
    }
}

/// Required roles per family. Whisper exports carry no joiner.
#[must_use]
pub fn required_roles(family: ModelFamily) -> &'static [ModelRole] {
    match family {
        ModelFamily::Transducer => &[
            ModelRole::Encoder,
            ModelRole::Decoder,
            ModelRole::Joiner,
            ModelRole::Tokens,
        ],
        ModelFamily::Whisper => &[ModelRole::Encoder, ModelRole::Decoder, ModelRole::Tokens],
        ModelFamily::Paraformer => &[ModelRole::Model, ModelRole::Tokens],
    }
}

/// Outcome of a layout check. Recomputed on demand, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub satisfied: bool,
    pub missing_roles: Vec<ModelRole>,
    /// Non-canonical files discovered by the fuzzy scan, keyed by the role
    /// they can satisfy.
    pub discovered: BTreeMap<ModelRole, PathBuf>,
}

impl VerificationResult {
    fn satisfied() -> Self {
        Self {
            satisfied: true,
            missing_roles: Vec::new(),
            discovered: BTreeMap::new(),
        }
    }
}

/// Check the canonical file set for `family` under `model_dir`.
///
/// Canonical paths are checked first; any missing role triggers a
/// recursive scan that tolerates versioned or prefixed archive file names
/// (`tiny-encoder.onnx`, `encoder-epoch-99-avg-1.int8.onnx`). When both a
/// plain and an INT8-quantized candidate exist, the plain one wins.
#[must_use]
pub fn verify(model_dir: &Path, family: ModelFamily) -> VerificationResult {
    let roles = required_roles(family);
    let missing: Vec<ModelRole> = roles
        .iter()
        .copied()
        .filter(|role| !model_dir.join(role.canonical_name()).is_file())
        .collect();

    if missing.is_empty() {
        return VerificationResult::satisfied();
    }

    let mut discovered = BTreeMap::new();
    for role in &missing {
        let mut candidates = Vec::new();
        collect_candidates(model_dir, *role, &mut candidates);
        if let Some(best) = pick_candidate(candidates) {
            discovered.insert(*role, best);
        }
    }

    VerificationResult {
        satisfied: false,
        missing_roles: missing,
        discovered,
    }
}

/// Copy every discovered non-canonical file to its canonical path, then
/// re-run [`verify`]. Sources are copied, never moved, so the original
/// archive layout stays intact and repair can be retried safely.
pub fn repair(model_dir: &Path, family: ModelFamily) -> Result<VerificationResult> {
    let report = verify(model_dir, family);
    if report.satisfied {
        return Ok(report);
    }

    for (role, source) in &report.discovered {
        let target = model_dir.join(role.canonical_name());
        if target.exists() {
            continue;
        }
        tracing::info!(
            "repairing model layout: {} -> {}",
            source.display(),
            target.display()
        );
        fs::copy(source, &target)?;
    }

    Ok(verify(model_dir, family))
}

fn collect_candidates(dir: &Path, role: ModelRole, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_candidates(&path, role, out);
        } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if matches_role(name, role) {
                out.push(path);
            }
        }
    }
}

fn matches_role(name: &str, role: ModelRole) -> bool {
    match role {
        // Exact-name match only, so `decoder.onnx` is never mistaken for a
        // paraformer graph.
        ModelRole::Model => name == "model.onnx" || name == "model.int8.onnx",
        ModelRole::Tokens => name.contains("tokens") && name.ends_with(".txt"),
        ModelRole::Encoder | ModelRole::Decoder | ModelRole::Joiner => {
            name.contains(role.keyword()) && name.ends_with(".onnx")
        }
    }
}

fn pick_candidate(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.sort();
    let non_quantized = candidates.iter().find(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|name| !name.contains("int8"))
            .unwrap_or(false)
    });
    non_quantized.cloned().or_else(|| candidates.into_iter().next())
}
