use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::thread;

use bzip2::read::BzDecoder;
use tar::Archive;
use tokio_util::sync::CancellationToken;

use crate::catalog::ModelDescriptor;
use crate::error::{AcquireError, Result};
use crate::events::{ExtractionPhase, ExtractionProgress};
use crate::layout;
use crate::transfer::format_bytes;

/// Yield to the scheduler this often inside the per-file write loop.
const YIELD_EVERY_FILES: usize = 8;

/// Unpacks a `tar.bz2` model bundle into its destination directory.
///
/// Extraction is attempted first through the system `tar` binary, which
/// streams with low peak memory. When no usable binary exists the
/// in-process fallback runs a staged read/decompress/decode/write
/// sequence; bundles reach several hundred megabytes, so each stage drops
/// the previous stage's buffer before allocating its own.
pub struct ArchiveExtractor;

/// Summary of one extraction run.
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub files_written: usize,
    /// Per-file write failures. Non-fatal; the remaining files are still
    /// extracted.
    pub warnings: Vec<String>,
    pub used_external_tool: bool,
}

impl ArchiveExtractor {
    /// Extract `archive` into `dest_dir`, stripping the bundle's top-level
    /// directory. Returns immediately without touching the archive when
    /// the canonical file set for the model is already present.
    ///
    /// Cancellation is honored at stage boundaries and between files on
    /// the fallback path only; the external tool runs to completion once
    /// spawned.
    pub fn extract<F>(
        archive: &Path,
        dest_dir: &Path,
        descriptor: &ModelDescriptor,
        mut progress: F,
        token: &CancellationToken,
    ) -> Result<ExtractionOutcome>
    where
        F: FnMut(ExtractionProgress),
    {
        if layout::verify(dest_dir, descriptor.family).satisfied {
            tracing::debug!(
                "canonical files already present for '{}', skipping extraction",
                descriptor.id
            );
            progress(ExtractionProgress::new(
                ExtractionPhase::Completed,
                100,
                "model files already in place",
            ));
            return Ok(ExtractionOutcome::default());
        }

        progress(ExtractionProgress::new(
            ExtractionPhase::Reading,
            0,
            "preparing archive",
        ));

        fs::create_dir_all(dest_dir).map_err(AcquireError::ExtractionIo)?;

        if let Some(tar_bin) = system_tar() {
            match run_system_tar(&tar_bin, archive, dest_dir) {
                Ok(()) => {
                    progress(ExtractionProgress::new(
                        ExtractionPhase::Completed,
                        100,
                        "archive extracted",
                    ));
                    return Ok(ExtractionOutcome {
                        used_external_tool: true,
                        ..ExtractionOutcome::default()
                    });
                }
                Err(err) => {
                    tracing::warn!("system tar failed ({err}), using in-process extraction");
                }
            }
        } else {
            tracing::debug!("no system tar found, using in-process extraction");
        }

        extract_in_process(archive, dest_dir, &descriptor.id, &mut progress, token)
    }
}

fn system_tar() -> Option<PathBuf> {
    which::which("tar").ok()
}

fn run_system_tar(tar_bin: &Path, archive: &Path, dest_dir: &Path) -> std::io::Result<()> {
    let status = Command::new(tar_bin)
        .arg("-xjf")
        .arg(archive)
        .arg("-C")
        .arg(dest_dir)
        .arg("--strip-components=1")
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("tar exited with {status}"),
        ))
    }
}

struct BundleEntry {
    path: PathBuf,
    data: Vec<u8>,
    is_dir: bool,
}

/// Staged fallback: read the whole archive, decompress it in one pass,
/// decode the tar stream into an entry list, then write files one by one.
/// The worker yields at stage boundaries and periodically within the file
/// loop so a supervising scheduler is never starved.
fn extract_in_process<F>(
    archive: &Path,
    dest_dir: &Path,
    model_id: &str,
    progress: &mut F,
    token: &CancellationToken,
) -> Result<ExtractionOutcome>
where
    F: FnMut(ExtractionProgress),
{
    let compressed = fs::read(archive).map_err(AcquireError::ExtractionIo)?;
    progress(ExtractionProgress::new(
        ExtractionPhase::Decompressing,
        10,
        format!("decompressing {}", format_bytes(compressed.len() as u64)),
    ));
    thread::yield_now();
    if token.is_cancelled() {
        return Err(AcquireError::Cancelled);
    }

    let mut decompressed = Vec::new();
    BzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decompressed)
        .map_err(|e| AcquireError::ArchiveCorrupt(format!("bzip2 decode failed: {e}")))?;
    drop(compressed);

    progress(ExtractionProgress::new(
        ExtractionPhase::Decompressed,
        30,
        format!("decompressed to {}", format_bytes(decompressed.len() as u64)),
    ));
    thread::yield_now();
    if token.is_cancelled() {
        return Err(AcquireError::Cancelled);
    }

    progress(ExtractionProgress::new(
        ExtractionPhase::Decoding,
        35,
        "decoding tar archive",
    ));

    let entries = decode_tar(&decompressed)?;
    drop(decompressed);

    progress(ExtractionProgress::new(
        ExtractionPhase::Decoded,
        50,
        format!("decoded {} entries", entries.len()),
    ));
    thread::yield_now();
    if token.is_cancelled() {
        return Err(AcquireError::Cancelled);
    }

    let total_files = entries.iter().filter(|entry| !entry.is_dir).count().max(1);
    let mut outcome = ExtractionOutcome::default();

    for entry in &entries {
        if token.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let Some(relative) = strip_bundle_prefix(&entry.path, model_id) else {
            outcome
                .warnings
                .push(format!("skipped unsafe entry path {:?}", entry.path));
            continue;
        };
        let target = dest_dir.join(&relative);

        if entry.is_dir {
            if let Err(err) = fs::create_dir_all(&target) {
                record_warning(&mut outcome, progress, &target, &err);
            }
            continue;
        }

        let written = (|| -> std::io::Result<()> {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &entry.data)
        })();

        match written {
            Ok(()) => {
                outcome.files_written += 1;
                let percent = 50 + (outcome.files_written * 50 / total_files) as u8;
                progress(ExtractionProgress::new(
                    ExtractionPhase::Extracting,
                    percent,
                    format!(
                        "{}/{} {}",
                        outcome.files_written,
                        total_files,
                        relative.display()
                    ),
                ));
            }
            Err(err) => record_warning(&mut outcome, progress, &target, &err),
        }

        if outcome.files_written % YIELD_EVERY_FILES == 0 {
            thread::yield_now();
        }
    }

    progress(ExtractionProgress::new(
        ExtractionPhase::Completed,
        100,
        format!("extracted {} files", outcome.files_written),
    ));
    Ok(outcome)
}

fn record_warning<F>(
    outcome: &mut ExtractionOutcome,
    progress: &mut F,
    target: &Path,
    err: &std::io::Error,
) where
    F: FnMut(ExtractionProgress),
{
    let detail = format!("failed to write {}: {err}", target.display());
    tracing::warn!("{detail}");
    progress(ExtractionProgress::new(ExtractionPhase::Warning, 50, &detail));
    outcome.warnings.push(detail);
}

fn decode_tar(data: &[u8]) -> Result<Vec<BundleEntry>> {
    let mut archive = Archive::new(data);
    let mut entries = Vec::new();
    for entry in archive
        .entries()
        .map_err(|e| AcquireError::ArchiveCorrupt(format!("tar decode failed: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| AcquireError::ArchiveCorrupt(format!("tar entry failed: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| AcquireError::ArchiveCorrupt(format!("tar entry path failed: {e}")))?
            .into_owned();
        let is_dir = entry.header().entry_type().is_dir();
        let mut data = Vec::new();
        if !is_dir {
            entry
                .read_to_end(&mut data)
                .map_err(|e| AcquireError::ArchiveCorrupt(format!("tar read failed: {e}")))?;
        }
        entries.push(BundleEntry { path, data, is_dir });
    }
    Ok(entries)
}

/// Strip the bundle's leading directory from an archive-relative path.
///
/// A leading segment matching or prefixed by the model id is always
/// dropped; otherwise the first component is dropped whenever another one
/// follows, matching the single-top-level-directory layout of released
/// bundles. Returns `None` for absolute paths or paths escaping the
/// destination.
fn strip_bundle_prefix(path: &Path, model_id: &str) -> Option<PathBuf> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            // Absolute paths and `..` must never escape the destination.
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }

    let bundle_idx = parts[..parts.len() - 1].iter().position(|part| {
        part.to_str()
            .is_some_and(|s| s.starts_with(model_id) || model_id.starts_with(s))
    });
    let start = match bundle_idx {
        Some(idx) => idx + 1,
        None if parts.len() > 1 => 1,
        None => 0,
    };
    Some(parts[start..].iter().copied().collect())
}
