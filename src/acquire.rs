use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::Disks;
use tokio_util::sync::CancellationToken;

use crate::catalog::{Catalog, ModelDescriptor};
use crate::error::{AcquireError, Result};
use crate::events::{AcquisitionEvent, AcquisitionState, EventSink};
use crate::extract::ArchiveExtractor;
use crate::layout::{self, VerificationResult};
use crate::transfer::{format_bytes, TransferManager};

/// Free space demanded beyond the projected bundle footprint.
const DISK_SPACE_MARGIN: u64 = 100 * 1024 * 1024;

/// Storage roots and the injected model table.
pub struct AcquirerConfig {
    /// Models land at `<models_root>/<model-id>/`.
    pub models_root: PathBuf,
    /// Archives are cached at `<temp_root>/<model-id>.tar.bz2`.
    pub temp_root: PathBuf,
    pub catalog: Catalog,
}

impl AcquirerConfig {
    /// Platform-default roots under the application data/cache dirs.
    pub fn with_default_roots(catalog: Catalog) -> Result<Self> {
        let project_dirs = ProjectDirs::from("com", "AsrAssets", "AsrAssets")
            .ok_or_else(|| AcquireError::Catalog("missing project directories".into()))?;
        Ok(Self {
            models_root: project_dirs.data_dir().join("models"),
            temp_root: project_dirs.cache_dir().join("archives"),
            catalog,
        })
    }
}

/// Recomputed-on-demand snapshot of one model's on-disk state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub model_id: String,
    pub installed: bool,
    pub archive_cached: bool,
    pub in_flight: bool,
    pub verification: VerificationResult,
}

/// Handle to one spawned acquisition.
pub struct AcquisitionTicket {
    model_id: String,
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl AcquisitionTicket {
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Request cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the terminal outcome.
    pub fn join(self) -> Result<()> {
        self.handle.join().unwrap_or_else(|_| {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "acquisition worker panicked",
            )
            .into())
        })
    }
}

/// Drives a model from any on-disk state to `Complete` (or a terminal
/// failure), coordinating transfer, extraction and layout repair.
///
/// Acquisitions for distinct model ids run in parallel on independent
/// worker threads. A second request for an id that is already in flight
/// is rejected; the archive path and model directory are only ever
/// written by one worker at a time.
pub struct Acquirer {
    shared: Arc<Shared>,
}

struct Shared {
    config: AcquirerConfig,
    transfer: TransferManager,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
    sink: EventSink,
}

impl Acquirer {
    pub fn new(config: AcquirerConfig) -> Result<(Self, Receiver<AcquisitionEvent>)> {
        fs::create_dir_all(&config.models_root)?;
        fs::create_dir_all(&config.temp_root)?;
        tracing::info!("models root: {}", config.models_root.display());

        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            config,
            transfer: TransferManager::new()?,
            in_flight: Mutex::new(HashMap::new()),
            sink: EventSink::new(sender),
        });
        Ok((Self { shared }, receiver))
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.shared.config.catalog
    }

    /// Directory the recognition engine should be pointed at.
    #[must_use]
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.shared.model_dir(model_id)
    }

    /// Ensure `model_id` is present, performing whatever subset of
    /// download / extraction / repair the on-disk state requires.
    /// Runs on a background worker; progress arrives on the event channel.
    pub fn ensure(&self, model_id: &str) -> Result<AcquisitionTicket> {
        let descriptor = self.shared.config.catalog.require(model_id)?.clone();
        let guard = InFlightGuard::register(&self.shared, model_id)?;
        let token = guard.token.clone();

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            let result = run_to_terminal(&shared, &guard.model_id, &descriptor, &guard.token);
            drop(guard);
            result
        });

        Ok(AcquisitionTicket {
            model_id: model_id.to_string(),
            token,
            handle,
        })
    }

    /// Same as [`Acquirer::ensure`], on the calling thread.
    pub fn ensure_blocking(&self, model_id: &str) -> Result<()> {
        let descriptor = self.shared.config.catalog.require(model_id)?.clone();
        let guard = InFlightGuard::register(&self.shared, model_id)?;
        run_to_terminal(&self.shared, &guard.model_id, &descriptor, &guard.token)
    }

    /// Cancel an in-flight acquisition. Returns false when none is active.
    pub fn cancel(&self, model_id: &str) -> bool {
        let in_flight = self.shared.in_flight.lock();
        if let Some(token) = in_flight.get(model_id) {
            token.cancel();
            tracing::info!("cancellation requested for '{model_id}'");
            true
        } else {
            false
        }
    }

    /// Delete the installed model directory and any cached archive.
    /// Refused while an acquisition for the same id is in flight.
    pub fn remove(&self, model_id: &str) -> Result<()> {
        if self.shared.in_flight.lock().contains_key(model_id) {
            return Err(AcquireError::AlreadyInFlight(model_id.to_string()));
        }

        let model_dir = self.shared.model_dir(model_id);
        if model_dir.exists() {
            fs::remove_dir_all(&model_dir)?;
        }
        let archive = self.shared.archive_path(model_id);
        if archive.exists() {
            fs::remove_file(&archive)?;
        }

        self.shared
            .sink
            .state_changed(model_id, AcquisitionState::Absent);
        Ok(())
    }

    /// Immutable state snapshot for `model_id`. Nothing is persisted.
    pub fn status(&self, model_id: &str) -> Result<ModelState> {
        let descriptor = self.shared.config.catalog.require(model_id)?;
        let verification = layout::verify(&self.shared.model_dir(model_id), descriptor.family);
        Ok(ModelState {
            model_id: model_id.to_string(),
            installed: verification.satisfied,
            archive_cached: self.shared.archive_path(model_id).is_file(),
            in_flight: self.shared.in_flight.lock().contains_key(model_id),
            verification,
        })
    }
}

impl Shared {
    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.config.models_root.join(model_id)
    }

    fn archive_path(&self, model_id: &str) -> PathBuf {
        self.config.temp_root.join(format!("{model_id}.tar.bz2"))
    }
}

/// Per-id exclusivity. Registration fails while another acquisition for
/// the same id holds the slot; the slot is released on drop.
struct InFlightGuard {
    shared: Arc<Shared>,
    model_id: String,
    token: CancellationToken,
}

impl std::fmt::Debug for InFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightGuard")
            .field("model_id", &self.model_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl InFlightGuard {
    fn register(shared: &Arc<Shared>, model_id: &str) -> Result<Self> {
        let mut in_flight = shared.in_flight.lock();
        if in_flight.contains_key(model_id) {
            return Err(AcquireError::AlreadyInFlight(model_id.to_string()));
        }
        let token = CancellationToken::new();
        in_flight.insert(model_id.to_string(), token.clone());
        Ok(Self {
            shared: Arc::clone(shared),
            model_id: model_id.to_string(),
            token,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight.lock().remove(&self.model_id);
    }
}

fn run_to_terminal(
    shared: &Shared,
    model_id: &str,
    descriptor: &ModelDescriptor,
    token: &CancellationToken,
) -> Result<()> {
    let result = run_pipeline(shared, model_id, descriptor, token);
    match &result {
        Ok(()) => {
            tracing::info!("model '{model_id}' ready");
            shared.sink.state_changed(model_id, AcquisitionState::Complete);
        }
        Err(err) if err.is_cancelled() => {
            tracing::info!("acquisition of '{model_id}' cancelled");
            shared
                .sink
                .state_changed(model_id, AcquisitionState::Cancelled);
        }
        Err(err) => {
            tracing::error!("acquisition of '{model_id}' failed: {err}");
            shared
                .sink
                .state_changed(model_id, AcquisitionState::Failed(err.to_string()));
        }
    }
    result
}

fn run_pipeline(
    shared: &Shared,
    model_id: &str,
    descriptor: &ModelDescriptor,
    token: &CancellationToken,
) -> Result<()> {
    let model_dir = shared.model_dir(model_id);

    // Already complete: no network or extraction I/O at all.
    if layout::verify(&model_dir, descriptor.family).satisfied {
        return Ok(());
    }
    shared.sink.state_changed(model_id, AcquisitionState::Absent);

    let archive = shared.archive_path(model_id);
    let remote_size = match shared.transfer.remote_size(&descriptor.source_url) {
        Ok(size) => size,
        // Offline with a cached archive: proceed and let extraction
        // decide whether the bytes are usable.
        Err(err) if archive.is_file() => {
            tracing::warn!("HEAD probe failed ({err}), trusting cached archive for '{model_id}'");
            None
        }
        Err(err) => return Err(err),
    };

    let cached = match (archive.is_file(), remote_size) {
        (true, Some(expected)) => {
            let local = fs::metadata(&archive)?.len();
            if local == expected {
                true
            } else {
                tracing::info!(
                    "cached archive for '{model_id}' is stale ({} local vs {} remote), discarding",
                    format_bytes(local),
                    format_bytes(expected)
                );
                fs::remove_file(&archive)?;
                false
            }
        }
        (exists, None) => exists,
        (false, _) => false,
    };

    if cached {
        shared
            .sink
            .state_changed(model_id, AcquisitionState::CachedArchiveValid);
    } else {
        preflight_disk_space(shared, descriptor)?;
        shared
            .sink
            .state_changed(model_id, AcquisitionState::Downloading);
        download_archive(shared, model_id, descriptor, &archive, remote_size, token)?;
    }

    if token.is_cancelled() {
        return Err(AcquireError::Cancelled);
    }

    shared
        .sink
        .state_changed(model_id, AcquisitionState::Extracting);
    let outcome = ArchiveExtractor::extract(
        &archive,
        &model_dir,
        descriptor,
        |progress| shared.sink.extraction(model_id, progress),
        token,
    )?;
    if !outcome.warnings.is_empty() {
        tracing::warn!(
            "extraction of '{model_id}' finished with {} warnings",
            outcome.warnings.len()
        );
    }

    shared
        .sink
        .state_changed(model_id, AcquisitionState::Verifying);
    let report = layout::repair(&model_dir, descriptor.family)?;
    if !report.satisfied {
        return Err(AcquireError::VerificationFailed {
            missing: report.missing_roles,
        });
    }

    Ok(())
}

/// Fetch the archive, resuming any partial file. A size mismatch after
/// the first pass triggers exactly one fresh re-download before giving up
/// with `ArchiveIncomplete`.
fn download_archive(
    shared: &Shared,
    model_id: &str,
    descriptor: &ModelDescriptor,
    archive: &std::path::Path,
    remote_size: Option<u64>,
    token: &CancellationToken,
) -> Result<()> {
    let mut progress =
        |downloaded, total| shared.sink.transfer_progress(model_id, downloaded, total);

    let first = shared.transfer.fetch(
        &descriptor.source_url,
        archive,
        true,
        &mut progress,
        token,
    );
    match first {
        Ok(()) if archive_size_matches(archive, remote_size) => return Ok(()),
        Ok(()) | Err(AcquireError::ArchiveIncomplete { .. }) => {
            tracing::warn!("archive for '{model_id}' incomplete, re-downloading from scratch");
        }
        Err(err) => return Err(err),
    }

    let _ = fs::remove_file(archive);
    shared.transfer.fetch(
        &descriptor.source_url,
        archive,
        false,
        &mut progress,
        token,
    )?;

    if archive_size_matches(archive, remote_size) {
        Ok(())
    } else {
        let actual = fs::metadata(archive).map(|m| m.len()).unwrap_or(0);
        let _ = fs::remove_file(archive);
        Err(AcquireError::ArchiveIncomplete {
            expected: remote_size.unwrap_or(0),
            actual,
        })
    }
}

fn archive_size_matches(archive: &std::path::Path, remote_size: Option<u64>) -> bool {
    match remote_size {
        Some(expected) => fs::metadata(archive)
            .map(|m| m.len() == expected)
            .unwrap_or(false),
        None => archive.is_file(),
    }
}

fn preflight_disk_space(shared: &Shared, descriptor: &ModelDescriptor) -> Result<()> {
    if descriptor.approx_size_bytes == 0 {
        return Ok(());
    }
    // Archive and extracted tree coexist until the caller prunes the cache.
    let required = descriptor
        .approx_size_bytes
        .saturating_mul(2)
        .saturating_add(DISK_SPACE_MARGIN);

    let Some(available) = available_space(&shared.config.models_root) else {
        return Ok(());
    };
    if available < required {
        return Err(AcquireError::DiskSpace {
            required,
            available,
        });
    }
    Ok(())
}

fn available_space(path: &std::path::Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
