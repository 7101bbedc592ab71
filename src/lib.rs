//! Acquisition pipeline for offline speech-recognition model bundles.
//!
//! Drives versioned `tar.bz2` model archives from any on-disk state to a
//! canonical, engine-ready directory layout: resumable download, archive
//! extraction, and layout verification/repair. The crate is a library
//! consumed by an application shell; progress and state transitions are
//! published as immutable events on a channel.

pub mod acquire;
pub mod catalog;
pub mod error;
pub mod events;
pub mod extract;
pub mod layout;
pub mod transfer;

pub use acquire::{Acquirer, AcquirerConfig, AcquisitionTicket, ModelState};
pub use catalog::{Catalog, ModelDescriptor, ModelFamily};
pub use error::{AcquireError, Result};
pub use events::{
    AcquisitionEvent, AcquisitionState, EventSink, ExtractionPhase, ExtractionProgress,
};
pub use extract::{ArchiveExtractor, ExtractionOutcome};
pub use layout::{repair, required_roles, verify, ModelRole, VerificationResult};
pub use transfer::{format_bytes, TransferManager};

// One token per logical acquisition, shared between the caller and every
// pipeline stage.
pub use tokio_util::sync::CancellationToken;
