use crossbeam_channel::Sender;
use serde::Serialize;

/// Phase markers for one extraction, delivered strictly in the order
/// `Reading → Decompressing → Decompressed → Decoding → Decoded →
/// Extracting* → Completed`. `Warning` may interleave with `Extracting`;
/// `Error` terminates the sequence.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ExtractionPhase {
    Reading,
    Decompressing,
    Decompressed,
    Decoding,
    Decoded,
    Extracting,
    Completed,
    Warning,
    Error,
}

/// One immutable extraction progress event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionProgress {
    pub phase: ExtractionPhase,
    /// 0..=100. The first half of the range is reserved for
    /// read/decompress/decode; per-file extraction fills 50..=100.
    pub percent: u8,
    pub detail: String,
}

impl ExtractionProgress {
    #[must_use]
    pub fn new(phase: ExtractionPhase, percent: u8, detail: impl Into<String>) -> Self {
        Self {
            phase,
            percent: percent.min(100),
            detail: detail.into(),
        }
    }
}

/// Snapshot of one model's acquisition state machine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "state", content = "detail")]
pub enum AcquisitionState {
    Absent,
    CachedArchiveValid,
    Downloading,
    Extracting,
    Verifying,
    Complete,
    Failed(String),
    Cancelled,
}

/// Events published on the acquirer's channel. Snapshots only; consumers
/// never share mutable state with the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "type")]
pub enum AcquisitionEvent {
    StateChanged {
        model_id: String,
        state: AcquisitionState,
    },
    TransferProgress {
        model_id: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    Extraction {
        model_id: String,
        progress: ExtractionProgress,
    },
}

/// Best-effort event publisher. A disconnected receiver never blocks or
/// fails the pipeline.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<AcquisitionEvent>,
}

impl EventSink {
    pub(crate) fn new(sender: Sender<AcquisitionEvent>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, event: AcquisitionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn state_changed(&self, model_id: &str, state: AcquisitionState) {
        self.emit(AcquisitionEvent::StateChanged {
            model_id: model_id.to_string(),
            state,
        });
    }

    pub fn transfer_progress(&self, model_id: &str, downloaded_bytes: u64, total_bytes: Option<u64>) {
        self.emit(AcquisitionEvent::TransferProgress {
            model_id: model_id.to_string(),
            downloaded_bytes,
            total_bytes,
        });
    }

    pub fn extraction(&self, model_id: &str, progress: ExtractionProgress) {
        self.emit(AcquisitionEvent::Extraction {
            model_id: model_id.to_string(),
            progress,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receiver_does_not_block_emission() {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let sink = EventSink::new(sender);
        drop(receiver);
        sink.state_changed("model", AcquisitionState::Downloading);
    }

    #[test]
    fn progress_percent_is_clamped() {
        let progress = ExtractionProgress::new(ExtractionPhase::Extracting, 140, "overflow");
        assert_eq!(progress.percent, 100);
    }

    #[test]
    fn state_snapshots_serialize_with_tagged_detail() {
        let json =
            serde_json::to_string(&AcquisitionState::Failed("boom".into())).unwrap();
        assert!(json.contains("\"state\":\"failed\""), "{json}");
        assert!(json.contains("boom"), "{json}");
    }
}
