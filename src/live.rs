//! Live-stream staging buffer.
//!
//! A single slot holding the most recent processed live frame. Writers swap in
//! a fresh `Arc<LiveStageEntry>` under a short lock; readers clone the `Arc`
//! and never see a partially written entry. Inference, annotation and
//! encoding all happen outside the lock.
//!
//! Snapshots are read-only. Their fields are private and accessors hand out
//! shared references only:
//!
//! ```compile_fail
//! use roastwatch::LiveStageEntry;
//!
//! fn tamper(entry: &LiveStageEntry) {
//!     entry.result().objects.clear();
//! }
//! ```
//!
//! ```compile_fail
//! use roastwatch::LiveStageEntry;
//!
//! fn swap_raw(entry: &mut LiveStageEntry, frame: image::RgbImage) {
//!     entry.raw = frame;
//! }
//! ```
//!
//! Frames only enter the slot through `ingest`:
//!
//! ```compile_fail
//! use roastwatch::{Analysis, LiveStage};
//!
//! fn bypass(stage: &LiveStage, frame: image::RgbImage, analysis: Analysis) {
//!     let _ = stage.stage(frame, analysis);
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::annotate::encode_base64_jpeg;
use crate::detect::DetectionResult;
use crate::error::{Error, Result};
use crate::images::decode_image;
use crate::job::{CaptureMethod, DetectionJob};
use crate::pipeline::{Analysis, DetectionService};

pub const LIVE_JPEG_QUALITY: u8 = 85;

/// Immutable snapshot of one processed live frame.
#[derive(Debug)]
pub struct LiveStageEntry {
    sequence: u64,
    captured_at: DateTime<Utc>,
    raw: RgbImage,
    annotated: RgbImage,
    result: DetectionResult,
    processing_time: Duration,
}

impl LiveStageEntry {
    /// Logical write order. Strictly increasing across staged entries.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn raw(&self) -> &RgbImage {
        &self.raw
    }

    pub fn annotated(&self) -> &RgbImage {
        &self.annotated
    }

    pub fn result(&self) -> &DetectionResult {
        &self.result
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }
}

/// What an ingest caller gets back: always its own frame's result, whether
/// or not a later ingest has already replaced it in the slot.
#[derive(Clone, Debug)]
pub struct LiveIngest {
    pub sequence: u64,
    pub result: DetectionResult,
    pub annotated_base64: String,
    pub processing_time: Duration,
}

#[derive(Default)]
struct Slot {
    entry: Option<Arc<LiveStageEntry>>,
    last_sequence: u64,
}

#[derive(Default)]
pub struct LiveStage {
    slot: Mutex<Slot>,
}

impl LiveStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| Error::Storage("live stage lock poisoned".into()))
    }

    /// Decode, analyse and stage one encoded frame.
    pub fn ingest(&self, service: &DetectionService, bytes: &[u8]) -> Result<LiveIngest> {
        let raw = decode_image(bytes)?;
        let analysis = service.analyze(&raw)?;
        let entry = self.stage(raw, analysis)?;

        let annotated_base64 = encode_base64_jpeg(entry.annotated(), LIVE_JPEG_QUALITY)?;
        log::debug!(
            "live frame {} staged with {} objects in {:?}",
            entry.sequence(),
            entry.result().count(),
            entry.processing_time()
        );
        Ok(LiveIngest {
            sequence: entry.sequence(),
            result: entry.result().clone(),
            annotated_base64,
            processing_time: entry.processing_time(),
        })
    }

    /// Replace the staged entry. The sequence is assigned under the lock so it
    /// follows write order.
    fn stage(&self, raw: RgbImage, analysis: Analysis) -> Result<Arc<LiveStageEntry>> {
        let mut slot = self.slot()?;
        slot.last_sequence += 1;
        let entry = Arc::new(LiveStageEntry {
            sequence: slot.last_sequence,
            captured_at: Utc::now(),
            raw,
            annotated: analysis.annotated,
            result: analysis.result,
            processing_time: analysis.processing_time,
        });
        slot.entry = Some(Arc::clone(&entry));
        Ok(entry)
    }

    /// Current snapshot, or `None` if nothing has been staged yet.
    pub fn peek(&self) -> Result<Option<Arc<LiveStageEntry>>> {
        Ok(self.slot()?.entry.clone())
    }

    pub fn latest(&self) -> Result<Arc<LiveStageEntry>> {
        self.peek()?
            .ok_or_else(|| Error::Empty("no live-stream frame has been processed yet".into()))
    }

    /// Record the staged entry as a `completed` job. The slot is left as is,
    /// so repeated captures of the same entry produce separate jobs.
    pub fn capture(&self, service: &DetectionService) -> Result<DetectionJob> {
        let entry = self.latest()?;
        let analysis = Analysis {
            result: entry.result().clone(),
            annotated: entry.annotated().clone(),
            processing_time: entry.processing_time(),
        };
        service.record_completed(entry.raw(), &analysis, CaptureMethod::LiveStream, None)
    }
}
