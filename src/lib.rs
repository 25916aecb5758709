//! Roastwatch
//!
//! Detection service that classifies coffee beans by roast level in still
//! images and live camera frames.
//!
//! # Architecture
//!
//! - `detect`: backend-independent detector adapter (thresholding, clamping,
//!   per-class suppression) over pluggable `DetectorBackend`s
//! - `annotate`: boxes, confidence tags and a summary banner on a copy of the
//!   input image
//! - `storage`: `JobStore` trait with SQLite and in-memory implementations
//! - `pipeline`: upload validation, the detection job state machine and
//!   direct capture from a remote camera
//! - `live`: single-slot staging buffer for live-stream frames
//! - `api`: blocking HTTP/1.1 surface under `/api`
//!
//! A job moves `uploaded -> processing -> completed | failed`. Only one
//! caller can move a job into `processing`; everyone else gets a conflict.

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod error;
mod font;
pub mod images;
pub mod job;
pub mod live;
pub mod pipeline;
pub mod remote;
pub mod storage;

pub use detect::{
    BoundingBox, DetectedObject, DetectionResult, Detector, DetectorBackend, DetectorSettings,
    RawDetection, RoastClass,
};
pub use error::{Error, ErrorKind, Result};
pub use images::ImageStore;
pub use job::{CaptureMethod, DetectionJob, JobId, JobOutcome, JobStatus, NewJob};
pub use live::{LiveIngest, LiveStage, LiveStageEntry};
pub use pipeline::{Analysis, DetectionService, ProcessingLease};
pub use remote::{RemoteCamera, RemoteFrame};
pub use storage::{shared_memory_uri, InMemoryJobStore, JobStats, JobStore, Page, SqliteJobStore};
