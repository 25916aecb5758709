//! Detection job records and their lifecycle.
//!
//! A job moves `uploaded -> processing -> {completed | failed}`. Terminal
//! states never change again. Capture paths that already hold inference
//! output create jobs directly in `completed`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::DetectionResult;
use crate::error::{Error, Result};

/// Opaque job identifier assigned by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .map(JobId)
            .ok_or_else(|| Error::Validation(format!("invalid job id: {:?}", s)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Uploaded,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Uploaded => "uploaded",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Uploaded, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Storage(format!("unknown job status {:?}", s)))
    }
}

/// How the source image reached the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureMethod {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "live-stream")]
    LiveStream,
    #[serde(rename = "direct-capture")]
    DirectCapture,
}

impl CaptureMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMethod::Upload => "upload",
            CaptureMethod::LiveStream => "live-stream",
            CaptureMethod::DirectCapture => "direct-capture",
        }
    }
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upload" => Ok(CaptureMethod::Upload),
            "live-stream" => Ok(CaptureMethod::LiveStream),
            "direct-capture" => Ok(CaptureMethod::DirectCapture),
            other => Err(Error::Storage(format!("unknown capture method {:?}", other))),
        }
    }
}

/// Result fields written when a job completes.
#[derive(Clone, Debug, PartialEq)]
pub struct JobOutcome {
    pub result_path: String,
    pub detections_count: u32,
    pub confidence_scores: Vec<f32>,
    pub detection_classes: Vec<String>,
    pub processing_time: Duration,
    pub synthetic: bool,
}

impl JobOutcome {
    pub fn from_result(
        result: &DetectionResult,
        result_path: impl Into<String>,
        processing_time: Duration,
    ) -> Self {
        Self {
            result_path: result_path.into(),
            detections_count: result.count() as u32,
            confidence_scores: result.confidence_scores(),
            detection_classes: result.classes(),
            processing_time,
            synthetic: result.synthetic,
        }
    }
}

/// Insert request. `outcome: None` creates an `uploaded` job; `Some`
/// creates it directly in `completed`.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJob {
    pub filename: String,
    pub original_path: String,
    pub capture_method: CaptureMethod,
    pub origin_address: Option<String>,
    pub outcome: Option<JobOutcome>,
}

impl NewJob {
    pub fn uploaded(filename: impl Into<String>, original_path: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            original_path: original_path.into(),
            capture_method: CaptureMethod::Upload,
            origin_address: None,
            outcome: None,
        }
    }

    pub fn completed(
        filename: impl Into<String>,
        original_path: impl Into<String>,
        capture_method: CaptureMethod,
        outcome: JobOutcome,
    ) -> Self {
        Self {
            filename: filename.into(),
            original_path: original_path.into(),
            capture_method,
            origin_address: None,
            outcome: Some(outcome),
        }
    }

    pub fn with_origin(mut self, address: impl Into<String>) -> Self {
        self.origin_address = Some(address.into());
        self
    }

    pub fn initial_status(&self) -> JobStatus {
        if self.outcome.is_some() {
            JobStatus::Completed
        } else {
            JobStatus::Uploaded
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionJob {
    pub id: JobId,
    pub filename: String,
    pub original_path: String,
    pub result_path: Option<String>,
    pub detections_count: u32,
    pub confidence_scores: Vec<f32>,
    pub detection_classes: Vec<String>,
    /// Seconds spent in inference and annotation.
    pub processing_time: Option<f64>,
    pub status: JobStatus,
    pub capture_method: CaptureMethod,
    pub origin_address: Option<String>,
    pub failure_reason: Option<String>,
    pub synthetic: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DetectionJob {
    /// Build the record a store persists for `new`.
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        let status = new.initial_status();
        let mut job = Self {
            id,
            filename: new.filename,
            original_path: new.original_path,
            result_path: None,
            detections_count: 0,
            confidence_scores: Vec::new(),
            detection_classes: Vec::new(),
            processing_time: None,
            status,
            capture_method: new.capture_method,
            origin_address: new.origin_address,
            failure_reason: None,
            synthetic: false,
            created_at: now,
            updated_at: now,
        };
        if let Some(outcome) = new.outcome {
            job.apply_outcome(outcome);
        }
        job
    }

    pub(crate) fn apply_outcome(&mut self, outcome: JobOutcome) {
        self.result_path = Some(outcome.result_path);
        self.detections_count = outcome.detections_count;
        self.confidence_scores = outcome.confidence_scores;
        self.detection_classes = outcome.detection_classes;
        self.processing_time = Some(outcome.processing_time.as_secs_f64());
        self.synthetic = outcome.synthetic;
    }

    pub fn check_invariants(&self) -> Result<()> {
        if self.result_path.is_some() != (self.status == JobStatus::Completed) {
            return Err(Error::Storage(format!(
                "job {}: result_path present={} with status {}",
                self.id,
                self.result_path.is_some(),
                self.status
            )));
        }
        if self.confidence_scores.len() != self.detection_classes.len() {
            return Err(Error::Storage(format!(
                "job {}: {} scores but {} classes",
                self.id,
                self.confidence_scores.len(),
                self.detection_classes.len()
            )));
        }
        if self.status == JobStatus::Completed
            && self.detections_count as usize != self.detection_classes.len()
        {
            return Err(Error::Storage(format!(
                "job {}: count {} does not match {} classes",
                self.id,
                self.detections_count,
                self.detection_classes.len()
            )));
        }
        if self.updated_at < self.created_at {
            return Err(Error::Storage(format!(
                "job {}: updated before it was created",
                self.id
            )));
        }
        Ok(())
    }
}
