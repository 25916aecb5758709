//! Detection job orchestration.
//!
//! `DetectionService` is the only component that moves jobs between states.
//! Every entry into `processing` goes through a [`ProcessingLease`], which
//! marks the job failed if it is dropped without being resolved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;

use crate::annotate::annotate;
use crate::detect::{DetectionResult, Detector};
use crate::error::{Error, Result};
use crate::images::{allowed_extension, decode_image, Bucket, ImageStore, ALLOWED_EXTENSIONS};
use crate::job::{CaptureMethod, DetectionJob, JobId, JobOutcome, NewJob};
use crate::remote::RemoteCamera;
use crate::storage::JobStore;

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const ABORTED: &str = "processing aborted";

/// Inference plus annotation for one frame.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub result: DetectionResult,
    pub annotated: RgbImage,
    pub processing_time: Duration,
}

/// Exclusive right to finish one `processing` job.
///
/// Resolve with [`complete`](Self::complete) or [`fail`](Self::fail).
/// Dropping an unresolved lease (early return, panic) fails the job.
pub struct ProcessingLease<'a> {
    store: &'a dyn JobStore,
    job: DetectionJob,
    resolved: bool,
}

impl<'a> ProcessingLease<'a> {
    pub fn acquire(store: &'a dyn JobStore, id: JobId) -> Result<Self> {
        let job = store.begin_processing(id)?;
        log::info!("detection {} processing", id);
        Ok(Self {
            store,
            job,
            resolved: false,
        })
    }

    pub fn job(&self) -> &DetectionJob {
        &self.job
    }

    pub fn complete(mut self, outcome: JobOutcome) -> Result<DetectionJob> {
        let job = self.store.complete(self.job.id, outcome)?;
        self.resolved = true;
        log::info!(
            "detection {} completed with {} objects",
            job.id,
            job.detections_count
        );
        Ok(job)
    }

    pub fn fail(mut self, cause: &str) -> Result<DetectionJob> {
        let job = self.store.fail(self.job.id, cause)?;
        self.resolved = true;
        log::warn!("detection {} failed: {}", job.id, cause);
        Ok(job)
    }
}

impl Drop for ProcessingLease<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        match self.store.fail(self.job.id, ABORTED) {
            Ok(_) => log::warn!("detection {} failed: {}", self.job.id, ABORTED),
            Err(err) => log::error!(
                "detection {} could not be marked failed after abort: {}",
                self.job.id,
                err
            ),
        }
    }
}

pub struct DetectionService {
    store: Arc<dyn JobStore>,
    images: ImageStore,
    detector: Arc<Detector>,
    remote: RemoteCamera,
    max_upload_bytes: usize,
}

impl DetectionService {
    pub fn new(store: Arc<dyn JobStore>, images: ImageStore, detector: Arc<Detector>) -> Self {
        Self {
            store,
            images,
            detector,
            remote: RemoteCamera::default(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn with_remote(mut self, remote: RemoteCamera) -> Self {
        self.remote = remote;
        self
    }

    pub fn with_max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = limit;
        self
    }

    pub fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn remote(&self) -> &RemoteCamera {
        &self.remote
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Store an uploaded image and create an `uploaded` job for it.
    pub fn upload(&self, filename: &str, bytes: &[u8]) -> Result<DetectionJob> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(Error::Validation("no file selected".into()));
        }
        let ext = allowed_extension(filename).ok_or_else(|| {
            Error::Validation(format!(
                "invalid file type; expected one of {}",
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })?;
        if bytes.is_empty() {
            return Err(Error::Validation("uploaded file is empty".into()));
        }
        if bytes.len() > self.max_upload_bytes {
            return Err(Error::Validation(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.max_upload_bytes
            )));
        }
        if image::guess_format(bytes).is_err() {
            return Err(Error::Validation("file is not a recognized image".into()));
        }

        let reference = self.images.save_bytes(Bucket::Uploads, "", &ext, bytes)?;
        let job = match self.store.insert(NewJob::uploaded(filename, reference.clone())) {
            Ok(job) => job,
            Err(err) => {
                self.discard(&[reference.as_str()]);
                return Err(err);
            }
        };
        log::info!("detection {} uploaded as {}", job.id, job.original_path);
        Ok(job)
    }

    /// Run the pipeline on an uploaded job.
    ///
    /// `Conflict` and `NotFound` leave the job untouched. Any failure after
    /// the job entered `processing` moves it to `failed` before the error is
    /// returned.
    pub fn run_detection(&self, id: JobId) -> Result<(DetectionJob, DetectionResult)> {
        let lease = ProcessingLease::acquire(self.store.as_ref(), id)?;
        match self.process(lease.job()) {
            Ok((outcome, result)) => {
                let result_path = outcome.result_path.clone();
                match lease.complete(outcome) {
                    Ok(job) => Ok((job, result)),
                    Err(err) => {
                        self.discard(&[result_path.as_str()]);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                if let Err(store_err) = lease.fail(&err.to_string()) {
                    log::error!("detection {} could not be marked failed: {}", id, store_err);
                }
                Err(err)
            }
        }
    }

    fn process(&self, job: &DetectionJob) -> Result<(JobOutcome, DetectionResult)> {
        let image = self.images.load_rgb(&job.original_path)?;
        let analysis = self.analyze(&image)?;
        let result_path = self
            .images
            .save_jpeg(Bucket::Results, "result_", &analysis.annotated)?;
        let outcome =
            JobOutcome::from_result(&analysis.result, result_path, analysis.processing_time);
        Ok((outcome, analysis.result))
    }

    pub fn analyze(&self, image: &RgbImage) -> Result<Analysis> {
        let started = Instant::now();
        let result = self.detector.infer(image)?;
        let annotated = annotate(image, &result);
        Ok(Analysis {
            result,
            annotated,
            processing_time: started.elapsed(),
        })
    }

    /// One-shot detection on an encoded frame. Nothing is persisted.
    pub fn detect_frame(&self, bytes: &[u8]) -> Result<Analysis> {
        let image = decode_image(bytes)?;
        self.analyze(&image)
    }

    /// Persist already-analysed rasters as a `completed` job.
    pub fn record_completed(
        &self,
        raw: &RgbImage,
        analysis: &Analysis,
        method: CaptureMethod,
        origin: Option<&str>,
    ) -> Result<DetectionJob> {
        let original_path = self.images.save_jpeg(Bucket::Captures, "capture_", raw)?;
        let result_path = match self
            .images
            .save_jpeg(Bucket::Results, "result_", &analysis.annotated)
        {
            Ok(path) => path,
            Err(err) => {
                self.discard(&[original_path.as_str()]);
                return Err(err);
            }
        };
        let filename = original_path
            .rsplit('/')
            .next()
            .unwrap_or(&original_path)
            .to_string();
        let outcome = JobOutcome::from_result(
            &analysis.result,
            result_path.clone(),
            analysis.processing_time,
        );
        let mut new = NewJob::completed(filename, original_path.clone(), method, outcome);
        if let Some(origin) = origin {
            new = new.with_origin(origin);
        }
        let job = match self.store.insert(new) {
            Ok(job) => job,
            Err(err) => {
                self.discard(&[original_path.as_str(), result_path.as_str()]);
                return Err(err);
            }
        };
        log::info!(
            "detection {} recorded from {} with {} objects",
            job.id,
            method,
            job.detections_count
        );
        Ok(job)
    }

    /// Pull one frame from the remote camera and record it.
    ///
    /// No job exists until the frame has been fetched and analysed, so remote
    /// failures never leave a record behind.
    pub fn capture_direct(&self, address: Option<&str>) -> Result<(DetectionJob, Analysis)> {
        let frame = self.remote.fetch_frame(address).map_err(|err| {
            log::warn!("direct capture failed: {}", err);
            err
        })?;
        let image = decode_image(&frame.bytes).map_err(|e| {
            Error::RemoteSource(format!(
                "camera at {} sent an unreadable frame: {}",
                frame.address, e
            ))
        })?;
        let analysis = self.analyze(&image)?;
        let job = self.record_completed(
            &image,
            &analysis,
            CaptureMethod::DirectCapture,
            Some(&frame.address),
        )?;
        Ok((job, analysis))
    }

    /// Remove images written for a job that was never recorded.
    fn discard(&self, references: &[&str]) {
        for reference in references {
            if let Err(err) = self.images.remove(reference) {
                log::warn!("could not remove orphaned image {}: {}", reference, err);
            }
        }
    }

    pub fn get(&self, id: JobId) -> Result<DetectionJob> {
        self.store.get(id)
    }

    pub fn original_image(&self, id: JobId) -> Result<(DetectionJob, Vec<u8>)> {
        let job = self.store.get(id)?;
        let bytes = self.images.read(&job.original_path)?;
        Ok((job, bytes))
    }

    pub fn result_image(&self, id: JobId) -> Result<(DetectionJob, Vec<u8>)> {
        let job = self.store.get(id)?;
        let reference = job
            .result_path
            .clone()
            .ok_or_else(|| Error::NotFound(format!("detection {} has no result image", id)))?;
        let bytes = self.images.read(&reference)?;
        Ok((job, bytes))
    }
}
