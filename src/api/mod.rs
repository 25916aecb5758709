//! Blocking HTTP API under `/api`.
//!
//! One listener thread accepts connections and hands each to its own worker
//! thread. Responses are JSON (`success: true` or `error: <message>`) except
//! for raw image downloads.

mod http;

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::annotate::{encode_base64_jpeg, encode_jpeg};
use crate::detect::DetectionResult;
use crate::error::{Error, ErrorKind};
use crate::images::content_type_for;
use crate::job::{DetectionJob, JobId, JobStatus};
use crate::live::{LiveStage, LIVE_JPEG_QUALITY};
use crate::pipeline::{Analysis, DetectionService, DEFAULT_MAX_UPLOAD_BYTES};

use self::http::{
    parse_multipart, read_request, write_json_response, write_response, HttpRequest, ReadError,
};

/// Room for multipart framing on top of the raw upload limit.
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub display_offset: FixedOffset,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            default_page_size: 10,
            max_page_size: 100,
            display_offset: Utc.fix(),
        }
    }
}

/// Shared state handed to every request worker.
pub struct ApiState {
    pub service: DetectionService,
    pub live: LiveStage,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: Arc<ApiState>) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = Arc::new(self.cfg);
        let state = self.state;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });
        log::info!("detection api listening on {}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    state: Arc<ApiState>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let cfg = Arc::clone(&cfg);
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &cfg, &state) {
                        log::warn!("request from {} failed: {}", peer, err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// A fully formed response, written after routing.
enum Reply {
    Json(u16, Value),
    Bytes(&'static str, Vec<u8>),
    NoContent,
}

impl Reply {
    fn ok(body: Value) -> Self {
        Reply::Json(200, body)
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Reply::Json(status, json!({ "error": message.into() }))
    }

    fn from_error(err: &Error) -> Self {
        Reply::error(err.http_status(), err.to_string())
    }
}

fn handle_connection(mut stream: TcpStream, cfg: &ApiConfig, state: &ApiState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let max_body = cfg.max_upload_bytes + BODY_OVERHEAD_BYTES;
    let reply = match read_request(&mut stream, max_body) {
        Ok(request) => route(&request, cfg, state),
        Err(ReadError::TooLarge(len)) => Reply::error(
            413,
            format!("request body of {} bytes exceeds the upload limit", len),
        ),
        Err(ReadError::Malformed(reason)) => Reply::error(400, reason),
        Err(ReadError::Io(err)) => return Err(err.into()),
    };
    match reply {
        Reply::Json(status, body) => write_json_response(&mut stream, status, &body),
        Reply::Bytes(content_type, bytes) => write_response(&mut stream, 200, content_type, &bytes),
        Reply::NoContent => write_response(&mut stream, 204, "text/plain", b""),
    }
}

fn route(request: &HttpRequest, cfg: &ApiConfig, state: &ApiState) -> Reply {
    if request.method == "OPTIONS" {
        return Reply::NoContent;
    }
    let Some(rest) = request.path.strip_prefix("/api/") else {
        return Reply::error(404, "not found");
    };
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    let method = request.method.as_str();

    let outcome = match (method, segments.as_slice()) {
        ("GET", ["health"]) => Ok(health(state)),
        ("POST", ["upload"]) => upload(request, cfg, state),
        ("POST", ["detect", "frame"]) => detect_frame(request, state),
        ("POST", ["detect", id]) => run_detection(id, cfg, state),
        ("GET", ["detections"]) => list_detections(request, cfg, state),
        ("GET", ["detection", id]) => get_detection(id, cfg, state),
        ("GET", ["detection", id, "image"]) => original_image(id, state),
        ("GET", ["detection", id, "result"]) => result_image(id, state),
        ("GET", ["stats"]) => stats(state),
        ("POST", ["live-stream"]) => live_ingest(request, state),
        ("GET", ["live-stream", "latest"]) => live_latest(cfg, state),
        ("GET", ["live-stream", "processed-image"]) => live_processed_image(state),
        ("POST", ["capture", "live-stream"]) => capture_live(cfg, state),
        ("POST", ["capture", "raspi-direct"]) => capture_direct(request, cfg, state),
        (_, path) if is_known_path(path) => return Reply::error(405, "method not allowed"),
        _ => return Reply::error(404, "not found"),
    };
    outcome.unwrap_or_else(|err| Reply::from_error(&err))
}

fn is_known_path(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["upload"]
            | ["detect", _]
            | ["detections"]
            | ["detection", _]
            | ["detection", _, "image" | "result"]
            | ["stats"]
            | ["live-stream"]
            | ["live-stream", "latest" | "processed-image"]
            | ["capture", "live-stream" | "raspi-direct"]
    )
}

fn health(state: &ApiState) -> Reply {
    let detector = state.service.detector();
    Reply::ok(json!({
        "status": "healthy",
        "message": "roast detection service is running",
        "detector": detector.backend_name(),
        "synthetic": detector.is_fallback(),
    }))
}

fn upload(request: &HttpRequest, cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let (filename, bytes) = image_from_request(request, "No file uploaded")?;
    let filename =
        filename.ok_or_else(|| Error::Validation("uploaded file has no filename".into()))?;
    let job = state.service.upload(&filename, &bytes)?;
    Ok(Reply::ok(json!({
        "success": true,
        "message": "File uploaded successfully",
        "detection": job_json(&job, cfg.display_offset),
    })))
}

fn run_detection(id: &str, cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let id: JobId = id.parse()?;
    match state.service.run_detection(id) {
        Ok((job, result)) => Ok(Reply::ok(json!({
            "success": true,
            "message": "Detection completed successfully",
            "detection": job_json(&job, cfg.display_offset),
            "results": result_json(&result),
        }))),
        Err(err) => match err.kind() {
            ErrorKind::Conflict => match state.service.get(id) {
                Ok(job) if job.status == JobStatus::Processing => {
                    Ok(Reply::error(409, "Detection already in progress"))
                }
                _ => Ok(Reply::from_error(&err)),
            },
            ErrorKind::NotFound | ErrorKind::Validation => Err(err),
            _ => Ok(Reply::error(500, format!("Detection failed: {}", err))),
        },
    }
}

fn detect_frame(request: &HttpRequest, state: &ApiState) -> Result<Reply, Error> {
    let (_, bytes) = image_from_request(request, "No frame uploaded")?;
    let analysis = state.service.detect_frame(&bytes)?;
    let mut body = analysis_json(&analysis)?;
    body["success"] = json!(true);
    Ok(Reply::ok(body))
}

fn list_detections(request: &HttpRequest, cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let page = query_u32(request, "page")?.unwrap_or(1).max(1);
    let per_page = query_u32(request, "per_page")?
        .unwrap_or(cfg.default_page_size)
        .clamp(1, cfg.max_page_size);
    let page = state.service.store().list(page, per_page)?;
    let detections: Vec<Value> = page
        .items
        .iter()
        .map(|job| job_json(job, cfg.display_offset))
        .collect();
    Ok(Reply::ok(json!({
        "success": true,
        "detections": detections,
        "pagination": {
            "page": page.page,
            "per_page": page.per_page,
            "total": page.total,
            "pages": page.pages,
        },
    })))
}

fn get_detection(id: &str, cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let job = state.service.get(id.parse()?)?;
    Ok(Reply::ok(json!({
        "success": true,
        "detection": job_json(&job, cfg.display_offset),
    })))
}

fn original_image(id: &str, state: &ApiState) -> Result<Reply, Error> {
    let (job, bytes) = state.service.original_image(id.parse()?)?;
    Ok(Reply::Bytes(content_type_for(&job.original_path), bytes))
}

fn result_image(id: &str, state: &ApiState) -> Result<Reply, Error> {
    let (job, bytes) = state.service.result_image(id.parse()?)?;
    let reference = job.result_path.as_deref().unwrap_or_default();
    Ok(Reply::Bytes(content_type_for(reference), bytes))
}

fn stats(state: &ApiState) -> Result<Reply, Error> {
    let stats = state.service.store().stats()?;
    Ok(Reply::ok(json!({ "success": true, "stats": stats })))
}

fn live_ingest(request: &HttpRequest, state: &ApiState) -> Result<Reply, Error> {
    let (_, bytes) = image_from_request(request, "No frame received")?;
    let ingest = state.live.ingest(&state.service, &bytes)?;
    Ok(Reply::ok(json!({
        "success": true,
        "sequence": ingest.sequence,
        "detections": detections_json(&ingest.result),
        "total_detections": ingest.result.count(),
        "synthetic": ingest.result.synthetic,
        "processing_time": ingest.processing_time.as_secs_f64(),
        "annotated_image": ingest.annotated_base64,
    })))
}

fn live_latest(cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let entry = state.live.latest()?;
    let annotated = encode_base64_jpeg(entry.annotated(), LIVE_JPEG_QUALITY)?;
    Ok(Reply::ok(json!({
        "success": true,
        "sequence": entry.sequence(),
        "timestamp": render_time(entry.captured_at(), cfg.display_offset),
        "detections": detections_json(entry.result()),
        "total_detections": entry.result().count(),
        "synthetic": entry.result().synthetic,
        "processing_time": entry.processing_time().as_secs_f64(),
        "annotated_image": annotated,
    })))
}

fn live_processed_image(state: &ApiState) -> Result<Reply, Error> {
    let entry = state.live.latest()?;
    let bytes = encode_jpeg(entry.annotated(), LIVE_JPEG_QUALITY)?;
    Ok(Reply::Bytes("image/jpeg", bytes))
}

fn capture_live(cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let job = state.live.capture(&state.service)?;
    Ok(Reply::ok(json!({
        "success": true,
        "message": "Live stream frame captured",
        "detection": job_json(&job, cfg.display_offset),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct DirectCaptureRequest {
    raspi_ip: Option<String>,
}

fn capture_direct(request: &HttpRequest, cfg: &ApiConfig, state: &ApiState) -> Result<Reply, Error> {
    let body: DirectCaptureRequest = if request.body.iter().all(u8::is_ascii_whitespace) {
        DirectCaptureRequest::default()
    } else {
        serde_json::from_slice(&request.body)
            .map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))?
    };
    let (job, analysis) = state.service.capture_direct(body.raspi_ip.as_deref())?;
    Ok(Reply::ok(json!({
        "success": true,
        "message": "Frame captured from remote camera",
        "detection": job_json(&job, cfg.display_offset),
        "results": result_json(&analysis.result),
    })))
}

/// Image bytes from a multipart `image` (or `frame`) field, or from a raw
/// `image/*` body.
fn image_from_request(request: &HttpRequest, missing: &str) -> Result<(Option<String>, Vec<u8>), Error> {
    let content_type = request.content_type().to_ascii_lowercase();
    if content_type.starts_with("multipart/form-data") {
        let parts = parse_multipart(request.content_type(), &request.body)
            .map_err(|e| Error::Validation(e.to_string()))?;
        let part = parts
            .into_iter()
            .find(|part| part.name == "image" || part.name == "frame")
            .ok_or_else(|| Error::Validation(missing.to_string()))?;
        return Ok((part.filename, part.data));
    }
    if content_type.starts_with("image/") && !request.body.is_empty() {
        let filename = request.header("x-filename").map(str::to_string);
        return Ok((filename, request.body.clone()));
    }
    Err(Error::Validation(missing.to_string()))
}

fn query_u32(request: &HttpRequest, key: &str) -> Result<Option<u32>, Error> {
    match request.query.get(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Validation(format!("{} must be a positive integer", key))),
        None => Ok(None),
    }
}

fn render_time(instant: DateTime<Utc>, offset: FixedOffset) -> String {
    instant.with_timezone(&offset).to_rfc3339()
}

fn job_json(job: &DetectionJob, offset: FixedOffset) -> Value {
    json!({
        "id": job.id,
        "filename": job.filename,
        "original_path": job.original_path,
        "result_path": job.result_path,
        "detections_count": job.detections_count,
        "confidence_scores": job.confidence_scores,
        "detection_classes": job.detection_classes,
        "processing_time": job.processing_time,
        "status": job.status,
        "capture_method": job.capture_method,
        "origin_address": job.origin_address,
        "failure_reason": job.failure_reason,
        "synthetic": job.synthetic,
        "created_at": render_time(job.created_at, offset),
        "updated_at": render_time(job.updated_at, offset),
    })
}

fn detections_json(result: &DetectionResult) -> Vec<Value> {
    result
        .objects
        .iter()
        .map(|object| {
            json!({
                "class": object.label,
                "confidence": object.confidence,
                "bbox": [
                    object.bbox.x,
                    object.bbox.y,
                    object.bbox.right(),
                    object.bbox.bottom(),
                ],
            })
        })
        .collect()
}

fn result_json(result: &DetectionResult) -> Value {
    json!({
        "detections": detections_json(result),
        "confidence_scores": result.confidence_scores(),
        "classes": result.classes(),
        "total_detections": result.count(),
        "synthetic": result.synthetic,
    })
}

fn analysis_json(analysis: &Analysis) -> Result<Value, Error> {
    let mut body = result_json(&analysis.result);
    body["processing_time"] = json!(analysis.processing_time.as_secs_f64());
    body["annotated_image"] = json!(encode_base64_jpeg(&analysis.annotated, LIVE_JPEG_QUALITY)?);
    Ok(body)
}
