use std::any::Any;
use std::cmp::Ordering;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use image::RgbImage;

use crate::detect::backend::{DetectorBackend, RawDetection};
use crate::detect::backends::FallbackBackend;
use crate::detect::result::{label_for_index, BoundingBox, DetectedObject, DetectionResult};
use crate::error::{Error, Result};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Post-processing thresholds applied to every backend's output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectorSettings {
    pub min_confidence: f32,
    /// Per-class overlap above which the weaker box is suppressed.
    pub iou_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

/// Thread-safe wrapper around a detector backend.
///
/// Backends are wrapped in a `Mutex` because `DetectorBackend::detect` takes
/// `&mut self`. The adapter owns the output contract: shape validation,
/// clamping, confidence filtering, per-class suppression and labelling.
pub struct Detector {
    backend: Option<Mutex<Box<dyn DetectorBackend>>>,
    backend_name: &'static str,
    synthetic: bool,
    settings: DetectorSettings,
}

impl Detector {
    pub fn new<B: DetectorBackend + 'static>(backend: B, settings: DetectorSettings) -> Self {
        let backend_name = backend.name();
        let synthetic = backend.is_synthetic();
        let backend: Box<dyn DetectorBackend> = Box::new(backend);
        Self {
            backend: Some(Mutex::new(backend)),
            backend_name,
            synthetic,
            settings,
        }
    }

    /// Synthetic detector for environments without a trained model.
    pub fn fallback(settings: DetectorSettings) -> Self {
        Self::new(FallbackBackend::new(), settings)
    }

    /// A detector with no backend at all. Every call reports
    /// `InferenceUnavailable`.
    pub fn unavailable(settings: DetectorSettings) -> Self {
        Self {
            backend: None,
            backend_name: "none",
            synthetic: false,
            settings,
        }
    }

    /// Build the detector described by configuration.
    ///
    /// Uses the ONNX backend when it is compiled in and the model file exists.
    /// Otherwise falls back to synthetic output, or to no backend at all when
    /// fallback is disallowed.
    pub fn from_config(
        model_path: Option<&Path>,
        input_size: u32,
        allow_fallback: bool,
        settings: DetectorSettings,
    ) -> Self {
        if let Some(path) = model_path {
            if path.exists() {
                match load_model_backend(path, input_size) {
                    Ok(mut backend) => {
                        if let Err(err) = backend.warm_up() {
                            log::warn!("detector warm-up failed: {}", err);
                        }
                        log::info!(
                            "loaded {} detector from {}",
                            backend.name(),
                            path.display()
                        );
                        return Self {
                            backend_name: backend.name(),
                            synthetic: backend.is_synthetic(),
                            backend: Some(Mutex::new(backend)),
                            settings,
                        };
                    }
                    Err(err) => log::error!("failed to load model {}: {}", path.display(), err),
                }
            } else {
                log::warn!("model file not found at {}", path.display());
            }
        }

        if allow_fallback {
            log::warn!("no trained model loaded; detector is producing synthetic results");
            Self::fallback(settings)
        } else {
            log::error!("no trained model loaded and fallback is disabled");
            Self::unavailable(settings)
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// True when results are synthesized rather than produced by a model.
    pub fn is_fallback(&self) -> bool {
        self.synthetic
    }

    pub fn settings(&self) -> DetectorSettings {
        self.settings
    }

    pub fn infer(&self, image: &RgbImage) -> Result<DetectionResult> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::Validation("image has zero dimensions".into()));
        }
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| Error::InferenceUnavailable("no detector backend loaded".into()))?;

        let raw = {
            // A backend holds no invariant a panic could break, so a
            // poisoned lock is still usable.
            let mut guard = backend.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                guard.detect(image.as_raw(), width, height)
            }));
            match outcome {
                Ok(detections) => detections.map_err(|e| {
                    Error::InferenceFailed(format!("{}: {:#}", self.backend_name, e))
                })?,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    log::error!("{} backend panicked: {}", self.backend_name, message);
                    return Err(Error::InferenceFailed(format!(
                        "{} backend panicked: {}",
                        self.backend_name, message
                    )));
                }
            }
        };

        let objects = postprocess(&raw, width, height, self.settings)?;
        Ok(DetectionResult {
            objects,
            synthetic: self.synthetic,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(feature = "backend-tract")]
fn load_model_backend(path: &Path, input_size: u32) -> anyhow::Result<Box<dyn DetectorBackend>> {
    let backend = crate::detect::backends::TractBackend::new(path, input_size, input_size)?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model_backend(_path: &Path, _input_size: u32) -> anyhow::Result<Box<dyn DetectorBackend>> {
    Err(anyhow::anyhow!(
        "built without the backend-tract feature; cannot load ONNX models"
    ))
}

/// Validate, clamp, filter, suppress and order raw backend output.
fn postprocess(
    raw: &[RawDetection],
    width: u32,
    height: u32,
    settings: DetectorSettings,
) -> Result<Vec<DetectedObject>> {
    let mut kept = Vec::with_capacity(raw.len());
    for det in raw {
        validate_shape(det)?;
        if det.confidence < settings.min_confidence {
            continue;
        }
        let Some(bbox) = clamp_box(det, width, height) else {
            log::debug!("dropping detection outside the frame: {:?}", det);
            continue;
        };
        kept.push(DetectedObject {
            label: label_for_index(det.class_index),
            confidence: det.confidence,
            bbox,
        });
    }

    kept.sort_by(order_objects);
    let mut suppressed = vec![false; kept.len()];
    for i in 0..kept.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..kept.len() {
            if suppressed[j] || kept[i].label != kept[j].label {
                continue;
            }
            if kept[i].bbox.iou(&kept[j].bbox) > settings.iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    Ok(kept
        .into_iter()
        .zip(suppressed)
        .filter_map(|(obj, gone)| (!gone).then_some(obj))
        .collect())
}

fn validate_shape(det: &RawDetection) -> Result<()> {
    let coords = [det.x1, det.y1, det.x2, det.y2];
    if !det.confidence.is_finite() || coords.iter().any(|v| !v.is_finite()) {
        return Err(Error::InferenceFailed(format!(
            "backend produced non-finite output: {:?}",
            det
        )));
    }
    if !(0.0..=1.0).contains(&det.confidence) {
        return Err(Error::InferenceFailed(format!(
            "confidence {} outside [0, 1]",
            det.confidence
        )));
    }
    if det.x2 < det.x1 || det.y2 < det.y1 {
        return Err(Error::InferenceFailed(format!(
            "box corners are inverted: {:?}",
            det
        )));
    }
    Ok(())
}

fn clamp_box(det: &RawDetection, width: u32, height: u32) -> Option<BoundingBox> {
    let x1 = det.x1.max(0.0).floor().min(width as f32) as u32;
    let y1 = det.y1.max(0.0).floor().min(height as f32) as u32;
    let x2 = det.x2.max(0.0).ceil().min(width as f32) as u32;
    let y2 = det.y2.max(0.0).ceil().min(height as f32) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(BoundingBox {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

/// Confidence descending, then left-to-right, then top-to-bottom.
fn order_objects(a: &DetectedObject, b: &DetectedObject) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then(a.bbox.x.cmp(&b.bbox.x))
        .then(a.bbox.y.cmp(&b.bbox.y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedBackend;
    use crate::error::ErrorKind;

    fn raw(class_index: usize, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> RawDetection {
        RawDetection {
            class_index,
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    fn frame() -> RgbImage {
        RgbImage::new(200, 200)
    }

    #[test]
    fn drops_low_confidence_objects() {
        let detector = Detector::new(
            ScriptedBackend::new(vec![
                raw(1, 0.49, 0.0, 0.0, 10.0, 10.0),
                raw(1, 0.5, 50.0, 50.0, 60.0, 60.0),
            ]),
            DetectorSettings::default(),
        );
        let result = detector.infer(&frame()).unwrap();
        assert_eq!(result.count(), 1);
        assert_eq!(result.objects[0].confidence, 0.5);
        assert!(!result.synthetic);
    }

    #[test]
    fn suppresses_overlaps_within_a_class_only() {
        let detector = Detector::new(
            ScriptedBackend::new(vec![
                raw(2, 0.9, 10.0, 10.0, 60.0, 60.0),
                raw(2, 0.8, 12.0, 12.0, 62.0, 62.0),
                raw(3, 0.7, 12.0, 12.0, 62.0, 62.0),
            ]),
            DetectorSettings::default(),
        );
        let result = detector.infer(&frame()).unwrap();
        assert_eq!(result.classes(), vec!["medium_roast", "dark_roast"]);
        assert_eq!(result.confidence_scores(), vec![0.9, 0.7]);
    }

    #[test]
    fn clamps_boxes_into_the_frame() {
        let detector = Detector::new(
            ScriptedBackend::new(vec![
                raw(0, 0.9, -20.0, 150.0, 40.0, 260.0),
                raw(0, 0.9, 300.0, 300.0, 320.0, 320.0),
            ]),
            DetectorSettings::default(),
        );
        let result = detector.infer(&frame()).unwrap();
        assert_eq!(result.count(), 1);
        let bbox = result.objects[0].bbox;
        assert_eq!(bbox, BoundingBox { x: 0, y: 150, width: 40, height: 50 });
    }

    #[test]
    fn malformed_output_is_inference_failure() {
        let detector = Detector::new(
            ScriptedBackend::new(vec![raw(0, f32::NAN, 0.0, 0.0, 1.0, 1.0)]),
            DetectorSettings::default(),
        );
        let err = detector.infer(&frame()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);

        let detector = Detector::new(
            ScriptedBackend::new(vec![raw(0, 0.9, 10.0, 10.0, 5.0, 5.0)]),
            DetectorSettings::default(),
        );
        assert_eq!(
            detector.infer(&frame()).unwrap_err().kind(),
            ErrorKind::InferenceFailed
        );
    }

    #[test]
    fn backend_errors_are_inference_failures() {
        let detector = Detector::new(
            ScriptedBackend::failing("tensor shape mismatch"),
            DetectorSettings::default(),
        );
        let err = detector.infer(&frame()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);
        assert!(err.to_string().contains("tensor shape mismatch"));
    }

    #[test]
    fn missing_backend_is_unavailable() {
        let detector = Detector::unavailable(DetectorSettings::default());
        let err = detector.infer(&frame()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceUnavailable);
    }

    #[test]
    fn empty_result_keeps_its_shape() {
        let detector = Detector::new(ScriptedBackend::new(vec![]), DetectorSettings::default());
        let result = detector.infer(&frame()).unwrap();
        assert_eq!(result.count(), 0);
        assert!(result.confidence_scores().is_empty());
        assert!(result.classes().is_empty());
    }

    #[test]
    fn fallback_is_flagged() {
        let detector = Detector::fallback(DetectorSettings::default());
        assert!(detector.is_fallback());
        let result = detector.infer(&frame()).unwrap();
        assert!(result.synthetic);
        assert!((1..=4).contains(&result.count()));
    }

    #[test]
    fn missing_model_file_falls_back_or_refuses() {
        let missing = Path::new("/nonexistent/roast.onnx");
        let detector = Detector::from_config(Some(missing), 640, true, DetectorSettings::default());
        assert!(detector.is_fallback());

        let detector =
            Detector::from_config(Some(missing), 640, false, DetectorSettings::default());
        assert_eq!(
            detector.infer(&frame()).unwrap_err().kind(),
            ErrorKind::InferenceUnavailable
        );
    }

    #[test]
    fn unknown_class_index_is_labelled() {
        let detector = Detector::new(
            ScriptedBackend::new(vec![raw(9, 0.8, 0.0, 0.0, 10.0, 10.0)]),
            DetectorSettings::default(),
        );
        let result = detector.infer(&frame()).unwrap();
        assert_eq!(result.classes(), vec!["class_9"]);
    }

    /// Panics on its first frame, then reports nothing.
    struct PanicsOnce {
        calls: usize,
    }

    impl DetectorBackend for PanicsOnce {
        fn name(&self) -> &'static str {
            "panics-once"
        }

        fn detect(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> anyhow::Result<Vec<RawDetection>> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("tensor shape mismatch");
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn backend_panic_is_a_failed_inference_and_detector_recovers() {
        let detector = Detector::new(PanicsOnce { calls: 0 }, DetectorSettings::default());

        let err = detector.infer(&frame()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailed);
        assert!(err.to_string().contains("tensor shape mismatch"));

        let result = detector.infer(&frame()).unwrap();
        assert_eq!(result.count(), 0);
    }
}
