mod adapter;
mod backend;
mod backends;
mod result;

pub use adapter::{Detector, DetectorSettings, DEFAULT_IOU_THRESHOLD, DEFAULT_MIN_CONFIDENCE};
pub use backend::{DetectorBackend, RawDetection};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use backends::{FallbackBackend, ScriptedBackend};
pub use result::{label_for_index, BoundingBox, DetectedObject, DetectionResult, RoastClass};
