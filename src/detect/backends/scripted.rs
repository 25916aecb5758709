use anyhow::{anyhow, Result};

use crate::detect::backend::{DetectorBackend, RawDetection};

/// Backend that replays a fixed candidate list on every frame.
///
/// Used for offline demos and for exercising the adapter contract with known
/// model output.
#[derive(Clone, Debug, Default)]
pub struct ScriptedBackend {
    detections: Vec<RawDetection>,
    fail_with: Option<String>,
}

impl ScriptedBackend {
    pub fn new(detections: Vec<RawDetection>) -> Self {
        Self {
            detections,
            fail_with: None,
        }
    }

    /// A backend whose every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            detections: Vec::new(),
            fail_with: Some(message.to_string()),
        }
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<RawDetection>> {
        if let Some(message) = &self.fail_with {
            return Err(anyhow!("{}", message));
        }
        Ok(self.detections.clone())
    }
}
