use anyhow::Result;

/// Unfiltered model output for one object, in source-image pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub class_index: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Detector backend trait.
///
/// Backends only produce raw candidates. Confidence filtering, overlap
/// suppression, clamping and labelling belong to [`crate::Detector`], so every
/// backend gets the same output contract.
///
/// Backends never touch job state or persistence.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// True when output is synthesized rather than produced by a trained model.
    fn is_synthetic(&self) -> bool {
        false
    }

    /// Run detection on a packed RGB8 frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
