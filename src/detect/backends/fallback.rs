use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::detect::backend::{DetectorBackend, RawDetection};
use crate::detect::result::RoastClass;

const MIN_OBJECTS: usize = 1;
const MAX_OBJECTS: usize = 4;
const MIN_CONFIDENCE: f32 = 0.7;
const MAX_CONFIDENCE: f32 = 0.95;
const MIN_SIDE: u32 = 50;
const MAX_SIDE: u32 = 200;

/// Synthetic backend used when no trained model is available.
///
/// Output is seeded from a hash of the pixels, so the same frame always yields
/// the same candidates. Results are flagged synthetic and must not be trusted
/// as real classifications.
#[derive(Default)]
pub struct FallbackBackend;

impl FallbackBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for FallbackBackend {
    fn name(&self) -> &'static str {
        "fallback"
    }

    fn is_synthetic(&self) -> bool {
        true
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot synthesize detections for an empty frame"));
        }

        let mut hasher = Sha256::new();
        hasher.update(width.to_le_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update(pixels);
        let seed: [u8; 32] = hasher.finalize().into();
        let mut rng = StdRng::from_seed(seed);

        let count = rng.gen_range(MIN_OBJECTS..=MAX_OBJECTS);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let class_index = rng.gen_range(0..RoastClass::ALL.len());
            let confidence = rng.gen_range(MIN_CONFIDENCE..=MAX_CONFIDENCE);

            let x1 = rng.gen_range(0..=width / 2);
            let y1 = rng.gen_range(0..=height / 2);
            let w = side(&mut rng, width - x1);
            let h = side(&mut rng, height - y1);

            out.push(RawDetection {
                class_index,
                confidence,
                x1: x1 as f32,
                y1: y1 as f32,
                x2: (x1 + w) as f32,
                y2: (y1 + h) as f32,
            });
        }
        Ok(out)
    }
}

/// Random side length that never leaves `room` pixels.
fn side(rng: &mut StdRng, room: u32) -> u32 {
    let max = MAX_SIDE.min(room).max(1);
    let min = MIN_SIDE.min(max);
    rng.gen_range(min..=max)
}
