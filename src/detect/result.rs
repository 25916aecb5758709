use serde::{Deserialize, Serialize};

/// Raw class index to label taxonomy for roast levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoastClass {
    GreenBean,
    LightRoast,
    MediumRoast,
    DarkRoast,
}

impl RoastClass {
    pub const ALL: [RoastClass; 4] = [
        RoastClass::GreenBean,
        RoastClass::LightRoast,
        RoastClass::MediumRoast,
        RoastClass::DarkRoast,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.label() == label)
    }

    pub fn label(self) -> &'static str {
        match self {
            RoastClass::GreenBean => "green_bean",
            RoastClass::LightRoast => "light_roast",
            RoastClass::MediumRoast => "medium_roast",
            RoastClass::DarkRoast => "dark_roast",
        }
    }
}

/// Label for a raw model class index. Unknown indices get `class_<n>`.
pub fn label_for_index(index: usize) -> String {
    match RoastClass::from_index(index) {
        Some(class) => class.label().to_string(),
        None => format!("class_{}", index),
    }
}

/// Axis-aligned box in source-image pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width as f32 * self.height as f32
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let intersection = (x2 - x1) as f32 * (y2 - y1) as f32;
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Output of one inference call.
///
/// Always carries every field, even when nothing was detected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub objects: Vec<DetectedObject>,
    /// Produced by the fallback generator rather than a trained model.
    pub synthetic: bool,
}

impl DetectionResult {
    pub fn count(&self) -> usize {
        self.objects.len()
    }

    pub fn confidence_scores(&self) -> Vec<f32> {
        self.objects.iter().map(|o| o.confidence).collect()
    }

    pub fn classes(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.label.clone()).collect()
    }
}
