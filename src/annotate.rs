//! Overlay drawing for detection results.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::{BoundingBox, DetectionResult, RoastClass};
use crate::error::Result;
use crate::font::{draw_text, text_size};

const BOX_THICKNESS: u32 = 3;
const TEXT_SCALE: u32 = 2;
const TAG_PADDING: u32 = 2;
const COUNT_ANCHOR: (i64, i64) = (10, 10);

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const COUNT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const FALLBACK_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Stable box color for a class label.
pub fn color_for(label: &str) -> Rgb<u8> {
    match RoastClass::from_label(label) {
        Some(RoastClass::GreenBean) => Rgb([0, 255, 0]),
        Some(RoastClass::LightRoast) => Rgb([255, 165, 0]),
        Some(RoastClass::MediumRoast) => Rgb([255, 0, 0]),
        Some(RoastClass::DarkRoast) => Rgb([128, 0, 128]),
        None => FALLBACK_COLOR,
    }
}

pub fn tag_text(label: &str, confidence: f32) -> String {
    format!("{}: {:.2}", label, confidence)
}

/// Draw boxes, tags and the total count onto a copy of `image`.
pub fn annotate(image: &RgbImage, result: &DetectionResult) -> RgbImage {
    let mut out = image.clone();
    for object in &result.objects {
        let color = color_for(&object.label);
        draw_box(&mut out, &object.bbox, color);
        draw_tag(
            &mut out,
            &object.bbox,
            &tag_text(&object.label, object.confidence),
            color,
        );
    }
    draw_text(
        &mut out,
        COUNT_ANCHOR.0,
        COUNT_ANCHOR.1,
        &format!("Total Detections: {}", result.count()),
        TEXT_SCALE,
        COUNT_COLOR,
    );
    out
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    for inset in 0..BOX_THICKNESS {
        let Some(width) = bbox.width.checked_sub(2 * inset).filter(|w| *w > 0) else {
            break;
        };
        let Some(height) = bbox.height.checked_sub(2 * inset).filter(|h| *h > 0) else {
            break;
        };
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(width, height);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Tag sits above the box, or just inside its top edge when there is no room
/// above. It is shifted left to stay inside the image.
fn draw_tag(image: &mut RgbImage, bbox: &BoundingBox, text: &str, color: Rgb<u8>) {
    let (text_w, text_h) = text_size(text, TEXT_SCALE);
    let tag_w = (text_w + 2 * TAG_PADDING).min(image.width());
    let tag_h = (text_h + 2 * TAG_PADDING).min(image.height());
    if tag_w == 0 || tag_h == 0 {
        return;
    }

    let tag_y = if bbox.y >= tag_h { bbox.y - tag_h } else { bbox.y };
    let tag_y = tag_y.min(image.height() - tag_h);
    let tag_x = bbox.x.min(image.width() - tag_w);

    draw_filled_rect_mut(
        image,
        Rect::at(tag_x as i32, tag_y as i32).of_size(tag_w, tag_h),
        color,
    );
    draw_text(
        image,
        (tag_x + TAG_PADDING) as i64,
        (tag_y + TAG_PADDING) as i64,
        text,
        TEXT_SCALE,
        TEXT_COLOR,
    );
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        encoder.encode_image(image)?;
    }
    Ok(buf.into_inner())
}

/// Base64 JPEG for embedding frames in JSON responses.
pub fn encode_base64_jpeg(image: &RgbImage, quality: u8) -> Result<String> {
    Ok(STANDARD.encode(encode_jpeg(image, quality)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectedObject;

    fn object(label: &str, confidence: f32, bbox: BoundingBox) -> DetectedObject {
        DetectedObject {
            label: label.to_string(),
            confidence,
            bbox,
        }
    }

    #[test]
    fn zero_detections_still_draw_the_count() {
        let image = RgbImage::new(200, 200);
        let out = annotate(&image, &DetectionResult::default());
        assert_eq!(out.dimensions(), (200, 200));
        assert!(out.pixels().any(|p| *p == COUNT_COLOR));
        assert!(image.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn boxes_use_class_colors() {
        let image = RgbImage::new(200, 200);
        let result = DetectionResult {
            objects: vec![object(
                "dark_roast",
                0.93,
                BoundingBox { x: 100, y: 100, width: 60, height: 60 },
            )],
            synthetic: false,
        };
        let out = annotate(&image, &result);
        let purple = Rgb([128, 0, 128]);
        assert_eq!(*out.get_pixel(100, 130), purple);
        assert_eq!(*out.get_pixel(102, 130), purple);
        assert_eq!(*out.get_pixel(103, 130), Rgb([0, 0, 0]));
        // tag sits above the box
        assert_eq!(*out.get_pixel(101, 99), purple);
    }

    #[test]
    fn tag_moves_inside_near_the_top_edge() {
        let image = RgbImage::new(120, 120);
        let result = DetectionResult {
            objects: vec![object(
                "mystery",
                0.5,
                BoundingBox { x: 90, y: 0, width: 30, height: 40 },
            )],
            synthetic: false,
        };
        let out = annotate(&image, &result);
        // fallback color fills the tag at the top of the box, shifted left
        assert_eq!(*out.get_pixel(119, 1), FALLBACK_COLOR);
        assert_eq!(color_for("mystery"), FALLBACK_COLOR);
    }

    #[test]
    fn annotation_is_deterministic() {
        let image = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let result = DetectionResult {
            objects: vec![object(
                "light_roast",
                0.81,
                BoundingBox { x: 5, y: 20, width: 20, height: 20 },
            )],
            synthetic: false,
        };
        assert_eq!(annotate(&image, &result), annotate(&image, &result));
    }

    #[test]
    fn tag_text_has_two_decimals() {
        assert_eq!(tag_text("light_roast", 0.8123), "light_roast: 0.81");
    }

    #[test]
    fn jpeg_helpers_produce_decodable_output() {
        let image = RgbImage::new(16, 16);
        let bytes = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let encoded = encode_base64_jpeg(&image, 80).unwrap();
        assert_eq!(STANDARD.decode(encoded).unwrap(), bytes);
    }
}
