use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use stockscan_contracts::detection::Detection;

/// Widest image sent to the vision model; larger captures are downscaled.
pub const MAX_UPLOAD_WIDTH: u32 = 512;

const JPEG_QUALITY: u8 = 90;

/// Encoded image bytes ready for an `inlineData` part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl ImagePayload {
    pub fn to_inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }

    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }
}

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

/// Downscales to `max_width` keeping the aspect ratio, flattens alpha, and encodes JPEG.
pub fn prepare_image(image: &DynamicImage, max_width: u32) -> Result<ImagePayload> {
    let resized = if image.width() > max_width && max_width > 0 {
        let height = ((image.height() as f64) * (max_width as f64) / (image.width() as f64))
            .round()
            .max(1.0) as u32;
        image.resize_exact(max_width, height, FilterType::Triangle)
    } else {
        image.clone()
    };
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("JPEG encode failed")?;
    Ok(ImagePayload {
        mime_type: "image/jpeg".to_string(),
        bytes,
    })
}

/// Crops the detection's box, clamped to the image; `None` when nothing remains.
pub fn crop_detection(image: &DynamicImage, detection: &Detection) -> Option<DynamicImage> {
    let (left, top, right, bottom) = clamped_box(image.width(), image.height(), detection.bbox)?;
    Some(image.crop_imm(left, top, right - left, bottom - top))
}

/// Pixel box `(left, top, right, bottom)`, right and bottom exclusive, covering `bbox`
/// inside a `width` x `height` image.
fn clamped_box(width: u32, height: u32, bbox: [f32; 4]) -> Option<(u32, u32, u32, u32)> {
    let (max_x, max_y) = (width as f32, height as f32);
    let [x_min, y_min, x_max, y_max] = bbox;
    let left = x_min.clamp(0.0, max_x).floor();
    let top = y_min.clamp(0.0, max_y).floor();
    let right = x_max.clamp(0.0, max_x).ceil();
    let bottom = y_max.clamp(0.0, max_y).ceil();
    if right - left < 1.0 || bottom - top < 1.0 {
        return None;
    }
    Some((left as u32, top as u32, right as u32, bottom as u32))
}

const BOX_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const HIGHLIGHT_COLOR: Rgb<u8> = Rgb([230, 0, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const OUTLINE_WIDTH: u32 = 2;
const TAB_HEIGHT: u32 = 14;
const TAB_CHAR_WIDTH: u32 = 7;
const LABEL_FONT_SIZE: f32 = 12.0;

/// Draws detection boxes and label tabs onto a copy of an image.
///
/// Label text needs a font; without one the tabs are drawn empty.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    /// Loads a TrueType/OpenType font for the label text.
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read label font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|err| anyhow!("invalid label font {}: {err}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    /// Boxes whose label matches `highlight` are drawn red, the rest green. Each box gets
    /// a filled tab at its top-left corner, as wide as the label, sitting above the box or
    /// inside it when the box touches the top edge. Boxes outside the image are skipped.
    pub fn annotate(
        &self,
        image: &DynamicImage,
        detections: &[Detection],
        highlight: Option<&str>,
    ) -> RgbImage {
        let mut canvas = image.to_rgb8();
        let (width, height) = canvas.dimensions();
        for detection in detections {
            let Some((left, top, right, bottom)) = clamped_box(width, height, detection.bbox)
            else {
                continue;
            };
            let color = if highlight.is_some_and(|query| detection.matches_query(query)) {
                HIGHLIGHT_COLOR
            } else {
                BOX_COLOR
            };
            for inset in 0..OUTLINE_WIDTH {
                let (box_width, box_height) = (right - left, bottom - top);
                if box_width <= inset * 2 || box_height <= inset * 2 {
                    break;
                }
                let rect = Rect::at((left + inset) as i32, (top + inset) as i32)
                    .of_size(box_width - inset * 2, box_height - inset * 2);
                draw_hollow_rect_mut(&mut canvas, rect, color);
            }

            let chars = detection.label.chars().count() as u32;
            let tab_width = (chars * TAB_CHAR_WIDTH + 4).min(width - left);
            let tab_top = if top >= TAB_HEIGHT { top - TAB_HEIGHT } else { top };
            let tab_height = TAB_HEIGHT.min(height - tab_top);
            let tab = Rect::at(left as i32, tab_top as i32).of_size(tab_width, tab_height);
            draw_filled_rect_mut(&mut canvas, tab, color);
            if let Some(font) = &self.font {
                draw_text_mut(
                    &mut canvas,
                    TEXT_COLOR,
                    left as i32 + 2,
                    tab_top as i32 + 1,
                    PxScale::from(LABEL_FONT_SIZE),
                    font,
                    &detection.label,
                );
            }
        }
        canvas
    }
}

/// [`Annotator::annotate`] without label text.
pub fn annotate_detections(
    image: &DynamicImage,
    detections: &[Detection],
    highlight: Option<&str>,
) -> RgbImage {
    Annotator::default().annotate(image, detections, highlight)
}

/// Writes an annotated image; the format follows the file extension.
pub fn save_annotated(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("failed to write annotated image {}", path.display()))
}

#[cfg(test)]
mod tests {
    use image::{DynamicImage, Rgb, RgbImage};
    use stockscan_contracts::detection::Detection;

    use super::{
        annotate_detections, crop_detection, prepare_image, save_annotated, Annotator,
        BOX_COLOR, HIGHLIGHT_COLOR, MAX_UPLOAD_WIDTH,
    };

    fn solid(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 30, 30])))
    }

    fn detection(bbox: [f32; 4]) -> Detection {
        labelled("Taza", bbox)
    }

    fn labelled(label: &str, bbox: [f32; 4]) -> Detection {
        Detection {
            label: label.to_string(),
            confidence: 0.9,
            bbox,
        }
    }

    #[test]
    fn prepare_image_downscales_wide_captures() -> anyhow::Result<()> {
        let payload = prepare_image(&solid(1024, 768), MAX_UPLOAD_WIDTH)?;
        assert_eq!(payload.mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&payload.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (512, 384));

        let small = prepare_image(&solid(300, 200), MAX_UPLOAD_WIDTH)?;
        let decoded = image::load_from_memory(&small.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (300, 200));
        Ok(())
    }

    #[test]
    fn inline_part_and_digest_are_stable() -> anyhow::Result<()> {
        let payload = prepare_image(&solid(32, 32), MAX_UPLOAD_WIDTH)?;
        let part = payload.to_inline_part();
        assert_eq!(part["inlineData"]["mimeType"], "image/jpeg");
        assert!(!part["inlineData"]["data"].as_str().unwrap_or("").is_empty());
        assert_eq!(payload.sha256_hex(), payload.clone().sha256_hex());
        assert_eq!(payload.sha256_hex().len(), 64);
        Ok(())
    }

    #[test]
    fn crop_clamps_boxes_to_the_image() {
        let image = solid(100, 80);
        let inside = crop_detection(&image, &detection([10.0, 20.0, 60.0, 50.0]))
            .map(|crop| (crop.width(), crop.height()));
        assert_eq!(inside, Some((50, 30)));

        let overhanging = crop_detection(&image, &detection([-20.0, 70.0, 150.0, 200.0]))
            .map(|crop| (crop.width(), crop.height()));
        assert_eq!(overhanging, Some((100, 10)));

        assert!(crop_detection(&image, &detection([120.0, 10.0, 140.0, 30.0])).is_none());
        assert!(crop_detection(&image, &detection([40.0, 40.0, 40.0, 60.0])).is_none());
    }

    #[test]
    fn annotation_outlines_boxes_and_highlights_matches() -> anyhow::Result<()> {
        let white = Rgb([255, 255, 255]);
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 80, white));
        let detections = vec![
            labelled("Taza", [10.0, 20.0, 60.0, 50.0]),
            labelled("Teclado", [70.0, 40.0, 95.0, 75.0]),
            labelled("Fuera", [150.0, 150.0, 160.0, 160.0]),
        ];

        let annotated = annotate_detections(&image, &detections, Some(" TAZA "));
        assert_eq!(annotated.dimensions(), (100, 80));
        assert_eq!(*annotated.get_pixel(10, 35), HIGHLIGHT_COLOR);
        assert_eq!(*annotated.get_pixel(59, 35), HIGHLIGHT_COLOR);
        assert_eq!(*annotated.get_pixel(35, 20), HIGHLIGHT_COLOR);
        assert_eq!(*annotated.get_pixel(35, 49), HIGHLIGHT_COLOR);
        assert_eq!(*annotated.get_pixel(12, 15), HIGHLIGHT_COLOR);
        assert_eq!(*annotated.get_pixel(35, 35), white);
        assert_eq!(*annotated.get_pixel(70, 60), BOX_COLOR);
        assert_eq!(*annotated.get_pixel(82, 36), BOX_COLOR);
        assert_eq!(*annotated.get_pixel(82, 60), white);

        let plain = annotate_detections(&image, &detections, None);
        assert_eq!(*plain.get_pixel(10, 35), BOX_COLOR);

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("annotated.png");
        save_annotated(&annotated, &path)?;
        let reloaded = image::open(&path)?.to_rgb8();
        assert_eq!(*reloaded.get_pixel(10, 35), HIGHLIGHT_COLOR);
        Ok(())
    }

    #[test]
    fn unreadable_label_font_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("font.ttf");
        assert!(Annotator::with_font_file(&path).is_err());
        std::fs::write(&path, b"not a font")?;
        assert!(Annotator::with_font_file(&path).is_err());
        Ok(())
    }

    #[test]
    fn label_tab_moves_inside_boxes_at_the_top_edge() {
        let white = Rgb([255, 255, 255]);
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 40, white));
        let boxes = [labelled("Caja", [5.0, 0.0, 50.0, 30.0])];
        let annotated = annotate_detections(&image, &boxes, None);
        assert_eq!(*annotated.get_pixel(15, 5), BOX_COLOR);
        assert_eq!(*annotated.get_pixel(15, 20), white);
    }
}
