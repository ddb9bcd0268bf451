use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;
use stockscan_contracts::detection::Detection;

/// Label given to the single region produced when no detector output is available.
pub const FULL_FRAME_LABEL: &str = "full_frame";

/// Black-box object detector: one image in, labelled regions out.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Treats the whole image as one region with full confidence.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFrameDetector;

impl Detector for FullFrameDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        Ok(vec![Detection {
            label: FULL_FRAME_LABEL.to_string(),
            confidence: 1.0,
            bbox: [0.0, 0.0, image.width() as f32, image.height() as f32],
        }])
    }
}

/// Replays detections recorded by an external detector run, stored as a JSON array.
#[derive(Debug, Clone)]
pub struct FixtureDetector {
    path: PathBuf,
    detections: Vec<Detection>,
}

impl FixtureDetector {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading detections {}", path.display()))?;
        let detections: Vec<Detection> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid detections JSON in {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            detections,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Detector for FixtureDetector {
    fn detect(&self, _image: &DynamicImage) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
}
