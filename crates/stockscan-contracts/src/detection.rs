use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One labelled region proposed by the object detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max] in pixels
}

impl Detection {
    pub fn top_left(&self) -> (f32, f32) {
        (self.bbox[0], self.bbox[1])
    }

    /// Whether the label contains `query`, ignoring case and surrounding whitespace.
    /// An empty query matches nothing.
    pub fn matches_query(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        !needle.is_empty() && self.label.to_lowercase().contains(&needle)
    }
}

pub fn filter_by_confidence(detections: Vec<Detection>, min_confidence: f32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|detection| detection.confidence >= min_confidence)
        .collect()
}

/// Count of detections per label, in first-seen order.
pub fn summarize_labels(detections: &[Detection]) -> IndexMap<String, usize> {
    let mut summary = IndexMap::new();
    for detection in detections {
        *summary.entry(detection.label.clone()).or_insert(0) += 1;
    }
    summary
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSearch {
    pub query: String,
    pub matches: Vec<Detection>,
}

impl DetectionSearch {
    pub fn count(&self) -> usize {
        self.matches.len()
    }

    pub fn locations(&self) -> Vec<(f32, f32)> {
        self.matches.iter().map(Detection::top_left).collect()
    }
}

/// Detections whose label contains `query`, ignoring case.
pub fn search_detections(detections: &[Detection], query: &str) -> DetectionSearch {
    let needle = query.trim().to_lowercase();
    let matches = if needle.is_empty() {
        Vec::new()
    } else {
        detections
            .iter()
            .filter(|detection| detection.matches_query(&needle))
            .cloned()
            .collect()
    };
    DetectionSearch {
        query: query.trim().to_string(),
        matches,
    }
}

pub fn format_summary(detections: &[Detection]) -> String {
    let mut text = String::from("Inventory summary:\n");
    for (label, count) in summarize_labels(detections) {
        text.push_str(&format!("- {label}: {count} unit(s)\n"));
    }
    text
}

pub fn format_search(search: &DetectionSearch) -> String {
    let mut text = format!(
        "Searching: '{}'\nFound: {}\n",
        search.query,
        search.count()
    );
    if search.count() > 0 {
        text.push_str("\nLocations (x, y):\n");
        for (idx, (x, y)) in search.locations().into_iter().enumerate() {
            text.push_str(&format!("- Item {}: ({x:.0}, {y:.0})\n", idx + 1));
        }
    }
    text
}
