use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Result};
use image::DynamicImage;
use serde::Serialize;
use serde_json::{json, Map, Value};
use stockscan_contracts::attributes::{AnalysisOutcome, AttributeRecord};
use stockscan_contracts::detection::{filter_by_confidence, Detection};
use stockscan_contracts::inventory::{
    item_names, register_item, InventoryItem, InventoryStore, NewInventoryItem, StoreError,
};
use stockscan_contracts::journal::{ActivityJournal, ActivityKind, ActivityPayload};
use stockscan_contracts::matching::{
    match_attributes, MatchResult, RemoteVerdict, INVENTORY_EMPTY, NOT_FOUND,
};
use tracing::{debug, info, warn};

use crate::detector::Detector;
use crate::extraction::AttributeExtractionAdapter;
use crate::generation::GenerationResult;
use crate::imaging::{crop_detection, prepare_image, ImagePayload, MAX_UPLOAD_WIDTH};

/// How an identification ranks the inventory against an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchStrategy {
    /// Extract attributes, then rank names by lexical overlap.
    Local,
    /// Let the vision model pick a name from the inventory list.
    Remote,
    /// Remote ranking, falling back to the local matcher when it yields nothing usable.
    #[default]
    RemoteThenLocal,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::RemoteThenLocal => "remote-then-local",
        }
    }
}

impl FromStr for MatchStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "remote-then-local" | "auto" => Ok(Self::RemoteThenLocal),
            other => bail!(
                "unknown match strategy '{other}' (expected local, remote, remote-then-local)"
            ),
        }
    }
}

/// Long-lived handles shared by every command: the store and the optional journal.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn InventoryStore>,
    pub journal: Option<ActivityJournal>,
}

impl Services {
    pub fn new(store: Arc<dyn InventoryStore>, journal: Option<ActivityJournal>) -> Self {
        Self { store, journal }
    }

    /// Journal failures are logged and swallowed; they never fail the user action.
    pub fn record(&self, kind: ActivityKind, payload: ActivityPayload) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(err) = journal.record(kind, payload) {
            warn!(
                event = kind.as_str(),
                path = %journal.path().display(),
                error = %err,
                "activity journal write failed"
            );
        }
    }

    pub fn register(
        &self,
        item: NewInventoryItem,
        custom_id: Option<&str>,
    ) -> Result<InventoryItem, StoreError> {
        let created = register_item(self.store.as_ref(), item, custom_id)?;
        self.record(ActivityKind::ItemAdded, item_payload(&created));
        Ok(created)
    }

    pub fn update(
        &self,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<InventoryItem, StoreError> {
        let changed: Vec<Value> = fields.keys().cloned().map(Value::String).collect();
        let updated = self.store.update(id, fields)?;
        let mut payload = item_payload(&updated);
        payload.insert("fields".to_string(), Value::Array(changed));
        self.record(ActivityKind::ItemUpdated, payload);
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.store.delete(id)?;
        if removed {
            let mut payload = Map::new();
            payload.insert("id".to_string(), Value::String(id.to_string()));
            self.record(ActivityKind::ItemDeleted, payload);
        }
        Ok(removed)
    }
}

/// Outcome of identifying one image (or one detected region of it).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identification {
    pub result: MatchResult,
    #[serde(skip)]
    pub analysis: Option<AnalysisOutcome>,
    pub image_sha256: String,
    /// Attempt summaries of every model call made for this identification, in order.
    pub generation: Vec<Value>,
}

impl Identification {
    /// Attributes to store when the user registers the object as a new item.
    pub fn attributes(&self) -> Option<&AttributeRecord> {
        self.result
            .attributes
            .as_ref()
            .or_else(|| self.analysis.as_ref().and_then(AnalysisOutcome::primary))
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(&self.result).unwrap_or(Value::Null);
        if let Some(object) = value.as_object_mut() {
            object.insert("image_sha256".to_string(), json!(self.image_sha256));
            object.insert("generation".to_string(), Value::Array(self.generation.clone()));
            if let Some(error) = self.analysis.as_ref().and_then(AnalysisOutcome::to_error_record) {
                object.insert("analysis_error".to_string(), error);
            }
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionIdentification {
    pub detection: Detection,
    /// `None` when the detection box lies outside the image.
    pub identification: Option<Identification>,
}

/// Image-to-inventory orchestration: prepare, extract, rank, link, journal.
///
/// Every external call is blocking and runs in sequence on the caller's thread.
pub struct RecognitionPipeline {
    services: Services,
    extractor: AttributeExtractionAdapter,
    strategy: MatchStrategy,
    max_width: u32,
}

impl RecognitionPipeline {
    pub fn new(services: Services, extractor: AttributeExtractionAdapter) -> Self {
        Self {
            services,
            extractor,
            strategy: MatchStrategy::default(),
            max_width: MAX_UPLOAD_WIDTH,
        }
    }

    pub fn with_strategy(mut self, strategy: MatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Attribute extraction only, resolved to an [`AnalysisOutcome`].
    pub fn analyze(&self, image: &DynamicImage) -> Result<(AnalysisOutcome, String)> {
        let payload = prepare_image(image, self.max_width)?;
        let digest = payload.sha256_hex();
        let outcome = self.extract(&payload, &digest, &mut Vec::new());
        Ok((outcome, digest))
    }

    pub fn identify(&self, image: &DynamicImage) -> Result<Identification> {
        let items = self.services.store.get_all()?;
        let payload = prepare_image(image, self.max_width)?;
        Ok(self.identify_payload(&payload, &items))
    }

    /// Runs the detector, keeps regions at or above `min_confidence`, and identifies
    /// each crop in detection order.
    pub fn analyze_regions(
        &self,
        image: &DynamicImage,
        detector: &dyn Detector,
        min_confidence: f32,
    ) -> Result<Vec<RegionIdentification>> {
        let detections = filter_by_confidence(detector.detect(image)?, min_confidence);
        info!(regions = detections.len(), "detector regions kept");
        let items = self.services.store.get_all()?;
        let mut regions = Vec::with_capacity(detections.len());
        for detection in detections {
            let identification = match crop_detection(image, &detection) {
                Some(crop) => {
                    let payload = prepare_image(&crop, self.max_width)?;
                    Some(self.identify_payload(&payload, &items))
                }
                None => {
                    warn!(label = %detection.label, "detection box outside image; skipped");
                    None
                }
            };
            regions.push(RegionIdentification {
                detection,
                identification,
            });
        }
        Ok(regions)
    }

    /// Stores an object the matcher could not place, keeping its attributes as `analysis`.
    pub fn register_unmatched(
        &self,
        name: &str,
        attributes: Option<&AttributeRecord>,
        custom_id: Option<&str>,
        quantity: Option<u64>,
    ) -> Result<InventoryItem, StoreError> {
        let analysis = attributes.map(AttributeRecord::to_json).unwrap_or_default();
        let item = NewInventoryItem::named(name)
            .with_analysis(analysis)
            .with_quantity(quantity);
        self.services.register(item, custom_id)
    }

    fn extract(
        &self,
        payload: &ImagePayload,
        digest: &str,
        trail: &mut Vec<Value>,
    ) -> AnalysisOutcome {
        let (outcome, generation) = self.extractor.extract_outcome(payload);
        let mut entry = Map::new();
        entry.insert("image_sha256".to_string(), json!(digest));
        entry.insert("model".to_string(), json!(generation.model()));
        entry.insert("parsed".to_string(), json!(outcome.is_parsed()));
        entry.insert("records".to_string(), json!(outcome.records().len()));
        if let AnalysisOutcome::Unparseable { reason, .. } = &outcome {
            entry.insert("error".to_string(), json!(reason));
        }
        self.services.record(ActivityKind::AttributesExtracted, entry);
        trail.push(generation_step("attributes", &generation));
        outcome
    }

    fn identify_payload(&self, payload: &ImagePayload, items: &[InventoryItem]) -> Identification {
        let digest = payload.sha256_hex();
        let names = item_names(items);
        debug!(strategy = self.strategy.as_str(), candidates = names.len(), "identifying image");
        let mut trail = Vec::new();

        let (result, analysis) = match self.strategy {
            MatchStrategy::Local => {
                let analysis = self.extract(payload, &digest, &mut trail);
                (local_match(&analysis, &names), Some(analysis))
            }
            MatchStrategy::Remote => {
                let result = if names.is_empty() {
                    MatchResult::remote(
                        RemoteVerdict {
                            best_match: INVENTORY_EMPTY.to_string(),
                            reasoning: None,
                        },
                        None,
                    )
                } else {
                    self.remote_match(payload, &names, None, &mut trail).unwrap_or_else(|| {
                        MatchResult::remote(
                            RemoteVerdict {
                                best_match: NOT_FOUND.to_string(),
                                reasoning: Some(
                                    "remote identification returned no usable answer".to_string(),
                                ),
                            },
                            None,
                        )
                    })
                };
                (result, None)
            }
            MatchStrategy::RemoteThenLocal => {
                let analysis = self.extract(payload, &digest, &mut trail);
                let remote = if names.is_empty() {
                    None
                } else {
                    self.remote_match(payload, &names, analysis.primary().cloned(), &mut trail)
                };
                let result = remote.unwrap_or_else(|| local_match(&analysis, &names));
                (result, Some(analysis))
            }
        };

        let result = result.resolve_item(items);
        if result.ambiguous {
            warn!(name = %result.best_match, "several inventory items share the matched name");
        }
        let mut entry = Map::new();
        entry.insert("image_sha256".to_string(), json!(digest));
        entry.insert("strategy".to_string(), json!(self.strategy.as_str()));
        entry.insert("best_match".to_string(), json!(result.best_match));
        entry.insert("matched".to_string(), json!(result.is_match()));
        entry.insert("source".to_string(), json!(result.source));
        entry.insert("item_id".to_string(), json!(result.item_id));
        entry.insert("ambiguous".to_string(), json!(result.ambiguous));
        entry.insert("generation".to_string(), Value::Array(trail.clone()));
        self.services.record(ActivityKind::Identified, entry);

        Identification {
            result,
            analysis,
            image_sha256: digest,
            generation: trail,
        }
    }

    fn remote_match(
        &self,
        payload: &ImagePayload,
        names: &[String],
        attributes: Option<AttributeRecord>,
        trail: &mut Vec<Value>,
    ) -> Option<MatchResult> {
        let (verdict, generation) =
            self.extractor.identify_remote(payload, names, attributes.as_ref());
        trail.push(generation_step("identification", &generation));
        verdict.map(|verdict| MatchResult::remote(verdict, attributes))
    }
}

/// Per-call attempt summary tagged with the pipeline step that made the call.
fn generation_step(step: &str, result: &GenerationResult) -> Value {
    let mut summary = result.summary();
    if let Some(object) = summary.as_object_mut() {
        object.insert("step".to_string(), json!(step));
    }
    summary
}

fn local_match(analysis: &AnalysisOutcome, names: &[String]) -> MatchResult {
    let record = analysis.primary().cloned().unwrap_or_default();
    let outcome = match_attributes(&record, names);
    let attributes = analysis.is_parsed().then_some(record);
    MatchResult::local(&outcome, attributes)
}

fn item_payload(item: &InventoryItem) -> ActivityPayload {
    let mut payload = Map::new();
    payload.insert("id".to_string(), json!(item.id));
    payload.insert("name".to_string(), json!(item.name));
    if let Some(quantity) = item.quantity {
        payload.insert("quantity".to_string(), json!(quantity));
    }
    payload
}
