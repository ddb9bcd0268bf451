//! Adapters to the external services behind inventory recognition (the Gemini
//! `generateContent` API, the detector, image preparation) and the pipeline that
//! strings them together.

pub mod config;
pub mod detector;
pub mod extraction;
pub mod gemini;
pub mod generation;
pub mod imaging;
pub mod pipeline;

pub use config::{ConfigError, EngineConfig};
pub use detector::{Detector, FixtureDetector, FullFrameDetector};
pub use extraction::AttributeExtractionAdapter;
pub use gemini::GeminiClient;
pub use generation::{
    AttemptOutcome, GenerationRequest, GenerationResult, GenerativeClient,
    ResilientGenerationCaller,
};
pub use imaging::{
    annotate_detections, load_image, prepare_image, save_annotated, Annotator, ImagePayload,
};
pub use pipeline::{
    Identification, MatchStrategy, RecognitionPipeline, RegionIdentification, Services,
};
