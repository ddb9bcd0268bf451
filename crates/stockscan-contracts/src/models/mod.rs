mod registry;
mod selectors;

pub use registry::{
    normalize_model_name, ModelRegistry, ModelSpec, CAPABILITY_TEXT, CAPABILITY_VISION,
};
pub use selectors::{ModelSelection, ModelSelector};
