use indexmap::IndexMap;

pub const CAPABILITY_TEXT: &str = "text";
pub const CAPABILITY_VISION: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub max_output_tokens: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Known generative models, in default fallback priority order.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(normalize_model_name(name))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }
}

/// Strips the `models/` resource prefix the Gemini API accepts on model names.
pub fn normalize_model_name(name: &str) -> &str {
    let trimmed = name.trim();
    trimmed.strip_prefix("models/").unwrap_or(trimmed)
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, capabilities: &[&str], max_output_tokens: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: "gemini".to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                max_output_tokens,
            },
        );
    };

    insert(
        "gemini-1.5-flash-latest",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(8192),
    );
    insert(
        "gemini-1.5-pro-latest",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(8192),
    );
    insert(
        "gemini-2.0-flash",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(8192),
    );
    insert(
        "gemini-2.5-flash",
        &[CAPABILITY_TEXT, CAPABILITY_VISION],
        Some(65536),
    );
    insert("gemini-pro-vision", &[CAPABILITY_VISION], Some(4096));
    insert("gemini-pro", &[CAPABILITY_TEXT], Some(8192));

    map
}
