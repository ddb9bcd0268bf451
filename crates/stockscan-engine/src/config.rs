use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODELS: &[&str] = &[
    "gemini-1.5-flash-latest",
    "gemini-1.5-pro-latest",
    "gemini-2.0-flash",
];
pub const DEFAULT_STORE_PATH: &str = "stockscan-inventory.json";
pub const DEFAULT_SAFETY_THRESHOLD: &str = "BLOCK_MEDIUM_AND_ABOVE";

const HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

const SAFETY_THRESHOLDS: [&str; 5] = [
    "BLOCK_NONE",
    "BLOCK_ONLY_HIGH",
    "BLOCK_MEDIUM_AND_ABOVE",
    "BLOCK_LOW_AND_ABOVE",
    "OFF",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY or GOOGLE_API_KEY not set")]
    MissingApiKey,
    #[error("unsupported safety threshold '{0}'")]
    InvalidSafetyThreshold(String),
}

/// Sampling parameters sent as `generationConfig`; fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationSettings {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            top_p: 1.0,
            top_k: 32,
            max_output_tokens: 4096,
        }
    }
}

/// One threshold applied to every harm category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetySettings {
    threshold: String,
}

impl SafetySettings {
    pub fn new(threshold: &str) -> Result<Self, ConfigError> {
        let normalized = threshold.trim().to_ascii_uppercase();
        if !SAFETY_THRESHOLDS.contains(&normalized.as_str()) {
            return Err(ConfigError::InvalidSafetyThreshold(threshold.to_string()));
        }
        Ok(Self {
            threshold: normalized,
        })
    }

    pub fn threshold(&self) -> &str {
        &self.threshold
    }

    pub fn to_payload(&self) -> Vec<Value> {
        HARM_CATEGORIES
            .into_iter()
            .map(|category| {
                json!({
                    "category": category,
                    "threshold": self.threshold,
                })
            })
            .collect()
    }
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SAFETY_THRESHOLD.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub models: Vec<String>,
    pub request_timeout: Duration,
    pub generation: GenerationSettings,
    pub safety: SafetySettings,
    pub store_path: PathBuf,
    pub journal_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            models: DEFAULT_MODELS.iter().map(|name| name.to_string()).collect(),
            request_timeout: Duration::from_secs(60),
            generation: GenerationSettings::default(),
            safety: SafetySettings::default(),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            journal_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            api_key: first_non_empty_env(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
            ..Self::default()
        };
        if let Some(base) = first_non_empty_env(&["GEMINI_API_BASE"]) {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(models) = first_non_empty_env(&["STOCKSCAN_MODELS"]) {
            let parsed = parse_model_list(&models);
            if !parsed.is_empty() {
                config.models = parsed;
            }
        }
        if let Some(store) = first_non_empty_env(&["STOCKSCAN_STORE"]) {
            config.store_path = PathBuf::from(store);
        }
        config.journal_path = first_non_empty_env(&["STOCKSCAN_JOURNAL"]).map(PathBuf::from);
        if let Some(raw) = first_non_empty_env(&["STOCKSCAN_REQUEST_TIMEOUT"]) {
            config.request_timeout = timeout_from_seconds(raw.parse::<f64>().ok());
        }
        if let Some(threshold) = first_non_empty_env(&["STOCKSCAN_SAFETY_THRESHOLD"]) {
            config.safety = SafetySettings::new(&threshold)?;
        }
        Ok(config)
    }

    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::MissingApiKey)
    }
}

pub fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Per-call deadline, defaulting to 60s and clamped to 5..=300s.
pub fn timeout_from_seconds(seconds: Option<f64>) -> Duration {
    let value = seconds
        .filter(|value| value.is_finite())
        .unwrap_or(60.0)
        .clamp(5.0, 300.0);
    Duration::from_secs_f64(value)
}

pub fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn generation_settings_serialize_as_camel_case() {
        let value = serde_json::to_value(GenerationSettings::default()).unwrap_or(Value::Null);
        assert_eq!(
            value,
            json!({
                "temperature": 0.4,
                "topP": 1.0,
                "topK": 32,
                "maxOutputTokens": 4096,
            })
        );
    }

    #[test]
    fn safety_settings_cover_four_categories() {
        let payload = SafetySettings::default().to_payload();
        assert_eq!(payload.len(), 4);
        assert!(payload
            .iter()
            .all(|entry| entry["threshold"] == json!("BLOCK_MEDIUM_AND_ABOVE")));

        let relaxed = SafetySettings::new(" block_only_high ").unwrap();
        assert_eq!(relaxed.threshold(), "BLOCK_ONLY_HIGH");
        assert!(matches!(
            SafetySettings::new("maybe"),
            Err(ConfigError::InvalidSafetyThreshold(_))
        ));
    }

    #[test]
    fn model_list_parsing_drops_blanks() {
        assert_eq!(
            parse_model_list(" gemini-2.0-flash, ,gemini-1.5-pro-latest,"),
            vec!["gemini-2.0-flash".to_string(), "gemini-1.5-pro-latest".to_string()]
        );
    }

    #[test]
    fn timeout_has_default_and_clamps() {
        assert_eq!(timeout_from_seconds(None), Duration::from_secs(60));
        assert_eq!(timeout_from_seconds(Some(1.0)), Duration::from_secs(5));
        assert_eq!(timeout_from_seconds(Some(900.0)), Duration::from_secs(300));
        assert_eq!(timeout_from_seconds(Some(f64::NAN)), Duration::from_secs(60));
        assert_eq!(timeout_from_seconds(Some(12.5)), Duration::from_secs_f64(12.5));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let config = EngineConfig::default();
        assert!(matches!(
            config.require_api_key(),
            Err(ConfigError::MissingApiKey)
        ));
    }
}
