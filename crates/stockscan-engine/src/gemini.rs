use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use stockscan_contracts::models::{normalize_model_name, ModelRegistry};

use crate::config::{EngineConfig, GenerationSettings, SafetySettings};
use crate::generation::{truncate_text, GenerationReply, GenerationRequest, GenerativeClient};

const SAFETY_FINISH_REASONS: [&str; 4] = ["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// `generateContent` client for the Gemini REST API.
///
/// Built once per process; the underlying HTTP client keeps its connection pool.
pub struct GeminiClient {
    api_base: String,
    api_key: String,
    http: HttpClient,
    timeout: Duration,
    generation: GenerationSettings,
    safety: SafetySettings,
    registry: ModelRegistry,
}

impl GeminiClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let api_key = config.require_api_key()?.to_string();
        let http = HttpClient::builder()
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            http,
            timeout: config.request_timeout,
            generation: config.generation.clone(),
            safety: config.safety.clone(),
            registry: ModelRegistry::new(None),
        })
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base,
            normalize_model_name(model)
        )
    }

    /// Configured sampling settings with `maxOutputTokens` capped at the model's limit.
    fn generation_for_model(&self, model: &str) -> GenerationSettings {
        let mut settings = self.generation.clone();
        if let Some(limit) = self
            .registry
            .get(model)
            .and_then(|spec| spec.max_output_tokens)
        {
            let limit = u32::try_from(limit).unwrap_or(u32::MAX);
            settings.max_output_tokens = settings.max_output_tokens.min(limit);
        }
        settings
    }

    fn build_payload(&self, model: &str, request: &GenerationRequest<'_>) -> Value {
        let mut parts = vec![json!({ "text": request.prompt })];
        if let Some(image) = request.image {
            parts.push(image.to_inline_part());
        }
        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": self.generation_for_model(model),
            "safetySettings": self.safety.to_payload(),
        })
    }

    /// Pulls the answer text, or the reason there is none, out of a response body.
    pub fn decode_response(payload: &Value) -> GenerationReply {
        let block_reason = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let candidate = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(Value::as_object);
        let finish_reason = candidate
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let text = candidate
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect::<Vec<&str>>()
                    .join("")
            })
            .unwrap_or_default();

        let block_reason = block_reason.or_else(|| {
            finish_reason
                .as_deref()
                .filter(|reason| SAFETY_FINISH_REASONS.contains(reason))
                .map(str::to_string)
        });
        GenerationReply {
            text,
            block_reason,
            finish_reason,
        }
    }
}

impl GenerativeClient for GeminiClient {
    fn generate(&self, model: &str, request: &GenerationRequest<'_>) -> Result<GenerationReply> {
        let endpoint = self.endpoint_for_model(model);
        let payload = self.build_payload(model, request);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({model})"))?;
        let body = response_json_or_error(model, response)?;
        Ok(Self::decode_response(&body))
    }
}

fn response_json_or_error(model: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("Gemini {model} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "Gemini {model} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("Gemini {model} returned invalid JSON payload"))?;
    if !parsed.is_object() {
        bail!("Gemini {model} returned a non-object payload");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::GeminiClient;
    use crate::config::{EngineConfig, GenerationSettings};
    use crate::generation::{GenerationReply, GenerationRequest};
    use crate::imaging::ImagePayload;

    fn client() -> GeminiClient {
        let config = EngineConfig {
            api_key: Some("test-key".to_string()),
            api_base: "https://example.test/v1beta/".to_string(),
            ..EngineConfig::default()
        };
        GeminiClient::new(&config).expect("client")
    }

    #[test]
    fn endpoint_accepts_bare_and_prefixed_model_names() {
        let client = client();
        assert_eq!(
            client.endpoint_for_model("gemini-1.5-flash-latest"),
            "https://example.test/v1beta/models/gemini-1.5-flash-latest:generateContent"
        );
        assert_eq!(
            client.endpoint_for_model(" models/gemini-2.0-flash "),
            "https://example.test/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn payload_puts_prompt_before_image_and_carries_fixed_settings() {
        let client = client();
        let image = ImagePayload {
            mime_type: "image/jpeg".to_string(),
            bytes: vec![1, 2, 3],
        };
        let payload = client.build_payload(
            "gemini-1.5-flash-latest",
            &GenerationRequest::with_image("describe", &image),
        );
        let parts = payload["contents"][0]["parts"].as_array().cloned().unwrap_or_default();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], json!("describe"));
        assert_eq!(parts[1]["inlineData"]["data"], json!("AQID"));
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], json!(4096));
        assert_eq!(payload["safetySettings"].as_array().map(Vec::len), Some(4));

        let text_only = client.build_payload("gemini-2.0-flash", &GenerationRequest::text("hola"));
        assert_eq!(text_only["contents"][0]["parts"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn output_token_budget_is_capped_per_model() -> anyhow::Result<()> {
        let config = EngineConfig {
            api_key: Some("test-key".to_string()),
            generation: GenerationSettings {
                max_output_tokens: 16384,
                ..GenerationSettings::default()
            },
            ..EngineConfig::default()
        };
        let client = GeminiClient::new(&config)?;
        let request = GenerationRequest::text("hola");
        let budget = |model: &str| {
            let payload = client.build_payload(model, &request);
            payload["generationConfig"]["maxOutputTokens"].clone()
        };

        assert_eq!(budget("gemini-pro-vision"), json!(4096));
        assert_eq!(budget("models/gemini-1.5-pro-latest"), json!(8192));
        assert_eq!(budget("gemini-2.5-flash"), json!(16384));
        assert_eq!(budget("gemini-unreleased"), json!(16384));
        Ok(())
    }

    #[test]
    fn decode_joins_text_parts() {
        let reply = GeminiClient::decode_response(&json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"main_object\":"}, {"text": " \"taza\"}"}]},
                "finishReason": "STOP",
            }]
        }));
        assert_eq!(reply.text, "{\"main_object\": \"taza\"}");
        assert_eq!(reply.finish_reason.as_deref(), Some("STOP"));
        assert!(reply.block_reason.is_none());
    }

    #[test]
    fn decode_reports_prompt_and_candidate_blocks() {
        let prompt_blocked = GeminiClient::decode_response(&json!({
            "promptFeedback": {"blockReason": "SAFETY"}
        }));
        assert!(prompt_blocked.text.is_empty());
        assert_eq!(prompt_blocked.block_reason.as_deref(), Some("SAFETY"));

        let candidate_blocked = GeminiClient::decode_response(&json!({
            "candidates": [{"finishReason": "PROHIBITED_CONTENT"}]
        }));
        assert_eq!(
            candidate_blocked.block_reason.as_deref(),
            Some("PROHIBITED_CONTENT")
        );

        let truncated = GeminiClient::decode_response(&json!({
            "candidates": [{"finishReason": "MAX_TOKENS", "content": {"parts": []}}]
        }));
        assert!(truncated.block_reason.is_none());
        assert_eq!(truncated.finish_reason.as_deref(), Some("MAX_TOKENS"));

        let empty = GeminiClient::decode_response(&Value::Null);
        assert_eq!(empty, GenerationReply::default());
    }
}
