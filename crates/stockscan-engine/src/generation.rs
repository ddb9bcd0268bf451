use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::{json, Value};
use stockscan_contracts::attributes::error_record;
use tracing::{debug, info, warn};

use crate::imaging::ImagePayload;

/// One prompt, optionally with a single image, sent to a generative model.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub image: Option<&'a ImagePayload>,
}

impl<'a> GenerationRequest<'a> {
    pub fn text(prompt: &'a str) -> Self {
        Self {
            prompt,
            image: None,
        }
    }

    pub fn with_image(prompt: &'a str, image: &'a ImagePayload) -> Self {
        Self {
            prompt,
            image: Some(image),
        }
    }
}

/// Decoded response of a single model call that reached the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReply {
    pub text: String,
    pub block_reason: Option<String>,
    pub finish_reason: Option<String>,
}

/// Transport to a hosted generative model. `Err` means the call itself failed.
pub trait GenerativeClient: Send + Sync {
    fn generate(&self, model: &str, request: &GenerationRequest<'_>) -> Result<GenerationReply>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Content(String),
    Blocked(String),
    Failed(String),
}

impl AttemptOutcome {
    fn from_reply(reply: GenerationReply) -> Self {
        if !reply.text.trim().is_empty() {
            return Self::Content(reply.text);
        }
        if let Some(reason) = reply.block_reason {
            return Self::Blocked(reason);
        }
        match reply.finish_reason {
            Some(reason) => Self::Failed(format!("empty response (finish reason {reason})")),
            None => Self::Failed("empty response".to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Content(_) => "content",
            Self::Blocked(_) => "blocked",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub model: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResult {
    Success {
        model: String,
        text: String,
        attempts: Vec<AttemptRecord>,
    },
    Exhausted {
        attempts: Vec<AttemptRecord>,
    },
}

impl GenerationResult {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Success { attempts, .. } | Self::Exhausted { attempts } => attempts,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Success { text, .. } => Some(text),
            Self::Exhausted { .. } => None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Success { model, .. } => Some(model),
            Self::Exhausted { .. } => None,
        }
    }

    /// Aggregate message naming the last recorded error or block reason.
    pub fn error_message(&self) -> Option<String> {
        let Self::Exhausted { attempts } = self else {
            return None;
        };
        let detail = match attempts.last() {
            Some(AttemptRecord {
                model,
                outcome: AttemptOutcome::Blocked(reason),
            }) => format!("last model {model} blocked the request by safety filter ({reason})"),
            Some(AttemptRecord {
                model,
                outcome: AttemptOutcome::Failed(error),
            }) => format!("last error from {model}: {error}"),
            _ => "no model produced content".to_string(),
        };
        Some(format!(
            "Gemini API unavailable after {} model(s); {detail}",
            attempts.len()
        ))
    }

    /// The model text on success, otherwise `{"error": ...}`.
    pub fn into_text(self) -> String {
        match self {
            Self::Success { text, .. } => text,
            exhausted => error_record(&exhausted.error_message().unwrap_or_default()),
        }
    }

    pub fn summary(&self) -> Value {
        let attempts = self
            .attempts()
            .iter()
            .map(|attempt| {
                json!({
                    "model": attempt.model,
                    "outcome": attempt.outcome.kind(),
                })
            })
            .collect::<Vec<Value>>();
        json!({
            "model": self.model(),
            "attempts": attempts,
        })
    }
}

/// Tries each configured model in order until one returns content.
///
/// Exactly one call is made per model; a transport error or a safety block moves on
/// to the next model. Holds only read-only state, so one instance can serve
/// concurrent callers.
#[derive(Clone)]
pub struct ResilientGenerationCaller {
    client: Arc<dyn GenerativeClient>,
    models: Vec<String>,
}

impl ResilientGenerationCaller {
    pub fn new(client: Arc<dyn GenerativeClient>, models: Vec<String>) -> Result<Self> {
        if models.is_empty() {
            bail!("model fallback list must not be empty");
        }
        Ok(Self { client, models })
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn call(&self, request: &GenerationRequest<'_>) -> GenerationResult {
        let mut attempts = Vec::with_capacity(self.models.len());
        for model in &self.models {
            debug!(model = %model, image = request.image.is_some(), "calling generative model");
            let outcome = match self.client.generate(model, request) {
                Ok(reply) => AttemptOutcome::from_reply(reply),
                Err(err) => AttemptOutcome::Failed(error_chain_text(&err, 512)),
            };
            match outcome {
                AttemptOutcome::Content(text) => {
                    info!(
                        model = %model,
                        attempt = attempts.len() + 1,
                        "generative model answered"
                    );
                    attempts.push(AttemptRecord {
                        model: model.clone(),
                        outcome: AttemptOutcome::Content(text.clone()),
                    });
                    return GenerationResult::Success {
                        model: model.clone(),
                        text,
                        attempts,
                    };
                }
                AttemptOutcome::Blocked(ref reason) => {
                    warn!(
                        model = %model,
                        reason = %reason,
                        "generative model blocked by safety filter"
                    );
                }
                AttemptOutcome::Failed(ref error) => {
                    warn!(model = %model, error = %error, "generative model call failed");
                }
            }
            attempts.push(AttemptRecord {
                model: model.clone(),
                outcome,
            });
        }
        GenerationResult::Exhausted { attempts }
    }
}

/// Flattens an error chain to one line, skipping repeated messages.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().is_some_and(|existing| existing == trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
