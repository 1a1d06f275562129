//! LLM interaction adapter.
//!
//! The model itself is an external collaborator reached through the narrow
//! [`LanguageModel`] trait: chat-style completions with a per-call deadline
//! and token usage reporting. Helpers in this module deal with the messy
//! edges of model output (code fences around SQL, JSON wrapped in prose)
//! and with per-provider token budgets for schema context.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::message::Message;

/// Errors from LLM calls or output handling.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("llm provider error ({provider}): {message}")]
    #[diagnostic(code(amila::llm::provider))]
    Provider { provider: String, message: String },

    #[error("llm call timed out after {0:?}")]
    #[diagnostic(code(amila::llm::timeout))]
    Timeout(Duration),

    #[error("unparseable llm output: {0}")]
    #[diagnostic(
        code(amila::llm::unparseable),
        help("The model returned output that does not match the expected JSON shape.")
    )]
    Unparseable(String),
}

/// Token usage reported for one completion.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One chat completion request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub deadline: Duration,
}

impl CompletionRequest {
    #[must_use]
    pub fn new(system: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system: system.into(),
            messages,
            deadline: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// One chat completion response.
#[derive(Clone, Debug)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// Narrow seam to the language model. Implementations own transport,
/// authentication, and provider-specific request shapes.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider label used for token accounting and budget lookup.
    fn provider(&self) -> &str;
    /// Model identifier recorded into `llm_metadata`.
    fn model(&self) -> &str;
    /// Run one completion, honoring `request.deadline`.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Strip a single markdown code fence (```sql … ``` or ``` … ```) wrapped
/// around model output, returning the inner text trimmed.
#[must_use]
pub fn strip_code_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop an optional language tag on the opening fence line.
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Parse a typed JSON value out of model output, tolerating surrounding
/// prose and code fences by slicing from the first `{` to the last `}`.
pub fn parse_json_response<T: DeserializeOwned>(content: &str) -> Result<T, LlmError> {
    let cleaned = strip_code_fences(content);
    if let Ok(value) = serde_json::from_str::<T>(&cleaned) {
        return Ok(value);
    }
    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<T>(&cleaned[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(LlmError::Unparseable(truncate_for_error(&cleaned)))
}

/// Trim free text to roughly `budget_tokens` (4 chars ≈ 1 token), cutting
/// at a char boundary. Used to keep schema context within provider budgets.
#[must_use]
pub fn truncate_to_token_budget(text: &str, budget_tokens: usize) -> String {
    let max_chars = budget_tokens.saturating_mul(4);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

fn truncate_for_error(content: &str) -> String {
    content.chars().take(400).collect()
}

/// OpenAI-compatible HTTP adapter used by the service binary.
///
/// Talks `POST {base_url}/chat/completions` with a bearer key. Any gateway
/// speaking that dialect works; the orchestrator never sees provider
/// details beyond name, model, and token usage.
pub struct HttpLanguageModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    provider: String,
    model: String,
}

impl HttpLanguageModel {
    #[must_use]
    pub fn new(base_url: &str, api_key: &str, provider: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut wire_messages = vec![WireMessage {
            role: "system",
            content: &request.system,
        }];
        for message in &request.messages {
            wire_messages.push(WireMessage {
                role: &message.role,
                content: &message.content,
            });
        }
        let body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
        });

        let send = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        let response = tokio::time::timeout(request.deadline, send)
            .await
            .map_err(|_| LlmError::Timeout(request.deadline))?
            .map_err(|e| LlmError::Provider {
                provider: self.provider.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(LlmError::Provider {
                provider: self.provider.clone(),
                message: format!("status {}", response.status()),
            });
        }

        let wire: WireResponse = response.json().await.map_err(|e| LlmError::Provider {
            provider: self.provider.clone(),
            message: e.to_string(),
        })?;
        let content = wire
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Unparseable("empty choices".to_string()))?;
        let usage = wire
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        Ok(CompletionResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sql_fences() {
        let fenced = "```sql\nSELECT 1 FROM dual\n```";
        assert_eq!(strip_code_fences(fenced), "SELECT 1 FROM dual");
        assert_eq!(strip_code_fences("SELECT 1"), "SELECT 1");
        assert_eq!(strip_code_fences("```\nplain\n```"), "plain");
    }

    #[derive(Deserialize, PartialEq, Debug)]
    struct Sample {
        intent: String,
    }

    #[test]
    fn parses_json_with_surrounding_prose() {
        let content = "Here is the result:\n```json\n{\"intent\": \"read\"}\n```\nDone.";
        // Fence stripping only handles a leading fence; the brace slice
        // covers the general prose case.
        let parsed: Sample = parse_json_response(content).unwrap();
        assert_eq!(parsed.intent, "read");
    }

    #[test]
    fn unparseable_output_is_an_error() {
        let result: Result<Sample, _> = parse_json_response("no json here");
        assert!(matches!(result, Err(LlmError::Unparseable(_))));
    }

    #[test]
    fn token_budget_truncates() {
        let text = "x".repeat(100);
        assert_eq!(truncate_to_token_budget(&text, 10).len(), 40);
        assert_eq!(truncate_to_token_budget("short", 10), "short");
    }
}
