use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Agent, AgentOutcome, build_prompt};
use crate::models::TaskEnvelope;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

/// AI calls run for minutes; this bounds them, unlike the short REST
/// timeouts elsewhere.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);

const SYSTEM_PROMPT: &str = "You are an autonomous software engineer. You receive one \
development ticket at a time and produce a complete implementation.";

/// Execution strategy backed by the Anthropic Messages API.
pub struct ClaudeAgent {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_url: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<MessageParam>,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

impl ClaudeAgent {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        Self::with_api_url(api_key, model, ANTHROPIC_API_URL)
    }

    /// Point the agent at a different endpoint (used by tests).
    pub fn with_api_url(api_key: &str, model: &str, api_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .context("Failed to build Anthropic HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            model: model.to_string(),
            api_url: api_url.to_string(),
        })
    }
}

#[async_trait]
impl Agent for ClaudeAgent {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn execute(&self, task: &TaskEnvelope) -> Result<AgentOutcome> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![MessageParam {
                role: "user",
                content: build_prompt(task),
            }],
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Anthropic")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API returned {}: {}", status, body);
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        let text: String = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            return Ok(AgentOutcome::failed(format!(
                "Anthropic response contained no text (stop_reason: {:?})",
                parsed.stop_reason
            )));
        }
        Ok(AgentOutcome::succeeded(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let request = MessagesRequest {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: MAX_TOKENS,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![MessageParam {
                role: "user",
                content: "do the thing".to_string(),
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "claude-sonnet-4-20250514");
        assert_eq!(json["max_tokens"], 8192);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "do the thing");
    }

    #[test]
    fn test_response_text_extraction() {
        let json = r#"{
            "content": [
                {"type": "text", "text": "First."},
                {"type": "tool_use", "id": "x", "name": "edit", "input": {}},
                {"type": "text", "text": "Second."}
            ],
            "stop_reason": "end_turn"
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(json).unwrap();
        let texts: Vec<_> = parsed
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.clone()),
                ContentBlock::Other => None,
            })
            .collect();
        assert_eq!(texts, vec!["First.", "Second."]);
        assert_eq!(parsed.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_empty_content_deserializes() {
        let parsed: MessagesResponse =
            serde_json::from_str(r#"{"content": [], "stop_reason": "max_tokens"}"#).unwrap();
        assert!(parsed.content.is_empty());
    }
}
