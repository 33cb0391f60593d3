use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Agent, AgentOutcome, build_prompt};
use crate::models::TaskEnvelope;

/// OpenCode sessions drive a full coding agent; give them even more room
/// than a single completion.
const SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Execution strategy backed by an OpenCode server (`opencode serve`,
/// typically Docker-hosted): create a session, send the ticket as a
/// prompt, collect the reply parts.
pub struct OpenCodeAgent {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest {
    title: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct MessagePart {
    #[serde(rename = "type")]
    part_type: &'static str,
    text: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(rename = "type", default)]
    part_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl OpenCodeAgent {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SESSION_TIMEOUT)
            .build()
            .context("Failed to build OpenCode HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Agent for OpenCodeAgent {
    fn name(&self) -> &'static str {
        "opencode"
    }

    async fn execute(&self, task: &TaskEnvelope) -> Result<AgentOutcome> {
        let session: SessionResponse = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&CreateSessionRequest {
                title: task.title.clone(),
            })
            .send()
            .await
            .context("Failed to create OpenCode session")?
            .error_for_status()
            .context("OpenCode session creation returned error status")?
            .json()
            .await
            .context("Failed to parse OpenCode session response")?;

        let reply: MessageResponse = self
            .client
            .post(format!("{}/session/{}/message", self.base_url, session.id))
            .json(&SendMessageRequest {
                parts: vec![MessagePart {
                    part_type: "text",
                    text: build_prompt(task),
                }],
            })
            .send()
            .await
            .context("Failed to send prompt to OpenCode session")?
            .error_for_status()
            .context("OpenCode message returned error status")?
            .json()
            .await
            .context("Failed to parse OpenCode message response")?;

        let text: String = reply
            .parts
            .iter()
            .filter(|p| p.part_type == "text")
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if text.is_empty() {
            return Ok(AgentOutcome::failed(
                "OpenCode reply contained no text parts",
            ));
        }
        Ok(AgentOutcome::succeeded(text))
    }
}
