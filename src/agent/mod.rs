//! Execution strategies ("agents") the worker dispatches tickets to.
//!
//! The core treats an agent as a black box: it gets the task envelope and
//! reports success with an artifact or failure with an error. Whether the
//! implementation talks to the Anthropic API, an OpenCode server, or a
//! test double is invisible to the worker loop.

pub mod claude;
pub mod opencode;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::TaskEnvelope;

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    /// Reference to what the agent produced (response text, patch, PR
    /// link) — opaque to the worker.
    pub artifact: Option<String>,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn succeeded(artifact: impl Into<String>) -> Self {
        Self {
            success: true,
            artifact: Some(artifact.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            artifact: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attempt to implement the ticket. `Err` means the attempt itself
    /// could not complete (network, provider outage) — the worker treats
    /// both `Err` and `success: false` as failures to requeue.
    async fn execute(&self, task: &TaskEnvelope) -> Result<AgentOutcome>;
}

/// Prompt shared by the HTTP-backed agents.
pub(crate) fn build_prompt(task: &TaskEnvelope) -> String {
    format!(
        "Implement the following {} ticket for repository {}.\n\n\
         Title: {}\n\nDescription:\n{}\n\n\
         Priority: {}. Respond with the implementation and a short summary \
         of the changes.",
        task.ticket_type, task.repository, task.title, task.description, task.priority
    )
}

#[cfg(test)]
pub mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted agent for worker tests: pops one outcome per call, falls
    /// back to success when the script runs dry.
    pub struct MockAgent {
        script: Mutex<VecDeque<Result<AgentOutcome, String>>>,
        calls: AtomicUsize,
    }

    impl MockAgent {
        pub fn scripted(script: Vec<Result<AgentOutcome, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always_succeeding() -> Self {
            Self::scripted(Vec::new())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Agent for MockAgent {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn execute(&self, _task: &TaskEnvelope) -> Result<AgentOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(outcome)) => Ok(outcome),
                Some(Err(message)) => Err(anyhow::anyhow!(message)),
                None => Ok(AgentOutcome::succeeded("mock artifact")),
            }
        }
    }
}
