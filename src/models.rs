use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Workflow status of a ticket. GitHub only knows open/closed; the richer
/// states exist locally and must survive sync passes (see `github`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Review,
    PendingValidation,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::PendingValidation => "pending_validation",
            Self::Closed => "closed",
        }
    }

    /// Transition table: `closed` is terminal, everything else is
    /// externally driven and unconstrained. Same-state writes are no-ops.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        match self {
            Self::Closed => next == Self::Closed,
            _ => true,
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "pending_validation" => Ok(Self::PendingValidation),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TicketType {
    Feature,
    Bugfix,
    Refactor,
    Documentation,
}

impl TicketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Documentation => "documentation",
        }
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature" => Ok(Self::Feature),
            "bugfix" => Ok(Self::Bugfix),
            "refactor" => Ok(Self::Refactor),
            "documentation" => Ok(Self::Documentation),
            _ => Err(format!("Invalid ticket type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// A unit of development work, optionally mirrored to a GitHub issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
    pub priority: Priority,
    pub status: TicketStatus,
    /// Queue position within the repository; lower = earlier. Ties are
    /// broken by insertion order (retrieval is stable).
    pub order: i64,
    pub repository: String,
    pub github_issue_number: Option<i64>,
    pub github_issue_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// The JSON message carried on the task queue. Immutable once published;
/// redelivery after a nack is possible (at-least-once, not exactly-once).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub ticket_id: String,
    pub title: String,
    pub description: String,
    pub repository: String,
    pub priority: Priority,
    #[serde(rename = "type")]
    pub ticket_type: TicketType,
    pub github_token: String,
}

impl TaskEnvelope {
    pub fn for_ticket(ticket: &Ticket, github_token: &str) -> Self {
        Self {
            ticket_id: ticket.id.clone(),
            title: ticket.title.clone(),
            description: ticket.description.clone(),
            repository: ticket.repository.clone(),
            priority: ticket.priority,
            ticket_type: ticket.ticket_type,
            github_token: github_token.to_string(),
        }
    }
}

/// Domain failures the API maps to 4xx responses. Everything else that
/// bubbles up through `anyhow` becomes a 500.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Ticket {0} not found")]
    TicketNotFound(String),

    #[error("Ticket {ticket_id} is already linked to issue #{issue_number}")]
    AlreadyLinked { ticket_id: String, issue_number: i64 },

    #[error("Issue #{issue_number} is already imported for {repository}")]
    DuplicateIssue {
        repository: String,
        issue_number: i64,
    },

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: TicketStatus,
        to: TicketStatus,
    },

    #[error("Ticket {ticket_id} is not open (status: {status})")]
    NotDispatchable {
        ticket_id: String,
        status: TicketStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in &["open", "in_progress", "review", "pending_validation", "closed"] {
            let parsed: TicketStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<TicketStatus>().is_err());
    }

    #[test]
    fn test_ticket_type_roundtrip() {
        for s in &["feature", "bugfix", "refactor", "documentation"] {
            let parsed: TicketType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("epic".parse::<TicketType>().is_err());
    }

    #[test]
    fn test_priority_roundtrip() {
        for s in &["critical", "high", "medium", "low"] {
            let parsed: Priority = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case() {
        assert_eq!(
            serde_json::to_string(&TicketStatus::PendingValidation).unwrap(),
            "\"pending_validation\""
        );
        assert_eq!(
            serde_json::to_string(&Priority::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&TicketType::Bugfix).unwrap(),
            "\"bugfix\""
        );
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Review,
            TicketStatus::PendingValidation,
        ] {
            assert!(!TicketStatus::Closed.can_transition_to(next));
        }
        assert!(TicketStatus::Closed.can_transition_to(TicketStatus::Closed));
    }

    #[test]
    fn test_non_closed_transitions_are_unconstrained() {
        let states = [
            TicketStatus::Open,
            TicketStatus::InProgress,
            TicketStatus::Review,
            TicketStatus::PendingValidation,
            TicketStatus::Closed,
        ];
        for from in states.iter().filter(|s| **s != TicketStatus::Closed) {
            for to in &states {
                assert!(from.can_transition_to(*to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = TaskEnvelope {
            ticket_id: "t-1".to_string(),
            title: "Add login".to_string(),
            description: "OAuth flow".to_string(),
            repository: "acme/app".to_string(),
            priority: Priority::High,
            ticket_type: TicketType::Feature,
            github_token: "ghp_test".to_string(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["ticket_id"], "t-1");
        assert_eq!(json["type"], "feature");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["github_token"], "ghp_test");
        // `type` is the wire name; there must be no `ticket_type` key
        assert!(json.get("ticket_type").is_none());
    }

    #[test]
    fn test_envelope_roundtrip_is_byte_identical() {
        let envelope = TaskEnvelope {
            ticket_id: "t-2".to_string(),
            title: "Fix crash".to_string(),
            description: String::new(),
            repository: "acme/app".to_string(),
            priority: Priority::Critical,
            ticket_type: TicketType::Bugfix,
            github_token: String::new(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }
}
