use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::Config;
use crate::db::{DbHandle, TicketPatch};
use crate::dispatch;
use crate::github::{self, GithubClient, ImportOutcome, map_ticket_status_to_github};
use crate::models::{DomainError, Priority, TaskEnvelope, TicketStatus, TicketType};
use crate::queue::{self, TaskQueue};
use crate::ws::{WsFrame, broadcast_frame};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: DbHandle,
    pub claude_queue: TaskQueue,
    pub opencode_queue: TaskQueue,
    pub ws_tx: broadcast::Sender<String>,
    pub github: Option<GithubClient>,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

fn default_ticket_type() -> TicketType {
    TicketType::Feature
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_issue_state() -> String {
    "open".to_string()
}

#[derive(Deserialize)]
pub struct CreateTicketRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_ticket_type")]
    pub ticket_type: TicketType,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub repository: String,
    pub order: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateTicketRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub ticket_type: Option<TicketType>,
    pub priority: Option<Priority>,
    pub status: Option<TicketStatus>,
    pub order: Option<i64>,
}

#[derive(Deserialize)]
pub struct ListTicketsQuery {
    pub repository: Option<String>,
}

#[derive(Deserialize)]
pub struct IssueStateQuery {
    #[serde(default = "default_issue_state")]
    pub state: String,
}

#[derive(Deserialize)]
pub struct LinkIssueRequest {
    pub issue_number: i64,
    pub issue_url: String,
}

#[derive(serde::Serialize)]
pub struct DispatchResponse {
    pub ticket_id: String,
    pub queue: String,
    pub delivery_id: i64,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl ApiError {
    /// Map domain failures to 4xx; anything unrecognized becomes a 500
    /// carrying the error message.
    fn from_err(e: anyhow::Error) -> Self {
        match e.downcast_ref::<DomainError>() {
            Some(DomainError::TicketNotFound(_)) => Self::NotFound(e.to_string()),
            Some(DomainError::IllegalTransition { .. }) => Self::BadRequest(e.to_string()),
            Some(DomainError::AlreadyLinked { .. })
            | Some(DomainError::DuplicateIssue { .. })
            | Some(DomainError::NotDispatchable { .. }) => Self::Conflict(e.to_string()),
            None => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/tickets", post(create_ticket).get(list_tickets))
        .route(
            "/tickets/{id}",
            get(get_ticket).put(update_ticket).delete(delete_ticket),
        )
        .route(
            "/tickets/repository/{repository}/next",
            get(next_ticket_handler),
        )
        .route("/tickets/{id}/develop-with-claude", post(develop_with_claude))
        .route(
            "/tickets/{id}/develop-with-opencode",
            post(develop_with_opencode),
        )
        .route("/tickets/{id}/link-issue", post(link_issue))
        .route("/tickets/{id}/unlink-issue", post(unlink_issue))
        .route("/github-issues/sync/{repository}", get(sync_issues))
        .route(
            "/github-issues/import/{repository}/{issue_number}",
            post(import_issue_handler),
        )
        .route("/github-issues/import-all/{repository}", post(import_all_handler))
        .route("/queue/dead-letters", get(dead_letters))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_ticket(
    State(state): State<SharedState>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .store
        .call(move |store| {
            store.create_ticket(
                &req.title,
                &req.description,
                req.ticket_type,
                req.priority,
                &req.repository,
                req.order,
            )
        })
        .await
        .map_err(ApiError::from_err)?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn list_tickets(
    State(state): State<SharedState>,
    Query(query): Query<ListTicketsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tickets = state
        .store
        .call(move |store| store.list_tickets(query.repository.as_deref()))
        .await
        .map_err(ApiError::from_err)?;
    Ok(Json(tickets))
}

async fn get_ticket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup_id = id.clone();
    let ticket = state
        .store
        .call(move |store| store.get_ticket(&lookup_id))
        .await
        .map_err(ApiError::from_err)?
        .ok_or_else(|| ApiError::NotFound(format!("Ticket {} not found", id)))?;
    Ok(Json(ticket))
}

async fn update_ticket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let patch = TicketPatch {
        title: req.title,
        description: req.description,
        ticket_type: req.ticket_type,
        priority: req.priority,
        status: req.status,
        order: req.order,
    };
    let update_id = id.clone();
    let ticket = state
        .store
        .call(move |store| store.update_ticket(&update_id, &patch))
        .await
        .map_err(ApiError::from_err)?;

    // Outbound half of the sync: closing a linked ticket closes the
    // remote issue. Best-effort — the local update already committed.
    if req.status == Some(TicketStatus::Closed) {
        if let (Some(github), Some(issue_number)) =
            (state.github.clone(), ticket.github_issue_number)
        {
            let repository = ticket.repository.clone();
            let remote_state = map_ticket_status_to_github(TicketStatus::Closed);
            tokio::spawn(async move {
                if let Err(e) = github
                    .set_issue_state(&repository, issue_number, remote_state)
                    .await
                {
                    warn!(repository, issue_number, error = %e, "failed to close remote issue");
                }
            });
        }
    }

    broadcast_frame(
        &state.ws_tx,
        &WsFrame::StatusUpdate {
            ticket_id: id,
            status: ticket.status,
            step: None,
            progress: None,
            message: None,
        },
    );
    Ok(Json(ticket))
}

async fn delete_ticket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let delete_id = id.clone();
    let deleted = state
        .store
        .call(move |store| store.delete_ticket(&delete_id))
        .await
        .map_err(ApiError::from_err)?;
    if !deleted {
        return Err(ApiError::NotFound(format!("Ticket {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /tickets/repository/{repository}/next` — the dispatch policy,
/// read-only: no claim happens here.
async fn next_ticket_handler(
    State(state): State<SharedState>,
    Path(repository): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tickets = state
        .store
        .call(move |store| store.list_tickets(Some(&repository)))
        .await
        .map_err(ApiError::from_err)?;
    Ok(Json(dispatch::next_ticket(&tickets)))
}

async fn develop_with_claude(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let queue = state.claude_queue.clone();
    dispatch_ticket(&state, id, &queue).await
}

async fn develop_with_opencode(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let queue = state.opencode_queue.clone();
    dispatch_ticket(&state, id, &queue).await
}

/// Claim the ticket (open -> in_progress, compare-and-swap) and publish
/// its envelope. A failed publish restores the prior status so a failed
/// dispatch leaves no partial mutation behind.
async fn dispatch_ticket(
    state: &SharedState,
    id: String,
    queue: &TaskQueue,
) -> Result<Response, ApiError> {
    let claim_id = id.clone();
    let ticket = state
        .store
        .call(move |store| store.claim_for_dispatch(&claim_id))
        .await
        .map_err(ApiError::from_err)?;

    let token = state.config.github_token.clone().unwrap_or_default();
    let envelope = TaskEnvelope::for_ticket(&ticket, &token);

    match queue.publish(&envelope).await {
        Ok(delivery_id) => {
            broadcast_frame(
                &state.ws_tx,
                &WsFrame::StatusUpdate {
                    ticket_id: id.clone(),
                    status: TicketStatus::InProgress,
                    step: Some("queued".to_string()),
                    progress: None,
                    message: None,
                },
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(DispatchResponse {
                    ticket_id: id,
                    queue: queue.name().to_string(),
                    delivery_id,
                }),
            )
                .into_response())
        }
        Err(e) => {
            let restore_id = id.clone();
            if let Err(restore_err) = state
                .store
                .call(move |store| store.restore_status(&restore_id, TicketStatus::Open))
                .await
            {
                warn!(ticket_id = %id, error = %restore_err, "failed to restore ticket after publish failure");
            }
            Err(ApiError::Internal(format!(
                "Failed to publish task: {}",
                e
            )))
        }
    }
}

async fn link_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<LinkIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .store
        .call(move |store| store.link_issue(&id, req.issue_number, &req.issue_url))
        .await
        .map_err(ApiError::from_err)?;
    Ok(Json(ticket))
}

async fn unlink_issue(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket = state
        .store
        .call(move |store| store.unlink_issue(&id))
        .await
        .map_err(ApiError::from_err)?;
    Ok(Json(ticket))
}

fn require_github(state: &SharedState) -> Result<GithubClient, ApiError> {
    state
        .github
        .clone()
        .ok_or_else(|| ApiError::BadRequest("GITHUB_TOKEN is not configured".to_string()))
}

/// `GET /github-issues/sync/{repository}?state=` — pull remote issue
/// state into local tickets without clobbering richer local statuses.
async fn sync_issues(
    State(state): State<SharedState>,
    Path(repository): Path<String>,
    Query(query): Query<IssueStateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let github = require_github(&state)?;
    let report = github::sync_repository(&state.store, &github, &repository, &query.state)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(report))
}

async fn import_issue_handler(
    State(state): State<SharedState>,
    Path((repository, issue_number)): Path<(String, i64)>,
) -> Result<Response, ApiError> {
    let github = require_github(&state)?;
    let outcome = github::import_issue(&state.store, &github, &repository, issue_number)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(match outcome {
        ImportOutcome::Imported(ticket) => {
            (StatusCode::CREATED, Json(ticket)).into_response()
        }
        ImportOutcome::Skipped(number) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "skipped": true,
                "issue_number": number,
                "reason": "already imported"
            })),
        )
            .into_response(),
    })
}

async fn import_all_handler(
    State(state): State<SharedState>,
    Path(repository): Path<String>,
    Query(query): Query<IssueStateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let github = require_github(&state)?;
    let report = github::import_all(&state.store, &github, &repository, &query.state)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(report))
}

async fn dead_letters(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let letters = queue::list_dead_letters(&state.store)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(letters))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_4xx() {
        let e = ApiError::from_err(DomainError::TicketNotFound("x".to_string()).into());
        assert!(matches!(e, ApiError::NotFound(_)));

        let e = ApiError::from_err(
            DomainError::IllegalTransition {
                from: TicketStatus::Closed,
                to: TicketStatus::Open,
            }
            .into(),
        );
        assert!(matches!(e, ApiError::BadRequest(_)));

        let e = ApiError::from_err(
            DomainError::DuplicateIssue {
                repository: "acme/app".to_string(),
                issue_number: 1,
            }
            .into(),
        );
        assert!(matches!(e, ApiError::Conflict(_)));

        let e = ApiError::from_err(anyhow::anyhow!("disk on fire"));
        assert!(matches!(e, ApiError::Internal(_)));
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateTicketRequest = serde_json::from_str(
            r#"{"title": "T", "repository": "acme/app"}"#,
        )
        .unwrap();
        assert_eq!(req.ticket_type, TicketType::Feature);
        assert_eq!(req.priority, Priority::Medium);
        assert_eq!(req.description, "");
        assert!(req.order.is_none());
    }

    #[test]
    fn test_update_request_accepts_type_key() {
        let req: UpdateTicketRequest =
            serde_json::from_str(r#"{"type": "bugfix", "status": "closed"}"#).unwrap();
        assert_eq!(req.ticket_type, Some(TicketType::Bugfix));
        assert_eq!(req.status, Some(TicketStatus::Closed));
    }
}
