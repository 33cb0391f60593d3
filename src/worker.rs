use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::db::DbHandle;
use crate::github::GithubClient;
use crate::models::{TaskEnvelope, TicketStatus};
use crate::queue::{Delivery, QueueOutcome, TaskQueue};
use crate::ws::{WsFrame, broadcast_frame};

/// Single consumer bridging one task queue to one execution strategy.
///
/// Holds no mutable state beyond the in-flight delivery: every side
/// effect (ticket status, issue comments, WebSocket frames) is external.
pub struct Worker {
    store: DbHandle,
    queue: TaskQueue,
    agent: Arc<dyn Agent>,
    github: Option<GithubClient>,
    ws_tx: broadcast::Sender<String>,
}

impl Worker {
    pub fn new(
        store: DbHandle,
        queue: TaskQueue,
        agent: Arc<dyn Agent>,
        github: Option<GithubClient>,
        ws_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            store,
            queue,
            agent,
            github,
            ws_tx,
        }
    }

    /// Consume until the shutdown flag flips (SIGINT in `serve`).
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            agent = self.agent.name(),
            queue = self.queue.name(),
            "worker started"
        );
        let worker = self.clone();
        let queue = self.queue.clone();
        queue
            .consume(shutdown, move |delivery| {
                let worker = worker.clone();
                async move { worker.handle_delivery(delivery).await }
            })
            .await
    }

    /// Handle one delivery and decide its fate. Malformed payloads are
    /// discarded without ever reaching the agent; execution failures are
    /// requeued (bounded by the queue's dead-letter policy).
    pub async fn handle_delivery(&self, delivery: Delivery) -> QueueOutcome {
        let envelope: TaskEnvelope = match serde_json::from_str(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    delivery_id = delivery.id,
                    error = %e,
                    "malformed task envelope, discarding"
                );
                return QueueOutcome::NackDiscard;
            }
        };

        info!(
            ticket_id = %envelope.ticket_id,
            agent = self.agent.name(),
            attempt = delivery.attempts + 1,
            "executing ticket"
        );
        broadcast_frame(
            &self.ws_tx,
            &WsFrame::StatusUpdate {
                ticket_id: envelope.ticket_id.clone(),
                status: TicketStatus::InProgress,
                step: Some("executing".to_string()),
                progress: None,
                message: None,
            },
        );

        match self.agent.execute(&envelope).await {
            Ok(outcome) if outcome.success => {
                self.annotate_success(&envelope, outcome.artifact.as_deref())
                    .await;
                QueueOutcome::Ack
            }
            Ok(outcome) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.annotate_failure(&envelope, &error).await;
                QueueOutcome::NackRequeue { error: Some(error) }
            }
            Err(e) => {
                let error = e.to_string();
                self.annotate_failure(&envelope, &error).await;
                QueueOutcome::NackRequeue { error: Some(error) }
            }
        }
    }

    /// Move the ticket into review and leave a success marker on the
    /// linked issue. Annotation failures are logged, never fatal: the
    /// task itself succeeded and must be acked.
    async fn annotate_success(&self, envelope: &TaskEnvelope, artifact: Option<&str>) {
        let ticket_id = envelope.ticket_id.clone();
        let updated = self
            .store
            .call(move |store| store.set_status(&ticket_id, TicketStatus::Review))
            .await;
        let ticket = match updated {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                warn!(ticket_id = %envelope.ticket_id, error = %e, "failed to update ticket after success");
                None
            }
        };

        broadcast_frame(
            &self.ws_tx,
            &WsFrame::StatusUpdate {
                ticket_id: envelope.ticket_id.clone(),
                status: TicketStatus::Review,
                step: Some("completed".to_string()),
                progress: Some(100),
                message: Some(format!("{} finished implementation", self.agent.name())),
            },
        );

        if let Some(issue_number) = ticket.as_ref().and_then(|t| t.github_issue_number) {
            let mut body = format!(
                "Implementation attempt by `{}` succeeded; ticket moved to review.",
                self.agent.name()
            );
            if let Some(artifact) = artifact {
                body.push_str("\n\n");
                body.push_str(artifact);
            }
            self.comment(envelope, issue_number, &body).await;
        }
    }

    async fn annotate_failure(&self, envelope: &TaskEnvelope, error: &str) {
        warn!(ticket_id = %envelope.ticket_id, error, "agent execution failed");
        broadcast_frame(
            &self.ws_tx,
            &WsFrame::Log {
                ticket_id: envelope.ticket_id.clone(),
                message: format!("{} failed: {}", self.agent.name(), error),
            },
        );

        let ticket_id = envelope.ticket_id.clone();
        let ticket = self
            .store
            .call(move |store| store.get_ticket(&ticket_id))
            .await;
        if let Ok(Some(ticket)) = ticket {
            if let Some(issue_number) = ticket.github_issue_number {
                let body = format!(
                    "Implementation attempt by `{}` failed: {}",
                    self.agent.name(),
                    error
                );
                self.comment(envelope, issue_number, &body).await;
            }
        }
    }

    async fn comment(&self, envelope: &TaskEnvelope, issue_number: i64, body: &str) {
        // The envelope's token belongs to the executing agent and wins
        // over the server-wide client when present.
        let client = if envelope.github_token.is_empty() {
            self.github.clone()
        } else {
            GithubClient::new(&envelope.github_token).ok()
        };
        let Some(client) = client else {
            return;
        };
        if let Err(e) = client
            .create_issue_comment(&envelope.repository, issue_number, body)
            .await
        {
            warn!(
                repository = %envelope.repository,
                issue_number,
                error = %e,
                "failed to comment on issue"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::MockAgent;
    use crate::agent::AgentOutcome;
    use crate::db::TicketStore;
    use crate::models::{Priority, Ticket, TicketType};

    async fn setup(agent: MockAgent) -> (DbHandle, TaskQueue, Arc<Worker>, broadcast::Sender<String>) {
        let db = DbHandle::new(TicketStore::new_in_memory().unwrap());
        let queue = TaskQueue::open(db.clone(), "tickets.test", 3).await.unwrap();
        let (ws_tx, _) = broadcast::channel(64);
        let worker = Arc::new(Worker::new(
            db.clone(),
            queue.clone(),
            Arc::new(agent),
            None,
            ws_tx.clone(),
        ));
        (db, queue, worker, ws_tx)
    }

    async fn dispatched_ticket(db: &DbHandle) -> Ticket {
        let ticket = db
            .call(|store| {
                store.create_ticket(
                    "Add retries",
                    "Retry transient failures",
                    TicketType::Feature,
                    Priority::High,
                    "acme/app",
                    None,
                )
            })
            .await
            .unwrap();
        let id = ticket.id.clone();
        db.call(move |store| store.claim_for_dispatch(&id))
            .await
            .unwrap()
    }

    fn delivery(payload: &str) -> Delivery {
        Delivery {
            id: 1,
            payload: payload.to_string(),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_discarded_without_invoking_agent() {
        let agent = MockAgent::always_succeeding();
        let (_db, queue, worker, _ws) = setup(agent).await;

        let outcome = worker.handle_delivery(delivery("{not json")).await;
        assert_eq!(outcome, QueueOutcome::NackDiscard);

        // Push the same garbage through the real queue: it is removed,
        // never redelivered.
        let id = queue
            .publish(&TaskEnvelope {
                ticket_id: "t".to_string(),
                title: String::new(),
                description: String::new(),
                repository: "acme/app".to_string(),
                priority: Priority::Low,
                ticket_type: TicketType::Bugfix,
                github_token: String::new(),
            })
            .await
            .unwrap();
        queue.nack_discard(id).await.unwrap();
        assert!(queue.claim_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_agent_never_called_for_malformed_payload() {
        let agent = MockAgent::always_succeeding();
        let db = DbHandle::new(TicketStore::new_in_memory().unwrap());
        let queue = TaskQueue::open(db.clone(), "q", 3).await.unwrap();
        let (ws_tx, _) = broadcast::channel(8);
        let agent = Arc::new(agent);
        let worker = Worker::new(db, queue, agent.clone(), None, ws_tx);

        worker.handle_delivery(delivery("[1, 2, 3]")).await;
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_acks_and_moves_ticket_to_review() {
        let (db, _queue, worker, ws_tx) = setup(MockAgent::always_succeeding()).await;
        let ticket = dispatched_ticket(&db).await;
        let mut ws_rx = ws_tx.subscribe();

        let envelope = TaskEnvelope::for_ticket(&ticket, "");
        let payload = serde_json::to_string(&envelope).unwrap();
        let outcome = worker.handle_delivery(delivery(&payload)).await;
        assert_eq!(outcome, QueueOutcome::Ack);

        let id = ticket.id.clone();
        let updated = db.call(move |s| s.get_ticket(&id)).await.unwrap().unwrap();
        assert_eq!(updated.status, TicketStatus::Review);

        // At least one status_update frame went out for this ticket.
        let frame = ws_rx.recv().await.unwrap();
        assert!(frame.contains("\"type\":\"status_update\""));
        assert!(frame.contains(&ticket.id));
    }

    #[tokio::test]
    async fn test_agent_error_requeues_and_retries_reinvoke_strategy() {
        let agent = MockAgent::scripted(vec![
            Err("provider down".to_string()),
            Ok(AgentOutcome::succeeded("done")),
        ]);
        let db = DbHandle::new(TicketStore::new_in_memory().unwrap());
        let queue = TaskQueue::open(db.clone(), "q", 3).await.unwrap();
        let (ws_tx, _) = broadcast::channel(8);
        let agent = Arc::new(agent);
        let worker = Worker::new(db.clone(), queue.clone(), agent.clone(), None, ws_tx);

        let ticket = db
            .call(|store| {
                store.create_ticket(
                    "t",
                    "",
                    TicketType::Bugfix,
                    Priority::Low,
                    "acme/app",
                    None,
                )
            })
            .await
            .unwrap();
        let envelope = TaskEnvelope::for_ticket(&ticket, "");
        queue.publish(&envelope).await.unwrap();

        // First consumption fails and requeues.
        let d = queue.claim_one().await.unwrap().unwrap();
        let outcome = worker.handle_delivery(d.clone()).await;
        assert!(matches!(outcome, QueueOutcome::NackRequeue { .. }));
        assert!(!queue.nack_requeue(d.id, Some("provider down".to_string())).await.unwrap());

        // Second consumption re-invokes the strategy and succeeds.
        let d = queue.claim_one().await.unwrap().unwrap();
        let outcome = worker.handle_delivery(d).await;
        assert_eq!(outcome, QueueOutcome::Ack);
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_unsuccessful_outcome_requeues_with_error() {
        let (db, _queue, worker, ws_tx) =
            setup(MockAgent::scripted(vec![Ok(AgentOutcome::failed("tests failed"))])).await;
        let ticket = dispatched_ticket(&db).await;
        let mut ws_rx = ws_tx.subscribe();

        let payload = serde_json::to_string(&TaskEnvelope::for_ticket(&ticket, "")).unwrap();
        let outcome = worker.handle_delivery(delivery(&payload)).await;
        assert_eq!(
            outcome,
            QueueOutcome::NackRequeue {
                error: Some("tests failed".to_string())
            }
        );

        // The failure was surfaced as a log frame.
        let mut saw_log = false;
        while let Ok(frame) = ws_rx.try_recv() {
            if frame.contains("\"type\":\"log\"") && frame.contains("tests failed") {
                saw_log = true;
            }
        }
        assert!(saw_log);

        // Dispatch left the ticket in its prior (in_progress) status.
        let id = ticket.id.clone();
        let current = db.call(move |s| s.get_ticket(&id)).await.unwrap().unwrap();
        assert_eq!(current.status, TicketStatus::InProgress);
    }
}
