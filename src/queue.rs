use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::db::DbHandle;
use crate::models::TaskEnvelope;

/// How long the consume loop sleeps when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What a handler tells the transport to do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Terminal success — permanently remove the delivery.
    Ack,
    /// Transient failure — redeliver, possibly to another worker. Bounded
    /// by the queue's max-attempts dead-lettering.
    NackRequeue { error: Option<String> },
    /// Poison message (malformed/unparseable) — remove without requeue.
    NackDiscard,
}

/// One claimed, unacknowledged message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub payload: String,
    /// Redeliveries already burned on this envelope.
    pub attempts: u32,
}

/// An envelope that exhausted its redelivery budget.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed_at: String,
}

/// Durable at-least-once channel for [`TaskEnvelope`]s, persisted in the
/// same SQLite database as the tickets. Envelopes survive restart; a
/// delivery claimed but never acknowledged is returned to pending when the
/// queue is next opened.
#[derive(Clone)]
pub struct TaskQueue {
    db: DbHandle,
    name: String,
    max_attempts: u32,
}

impl TaskQueue {
    /// Open a named queue and recover deliveries left in flight by a
    /// previous process.
    pub async fn open(db: DbHandle, name: &str, max_attempts: u32) -> Result<Self> {
        let queue_name = name.to_string();
        let recovered = db
            .call(move |store| store.queue_recover_in_flight(&queue_name))
            .await?;
        if recovered > 0 {
            info!(queue = name, recovered, "recovered in-flight deliveries");
        }
        Ok(Self {
            db,
            name: name.to_string(),
            max_attempts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize and persist an envelope. Publish failures are returned to
    /// the caller — the transport never retries on its own.
    pub async fn publish(&self, envelope: &TaskEnvelope) -> Result<i64> {
        let payload =
            serde_json::to_string(envelope).context("Failed to serialize task envelope")?;
        let name = self.name.clone();
        self.db
            .call(move |store| store.queue_publish(&name, &payload))
            .await
    }

    /// Claim at most one pending delivery (prefetch = 1).
    pub async fn claim_one(&self) -> Result<Option<Delivery>> {
        let name = self.name.clone();
        self.db
            .call(move |store| store.queue_claim_one(&name))
            .await
    }

    pub async fn ack(&self, delivery_id: i64) -> Result<()> {
        self.db
            .call(move |store| store.queue_ack(delivery_id))
            .await
    }

    /// Returns `true` when the delivery was dead-lettered instead of
    /// requeued.
    pub async fn nack_requeue(&self, delivery_id: i64, error: Option<String>) -> Result<bool> {
        let max_attempts = self.max_attempts;
        self.db
            .call(move |store| {
                store.queue_nack_requeue(delivery_id, max_attempts, error.as_deref())
            })
            .await
    }

    pub async fn nack_discard(&self, delivery_id: i64) -> Result<()> {
        self.db
            .call(move |store| store.queue_nack_discard(delivery_id))
            .await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let name = self.name.clone();
        self.db
            .call(move |store| store.queue_pending_count(&name))
            .await
    }

    async fn apply(&self, delivery_id: i64, outcome: QueueOutcome) -> Result<()> {
        match outcome {
            QueueOutcome::Ack => self.ack(delivery_id).await,
            QueueOutcome::NackRequeue { error } => {
                let dead = self.nack_requeue(delivery_id, error).await?;
                if dead {
                    warn!(
                        queue = %self.name,
                        delivery_id,
                        "delivery exhausted retries, moved to dead letters"
                    );
                }
                Ok(())
            }
            QueueOutcome::NackDiscard => {
                warn!(queue = %self.name, delivery_id, "discarding delivery without requeue");
                self.nack_discard(delivery_id).await
            }
        }
    }

    /// Consume loop: one delivery in flight at a time, handler invoked
    /// synchronously, outcome applied before the next claim. Runs until
    /// the shutdown flag flips.
    pub async fn consume<H, Fut>(&self, mut shutdown: watch::Receiver<bool>, handler: H) -> Result<()>
    where
        H: Fn(Delivery) -> Fut,
        Fut: Future<Output = QueueOutcome>,
    {
        info!(queue = %self.name, "consuming");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.claim_one().await? {
                Some(delivery) => {
                    let delivery_id = delivery.id;
                    let outcome = handler(delivery).await;
                    self.apply(delivery_id, outcome).await?;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!(queue = %self.name, "consume loop stopped");
        Ok(())
    }
}

/// Dead letters across all queues, for inspection via the API.
pub async fn list_dead_letters(db: &DbHandle) -> Result<Vec<DeadLetter>> {
    db.call(|store| store.list_dead_letters()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TicketStore;
    use crate::models::{Priority, TicketType};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handle() -> DbHandle {
        DbHandle::new(TicketStore::new_in_memory().unwrap())
    }

    fn envelope(id: &str) -> TaskEnvelope {
        TaskEnvelope {
            ticket_id: id.to_string(),
            title: "Add search".to_string(),
            description: "Full-text search over tickets".to_string(),
            repository: "acme/app".to_string(),
            priority: Priority::High,
            ticket_type: TicketType::Feature,
            github_token: "ghp_test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_consume_roundtrip_is_byte_identical() {
        let queue = TaskQueue::open(handle(), "tickets", 5).await.unwrap();
        let sent = envelope("t-1");
        queue.publish(&sent).await.unwrap();

        let delivery = queue.claim_one().await.unwrap().unwrap();
        assert_eq!(delivery.payload, serde_json::to_string(&sent).unwrap());
        let received: TaskEnvelope = serde_json::from_str(&delivery.payload).unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_deliveries_survive_reopen() {
        let db = handle();
        let queue = TaskQueue::open(db.clone(), "tickets", 5).await.unwrap();
        queue.publish(&envelope("t-1")).await.unwrap();
        let claimed = queue.claim_one().await.unwrap().unwrap();
        drop(queue);

        // Reopening the queue recovers the unacked claim.
        let reopened = TaskQueue::open(db, "tickets", 5).await.unwrap();
        let redelivered = reopened.claim_one().await.unwrap().unwrap();
        assert_eq!(redelivered.id, claimed.id);
    }

    #[tokio::test]
    async fn test_consume_applies_ack() {
        let queue = TaskQueue::open(handle(), "tickets", 5).await.unwrap();
        queue.publish(&envelope("t-1")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = seen.clone();
        queue
            .consume(shutdown_rx, move |_delivery| {
                let seen = seen_in_handler.clone();
                let shutdown_tx = shutdown_tx.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    let _ = shutdown_tx.send(true);
                    QueueOutcome::Ack
                }
            })
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_requeues_then_redelivers() {
        let queue = TaskQueue::open(handle(), "tickets", 5).await.unwrap();
        queue.publish(&envelope("t-1")).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = calls.clone();
        queue
            .consume(shutdown_rx, move |_delivery| {
                let calls = calls_in_handler.clone();
                let shutdown_tx = shutdown_tx.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        QueueOutcome::NackRequeue {
                            error: Some("transient".to_string()),
                        }
                    } else {
                        let _ = shutdown_tx.send(true);
                        QueueOutcome::Ack
                    }
                }
            })
            .await
            .unwrap();

        // The nacked delivery came back and was handled a second time.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_discard_never_redelivers() {
        let db = handle();
        let queue = TaskQueue::open(db.clone(), "tickets", 5).await.unwrap();
        queue.publish(&envelope("t-1")).await.unwrap();

        let delivery = queue.claim_one().await.unwrap().unwrap();
        queue.nack_discard(delivery.id).await.unwrap();

        assert!(queue.claim_one().await.unwrap().is_none());
        // Discarded messages are not dead letters either.
        assert!(list_dead_letters(&db).await.unwrap().is_empty());
    }
}
