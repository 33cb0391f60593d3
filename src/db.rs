use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::models::{DomainError, Priority, Ticket, TicketStatus, TicketType};
use crate::queue::{DeadLetter, Delivery};

/// Async-safe handle to the ticket database.
///
/// Wraps `TicketStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TicketStore>>,
}

impl DbHandle {
    pub fn new(store: TicketStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TicketStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Fields accepted by a partial ticket update. `None` leaves the column
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct TicketPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub ticket_type: Option<TicketType>,
    pub priority: Option<Priority>,
    pub status: Option<TicketStatus>,
    pub order: Option<i64>,
}

pub struct TicketStore {
    conn: Connection,
}

struct TicketRow {
    id: String,
    title: String,
    description: String,
    ticket_type: String,
    priority: String,
    status: String,
    sort_order: i64,
    repository: String,
    github_issue_number: Option<i64>,
    github_issue_url: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TicketRow {
    fn into_ticket(self) -> Result<Ticket> {
        Ok(Ticket {
            id: self.id,
            title: self.title,
            description: self.description,
            ticket_type: TicketType::from_str(&self.ticket_type)
                .map_err(|e| anyhow::anyhow!(e))?,
            priority: Priority::from_str(&self.priority).map_err(|e| anyhow::anyhow!(e))?,
            status: TicketStatus::from_str(&self.status).map_err(|e| anyhow::anyhow!(e))?,
            order: self.sort_order,
            repository: self.repository,
            github_issue_number: self.github_issue_number,
            github_issue_url: self.github_issue_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const TICKET_COLUMNS: &str = "id, title, description, ticket_type, priority, status, sort_order, \
     repository, github_issue_number, github_issue_url, created_at, updated_at";

fn map_ticket_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TicketRow> {
    Ok(TicketRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        ticket_type: row.get(3)?,
        priority: row.get(4)?,
        status: row.get(5)?,
        sort_order: row.get(6)?,
        repository: row.get(7)?,
        github_issue_number: row.get(8)?,
        github_issue_url: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl TicketStore {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tickets (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    ticket_type TEXT NOT NULL DEFAULT 'feature',
                    priority TEXT NOT NULL DEFAULT 'medium',
                    status TEXT NOT NULL DEFAULT 'open',
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    repository TEXT NOT NULL,
                    github_issue_number INTEGER,
                    github_issue_url TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tickets_repository ON tickets(repository);
                CREATE INDEX IF NOT EXISTS idx_tickets_repo_status
                    ON tickets(repository, status, sort_order);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_tickets_github_number
                    ON tickets(repository, github_issue_number)
                    WHERE github_issue_number IS NOT NULL;

                CREATE TABLE IF NOT EXISTS task_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    enqueued_at TEXT NOT NULL,
                    claimed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_task_queue_claim
                    ON task_queue(queue, state, id);

                CREATE TABLE IF NOT EXISTS dead_letters (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    last_error TEXT,
                    failed_at TEXT NOT NULL
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Ticket CRUD ───────────────────────────────────────────────────

    pub fn create_ticket(
        &self,
        title: &str,
        description: &str,
        ticket_type: TicketType,
        priority: Priority,
        repository: &str,
        order: Option<i64>,
    ) -> Result<Ticket> {
        // Append to the end of the repository's queue unless an explicit
        // order was requested.
        let order = match order {
            Some(o) => o,
            None => {
                let max: i64 = self
                    .conn
                    .query_row(
                        "SELECT COALESCE(MAX(sort_order), -1) FROM tickets WHERE repository = ?1",
                        params![repository],
                        |row| row.get(0),
                    )
                    .context("Failed to get max order")?;
                max + 1
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO tickets (id, title, description, ticket_type, priority, status, \
                 sort_order, repository, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?8, ?8)",
                params![
                    id,
                    title,
                    description,
                    ticket_type.as_str(),
                    priority.as_str(),
                    order,
                    repository,
                    ts
                ],
            )
            .context("Failed to insert ticket")?;
        self.get_ticket(&id)?
            .context("Ticket not found after insert")
    }

    /// List tickets, optionally filtered by repository. Ordering is
    /// ascending by `order` with rowid as the tiebreaker, so equal orders
    /// keep insertion order (the dispatch policy relies on this stability).
    pub fn list_tickets(&self, repository: Option<&str>) -> Result<Vec<Ticket>> {
        let sql = match repository {
            Some(_) => format!(
                "SELECT {} FROM tickets WHERE repository = ?1 ORDER BY sort_order ASC, rowid ASC",
                TICKET_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM tickets ORDER BY sort_order ASC, rowid ASC",
                TICKET_COLUMNS
            ),
        };
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tickets")?;
        let rows = match repository {
            Some(repo) => stmt.query_map(params![repo], map_ticket_row),
            None => stmt.query_map([], map_ticket_row),
        }
        .context("Failed to query tickets")?;
        let mut tickets = Vec::new();
        for row in rows {
            let r = row.context("Failed to read ticket row")?;
            tickets.push(r.into_ticket()?);
        }
        Ok(tickets)
    }

    pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        let sql = format!("SELECT {} FROM tickets WHERE id = ?1", TICKET_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare get_ticket")?;
        let mut rows = stmt
            .query_map(params![id], map_ticket_row)
            .context("Failed to query ticket")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read ticket row")?;
                Ok(Some(r.into_ticket()?))
            }
            None => Ok(None),
        }
    }

    pub fn update_ticket(&self, id: &str, patch: &TicketPatch) -> Result<Ticket> {
        let current = self
            .get_ticket(id)?
            .ok_or_else(|| DomainError::TicketNotFound(id.to_string()))?;

        if let Some(next) = patch.status {
            if !current.status.can_transition_to(next) {
                return Err(DomainError::IllegalTransition {
                    from: current.status,
                    to: next,
                }
                .into());
            }
        }

        // All field updates commit atomically. Safety: DbHandle's Mutex
        // already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();

        if let Some(ref t) = patch.title {
            tx.execute(
                "UPDATE tickets SET title = ?1, updated_at = ?2 WHERE id = ?3",
                params![t, ts, id],
            )
            .context("Failed to update ticket title")?;
        }
        if let Some(ref d) = patch.description {
            tx.execute(
                "UPDATE tickets SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![d, ts, id],
            )
            .context("Failed to update ticket description")?;
        }
        if let Some(tt) = patch.ticket_type {
            tx.execute(
                "UPDATE tickets SET ticket_type = ?1, updated_at = ?2 WHERE id = ?3",
                params![tt.as_str(), ts, id],
            )
            .context("Failed to update ticket type")?;
        }
        if let Some(p) = patch.priority {
            tx.execute(
                "UPDATE tickets SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                params![p.as_str(), ts, id],
            )
            .context("Failed to update ticket priority")?;
        }
        if let Some(s) = patch.status {
            tx.execute(
                "UPDATE tickets SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![s.as_str(), ts, id],
            )
            .context("Failed to update ticket status")?;
        }
        if let Some(o) = patch.order {
            tx.execute(
                "UPDATE tickets SET sort_order = ?1, updated_at = ?2 WHERE id = ?3",
                params![o, ts, id],
            )
            .context("Failed to update ticket order")?;
        }

        tx.commit().context("Failed to commit ticket update")?;
        self.get_ticket(id)?
            .context("Ticket not found after update")
    }

    /// Transition-checked status write. Used by the worker and the sync
    /// reconciliation path.
    pub fn set_status(&self, id: &str, status: TicketStatus) -> Result<Ticket> {
        self.update_ticket(
            id,
            &TicketPatch {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    pub fn delete_ticket(&self, id: &str) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM tickets WHERE id = ?1", params![id])
            .context("Failed to delete ticket")?;
        Ok(count > 0)
    }

    // ── Dispatch claims ───────────────────────────────────────────────

    /// Compare-and-swap claim for dispatching a specific ticket: flips
    /// `open` to `in_progress` only if the ticket is still open, so two
    /// concurrent dispatch requests cannot both enqueue it.
    pub fn claim_for_dispatch(&self, id: &str) -> Result<Ticket> {
        let changed = self
            .conn
            .execute(
                "UPDATE tickets SET status = 'in_progress', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'open'",
                params![now(), id],
            )
            .context("Failed to claim ticket")?;
        if changed == 0 {
            let ticket = self
                .get_ticket(id)?
                .ok_or_else(|| DomainError::TicketNotFound(id.to_string()))?;
            return Err(DomainError::NotDispatchable {
                ticket_id: id.to_string(),
                status: ticket.status,
            }
            .into());
        }
        self.get_ticket(id)?
            .context("Ticket not found after claim")
    }

    /// Claim the head of a repository's open queue. Loops over candidates
    /// so a lost CAS race moves on to the next ticket instead of failing.
    pub fn claim_next(&self, repository: &str) -> Result<Option<Ticket>> {
        loop {
            let head: Option<String> = {
                let mut stmt = self.conn.prepare(
                    "SELECT id FROM tickets WHERE repository = ?1 AND status = 'open' \
                     ORDER BY sort_order ASC, rowid ASC LIMIT 1",
                )?;
                let mut rows = stmt.query_map(params![repository], |row| row.get(0))?;
                match rows.next() {
                    Some(row) => Some(row.context("Failed to read head ticket id")?),
                    None => None,
                }
            };
            let Some(id) = head else {
                return Ok(None);
            };
            let changed = self.conn.execute(
                "UPDATE tickets SET status = 'in_progress', updated_at = ?1 \
                 WHERE id = ?2 AND status = 'open'",
                params![now(), id],
            )?;
            if changed == 1 {
                return self.get_ticket(&id);
            }
        }
    }

    /// Unconditional status restore, used to undo a claim when the
    /// subsequent publish fails (no partial mutation visible to clients).
    pub fn restore_status(&self, id: &str, status: TicketStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tickets SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now(), id],
            )
            .context("Failed to restore ticket status")?;
        Ok(())
    }

    // ── GitHub issue linkage ──────────────────────────────────────────

    pub fn link_issue(&self, id: &str, issue_number: i64, issue_url: &str) -> Result<Ticket> {
        let ticket = self
            .get_ticket(id)?
            .ok_or_else(|| DomainError::TicketNotFound(id.to_string()))?;
        if let Some(existing) = ticket.github_issue_number {
            return Err(DomainError::AlreadyLinked {
                ticket_id: id.to_string(),
                issue_number: existing,
            }
            .into());
        }
        if self
            .find_by_issue_number(&ticket.repository, issue_number)?
            .is_some()
        {
            return Err(DomainError::DuplicateIssue {
                repository: ticket.repository,
                issue_number,
            }
            .into());
        }
        self.conn
            .execute(
                "UPDATE tickets SET github_issue_number = ?1, github_issue_url = ?2, \
                 updated_at = ?3 WHERE id = ?4",
                params![issue_number, issue_url, now(), id],
            )
            .context("Failed to link issue")?;
        self.get_ticket(id)?.context("Ticket not found after link")
    }

    pub fn unlink_issue(&self, id: &str) -> Result<Ticket> {
        let changed = self
            .conn
            .execute(
                "UPDATE tickets SET github_issue_number = NULL, github_issue_url = NULL, \
                 updated_at = ?1 WHERE id = ?2",
                params![now(), id],
            )
            .context("Failed to unlink issue")?;
        if changed == 0 {
            return Err(DomainError::TicketNotFound(id.to_string()).into());
        }
        self.get_ticket(id)?
            .context("Ticket not found after unlink")
    }

    pub fn find_by_issue_number(
        &self,
        repository: &str,
        issue_number: i64,
    ) -> Result<Option<Ticket>> {
        let sql = format!(
            "SELECT {} FROM tickets WHERE repository = ?1 AND github_issue_number = ?2",
            TICKET_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare find_by_issue_number")?;
        let mut rows = stmt
            .query_map(params![repository, issue_number], map_ticket_row)
            .context("Failed to query ticket by issue number")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read ticket row")?;
                Ok(Some(r.into_ticket()?))
            }
            None => Ok(None),
        }
    }

    /// Import a ticket from a remote issue. Returns `None` when a ticket
    /// for this (repository, issue_number) already exists — import is
    /// idempotent, the second attempt is a skip, not an error.
    pub fn create_from_issue(
        &self,
        repository: &str,
        title: &str,
        description: &str,
        issue_number: i64,
        issue_url: &str,
        status: TicketStatus,
    ) -> Result<Option<Ticket>> {
        if self.find_by_issue_number(repository, issue_number)?.is_some() {
            return Ok(None);
        }

        let max: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(sort_order), -1) FROM tickets WHERE repository = ?1",
                params![repository],
                |row| row.get(0),
            )
            .context("Failed to get max order")?;

        let id = uuid::Uuid::new_v4().to_string();
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO tickets (id, title, description, ticket_type, priority, status, \
                 sort_order, repository, github_issue_number, github_issue_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'feature', 'medium', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    title,
                    description,
                    status.as_str(),
                    max + 1,
                    repository,
                    issue_number,
                    issue_url,
                    ts
                ],
            )
            .context("Failed to insert imported ticket")?;
        self.get_ticket(&id)
    }

    // ── Queue transport rows ──────────────────────────────────────────

    pub fn queue_publish(&self, queue: &str, payload: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO task_queue (queue, payload, enqueued_at) VALUES (?1, ?2, ?3)",
                params![queue, payload, now()],
            )
            .context("Failed to publish to queue")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Claim the oldest pending delivery for a queue (prefetch = 1: the
    /// caller holds at most one unacknowledged delivery at a time).
    pub fn queue_claim_one(&self, queue: &str) -> Result<Option<Delivery>> {
        let candidate: Option<(i64, String, u32)> = {
            let mut stmt = self.conn.prepare(
                "SELECT id, payload, attempts FROM task_queue \
                 WHERE queue = ?1 AND state = 'pending' ORDER BY id ASC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![queue], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            match rows.next() {
                Some(row) => Some(row.context("Failed to read queue row")?),
                None => None,
            }
        };
        let Some((id, payload, attempts)) = candidate else {
            return Ok(None);
        };
        let changed = self.conn.execute(
            "UPDATE task_queue SET state = 'in_flight', claimed_at = ?1 \
             WHERE id = ?2 AND state = 'pending'",
            params![now(), id],
        )?;
        if changed == 0 {
            // Lost the claim to another worker process; report empty and
            // let the consume loop poll again.
            return Ok(None);
        }
        Ok(Some(Delivery {
            id,
            payload,
            attempts,
        }))
    }

    pub fn queue_ack(&self, delivery_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM task_queue WHERE id = ?1", params![delivery_id])
            .context("Failed to ack delivery")?;
        Ok(())
    }

    /// Requeue a failed delivery, or move it to the dead-letter table once
    /// `max_attempts` redeliveries have been burned. Returns `true` when
    /// the envelope was dead-lettered.
    pub fn queue_nack_requeue(
        &self,
        delivery_id: i64,
        max_attempts: u32,
        error: Option<&str>,
    ) -> Result<bool> {
        let row: Option<(String, String, u32)> = {
            let mut stmt = self.conn.prepare(
                "SELECT queue, payload, attempts FROM task_queue WHERE id = ?1",
            )?;
            let mut rows = stmt.query_map(params![delivery_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            match rows.next() {
                Some(r) => Some(r.context("Failed to read queue row")?),
                None => None,
            }
        };
        let Some((queue, payload, attempts)) = row else {
            // Already acked or discarded; nothing to requeue.
            return Ok(false);
        };

        let attempts = attempts + 1;
        if attempts >= max_attempts {
            let tx = self
                .conn
                .unchecked_transaction()
                .context("Failed to begin dead-letter transaction")?;
            tx.execute(
                "INSERT INTO dead_letters (queue, payload, attempts, last_error, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![queue, payload, attempts, error, now()],
            )
            .context("Failed to insert dead letter")?;
            tx.execute("DELETE FROM task_queue WHERE id = ?1", params![delivery_id])
                .context("Failed to remove dead-lettered delivery")?;
            tx.commit().context("Failed to commit dead-letter move")?;
            return Ok(true);
        }

        self.conn
            .execute(
                "UPDATE task_queue SET state = 'pending', attempts = ?1, claimed_at = NULL \
                 WHERE id = ?2",
                params![attempts, delivery_id],
            )
            .context("Failed to requeue delivery")?;
        Ok(false)
    }

    pub fn queue_nack_discard(&self, delivery_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM task_queue WHERE id = ?1", params![delivery_id])
            .context("Failed to discard delivery")?;
        Ok(())
    }

    /// Return deliveries stuck `in_flight` (a worker died mid-task) to
    /// `pending`. Called when a queue is opened; this is where the
    /// at-least-once redelivery on crash comes from.
    pub fn queue_recover_in_flight(&self, queue: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE task_queue SET state = 'pending', claimed_at = NULL \
                 WHERE queue = ?1 AND state = 'in_flight'",
                params![queue],
            )
            .context("Failed to recover in-flight deliveries")
    }

    pub fn queue_pending_count(&self, queue: &str) -> Result<u64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM task_queue WHERE queue = ?1 AND state = 'pending'",
                params![queue],
                |row| row.get(0),
            )
            .context("Failed to count pending deliveries")
    }

    pub fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, queue, payload, attempts, last_error, failed_at \
                 FROM dead_letters ORDER BY id ASC",
            )
            .context("Failed to prepare list_dead_letters")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DeadLetter {
                    id: row.get(0)?,
                    queue: row.get(1)?,
                    payload: row.get(2)?,
                    attempts: row.get(3)?,
                    last_error: row.get(4)?,
                    failed_at: row.get(5)?,
                })
            })
            .context("Failed to query dead letters")?;
        let mut letters = Vec::new();
        for row in rows {
            letters.push(row.context("Failed to read dead letter row")?);
        }
        Ok(letters)
    }
}
