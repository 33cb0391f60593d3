//! AutoCode — ticket dispatch back-end.
//!
//! ## Overview
//!
//! Development tickets live in a SQLite database, optionally mirrored to
//! GitHub issues. Dispatching a ticket claims it and publishes a task
//! envelope onto a durable queue; a worker consumes one envelope at a
//! time, hands it to an AI coding agent, and reports the outcome back to
//! the ticket, the linked issue, and any WebSocket listeners.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP    ┌─────────────────────────────────────────────┐
//! │  Client  │ ────────> │  server.rs  (Router assembly, lifecycle)    │
//! │          │ <──────── │    └─ api.rs  (handlers, AppState)          │
//! └──────────┘ WebSocket │         │                │                  │
//!                        │         │ claim + publish│ next_ticket()    │
//!                        │         v                v                  │
//!                        │  queue.rs (TaskQueue)  dispatch.rs          │
//!                        │         │                                   │
//!                        │         │ consume (prefetch = 1)            │
//!                        │         v                                   │
//!                        │  worker.rs ──> agent/ (claude, opencode)    │
//!                        │         │                                   │
//!                        │         └──> github.rs (status sync)        │
//!                        └─────────────────────────────────────────────┘
//! ```
//!
//! | Module     | Responsibility                                        |
//! |------------|-------------------------------------------------------|
//! | `models`   | Ticket, status/priority/type enums, task envelope     |
//! | `db`       | SQLite access via `DbHandle`, CAS dispatch claims     |
//! | `dispatch` | Pure next-ticket selection policy                     |
//! | `queue`    | Durable at-least-once task queue with dead letters    |
//! | `worker`   | Consume loop bridging queue to an execution strategy  |
//! | `agent`    | `Agent` trait + Claude / OpenCode implementations     |
//! | `github`   | Issue client + bidirectional status mapping           |
//! | `api`      | REST handlers                                         |
//! | `ws`       | WebSocket fan-out (`status_update` / `log` frames)    |
//! | `config`   | Environment-driven configuration                      |

pub mod agent;
pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod github;
pub mod models;
pub mod queue;
pub mod server;
pub mod worker;
pub mod ws;
