//! `goclaw-store`: the durable task queue and conversation store backing
//! the goclaw multi-agent orchestration daemon.
//!
//! A single SQLite file holds every table a running daemon needs: the task
//! lattice and its append-only event log, conversation history, the
//! inter-agent mailbox, agent memory and shared pins, delegation and
//! schedule bookkeeping, and the idempotency ledger for at-most-once tool
//! side effects. Everything funnels through one [`Store`] behind a single
//! connection — there is no connection pool, because SQLite's single-writer
//! model makes one unnecessary.
//!
//! Open one with [`Store::open_default`] or [`Store::open`], then share it
//! behind an `Arc`.

pub mod config;
pub mod context;
pub mod conversation;
pub mod delegation;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod knowledge;
pub mod ops;
pub mod plan;
pub mod publisher;
pub mod retry;
pub mod schedule;
pub mod schema;
pub mod skills;
pub mod store;
pub mod tasks;
pub mod transitions;
pub mod types;

pub use config::StoreConfig;
pub use context::OpContext;
pub use error::StoreError;
pub use store::Store;
