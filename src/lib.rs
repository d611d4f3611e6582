//! Transactional outbox + inbox for Postgres-backed services.
//!
//! Solves the dual-write problem in three parts:
//!
//! - [`outbox::Outbox::emit`] co-writes a pending event with business
//!   state in the caller's own transaction.
//! - [`dispatcher::dispatcher`] runs a background claim/publish/settle
//!   loop with exponential backoff and a dead-letter terminal state.
//!   Delivery is at-least-once.
//! - [`inbox::Inbox::with_idempotency`] gates consumer side effects so
//!   they run at most once per `(consumer, message_id)`, with lease
//!   takeover for workers that crash mid-processing.
//!
//! The store contracts in [`store`] decouple all three from the default
//! [`store::postgres::PgStore`] backend.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod inbox;
pub mod outbox;
pub mod publisher;
pub mod record;
pub mod store;
