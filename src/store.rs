//! Capability contracts the outbox, dispatcher, and inbox depend on.
//!
//! The default backend ([`postgres::PgStore`]) is one value satisfying all
//! three traits; tests and alternative backends can satisfy any subset.

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::config::{DispatcherConfig, InboxConfig};
use crate::error::Error;
use crate::event::{EventDraft, OutboxEvent};

pub mod postgres;

/// Durable co-writing of a pending event with the caller's business state.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a `pending` row inside the caller's live transaction.
    ///
    /// The row becomes visible to other readers if and only if the
    /// enclosing transaction commits. The event id is generated here, not
    /// supplied by the caller.
    async fn emit(
        &self,
        tx: &mut PgConnection,
        draft: &EventDraft,
        table: &str,
    ) -> Result<Uuid, Error>;
}

/// Claim/settle surface the background dispatcher drives.
#[async_trait]
pub trait DispatcherStore: Send + Sync {
    /// Return up to `batch_size` claimable rows: `pending`, or `failed`
    /// with an elapsed `next_attempt_at` and attempts below the budget.
    ///
    /// Rows held by another worker are skipped, never waited on. Ordering
    /// is `created_at` ascending. Claiming stamps a `claim_ttl_ms` lease
    /// on each returned row in the same atomic statement, so no other
    /// worker can claim it until the lease expires; settlement is a
    /// second call and clears the lease.
    async fn claim_batch(&self, config: &DispatcherConfig) -> Result<Vec<OutboxEvent>, Error>;

    /// Terminal success: `sent` with `published_at = now`. Rows already
    /// in a terminal state are left untouched.
    async fn mark_outbox_sent(
        &self,
        event_id: Uuid,
        config: &DispatcherConfig,
    ) -> Result<(), Error>;

    /// Record a failed publish attempt: schedules a retry, or transitions
    /// to `dead` once the attempt budget is exhausted. Rows already in a
    /// terminal state are left untouched.
    async fn mark_outbox_failed(
        &self,
        event_id: Uuid,
        error: &str,
        prior_attempts: i32,
        config: &DispatcherConfig,
    ) -> Result<(), Error>;
}

/// Lease-based dedup surface the inbox gate drives.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Try to lease `(consumer, message_id)` for `ttl_ms`.
    ///
    /// True on first-seen insert or on takeover of an expired
    /// `processing` lease; false while another worker holds a live lease
    /// or once the record is terminal.
    async fn acquire_lock(
        &self,
        consumer: &str,
        message_id: &str,
        config: &InboxConfig,
    ) -> Result<bool, Error>;

    async fn mark_inbox_processed(
        &self,
        consumer: &str,
        message_id: &str,
        config: &InboxConfig,
    ) -> Result<(), Error>;

    async fn mark_inbox_failed(
        &self,
        consumer: &str,
        message_id: &str,
        error: &str,
        config: &InboxConfig,
    ) -> Result<(), Error>;
}
