use sqlx::PgConnection;
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::Error;
use crate::event::EventDraft;
use crate::store::OutboxStore;

/// Entry point for producers.
///
/// The façade never opens or manages a transaction; atomicity with the
/// business write is exactly the property of using the caller's own
/// transaction:
///
/// ```ignore
/// let mut tx = store.pool().begin().await?;
///
/// sqlx::query("UPDATE orders SET status = 'placed' WHERE id = $1")
///     .bind(order_id)
///     .execute(&mut *tx)
///     .await?;
///
/// let event_id = outbox
///     .emit(
///         &mut tx,
///         EventDraft::builder()
///             .aggregate_type("order")
///             .aggregate_id(order_id.to_string())
///             .event_type("order.placed")
///             .payload(serde_json::json!({ "order_id": order_id }))
///             .build(),
///     )
///     .await?;
///
/// tx.commit().await?;
/// ```
#[derive(Clone)]
pub struct Outbox<S> {
    store: S,
    config: OutboxConfig,
}

impl<S> Outbox<S>
where
    S: OutboxStore,
{
    pub fn new(store: S) -> Self {
        Self::with_config(store, OutboxConfig::default())
    }

    pub fn with_config(store: S, config: OutboxConfig) -> Self {
        Self { store, config }
    }

    /// Record a durable intent to publish inside the caller's transaction.
    ///
    /// Validates the draft, assigns a fresh v4 event id, and inserts a
    /// `pending` row. If the transaction rolls back, no row exists.
    pub async fn emit(&self, tx: &mut PgConnection, draft: EventDraft) -> Result<Uuid, Error> {
        self.store.emit(tx, &draft, self.config.table_name()).await
    }
}
