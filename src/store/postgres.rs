use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use crate::config::{Config, DispatcherConfig, InboxConfig};
use crate::dispatcher::retry_delay;
use crate::error::Error;
use crate::event::{EventDraft, OutboxEvent, OutboxStats};
use crate::record::InboxRecord;
use crate::store::{DispatcherStore, InboxStore, OutboxStore};

/// Postgres implementation of all three store contracts.
///
/// Cheap to clone; every clone shares the same pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing pool. Migrations are the caller's business.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    /// Connect and bring the default tables up to date.
    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        let pool = PgPoolOptions::new().connect(config.database_url()).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Fetch a single outbox row.
    pub async fn event(
        &self,
        event_id: Uuid,
        config: &DispatcherConfig,
    ) -> Result<Option<OutboxEvent>, Error> {
        let mut db = self.pool.acquire().await?;

        Ok(sqlx::query_as(&format!(
            "
            SELECT * FROM {} WHERE event_id = $1
            ",
            config.table_name()
        ))
        .bind(event_id)
        .fetch_optional(&mut *db)
        .await?)
    }

    /// Events emitted by one entity instance, oldest first.
    pub async fn events_for_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        config: &DispatcherConfig,
    ) -> Result<Vec<OutboxEvent>, Error> {
        let mut db = self.pool.acquire().await?;

        let query = format!(
            "
            SELECT * FROM {}
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY created_at ASC
            ",
            config.table_name()
        );

        let mut stream = sqlx::query_as(&query)
            .bind(aggregate_type)
            .bind(aggregate_id)
            .fetch(&mut *db);

        let mut events = Vec::new();

        while let Some(event) = stream.next().await.transpose()? {
            events.push(event);
        }

        Ok(events)
    }

    /// Per-status row counts for monitoring.
    pub async fn outbox_stats(&self, config: &DispatcherConfig) -> Result<OutboxStats, Error> {
        let mut db = self.pool.acquire().await?;

        Ok(sqlx::query_as(&format!(
            "
            SELECT
                COUNT(CASE WHEN status = 'pending' THEN 1 END) as pending,
                COUNT(CASE WHEN status = 'sent' THEN 1 END) as sent,
                COUNT(CASE WHEN status = 'failed' THEN 1 END) as failed,
                COUNT(CASE WHEN status = 'dead' THEN 1 END) as dead
            FROM {}
            ",
            config.table_name()
        ))
        .fetch_one(&mut *db)
        .await?)
    }

    /// Operator reset of a dead-lettered row back to `pending`.
    ///
    /// Attempts and schedule are cleared; `last_error` is kept for
    /// diagnosis. Returns false when the row is missing or not `dead`.
    pub async fn redrive(
        &self,
        event_id: Uuid,
        config: &DispatcherConfig,
    ) -> Result<bool, Error> {
        let mut db = self.pool.acquire().await?;

        let result = sqlx::query(&format!(
            "
            UPDATE {}
            SET status = 'pending', attempts = 0, next_attempt_at = NULL,
                dead_at = NULL, claimed_until = NULL
            WHERE event_id = $1 AND status = 'dead'
            ",
            config.table_name()
        ))
        .bind(event_id)
        .execute(&mut *db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fetch a single inbox record.
    pub async fn inbox_record(
        &self,
        consumer: &str,
        message_id: &str,
        config: &InboxConfig,
    ) -> Result<Option<InboxRecord>, Error> {
        let mut db = self.pool.acquire().await?;

        Ok(sqlx::query_as(&format!(
            "
            SELECT * FROM {} WHERE consumer = $1 AND message_id = $2
            ",
            config.table_name()
        ))
        .bind(consumer)
        .bind(message_id)
        .fetch_optional(&mut *db)
        .await?)
    }
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn emit(
        &self,
        tx: &mut PgConnection,
        draft: &EventDraft,
        table: &str,
    ) -> Result<Uuid, Error> {
        draft.validate()?;

        let event_id = Uuid::new_v4();

        sqlx::query(&format!(
            "
            INSERT INTO {table}
                (event_id, aggregate_type, aggregate_id, event_type, payload, headers, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, now())
            ",
        ))
        .bind(event_id)
        .bind(&draft.aggregate_type)
        .bind(&draft.aggregate_id)
        .bind(&draft.event_type)
        .bind(&draft.payload)
        .bind(&draft.headers)
        .execute(tx)
        .await?;

        Ok(event_id)
    }
}

#[async_trait]
impl DispatcherStore for PgStore {
    async fn claim_batch(&self, config: &DispatcherConfig) -> Result<Vec<OutboxEvent>, Error> {
        let mut db = self.pool.acquire().await?;

        let claimed_until =
            Utc::now() + chrono::Duration::milliseconds(config.claim_ttl_ms() as i64);

        // Selecting and claim-stamping are one atomic statement, so the
        // claim survives commit and a concurrent worker cannot pick up a
        // row that is mid-publish. An expired stamp makes the row
        // claimable again: a worker that crashes between claim and
        // settlement costs a duplicate delivery, never a lost one.
        let query = format!(
            "
            WITH claimable AS (
                SELECT event_id FROM {table}
                WHERE (status = 'pending'
                    OR (status = 'failed' AND next_attempt_at <= now() AND attempts < $1))
                  AND (claimed_until IS NULL OR claimed_until < now())
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE {table} o
                SET claimed_until = $3
                FROM claimable c
                WHERE o.event_id = c.event_id
                RETURNING o.*
            )
            SELECT * FROM claimed ORDER BY created_at ASC
            ",
            table = config.table_name()
        );

        let mut events = Vec::new();

        {
            let mut stream = sqlx::query_as::<_, OutboxEvent>(&query)
                .bind(config.max_attempts() as i32)
                .bind(config.batch_size() as i64)
                .bind(claimed_until)
                .fetch(&mut *db);

            while let Some(event) = stream.next().await.transpose()? {
                events.push(event);
            }
        }

        Ok(events)
    }

    async fn mark_outbox_sent(
        &self,
        event_id: Uuid,
        config: &DispatcherConfig,
    ) -> Result<(), Error> {
        let mut db = self.pool.acquire().await?;

        // Terminal rows are never overwritten, even if a second worker
        // settles late.
        sqlx::query(&format!(
            "
            UPDATE {}
            SET status = 'sent', published_at = now(), claimed_until = NULL
            WHERE event_id = $1 AND status NOT IN ('sent', 'dead')
            ",
            config.table_name()
        ))
        .bind(event_id)
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    async fn mark_outbox_failed(
        &self,
        event_id: Uuid,
        error: &str,
        prior_attempts: i32,
        config: &DispatcherConfig,
    ) -> Result<(), Error> {
        let mut db = self.pool.acquire().await?;

        let attempts = prior_attempts.saturating_add(1);

        if attempts as u32 >= config.max_attempts() {
            tracing::warn!(%event_id, attempts, "retry budget exhausted, dead-lettering");

            sqlx::query(&format!(
                "
                UPDATE {}
                SET status = 'dead', attempts = $2, last_error = $3,
                    next_attempt_at = NULL, dead_at = now(), claimed_until = NULL
                WHERE event_id = $1 AND status NOT IN ('sent', 'dead')
                ",
                config.table_name()
            ))
            .bind(event_id)
            .bind(attempts)
            .bind(error)
            .execute(&mut *db)
            .await?;
        } else {
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(retry_delay(attempts as u32, config))
                    .unwrap_or_else(|_| chrono::Duration::days(3650));

            sqlx::query(&format!(
                "
                UPDATE {}
                SET status = 'failed', attempts = $2, last_error = $3,
                    next_attempt_at = $4, claimed_until = NULL
                WHERE event_id = $1 AND status NOT IN ('sent', 'dead')
                ",
                config.table_name()
            ))
            .bind(event_id)
            .bind(attempts)
            .bind(error)
            .bind(next_attempt_at)
            .execute(&mut *db)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl InboxStore for PgStore {
    async fn acquire_lock(
        &self,
        consumer: &str,
        message_id: &str,
        config: &InboxConfig,
    ) -> Result<bool, Error> {
        let mut db = self.pool.acquire().await?;

        let locked_until = Utc::now() + chrono::Duration::milliseconds(config.ttl_ms() as i64);

        // First-seen path: insert wins the lease outright.
        let inserted = sqlx::query(&format!(
            "
            INSERT INTO {} (consumer, message_id, status, locked_until, created_at, retry_count)
            VALUES ($1, $2, 'processing', $3, now(), 0)
            ON CONFLICT (consumer, message_id) DO NOTHING
            ",
            config.table_name()
        ))
        .bind(consumer)
        .bind(message_id)
        .bind(locked_until)
        .execute(&mut *db)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(true);
        }

        // Takeover path: only an expired `processing` lease is up for
        // grabs. Terminal records and live leases update zero rows.
        let takeover = sqlx::query(&format!(
            "
            UPDATE {}
            SET locked_until = $3, retry_count = retry_count + 1,
                last_error = 'Takeover from crash'
            WHERE consumer = $1 AND message_id = $2
              AND status = 'processing' AND locked_until < now()
            ",
            config.table_name()
        ))
        .bind(consumer)
        .bind(message_id)
        .bind(locked_until)
        .execute(&mut *db)
        .await?;

        Ok(takeover.rows_affected() == 1)
    }

    async fn mark_inbox_processed(
        &self,
        consumer: &str,
        message_id: &str,
        config: &InboxConfig,
    ) -> Result<(), Error> {
        let mut db = self.pool.acquire().await?;

        sqlx::query(&format!(
            "
            UPDATE {}
            SET status = 'processed', processed_at = now(), locked_until = NULL
            WHERE consumer = $1 AND message_id = $2
            ",
            config.table_name()
        ))
        .bind(consumer)
        .bind(message_id)
        .execute(&mut *db)
        .await?;

        Ok(())
    }

    async fn mark_inbox_failed(
        &self,
        consumer: &str,
        message_id: &str,
        error: &str,
        config: &InboxConfig,
    ) -> Result<(), Error> {
        let mut db = self.pool.acquire().await?;

        sqlx::query(&format!(
            "
            UPDATE {}
            SET status = 'failed', last_error = $3, locked_until = NULL
            WHERE consumer = $1 AND message_id = $2
            ",
            config.table_name()
        ))
        .bind(consumer)
        .bind(message_id)
        .bind(error)
        .execute(&mut *db)
        .await?;

        Ok(())
    }
}
