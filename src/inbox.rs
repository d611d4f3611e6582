//! Idempotency gate for message consumers.
//!
//! The outbox dispatcher delivers at-least-once; this gate turns that into
//! effectively-once *side effects*. Each `(consumer, message_id)` pair is
//! leased before the handler runs, so duplicates are skipped and a worker
//! that crashed mid-processing is recovered by takeover once its lease
//! expires.

use std::future::Future;

use crate::config::InboxConfig;
use crate::error::Error;
use crate::store::InboxStore;

/// What the gate did with one delivery.
#[derive(Debug)]
pub enum InboxOutcome<T> {
    /// The handler ran to completion; the record is terminally `processed`.
    Processed(T),
    /// Another worker holds the lease, or the record is already terminal.
    /// The handler was not invoked.
    Skipped,
}

impl<T> InboxOutcome<T> {
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Processed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Entry point for consumers.
#[derive(Clone)]
pub struct Inbox<S> {
    store: S,
    config: InboxConfig,
}

impl<S> Inbox<S>
where
    S: InboxStore,
{
    pub fn new(store: S) -> Self {
        Self::with_config(store, InboxConfig::default())
    }

    pub fn with_config(store: S, config: InboxConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &InboxConfig {
        &self.config
    }

    /// Run `handler` at most once for `(consumer, message_id)`.
    ///
    /// A handler error is recorded as terminal `failed` and then re-raised
    /// wrapped in [`Error::Handler`], so the consumer framework can NACK
    /// the upstream message. Retrying a `failed` record is an operator
    /// decision, not something this gate does on its own.
    pub async fn with_idempotency<F, Fut, T>(
        &self,
        consumer: &str,
        message_id: &str,
        handler: F,
    ) -> Result<InboxOutcome<T>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        if consumer.trim().is_empty() {
            return Err(Error::invalid_parameter("consumer must be non-empty"));
        }
        if message_id.trim().is_empty() {
            return Err(Error::invalid_parameter("message_id must be non-empty"));
        }

        if !self
            .store
            .acquire_lock(consumer, message_id, &self.config)
            .await?
        {
            tracing::debug!(consumer, message_id, "duplicate or contended message skipped");
            return Ok(InboxOutcome::Skipped);
        }

        match handler().await {
            Ok(value) => {
                self.store
                    .mark_inbox_processed(consumer, message_id, &self.config)
                    .await?;

                Ok(InboxOutcome::Processed(value))
            }
            Err(source) => {
                if let Err(e) = self
                    .store
                    .mark_inbox_failed(consumer, message_id, &source.to_string(), &self.config)
                    .await
                {
                    tracing::error!(consumer, message_id, error = %e, "handler failure not recorded");
                }

                Err(Error::Handler { source })
            }
        }
    }
}
