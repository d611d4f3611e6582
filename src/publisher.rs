use std::future::Future;

use async_trait::async_trait;

use crate::event::OutboxEvent;

/// Transport seam between the dispatcher and the outside world.
///
/// Any error from [`Publisher::publish`] is treated as retryable; the
/// dispatcher schedules the next attempt and eventually dead-letters the
/// event. Implementations that can hang must enforce their own timeouts.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Called once before the dispatch loop begins.
    async fn start(&self) -> eyre::Result<()> {
        Ok(())
    }

    /// Called after the loop has drained during shutdown.
    async fn stop(&self) -> eyre::Result<()> {
        Ok(())
    }

    /// Send one event.
    async fn publish(&self, event: &OutboxEvent) -> eyre::Result<()>;
}

/// [`Publisher`] wrapping a plain async function, with no-op lifecycle.
pub struct FnPublisher<F> {
    f: F,
}

/// Adapt a unary send function into a [`Publisher`].
pub fn publisher_fn<F, Fut>(f: F) -> FnPublisher<F>
where
    F: Fn(OutboxEvent) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send,
{
    FnPublisher { f }
}

#[async_trait]
impl<F, Fut> Publisher for FnPublisher<F>
where
    F: Fn(OutboxEvent) -> Fut + Send + Sync,
    Fut: Future<Output = eyre::Result<()>> + Send,
{
    async fn publish(&self, event: &OutboxEvent) -> eyre::Result<()> {
        (self.f)(event.clone()).await
    }
}
