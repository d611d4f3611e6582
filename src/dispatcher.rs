use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::event::OutboxEvent;
use crate::publisher::Publisher;
use crate::store::DispatcherStore;

/// Cool-down applied after an unexpected error in the poll loop, so a
/// persistent storage failure cannot spin the worker.
const LOOP_ERROR_COOLDOWN: Duration = Duration::from_secs(5);

/// Returns a builder for a background dispatcher.
///
/// The finishing call starts the publisher, spawns the worker task, and
/// hands back a [`DispatcherHandle`]. Multiple dispatchers may run against
/// the same table, in-process or across hosts; the skip-locked claim and
/// its durable lease keep them from double-publishing.
#[bon::builder(finish_fn = start)]
pub async fn dispatcher<S, P>(
    store: S,
    publisher: P,
    #[builder(default)] config: DispatcherConfig,
) -> Result<DispatcherHandle, Error>
where
    S: DispatcherStore + 'static,
    P: Publisher + 'static,
{
    publisher
        .start()
        .await
        .map_err(|source| Error::PublisherStart { source })?;

    let token = CancellationToken::new();

    let worker = tokio::spawn(run_worker(
        Arc::new(store),
        Arc::new(publisher),
        config,
        token.clone(),
    ));

    Ok(DispatcherHandle {
        token,
        worker: Some(worker),
    })
}

/// Handle for signalling and awaiting a running dispatcher.
pub struct DispatcherHandle {
    token: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal the worker without waiting for it.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Signal the worker, then wait for the in-flight batch to drain and
    /// the publisher to stop.
    pub async fn stop(mut self) {
        self.token.cancel();

        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run_worker<S, P>(
    store: Arc<S>,
    publisher: Arc<P>,
    config: DispatcherConfig,
    token: CancellationToken,
) where
    S: DispatcherStore + 'static,
    P: Publisher + 'static,
{
    tracing::info!(table = config.table_name(), "dispatcher started");

    loop {
        if token.is_cancelled() {
            break;
        }

        match store.claim_batch(&config).await {
            Ok(events) if events.is_empty() => {
                let idle = Duration::from_millis(config.poll_interval_ms());
                if sleep_or_cancelled(&token, idle).await {
                    break;
                }
            }
            Ok(events) => {
                let mut batch = JoinSet::new();

                for event in events {
                    let store = store.clone();
                    let publisher = publisher.clone();
                    let config = config.clone();

                    batch.spawn(async move {
                        process_event(&*store, &*publisher, event, &config).await;
                    });
                }

                // A stop signal lets the claimed batch settle; it only
                // prevents the next claim.
                while batch.join_next().await.is_some() {}
            }
            Err(e) => {
                tracing::error!(error = %e, "claim failed");
                if sleep_or_cancelled(&token, LOOP_ERROR_COOLDOWN).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = publisher.stop().await {
        tracing::warn!(error = %e, "publisher stop failed");
    }

    tracing::info!("dispatcher stopped");
}

/// Publish one claimed event and settle the row.
///
/// Publish happens before the settlement write, so a crash in between
/// re-delivers the event once its claim lease expires. That is the
/// at-least-once boundary of the outbox; settlement failures are logged
/// and swallowed so one bad row cannot take the worker down.
async fn process_event<S, P>(store: &S, publisher: &P, event: OutboxEvent, config: &DispatcherConfig)
where
    S: DispatcherStore + ?Sized,
    P: Publisher + ?Sized,
{
    let event_id = event.event_id;
    let prior_attempts = event.attempts;

    match publisher.publish(&event).await {
        Ok(()) => {
            if let Err(e) = store.mark_outbox_sent(event_id, config).await {
                tracing::error!(%event_id, error = %e, "published but not settled; row retries after its claim lease");
            }
        }
        Err(publish_err) => {
            tracing::warn!(%event_id, error = %publish_err, "publish failed");

            if let Err(e) = store
                .mark_outbox_failed(event_id, &publish_err.to_string(), prior_attempts, config)
                .await
            {
                tracing::error!(%event_id, error = %e, "failure not recorded; row retries after its claim lease");
            }
        }
    }
}

async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Delay before attempt `attempts + 1`, with 0–10% additive jitter.
pub fn retry_delay(attempts: u32, config: &DispatcherConfig) -> Duration {
    let exponent = attempts.saturating_sub(1);
    let base = config.initial_backoff_ms() as f64
        * config.backoff_multiplier().powi(exponent as i32);
    let jitter = base * rand::random::<f64>() * 0.1;

    Duration::from_millis((base + jitter).floor() as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::event::EventStatus;

    /// In-memory rendition of the outbox table, faithful to the state
    /// lattice the real store enforces.
    #[derive(Clone, Default)]
    struct MemStore {
        events: Arc<Mutex<Vec<OutboxEvent>>>,
    }

    impl MemStore {
        fn seed(&self, n: usize) -> Vec<Uuid> {
            let mut events = self.events.lock().unwrap();
            let mut ids = Vec::new();

            for i in 0..n {
                let event = sample_event(i);
                ids.push(event.event_id);
                events.push(event);
            }

            ids
        }

        fn get(&self, event_id: Uuid) -> OutboxEvent {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|e| e.event_id == event_id)
                .cloned()
                .unwrap()
        }

        fn count_with(&self, status: EventStatus) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.status == status)
                .count()
        }
    }

    #[async_trait]
    impl DispatcherStore for MemStore {
        async fn claim_batch(
            &self,
            config: &DispatcherConfig,
        ) -> Result<Vec<OutboxEvent>, Error> {
            let now = Utc::now();
            let claimed_until =
                now + chrono::Duration::milliseconds(config.claim_ttl_ms() as i64);
            let mut events = self.events.lock().unwrap();

            let mut picked: Vec<usize> = events
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    let unclaimed = e.claimed_until.map_or(true, |at| at < now);
                    unclaimed
                        && match e.status {
                            EventStatus::Pending => true,
                            EventStatus::Failed => {
                                e.next_attempt_at.is_some_and(|at| at <= now)
                                    && (e.attempts as u32) < config.max_attempts()
                            }
                            EventStatus::Sent | EventStatus::Dead => false,
                        }
                })
                .map(|(i, _)| i)
                .collect();

            picked.sort_by_key(|&i| events[i].created_at);
            picked.truncate(config.batch_size());

            let mut claimed = Vec::with_capacity(picked.len());
            for i in picked {
                events[i].claimed_until = Some(claimed_until);
                claimed.push(events[i].clone());
            }

            Ok(claimed)
        }

        async fn mark_outbox_sent(
            &self,
            event_id: Uuid,
            _config: &DispatcherConfig,
        ) -> Result<(), Error> {
            let mut events = self.events.lock().unwrap();
            let event = events.iter_mut().find(|e| e.event_id == event_id).unwrap();

            if matches!(event.status, EventStatus::Sent | EventStatus::Dead) {
                return Ok(());
            }

            event.status = EventStatus::Sent;
            event.published_at = Some(Utc::now());
            event.claimed_until = None;

            Ok(())
        }

        async fn mark_outbox_failed(
            &self,
            event_id: Uuid,
            error: &str,
            prior_attempts: i32,
            config: &DispatcherConfig,
        ) -> Result<(), Error> {
            let mut events = self.events.lock().unwrap();
            let event = events.iter_mut().find(|e| e.event_id == event_id).unwrap();

            if matches!(event.status, EventStatus::Sent | EventStatus::Dead) {
                return Ok(());
            }

            event.attempts = prior_attempts + 1;
            event.last_error = Some(error.to_owned());
            event.claimed_until = None;

            if event.attempts as u32 >= config.max_attempts() {
                event.status = EventStatus::Dead;
                event.next_attempt_at = None;
                event.dead_at = Some(Utc::now());
            } else {
                event.status = EventStatus::Failed;
                event.next_attempt_at = Some(
                    Utc::now()
                        + chrono::Duration::from_std(retry_delay(event.attempts as u32, config))
                            .unwrap(),
                );
            }

            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct SpyPublisher {
        published: Arc<Mutex<Vec<Uuid>>>,
        fail_event_type: Option<&'static str>,
        publish_delay: Option<Duration>,
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl SpyPublisher {
        fn seen(&self) -> usize {
            self.published.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Publisher for SpyPublisher {
        async fn start(&self) -> eyre::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> eyre::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&self, event: &OutboxEvent) -> eyre::Result<()> {
            if let Some(delay) = self.publish_delay {
                tokio::time::sleep(delay).await;
            }

            if self.fail_event_type == Some(event.event_type.as_str()) {
                return Err(eyre::eyre!("simulated broker failure"));
            }

            self.published.lock().unwrap().push(event.event_id);
            Ok(())
        }
    }

    fn sample_event(i: usize) -> OutboxEvent {
        OutboxEvent {
            event_id: Uuid::new_v4(),
            aggregate_type: "order".to_owned(),
            aggregate_id: format!("order-{i}"),
            event_type: "order.placed".to_owned(),
            payload: serde_json::json!({ "seq": i }),
            headers: None,
            status: EventStatus::Pending,
            attempts: 0,
            next_attempt_at: None,
            claimed_until: None,
            created_at: Utc::now() + chrono::Duration::microseconds(i as i64),
            published_at: None,
            last_error: None,
            dead_at: None,
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            poll_interval_ms: Some(5),
            initial_backoff_ms: Some(1),
            ..Default::default()
        }
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(deadline, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[test]
    fn retry_delay_stays_within_jitter_bounds() {
        let config = DispatcherConfig {
            initial_backoff_ms: Some(100),
            backoff_multiplier: Some(2.0),
            ..Default::default()
        };

        for attempts in 1..=6u32 {
            let base = 100.0 * 2f64.powi(attempts as i32 - 1);
            let delay = retry_delay(attempts, &config).as_millis() as f64;

            assert!(delay >= base, "attempt {attempts}: {delay} < {base}");
            assert!(delay <= base * 1.1, "attempt {attempts}: {delay} > {}", base * 1.1);
        }
    }

    #[tokio::test]
    async fn claimed_rows_are_invisible_until_settled() {
        let store = MemStore::default();
        let ids = store.seed(2);
        let config = fast_config();

        let first = store.claim_batch(&config).await.unwrap();
        assert_eq!(first.len(), 2);

        // The claim lease keeps a second worker away until settlement.
        assert!(store.claim_batch(&config).await.unwrap().is_empty());

        store.mark_outbox_sent(ids[0], &config).await.unwrap();
        store
            .mark_outbox_failed(ids[1], "broker unreachable", 0, &config)
            .await
            .unwrap();

        // A late failure report cannot flip the settled row back.
        store
            .mark_outbox_failed(ids[0], "late failure", 0, &config)
            .await
            .unwrap();
        assert_eq!(store.get(ids[0]).status, EventStatus::Sent);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn publishes_pending_events_and_settles_them() {
        let store = MemStore::default();
        let ids = store.seed(3);
        let publisher = SpyPublisher::default();

        let handle = dispatcher()
            .store(store.clone())
            .publisher(publisher.clone())
            .config(fast_config())
            .start()
            .await
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || publisher.seen() == 3).await);
        handle.stop().await;

        assert!(publisher.started.load(Ordering::SeqCst));
        assert!(publisher.stopped.load(Ordering::SeqCst));

        for id in ids {
            let event = store.get(id);
            assert_eq!(event.status, EventStatus::Sent);
            assert!(event.published_at.is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_publisher_walks_event_to_dead() {
        let store = MemStore::default();
        let ids = store.seed(1);
        let publisher = SpyPublisher {
            fail_event_type: Some("order.placed"),
            ..Default::default()
        };

        let config = DispatcherConfig {
            max_attempts: Some(3),
            ..fast_config()
        };

        let handle = dispatcher()
            .store(store.clone())
            .publisher(publisher.clone())
            .config(config)
            .start()
            .await
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(2), || {
                store.get(ids[0]).status == EventStatus::Dead
            })
            .await
        );
        handle.stop().await;

        let event = store.get(ids[0]);
        assert_eq!(event.attempts, 3);
        assert!(event.dead_at.is_some());
        assert!(event.next_attempt_at.is_none());
        assert_eq!(
            event.last_error.as_deref(),
            Some("simulated broker failure")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failing_event_does_not_block_the_batch() {
        let store = MemStore::default();

        {
            let mut poisoned = sample_event(0);
            poisoned.event_type = "order.poisoned".to_owned();
            store.events.lock().unwrap().push(poisoned);
        }
        let healthy = store.seed(2);

        let publisher = SpyPublisher {
            fail_event_type: Some("order.poisoned"),
            ..Default::default()
        };

        let handle = dispatcher()
            .store(store.clone())
            .publisher(publisher.clone())
            .config(DispatcherConfig {
                max_attempts: Some(2),
                ..fast_config()
            })
            .start()
            .await
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || publisher.seen() == 2).await);
        assert!(
            wait_until(Duration::from_secs(2), || {
                store.count_with(EventStatus::Dead) == 1
            })
            .await
        );
        handle.stop().await;

        for id in healthy {
            assert_eq!(store.get(id).status, EventStatus::Sent);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_drains_the_inflight_event_and_claims_no_more() {
        let store = MemStore::default();
        store.seed(5);

        let publisher = SpyPublisher {
            publish_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };

        let handle = dispatcher()
            .store(store.clone())
            .publisher(publisher.clone())
            .config(DispatcherConfig {
                batch_size: Some(1),
                ..fast_config()
            })
            .start()
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(75)).await;
        handle.stop().await;

        // Whatever was published is also settled, and the worker claims
        // nothing further once stop has returned.
        let seen_at_stop = publisher.seen();
        assert_eq!(store.count_with(EventStatus::Sent), seen_at_stop);
        assert!(publisher.stopped.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(publisher.seen(), seen_at_stop);
    }
}
