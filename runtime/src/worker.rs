//! Fault-tolerant stream consumer.
//!
//! A [`BaseWorker`] reads one stream as one consumer of one group and drives an
//! [`EventHandler`]. Every message ends in exactly one terminal outcome, and every
//! terminal outcome acknowledges the message:
//!
//! ```text
//! received ─► parse ──fail──► DLQ(parse_error) ─► ack
//!               │
//!               ▼
//!           dedupe ──seen──► ack (duplicate)
//!               │
//!               ▼
//!           handle ◄─retry with backoff─┐
//!               │ ok           │ err ───┘
//!               ▼              ▼ exhausted
//!        mark processed   DLQ(processing_error)
//!               │              │
//!               └──► ack ◄─────┘
//! ```
//!
//! The only path that leaves a message pending is shutdown during a retry, in which case
//! the message is redelivered to this consumer on restart.

use crate::dlq::{DlqEntry, DlqHandler, ERROR_PARSE, ERROR_PROCESSING};
use crate::metrics::WorkerMetrics;
use crate::retry::{RetryError, RetryPolicy, retry_with_backoff};
use crate::shutdown::{cancelled, sleep_or_cancel};
use lru::LruCache;
use sparkle_cqrs_core::event::DomainEvent;
use sparkle_cqrs_core::event_bus::{EventBus, EventBusError, ReadOptions, StartPosition};
use sparkle_cqrs_core::handler::{DeliveryContext, EventHandler, HandlerError};
use sparkle_cqrs_core::idempotency::ProcessedEventStore;
use sparkle_cqrs_core::payload::validate_payload;
use sparkle_cqrs_core::wire::StreamMessage;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// Errors that stop a worker before it starts consuming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The consumer group could not be created.
    #[error(transparent)]
    Bus(#[from] EventBusError),
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stream to read.
    pub stream: String,
    /// Consumer group.
    pub group: String,
    /// Consumer name, unique within the group.
    pub consumer: String,
    /// Messages per read.
    pub batch_size: usize,
    /// How long a read waits for new messages.
    pub block_timeout: Duration,
    /// Handler retry policy.
    pub retry: RetryPolicy,
    /// Skip events the group already processed.
    pub idempotency: bool,
    /// Dead-letter messages that fail terminally.
    pub dlq: bool,
    /// Capacity of the in-memory processed-id cache.
    pub dedupe_cache_size: usize,
    /// How long a running handler may continue after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Pause after a failed read.
    pub error_backoff: Duration,
    /// Delays between restarts when the worker cannot start. `max_retries` is ignored.
    pub restart_backoff: RetryPolicy,
}

impl WorkerConfig {
    /// Settings for `consumer` in `group` on `stream`, with defaults for the rest.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            batch_size: 10,
            block_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            idempotency: true,
            dlq: true,
            dedupe_cache_size: 10_000,
            shutdown_grace: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
            restart_backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(60))
                .build(),
        }
    }

    /// Set the read batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the read block timeout.
    #[must_use]
    pub const fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the delays between restarts.
    #[must_use]
    pub fn with_restart_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.restart_backoff = backoff;
        self
    }

    /// Set the dedupe cache capacity.
    #[must_use]
    pub const fn with_dedupe_cache_size(mut self, size: usize) -> Self {
        self.dedupe_cache_size = size;
        self
    }

    /// Turn idempotency checks on or off.
    #[must_use]
    pub const fn with_idempotency(mut self, enabled: bool) -> Self {
        self.idempotency = enabled;
        self
    }

    /// Turn dead-lettering on or off.
    #[must_use]
    pub const fn with_dlq(mut self, enabled: bool) -> Self {
        self.dlq = enabled;
        self
    }
}

/// Terminal outcome of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled, marked and acknowledged.
    Processed,
    /// Already processed by the group; acknowledged without handling.
    Duplicate,
    /// Written to the DLQ and acknowledged.
    DeadLettered,
    /// Shutdown arrived mid-retry; left pending.
    Interrupted,
}

/// Reads one stream as one consumer and drives an [`EventHandler`].
pub struct BaseWorker {
    bus: Arc<dyn EventBus>,
    handler: Arc<dyn EventHandler>,
    ledger: Option<Arc<dyn ProcessedEventStore>>,
    dlq: Option<Arc<DlqHandler>>,
    config: WorkerConfig,
    seen: Mutex<LruCache<String, ()>>,
}

impl BaseWorker {
    /// Create a worker without ledger or DLQ.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, handler: Arc<dyn EventHandler>, config: WorkerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.dedupe_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            bus,
            handler,
            ledger: None,
            dlq: None,
            config,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Attach the idempotency ledger.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn ProcessedEventStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Attach the dead-letter queue.
    #[must_use]
    pub fn with_dlq(mut self, dlq: Arc<DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    /// The worker's settings.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Consume until shutdown.
    ///
    /// Creates the group if needed, reprocesses this consumer's pending messages, then
    /// reads new ones. Read failures are logged and retried after `error_backoff`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Bus`] if the consumer group cannot be created.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        let WorkerConfig {
            stream,
            group,
            consumer,
            ..
        } = &self.config;

        self.bus.ensure_group(stream, group).await?;
        tracing::info!(
            stream = %stream,
            group = %group,
            consumer = %consumer,
            handler = self.handler.name(),
            "Worker started"
        );

        self.drain_pending(&mut shutdown).await;

        let options = ReadOptions {
            batch_size: self.config.batch_size,
            block: self.config.block_timeout,
            start: StartPosition::New,
        };

        while !*shutdown.borrow() {
            if !self.handler.ready().await {
                tracing::debug!(group = %group, "Handler not ready, waiting");
                if !sleep_or_cancel(self.config.block_timeout, &mut shutdown).await {
                    break;
                }
                continue;
            }

            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.bus.read_group(stream, group, consumer, &options) => batch,
            };

            match batch {
                Ok(messages) => {
                    if messages.is_empty() {
                        continue;
                    }
                    let finished = self.process_batch(messages, &mut shutdown).await;
                    self.refresh_lag().await;
                    if !finished {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(stream = %stream, group = %group, error = %e, "Stream read failed");
                    WorkerMetrics::record_error(group, "read_batch");
                    if !sleep_or_cancel(self.config.error_backoff, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(stream = %stream, group = %group, consumer = %consumer, "Worker stopped");
        Ok(())
    }

    /// Consume until shutdown, restarting whenever [`BaseWorker::run`] fails.
    ///
    /// Restarts back off along `restart_backoff` and never give up, so a consumer group
    /// that cannot be created yet is picked up once the bus recovers.
    pub async fn run_supervised(&self, mut shutdown: watch::Receiver<bool>) {
        let group = self.config.group.as_str();
        let mut restarts: u32 = 0;

        loop {
            match self.run(shutdown.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    restarts = restarts.saturating_add(1);
                    let delay = self.config.restart_backoff.delay_for_retry(restarts);
                    tracing::error!(
                        group,
                        restarts,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Worker failed, restarting"
                    );
                    WorkerMetrics::record_error(group, "worker_start");
                    if !sleep_or_cancel(delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    /// Redeliver messages this consumer read but never acknowledged.
    async fn drain_pending(&self, shutdown: &mut watch::Receiver<bool>) {
        let options = ReadOptions {
            batch_size: self.config.batch_size,
            block: self.config.block_timeout,
            start: StartPosition::Pending,
        };
        // Messages left pending by an interrupted retry come back on every read.
        let mut attempted = HashSet::new();

        while !*shutdown.borrow() {
            let batch = match self
                .bus
                .read_group(&self.config.stream, &self.config.group, &self.config.consumer, &options)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(group = %self.config.group, error = %e, "Pending read failed");
                    return;
                }
            };

            let fresh: Vec<StreamMessage> = batch
                .into_iter()
                .filter(|message| attempted.insert(message.id.clone()))
                .collect();
            if fresh.is_empty() {
                return;
            }

            tracing::info!(
                group = %self.config.group,
                count = fresh.len(),
                "Reprocessing pending messages"
            );
            if !self.process_batch(fresh, shutdown).await {
                return;
            }
        }
    }

    /// Process messages in order. Returns `false` if shutdown cut the batch short.
    async fn process_batch(
        &self,
        messages: Vec<StreamMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let total = messages.len();
        for (index, message) in messages.iter().enumerate() {
            if *shutdown.borrow() {
                tracing::info!(
                    group = %self.config.group,
                    remaining = total - index,
                    "Shutdown requested; remaining messages stay pending"
                );
                return false;
            }
            if self.process_message(message, shutdown).await == Outcome::Interrupted {
                return false;
            }
        }
        true
    }

    /// Take one message to a terminal outcome.
    pub async fn process_message(
        &self,
        message: &StreamMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let started = Instant::now();
        let group = self.config.group.as_str();

        let event = match parse(message) {
            Ok(event) => event,
            Err(reason) => {
                tracing::warn!(
                    message_id = %message.id,
                    group,
                    error = %reason,
                    "Unparsable message"
                );
                WorkerMetrics::record_error(group, ERROR_PARSE);
                self.dead_letter(message, ERROR_PARSE, &reason).await;
                self.ack(message).await;
                return Outcome::DeadLettered;
            }
        };

        if self.config.idempotency && self.already_processed(&event.id).await {
            tracing::debug!(event_id = %event.id, group, "Duplicate event skipped");
            WorkerMetrics::record_duplicate(group);
            self.ack(message).await;
            return Outcome::Duplicate;
        }

        let context = DeliveryContext::new(&self.config.stream, group, &message.id);
        let grace = shutdown.clone();
        let result = retry_with_backoff(&self.config.retry, shutdown, |attempt| {
            let mut grace = grace.clone();
            let (event, context) = (&event, &context);
            async move {
                if attempt > 0 {
                    WorkerMetrics::record_retry(group);
                }
                self.call_handler(event, context, &mut grace).await
            }
        })
        .await;

        match result {
            Ok(()) => {
                if self.config.idempotency {
                    self.remember(&event).await;
                }
                self.ack(message).await;
                WorkerMetrics::record_processed(event.event_type.as_str(), group, started.elapsed());
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    group,
                    "Event processed"
                );
                Outcome::Processed
            }
            Err(RetryError::Cancelled { attempts }) => {
                tracing::info!(
                    event_id = %event.id,
                    group,
                    attempts,
                    "Shutdown during retry; message left pending"
                );
                Outcome::Interrupted
            }
            Err(RetryError::Exhausted { last, .. } | RetryError::Aborted(last)) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    group,
                    error = %last,
                    "Handler failed after retries"
                );
                WorkerMetrics::record_error(group, "process_event");
                self.dead_letter(message, ERROR_PROCESSING, &last.to_string()).await;
                self.ack(message).await;
                Outcome::DeadLettered
            }
        }
    }

    /// Run the handler; once shutdown is requested it gets `shutdown_grace` to finish.
    async fn call_handler(
        &self,
        event: &DomainEvent,
        context: &DeliveryContext,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), HandlerError> {
        let mut handling = self.handler.handle(event, context);
        tokio::select! {
            result = &mut handling => return result,
            () = cancelled(shutdown) => {}
        }

        tracing::info!(
            event_id = %event.id,
            grace_secs = self.config.shutdown_grace.as_secs(),
            "Shutdown requested; waiting for handler"
        );
        tokio::time::timeout(self.config.shutdown_grace, handling)
            .await
            .unwrap_or_else(|_| {
                Err(HandlerError::Failed(
                    "handler did not finish within the shutdown grace period".to_string(),
                ))
            })
    }

    async fn already_processed(&self, event_id: &str) -> bool {
        if self.seen.lock().await.contains(event_id) {
            return true;
        }
        let Some(ledger) = &self.ledger else {
            return false;
        };
        match ledger.is_processed(event_id, &self.config.group).await {
            Ok(true) => {
                self.seen.lock().await.put(event_id.to_string(), ());
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(event_id, error = %e, "Ledger lookup failed; processing anyway");
                false
            }
        }
    }

    async fn remember(&self, event: &DomainEvent) {
        self.seen.lock().await.put(event.id.clone(), ());
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.mark_processed(&event.id, &self.config.group).await {
                tracing::warn!(event_id = %event.id, error = %e, "Failed to mark event processed");
            }
        }
    }

    async fn dead_letter(&self, message: &StreamMessage, error_type: &str, reason: &str) {
        let dlq = match (&self.dlq, self.config.dlq) {
            (Some(dlq), true) => dlq,
            _ => {
                tracing::error!(
                    message_id = %message.id,
                    group = %self.config.group,
                    error_type,
                    "DLQ disabled; failed message dropped"
                );
                return;
            }
        };

        let entry = DlqEntry::new(message, &self.config.stream, &self.config.group, error_type, reason);
        if let Err(e) = dlq.send(&entry).await {
            tracing::error!(message_id = %message.id, error = %e, "Failed to write DLQ entry");
        }
    }

    async fn ack(&self, message: &StreamMessage) {
        if let Err(e) = self
            .bus
            .acknowledge(&self.config.stream, &self.config.group, &message.id)
            .await
        {
            tracing::error!(message_id = %message.id, error = %e, "Failed to acknowledge message");
        }
    }

    async fn refresh_lag(&self) {
        match self.bus.pending_count(&self.config.stream, &self.config.group).await {
            Ok(pending) => {
                WorkerMetrics::set_consumer_lag(&self.config.stream, &self.config.group, pending);
            }
            Err(e) => tracing::debug!(error = %e, "Pending count unavailable"),
        }
    }
}

/// Decode a message and validate its payload.
fn parse(message: &StreamMessage) -> Result<DomainEvent, String> {
    let event = message.decode().map_err(|e| e.to_string())?;
    validate_payload(&event.event_type, &event.payload).map_err(|e| e.to_string())?;
    Ok(event)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dlq::DlqConfig;
    use crate::shutdown;
    use sparkle_cqrs_core::event::EventType;
    use sparkle_cqrs_core::routing::{GROUP_TASK, STREAM_TASK};
    use sparkle_cqrs_core::wire::encode;
    use sparkle_cqrs_testing::{InMemoryProcessedEvents, InMemoryStreamBus, RecordingHandler, task_event};
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    struct Fixture {
        bus: Arc<InMemoryStreamBus>,
        ledger: Arc<InMemoryProcessedEvents>,
        dlq: Arc<DlqHandler>,
        handler: Arc<RecordingHandler>,
    }

    impl Fixture {
        fn new(handler: RecordingHandler) -> Self {
            let bus = Arc::new(InMemoryStreamBus::new());
            Self {
                dlq: Arc::new(DlqHandler::new(bus.clone(), DlqConfig::default())),
                bus,
                ledger: Arc::new(InMemoryProcessedEvents::new()),
                handler: Arc::new(handler),
            }
        }

        fn worker(&self, config: WorkerConfig) -> BaseWorker {
            BaseWorker::new(self.bus.clone(), self.handler.clone(), config)
                .with_ledger(self.ledger.clone())
                .with_dlq(self.dlq.clone())
        }

        fn spawn(&self, config: WorkerConfig) -> (watch::Sender<bool>, JoinHandle<Result<(), WorkerError>>) {
            let worker = self.worker(config);
            let (tx, rx) = shutdown::channel();
            (tx, tokio::spawn(async move { worker.run(rx).await }))
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(STREAM_TASK, GROUP_TASK, "worker-1")
    }

    fn valid_event() -> DomainEvent {
        task_event(EventType::TaskCreated, Uuid::new_v4(), "u-1")
    }

    #[tokio::test(start_paused = true)]
    async fn test_poison_message_is_dead_lettered_and_acked() {
        let fx = Fixture::new(RecordingHandler::new());
        let poison: Vec<(String, String)> = encode(&valid_event())
            .unwrap()
            .into_iter()
            .filter(|(key, _)| key != "aggregate_id")
            .collect();
        fx.bus.append(STREAM_TASK, poison).await.unwrap();
        let good = valid_event();
        fx.bus.publish(&good).await.unwrap();

        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());
        let entries = fx.dlq.get_entries(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_type, ERROR_PARSE);
        assert_eq!(fx.handler.event_ids(), vec![good.id]);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_payload_is_a_parse_error() {
        let fx = Fixture::new(RecordingHandler::new());
        let mut event = valid_event();
        event.payload.remove("user_id");
        fx.bus.publish(&event).await.unwrap();

        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.handler.call_count(), 0);
        assert_eq!(fx.dlq.get_entries_by_error_type(ERROR_PARSE, 10).await.unwrap().len(), 1);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_backs_off_then_dead_letters() {
        let fx = Fixture::new(RecordingHandler::failing());
        fx.bus.publish(&valid_event()).await.unwrap();

        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(fx.handler.call_count(), 4);
        let times = fx.handler.call_times();
        for (gap, expected_ms) in times.windows(2).zip([100.0_f64, 200.0, 400.0]) {
            let actual_ms = (gap[1] - gap[0]).as_secs_f64() * 1000.0;
            assert!(
                (actual_ms - expected_ms).abs() <= expected_ms * 0.2,
                "gap {actual_ms}ms, expected {expected_ms}ms"
            );
        }

        let entries = fx.dlq.get_entries(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_type, ERROR_PROCESSING);
        assert_eq!(entries[0].retry_count, 0);
        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers_without_dlq() {
        let fx = Fixture::new(RecordingHandler::failing_times(2));
        let event = valid_event();
        fx.bus.publish(&event).await.unwrap();

        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.handler.call_count(), 3);
        assert_eq!(fx.dlq.count().await.unwrap(), 0);
        assert!(fx.ledger.is_processed(&event.id, GROUP_TASK).await.unwrap());

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_crash_before_ack_is_not_reapplied() {
        let fx = Fixture::new(RecordingHandler::new());
        let event = valid_event();
        fx.bus.ensure_group(STREAM_TASK, GROUP_TASK).await.unwrap();
        fx.bus.publish(&event).await.unwrap();

        // First run: read, handled, marked, then the process dies before the ack.
        let delivered = fx
            .bus
            .read_group(STREAM_TASK, GROUP_TASK, "worker-1", &ReadOptions::default())
            .await
            .unwrap();
        let context = DeliveryContext::new(STREAM_TASK, GROUP_TASK, &delivered[0].id);
        fx.handler.handle(&event, &context).await.unwrap();
        fx.ledger.mark_processed(&event.id, GROUP_TASK).await.unwrap();
        assert_eq!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).len(), 1);

        // Restart with the same consumer name.
        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.handler.call_count(), 1);
        assert_eq!(fx.ledger.len(), 1);
        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_deliveries_apply_once() {
        let fx = Fixture::new(RecordingHandler::new());
        let event = valid_event();
        fx.bus.publish(&event).await.unwrap();
        fx.bus.publish(&event).await.unwrap();
        fx.bus.publish(&event).await.unwrap();

        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.handler.call_count(), 1);
        assert_eq!(fx.ledger.len(), 1);
        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_dedupe_cache_still_consults_ledger() {
        let fx = Fixture::new(RecordingHandler::new());
        let first = valid_event();
        let second = valid_event();
        for event in [&first, &second, &first] {
            fx.bus.publish(event).await.unwrap();
        }

        let (tx, task) = fx.spawn(config().with_dedupe_cache_size(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.handler.event_ids(), vec![first.id.clone(), second.id.clone()]);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_handler_leaves_messages_in_stream() {
        let handler = RecordingHandler::new();
        handler.set_ready(false);
        let fx = Fixture::new(handler);
        fx.bus.publish(&valid_event()).await.unwrap();

        let (tx, task) = fx.spawn(config());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.handler.call_count(), 0);
        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());

        fx.handler.set_ready(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fx.handler.call_count(), 1);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_backoff_leaves_message_pending() {
        let fx = Fixture::new(RecordingHandler::failing());
        fx.bus.publish(&valid_event()).await.unwrap();
        let slow_retry = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(30))
            .build();

        let (tx, task) = fx.spawn(config().with_retry(slow_retry));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(fx.handler.call_count(), 1);
        assert_eq!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).len(), 1);
        assert_eq!(fx.dlq.count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_dlq_terminal_failures_are_still_acked() {
        let fx = Fixture::new(RecordingHandler::failing());
        fx.bus.publish(&valid_event()).await.unwrap();

        let (tx, task) = fx.spawn(config().with_dlq(false));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());
        assert_eq!(fx.dlq.count().await.unwrap(), 0);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervised_worker_restarts_until_group_is_created() {
        let fx = Fixture::new(RecordingHandler::new());
        fx.bus.fail_group_creation(3);
        let event = valid_event();
        fx.bus.publish(&event).await.unwrap();

        let worker = fx.worker(config().with_restart_backoff(
            RetryPolicy::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(1))
                .build(),
        ));
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(async move { worker.run_supervised(rx).await });

        // Restarts after 100ms, 200ms and 400ms.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.handler.event_ids().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.handler.event_ids(), vec![event.id]);
        assert!(fx.bus.pending_ids(STREAM_TASK, GROUP_TASK).is_empty());

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervised_worker_stops_on_shutdown_while_failing() {
        let fx = Fixture::new(RecordingHandler::new());
        fx.bus.fail_group_creation(usize::MAX);
        let worker = fx.worker(config());
        let (tx, rx) = shutdown::channel();
        let task = tokio::spawn(async move { worker.run_supervised(rx).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("supervised worker ignores shutdown")
            .unwrap();
        assert_eq!(fx.bus.stream_length(STREAM_TASK).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_group_stream_is_created_on_start() {
        let fx = Fixture::new(RecordingHandler::new());
        let (tx, task) = fx.spawn(config().with_block_timeout(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fx.bus.stream_length(STREAM_TASK).await.unwrap(), Some(0));

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
