//! # Sparkle CQRS Runtime
//!
//! The long-lived tasks that move events from the outbox to the read side.
//!
//! ## Core Components
//!
//! - **Publisher**: relays outbox rows to the stream bus
//! - **`BaseWorker`**: consumes a stream for one consumer group with dedupe, retry and
//!   dead-lettering
//! - **DLQ**: inspection and manual replay of failed messages
//! - **Maintenance**: outbox cleaner, pending monitor, DLQ cleaner, ledger pruner
//! - **Health**: cached component checks for readiness probes
//! - **Metrics**: Prometheus recorder and per-component recorders
//!
//! Every task takes a `watch::Receiver<bool>` from [`shutdown::channel`] and returns once
//! it flips to `true`.
//!
//! ## Example
//!
//! ```ignore
//! use sparkle_cqrs_runtime::{BaseWorker, Publisher, PublisherConfig, WorkerConfig, shutdown};
//!
//! let (stop, rx) = shutdown::channel();
//! let publisher = Publisher::new(outbox, bus.clone(), PublisherConfig::default());
//! tokio::spawn(async move { publisher.run(rx.clone()).await });
//!
//! let worker = BaseWorker::new(bus, handler, WorkerConfig::new(STREAM_TASK, GROUP_TASK, "worker-1"))
//!     .with_ledger(ledger)
//!     .with_dlq(dlq);
//! tokio::spawn(async move { worker.run(rx).await });
//!
//! // Later
//! stop.send(true)?;
//! ```

pub mod dlq;
pub mod health;
pub mod maintenance;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod shutdown;
pub mod worker;

pub use dlq::{DlqConfig, DlqEntry, DlqError, DlqHandler, DlqStats};
pub use health::{ComponentHealth, CqrsHealth, HealthChecker, HealthConfig, HealthStatus};
pub use maintenance::{
    DlqCleaner, LedgerPruner, OutboxBacklog, OutboxCleaner, OutboxCleanerConfig, PendingMonitor,
    PendingMonitorConfig,
};
pub use metrics::PrometheusMetrics;
pub use publisher::{PublishReport, Publisher, PublisherConfig, PublisherError};
pub use retry::{RetryError, RetryPolicy};
pub use worker::{BaseWorker, Outcome, WorkerConfig, WorkerError};
