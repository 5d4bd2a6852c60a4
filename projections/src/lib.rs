//! Projections for the Sparkle CQRS substrate.
//!
//! # Overview
//!
//! - [`ProjectionManager`]: registry, status machine and positions
//! - [`ProjectionBuilder`]: rebuilds from the event store, resume and snapshots
//! - [`ProjectionConsumer`]: plugs a projection into a base worker
//! - [`CommunityProjection`], [`TaskProjection`], [`GalaxyProjection`]: the read models
//!
//! # Live and replayed input
//!
//! ```text
//! Redis stream ─→ BaseWorker ─→ ProjectionConsumer ─┐
//!                                                   ├─→ ProjectionHandler ─→ Redis keys
//! events table ─→ ProjectionBuilder ────────────────┘
//! ```
//!
//! Both paths hand the projection the same serialized event, so a rebuilt read model
//! matches the one maintained live.

pub mod builder;
pub mod community;
pub mod consumer;
pub mod galaxy;
mod keyspace;
pub mod manager;
pub mod metrics;
pub mod task;

pub use builder::{ProjectionBuilder, RebuildOptions, RebuildProgress, RebuildStatus};
pub use community::CommunityProjection;
pub use consumer::ProjectionConsumer;
pub use galaxy::GalaxyProjection;
pub use manager::ProjectionManager;
pub use metrics::ProjectionMetrics;
pub use task::TaskProjection;
