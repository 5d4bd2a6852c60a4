//! Redis backends for the Sparkle CQRS substrate.
//!
//! - [`RedisStreamBus`]: the [`EventBus`](sparkle_cqrs_core::EventBus) over Redis Streams
//!   consumer groups
//! - [`RedisReadModelStore`]: the
//!   [`ReadModelStore`](sparkle_cqrs_core::read_model::ReadModelStore) projections write to
//!
//! Both share one [`ConnectionManager`]; blocking group reads get their own connection
//! per consumer so they never stall other commands.
//!
//! # Example
//!
//! ```ignore
//! use sparkle_cqrs_redis::{RedisReadModelStore, RedisStreamBus, connect};
//!
//! let (client, conn) = connect("redis://127.0.0.1:6379").await?;
//! let bus = RedisStreamBus::new(client, conn.clone());
//! let read_models = RedisReadModelStore::new(conn);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod read_model;
pub mod stream_bus;

pub use read_model::RedisReadModelStore;
pub use stream_bus::RedisStreamBus;

use redis::Client;
use redis::aio::ConnectionManager;
use sparkle_cqrs_core::event_bus::EventBusError;

/// Open a client and a shared connection manager.
///
/// # Errors
///
/// Returns [`EventBusError::ConnectionFailed`] if the URL is invalid or the server is
/// unreachable.
pub async fn connect(redis_url: &str) -> Result<(Client, ConnectionManager), EventBusError> {
    let client = Client::open(redis_url).map_err(|e| {
        EventBusError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
    })?;

    let conn = ConnectionManager::new(client.clone()).await.map_err(|e| {
        EventBusError::ConnectionFailed(format!("Failed to create Redis connection manager: {e}"))
    })?;

    tracing::info!("Connected to Redis");
    Ok((client, conn))
}
