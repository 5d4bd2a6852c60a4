//! Redis Streams implementation of [`EventBus`].
//!
//! # Architecture
//!
//! - **Append**: `XADD <stream> MAXLEN ~ 100000 * field value ...`
//! - **Groups**: `XGROUP CREATE <stream> <group> 0 MKSTREAM`; `BUSYGROUP` is success
//! - **Read**: `XREADGROUP GROUP <group> <consumer> COUNT n BLOCK ms STREAMS <stream> >|0`
//! - **Ack / lag**: `XACK`, `XPENDING`
//!
//! Blocking reads run on a connection owned by the reading consumer. Everything else
//! goes through the shared [`ConnectionManager`].

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{
    StreamId, StreamMaxlen, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use sparkle_cqrs_core::event_bus::{
    BusFuture, EventBus, EventBusError, Fields, MAX_STREAM_LENGTH, ReadOptions, StartPosition,
};
use sparkle_cqrs_core::wire::StreamMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Response timeout for reader connections; longer than any block interval.
const READER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Redis Streams event bus.
#[derive(Clone)]
pub struct RedisStreamBus {
    client: Client,
    conn: ConnectionManager,
    readers: Arc<Mutex<HashMap<String, ConnectionManager>>>,
}

impl RedisStreamBus {
    /// Create a bus from a client and the shared connection manager.
    #[must_use]
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            readers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if Redis is unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, EventBusError> {
        let (client, conn) = crate::connect(redis_url).await?;
        Ok(Self::new(client, conn))
    }

    async fn reader(&self, stream: &str, consumer: &str) -> Result<ConnectionManager, EventBusError> {
        let key = format!("{stream}|{consumer}");
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(&key) {
            return Ok(conn.clone());
        }

        let config = ConnectionManagerConfig::new().set_response_timeout(READER_RESPONSE_TIMEOUT);
        let conn = ConnectionManager::new_with_config(self.client.clone(), config)
            .await
            .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
        readers.insert(key, conn.clone());
        Ok(conn)
    }
}

fn to_message(entry: StreamId) -> StreamMessage {
    let fields = entry
        .map
        .iter()
        .filter_map(|(name, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|v| (name.clone(), v))
        })
        .collect();
    StreamMessage::new(entry.id, fields)
}

fn transport(err: &RedisError) -> EventBusError {
    EventBusError::TransportError(err.to_string())
}

impl EventBus for RedisStreamBus {
    fn append(&self, stream: &str, fields: Fields) -> BusFuture<'_, String> {
        let stream = stream.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let id: String = conn
                .xadd_maxlen(
                    &stream,
                    StreamMaxlen::Approx(MAX_STREAM_LENGTH),
                    "*",
                    fields.as_slice(),
                )
                .await
                .map_err(|e| EventBusError::PublishFailed {
                    stream: stream.clone(),
                    reason: e.to_string(),
                })?;

            tracing::debug!(stream = %stream, message_id = %id, "Appended to stream");
            Ok(id)
        })
    }

    fn append_batch(
        &self,
        entries: Vec<(String, Fields)>,
    ) -> BusFuture<'_, Vec<Result<String, EventBusError>>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let mut pipe = redis::pipe();
            for (stream, fields) in &entries {
                pipe.xadd_maxlen(
                    stream,
                    StreamMaxlen::Approx(MAX_STREAM_LENGTH),
                    "*",
                    fields.as_slice(),
                );
            }

            let ids: Vec<String> = pipe.query_async(&mut conn).await.map_err(|e| transport(&e))?;

            if ids.len() != entries.len() {
                return Err(EventBusError::TransportError(format!(
                    "pipeline returned {} ids for {} entries",
                    ids.len(),
                    entries.len()
                )));
            }
            Ok(ids.into_iter().map(Ok).collect())
        })
    }

    fn ensure_group(&self, stream: &str, group: &str) -> BusFuture<'_, ()> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let created: Result<(), RedisError> =
                conn.xgroup_create_mkstream(&stream, &group, "0").await;

            match created {
                Ok(()) => {
                    tracing::info!(stream = %stream, group = %group, "Created consumer group");
                    Ok(())
                }
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(EventBusError::ConsumerGroupError(format!(
                    "{stream}/{group}: {e}"
                ))),
            }
        })
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &ReadOptions,
    ) -> BusFuture<'_, Vec<StreamMessage>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let options = options.clone();
        Box::pin(async move {
            let read_failed = |reason: String| EventBusError::ReadFailed {
                stream: stream.clone(),
                group: group.clone(),
                reason,
            };

            let mut read = StreamReadOptions::default()
                .group(&group, &consumer)
                .count(options.batch_size);
            if options.start == StartPosition::New {
                let block_ms = usize::try_from(options.block.as_millis()).unwrap_or(usize::MAX);
                read = read.block(block_ms);
            }

            let mut conn = self.reader(&stream, &consumer).await?;
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&stream], &[options.start.as_id()], &read)
                .await
                .map_err(|e| read_failed(e.to_string()))?;

            Ok(reply
                .into_iter()
                .flat_map(|r| r.keys)
                .flat_map(|key| key.ids)
                .map(to_message)
                .collect())
        })
    }

    fn acknowledge(&self, stream: &str, group: &str, message_id: &str) -> BusFuture<'_, ()> {
        let stream = stream.to_string();
        let group = group.to_string();
        let message_id = message_id.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: u64 = conn
                .xack(&stream, &group, &[&message_id])
                .await
                .map_err(|e| transport(&e))?;
            Ok(())
        })
    }

    fn pending_count(&self, stream: &str, group: &str) -> BusFuture<'_, u64> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let reply: StreamPendingReply = conn
                .xpending(&stream, &group)
                .await
                .map_err(|e| transport(&e))?;
            Ok(reply.count() as u64)
        })
    }

    fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BusFuture<'_, Vec<StreamMessage>> {
        let stream = stream.to_string();
        let start = start.to_string();
        let end = end.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let reply: StreamRangeReply = match count {
                Some(count) => conn.xrange_count(&stream, &start, &end, count).await,
                None => conn.xrange(&stream, &start, &end).await,
            }
            .map_err(|e| transport(&e))?;

            Ok(reply.ids.into_iter().map(to_message).collect())
        })
    }

    fn delete(&self, stream: &str, message_ids: Vec<String>) -> BusFuture<'_, u64> {
        let stream = stream.to_string();
        Box::pin(async move {
            if message_ids.is_empty() {
                return Ok(0);
            }
            let mut conn = self.conn.clone();
            let deleted: u64 = conn
                .xdel(&stream, &message_ids)
                .await
                .map_err(|e| transport(&e))?;
            Ok(deleted)
        })
    }

    fn stream_length(&self, stream: &str) -> BusFuture<'_, Option<u64>> {
        let stream = stream.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let exists: bool = conn.exists(&stream).await.map_err(|e| transport(&e))?;
            if !exists {
                return Ok(None);
            }
            let len: u64 = conn.xlen(&stream).await.map_err(|e| transport(&e))?;
            Ok(Some(len))
        })
    }

    fn ping(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| EventBusError::ConnectionFailed(e.to_string()))?;
            Ok(())
        })
    }
}
