//! Redis-backed read-model store.
//!
//! Projection writes arrive as [`WriteOp`] batches and run in one `MULTI`/`EXEC`
//! pipeline, so a handler's mutations for one event land together. Reads return
//! collections in canonical order so exports from two stores compare equal.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Pipeline};
use sparkle_cqrs_core::read_model::{KeyValue, ReadModelError, ReadModelStore, StoreFuture, WriteOp};

/// Keys fetched per `SCAN` round.
const SCAN_COUNT: usize = 500;

/// Keys deleted per `DEL` when clearing a pattern.
const DELETE_CHUNK: usize = 500;

/// Redis implementation of [`ReadModelStore`].
#[derive(Clone)]
pub struct RedisReadModelStore {
    conn: ConnectionManager,
}

impl RedisReadModelStore {
    /// Create a store over the shared connection manager.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, ReadModelError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| ReadModelError::Storage(e.to_string()))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn queue(pipe: &mut Pipeline, op: &WriteOp) {
    match op {
        WriteOp::Set { key, value } => pipe.cmd("SET").arg(key).arg(value),
        WriteOp::Del { key } => pipe.cmd("DEL").arg(key),
        WriteOp::SAdd { key, member } => pipe.cmd("SADD").arg(key).arg(member),
        WriteOp::SRem { key, member } => pipe.cmd("SREM").arg(key).arg(member),
        WriteOp::ZAdd { key, score, member } => pipe.cmd("ZADD").arg(key).arg(*score).arg(member),
        WriteOp::ZRem { key, member } => pipe.cmd("ZREM").arg(key).arg(member),
        WriteOp::HSet { key, field, value } => pipe.cmd("HSET").arg(key).arg(field).arg(value),
        WriteOp::HIncrBy { key, field, delta } => {
            pipe.cmd("HINCRBY").arg(key).arg(field).arg(*delta)
        }
        WriteOp::HIncrByFloat { key, field, delta } => {
            pipe.cmd("HINCRBYFLOAT").arg(key).arg(field).arg(*delta)
        }
        WriteOp::LPush { key, value } => pipe.cmd("LPUSH").arg(key).arg(value),
        WriteOp::LTrim { key, start, stop } => pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop),
        WriteOp::ZRemRangeByRank { key, start, stop } => {
            pipe.cmd("ZREMRANGEBYRANK").arg(key).arg(*start).arg(*stop)
        }
    }
    .ignore();
}

impl ReadModelStore for RedisReadModelStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.get(key)
                .await
                .map_err(|e| ReadModelError::Storage(e.to_string()))
        })
    }

    fn value<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<KeyValue>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let storage = |e: redis::RedisError| ReadModelError::Storage(e.to_string());

            let kind: String = redis::cmd("TYPE")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(storage)?;

            let value = match kind.as_str() {
                "none" => None,
                "string" => {
                    let value: Option<String> = conn.get(key).await.map_err(storage)?;
                    value.map(KeyValue::String)
                }
                "set" => {
                    let mut members: Vec<String> = conn.smembers(key).await.map_err(storage)?;
                    members.sort();
                    Some(KeyValue::Set(members))
                }
                "zset" => {
                    let mut members: Vec<(String, f64)> =
                        conn.zrange_withscores(key, 0, -1).await.map_err(storage)?;
                    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                    Some(KeyValue::SortedSet(members))
                }
                "hash" => {
                    let mut fields: Vec<(String, String)> =
                        conn.hgetall(key).await.map_err(storage)?;
                    fields.sort();
                    Some(KeyValue::Hash(fields))
                }
                "list" => {
                    let items: Vec<String> = conn.lrange(key, 0, -1).await.map_err(storage)?;
                    Some(KeyValue::List(items))
                }
                other => {
                    return Err(ReadModelError::Serialization(format!(
                        "unsupported type '{other}' at {key}"
                    )));
                }
            };
            Ok(value)
        })
    }

    fn is_member<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.sismember(key, member)
                .await
                .map_err(|e| ReadModelError::Storage(e.to_string()))
        })
    }

    fn apply(&self, ops: Vec<WriteOp>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if ops.is_empty() {
                return Ok(());
            }
            let mut conn = self.conn.clone();
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &ops {
                queue(&mut pipe, op);
            }
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| ReadModelError::Storage(e.to_string()))?;
            Ok(())
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(self.scan(pattern))
    }

    fn delete_pattern<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let keys = self.scan(pattern).await?;
            let mut conn = self.conn.clone();
            let mut deleted = 0;
            for chunk in keys.chunks(DELETE_CHUNK) {
                let n: u64 = conn
                    .del(chunk)
                    .await
                    .map_err(|e| ReadModelError::Storage(e.to_string()))?;
                deleted += n;
            }
            tracing::debug!(pattern, deleted, "Deleted read-model keys");
            Ok(deleted)
        })
    }
}
