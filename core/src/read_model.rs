//! Read-model store abstraction.
//!
//! Projections write denormalized views into a key/value store with Redis data types:
//! plain strings (JSON views), sets, sorted sets, hashes and lists. Handlers describe a
//! whole event's effect as a list of [`WriteOp`]s and submit it with one
//! [`ReadModelStore::apply`] call, which implementations execute atomically.
//!
//! # Implementations
//!
//! - `RedisReadModelStore` (in `sparkle-cqrs-redis`): production
//! - `InMemoryReadModelStore` (in `sparkle-cqrs-testing`): tests and determinism checks

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur against the read-model store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadModelError {
    /// Backend error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored value had an unexpected shape.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// One mutation against the read-model store.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Set a string value.
    Set {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Delete a key of any type.
    Del {
        /// Key.
        key: String,
    },
    /// Add a set member.
    SAdd {
        /// Key.
        key: String,
        /// Member.
        member: String,
    },
    /// Remove a set member.
    SRem {
        /// Key.
        key: String,
        /// Member.
        member: String,
    },
    /// Add or rescore a sorted-set member.
    ZAdd {
        /// Key.
        key: String,
        /// Score.
        score: f64,
        /// Member.
        member: String,
    },
    /// Remove a sorted-set member.
    ZRem {
        /// Key.
        key: String,
        /// Member.
        member: String,
    },
    /// Set a hash field.
    HSet {
        /// Key.
        key: String,
        /// Field.
        field: String,
        /// Value.
        value: String,
    },
    /// Increment an integer hash field.
    HIncrBy {
        /// Key.
        key: String,
        /// Field.
        field: String,
        /// Delta.
        delta: i64,
    },
    /// Increment a float hash field.
    HIncrByFloat {
        /// Key.
        key: String,
        /// Field.
        field: String,
        /// Delta.
        delta: f64,
    },
    /// Push onto the head of a list.
    LPush {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Keep only `start..=stop` of a list.
    LTrim {
        /// Key.
        key: String,
        /// First index kept.
        start: i64,
        /// Last index kept.
        stop: i64,
    },
    /// Remove sorted-set members ranked `start..=stop`, lowest score first.
    ZRemRangeByRank {
        /// Key.
        key: String,
        /// First rank removed.
        start: i64,
        /// Last rank removed.
        stop: i64,
    },
}

impl WriteOp {
    /// `SET key value`.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `DEL key`.
    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    /// `SADD key member`.
    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    /// `SREM key member`.
    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    /// `ZADD key score member`.
    pub fn zadd(key: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        Self::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        }
    }

    /// `ZREMRANGEBYRANK key start stop`.
    pub fn zremrangebyrank(key: impl Into<String>, start: i64, stop: i64) -> Self {
        Self::ZRemRangeByRank {
            key: key.into(),
            start,
            stop,
        }
    }

    /// `ZREM key member`.
    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    /// `HSET key field value`.
    pub fn hset(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::HSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    /// `HINCRBY key field delta`.
    pub fn hincr(key: impl Into<String>, field: impl Into<String>, delta: i64) -> Self {
        Self::HIncrBy {
            key: key.into(),
            field: field.into(),
            delta,
        }
    }

    /// `HINCRBYFLOAT key field delta`.
    pub fn hincr_float(key: impl Into<String>, field: impl Into<String>, delta: f64) -> Self {
        Self::HIncrByFloat {
            key: key.into(),
            field: field.into(),
            delta,
        }
    }

    /// `LPUSH key value`.
    pub fn lpush(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::LPush {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `LTRIM key start stop`.
    pub fn ltrim(key: impl Into<String>, start: i64, stop: i64) -> Self {
        Self::LTrim {
            key: key.into(),
            start,
            stop,
        }
    }
}

/// A typed value read back from the store.
///
/// Collections are returned in a canonical order (sets and hashes sorted, sorted sets by
/// score then member, lists head first) so two stores with the same content compare
/// equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyValue {
    /// String.
    String(String),
    /// Set members.
    Set(Vec<String>),
    /// Sorted-set `(member, score)` pairs.
    SortedSet(Vec<(String, f64)>),
    /// Hash `(field, value)` pairs.
    Hash(Vec<(String, String)>),
    /// List items.
    List(Vec<String>),
}

impl KeyValue {
    /// Operations that recreate this value at `key`, after deleting what is there.
    #[must_use]
    pub fn restore_ops(&self, key: &str) -> Vec<WriteOp> {
        let mut ops = vec![WriteOp::del(key)];
        match self {
            Self::String(value) => ops.push(WriteOp::set(key, value.clone())),
            Self::Set(members) => {
                ops.extend(members.iter().map(|m| WriteOp::sadd(key, m.clone())));
            }
            Self::SortedSet(members) => {
                ops.extend(members.iter().map(|(m, s)| WriteOp::zadd(key, *s, m.clone())));
            }
            Self::Hash(fields) => {
                ops.extend(fields.iter().map(|(f, v)| WriteOp::hset(key, f.clone(), v.clone())));
            }
            Self::List(items) => {
                ops.extend(items.iter().rev().map(|v| WriteOp::lpush(key, v.clone())));
            }
        }
        ops
    }

    /// The value of a hash field, if this is a hash.
    #[must_use]
    pub fn hash_field(&self, field: &str) -> Option<&str> {
        match self {
            Self::Hash(fields) => fields
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// A dump of every key matching a set of patterns, sorted by key.
pub type Export = Vec<(String, KeyValue)>;

/// Boxed future returned by [`ReadModelStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ReadModelError>> + Send + 'a>>;

/// Key/value store for projection read models.
pub trait ReadModelStore: Send + Sync {
    /// Read a string key.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Read a key of any type.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn value<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<KeyValue>>;

    /// Whether `member` is in the set at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn is_member<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool>;

    /// Apply operations atomically, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure; nothing is applied.
    fn apply(&self, ops: Vec<WriteOp>) -> StoreFuture<'_, ()>;

    /// Keys matching a glob pattern (`*` wildcard), sorted.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn keys<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, Vec<String>>;

    /// Delete every key matching a glob pattern, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn delete_pattern<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, u64>;

    /// Dump every key matching any of `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn export<'a>(&'a self, patterns: &'a [&'a str]) -> StoreFuture<'a, Export> {
        Box::pin(async move {
            let mut keys = Vec::new();
            for pattern in patterns {
                keys.extend(self.keys(pattern).await?);
            }
            keys.sort();
            keys.dedup();

            let mut dump = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(value) = self.value(&key).await? {
                    dump.push((key, value));
                }
            }
            Ok(dump)
        })
    }

    /// Write back a dump produced by [`ReadModelStore::export`].
    ///
    /// # Errors
    ///
    /// Returns [`ReadModelError::Storage`] on backend failure.
    fn import(&self, dump: Export) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let ops = dump
                .iter()
                .flat_map(|(key, value)| value.restore_ops(key))
                .collect();
            self.apply(ops).await
        })
    }
}

/// Whether `key` matches a glob with `*` wildcards.
#[must_use]
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (index, part) in parts.iter().enumerate() {
        if index == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(found) = rest.find(part) {
            rest = &rest[found + part.len()..];
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("post:view:*", "post:view:42"));
        assert!(glob_match("user:tasks:*", "user:tasks:pending:u1"));
        assert!(glob_match("galaxy:user:*:stats", "galaxy:user:u1:stats"));
        assert!(!glob_match("galaxy:user:*:stats", "galaxy:user:u1:unlocked"));
        assert!(glob_match("feed:global", "feed:global"));
        assert!(!glob_match("feed:global", "feed:global:2"));
        assert!(!glob_match("task:view:*", "post:view:1"));
    }

    #[test]
    fn test_restore_ops_preserve_list_order() {
        let ops = KeyValue::List(vec!["newest".into(), "older".into()]).restore_ops("l");
        assert_eq!(
            ops,
            vec![
                WriteOp::del("l"),
                WriteOp::lpush("l", "older"),
                WriteOp::lpush("l", "newest"),
            ]
        );
    }

    #[test]
    fn test_hash_field_lookup() {
        let value = KeyValue::Hash(vec![("total_tasks".into(), "3".into())]);
        assert_eq!(value.hash_field("total_tasks"), Some("3"));
        assert_eq!(value.hash_field("pending_tasks"), None);
        assert_eq!(KeyValue::String("x".into()).hash_field("x"), None);
    }
}
