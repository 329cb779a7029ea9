//! In-process key-value store with RedisJSON path semantics.
//!
//! Supports the root path (`$`) and dotted member paths (`$.a.b`). Expiry uses the
//! tokio clock so TTL behaviour can be driven with paused time in tests.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use super::pipeline::{KvOp, KvReply};
use crate::error::KvError;

#[derive(Debug, Clone)]
struct MemoryEntry {
    doc: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn apply(&self, op: &KvOp) -> Result<KvReply, KvError> {
        match op {
            KvOp::GetPath { key, path } => self.get_path(key, path).map(KvReply::Value),
            KvOp::SetPath { key, path, value } => self.set_path(key, path, value).map(KvReply::Set),
            KvOp::DeletePath { key, path } => self.delete_path(key, path).map(KvReply::Deleted),
            KvOp::Exists { key } => Ok(KvReply::Exists(self.exists(key))),
            KvOp::Expire { key, ttl } => Ok(KvReply::Expire(self.expire(key, *ttl))),
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, `None` when it is missing or has no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.evict_expired(key);
        let entry = self.entries.get(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn evict_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn get_path(&self, key: &str, path: &str) -> Result<Option<String>, KvError> {
        let segments = parse_path(path)?;
        self.evict_expired(key);
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };

        let matched: Vec<&Value> = resolve(&entry.doc, &segments).into_iter().collect();
        serde_json::to_string(&matched)
            .map(Some)
            .map_err(|e| KvError::Command(e.to_string()))
    }

    fn set_path(&self, key: &str, path: &str, value: &str) -> Result<bool, KvError> {
        let segments = parse_path(path)?;
        let value: Value = serde_json::from_str(value)
            .map_err(|e| KvError::Command(format!("invalid JSON value: {e}")))?;
        self.evict_expired(key);

        let Some((last, parents)) = segments.split_last() else {
            // Root writes replace the document and keep an existing expiry, like
            // RedisJSON does.
            self.entries
                .entry(key.to_string())
                .and_modify(|entry| entry.doc = value.clone())
                .or_insert(MemoryEntry {
                    doc: value,
                    expires_at: None,
                });
            return Ok(true);
        };

        let mut entry = self.entries.get_mut(key).ok_or_else(|| {
            KvError::Command("new objects must be created at the root".to_string())
        })?;
        match resolve_mut(&mut entry.doc, parents).and_then(Value::as_object_mut) {
            Some(object) => {
                object.insert((*last).to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_path(&self, key: &str, path: &str) -> Result<u64, KvError> {
        let segments = parse_path(path)?;
        self.evict_expired(key);

        let Some((last, parents)) = segments.split_last() else {
            return Ok(u64::from(self.entries.remove(key).is_some()));
        };

        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(0);
        };
        let removed = resolve_mut(&mut entry.doc, parents)
            .and_then(Value::as_object_mut)
            .and_then(|object| object.remove(*last));
        Ok(u64::from(removed.is_some()))
    }

    fn exists(&self, key: &str) -> bool {
        self.evict_expired(key);
        self.entries.contains_key(key)
    }

    fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.evict_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }
}

fn parse_path(path: &str) -> Result<Vec<&str>, KvError> {
    if path == "$" || path == "." {
        return Ok(Vec::new());
    }

    let rest = path
        .strip_prefix("$.")
        .or_else(|| path.strip_prefix('.'))
        .ok_or_else(|| KvError::UnsupportedPath(path.to_string()))?;

    rest.split('.')
        .map(|segment| {
            if segment.is_empty() || segment.contains(['[', ']', '*', '?', '@']) {
                Err(KvError::UnsupportedPath(path.to_string()))
            } else {
                Ok(segment)
            }
        })
        .collect()
}

fn resolve<'a>(doc: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(doc, |node, segment| node.get(*segment))
}

fn resolve_mut<'a>(doc: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    segments
        .iter()
        .try_fold(doc, |node, segment| node.get_mut(*segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(store: &MemoryStore, key: &str, path: &str, value: &str) -> bool {
        store
            .apply(&KvOp::SetPath {
                key: key.into(),
                path: path.into(),
                value: value.into(),
            })
            .map(|r| r == KvReply::Set(true))
            .unwrap()
    }

    fn get(store: &MemoryStore, key: &str, path: &str) -> Option<String> {
        store
            .apply(&KvOp::GetPath {
                key: key.into(),
                path: path.into(),
            })
            .unwrap()
            .into_value()
    }

    #[test]
    fn root_get_wraps_document_in_array() {
        let store = MemoryStore::new();
        assert_eq!(get(&store, "user:1", "$"), None);

        assert!(set(&store, "user:1", "$", r#"{"id":"1","username":"a"}"#));
        assert_eq!(
            get(&store, "user:1", "$").as_deref(),
            Some(r#"[{"id":"1","username":"a"}]"#)
        );
    }

    #[test]
    fn negative_marker_round_trips() {
        let store = MemoryStore::new();
        assert!(set(&store, "guild:1:member:2", "$", "null"));
        assert_eq!(get(&store, "guild:1:member:2", "$").as_deref(), Some("[null]"));
        assert!(store.exists("guild:1:member:2"));
    }

    #[test]
    fn member_paths_read_and_write_fields() {
        let store = MemoryStore::new();
        set(&store, "guild:1", "$", r#"{"id":"1","name":"old","meta":{"a":1}}"#);

        assert!(set(&store, "guild:1", "$.name", r#""new""#));
        assert_eq!(get(&store, "guild:1", "$.name").as_deref(), Some(r#"["new"]"#));
        assert_eq!(get(&store, "guild:1", "$.meta.a").as_deref(), Some("[1]"));
        assert_eq!(get(&store, "guild:1", "$.missing").as_deref(), Some("[]"));

        assert!(!set(&store, "guild:1", "$.nope.deeper", "1"));
        assert!(store.set_path("guild:2", "$.name", r#""x""#).is_err());
    }

    #[test]
    fn delete_root_and_member_paths() {
        let store = MemoryStore::new();
        set(&store, "guild:1", "$", r#"{"id":"1","name":"n"}"#);

        assert_eq!(store.delete_path("guild:1", "$.name").unwrap(), 1);
        assert_eq!(store.delete_path("guild:1", "$.name").unwrap(), 0);
        assert_eq!(store.delete_path("guild:1", "$").unwrap(), 1);
        assert_eq!(store.delete_path("guild:1", "$").unwrap(), 0);
        assert!(!store.exists("guild:1"));
    }

    #[test]
    fn filter_paths_are_rejected() {
        assert!(matches!(
            parse_path("$..roles[?(@.id=='1')]"),
            Err(KvError::UnsupportedPath(_))
        ));
        assert!(parse_path("roles").is_err());
        assert_eq!(parse_path("$.a.b").unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_on_the_tokio_clock() {
        let store = MemoryStore::new();
        set(&store, "user:1", "$", "{}");
        assert!(!store.expire("user:2", Duration::from_secs(1)));
        assert!(store.expire("user:1", Duration::from_secs(10)));
        assert_eq!(store.ttl("user:1"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.exists("user:1"));

        // Root overwrite keeps the expiry.
        set(&store, "user:1", "$", r#"{"v":2}"#);
        assert_eq!(store.ttl("user:1"), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.exists("user:1"));
        assert_eq!(get(&store, "user:1", "$"), None);
        assert!(store.is_empty());
    }
}
