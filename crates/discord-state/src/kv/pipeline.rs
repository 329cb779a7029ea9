//! Batched key-value operations executed in one round trip.

use std::time::Duration;

/// A single queued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum KvOp {
    GetPath { key: String, path: String },
    SetPath { key: String, path: String, value: String },
    DeletePath { key: String, path: String },
    Exists { key: String },
    Expire { key: String, ttl: Duration },
}

/// Reply to one queued operation, in the order the operations were queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvReply {
    /// Raw `JSON.GET` reply; `None` when the key does not exist.
    Value(Option<String>),
    /// Whether `JSON.SET` wrote the value.
    Set(bool),
    /// Number of paths removed by `JSON.DEL`.
    Deleted(u64),
    Exists(bool),
    /// Whether an expiry was applied (false when the key does not exist).
    Expire(bool),
}

impl KvReply {
    pub fn into_value(self) -> Option<String> {
        match self {
            KvReply::Value(v) => v,
            _ => None,
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, KvReply::Exists(true))
    }
}

/// Builder for a batch of operations.
///
/// `set_path` with a TTL queues two operations (`JSON.SET` then `PEXPIRE`), so the
/// reply vector has one entry per queued operation, not per builder call.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    pub(crate) ops: Vec<KvOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_path(&mut self, key: impl Into<String>, path: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::GetPath {
            key: key.into(),
            path: path.into(),
        });
        self
    }

    pub fn set_path(
        &mut self,
        key: impl Into<String>,
        path: impl Into<String>,
        value: impl Into<String>,
        ttl: Option<Duration>,
    ) -> &mut Self {
        let key = key.into();
        self.ops.push(KvOp::SetPath {
            key: key.clone(),
            path: path.into(),
            value: value.into(),
        });
        if let Some(ttl) = ttl {
            self.ops.push(KvOp::Expire { key, ttl });
        }
        self
    }

    pub fn delete_path(&mut self, key: impl Into<String>, path: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::DeletePath {
            key: key.into(),
            path: path.into(),
        });
        self
    }

    pub fn exists(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(KvOp::Exists { key: key.into() });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(KvOp::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_with_ttl_queues_expire() {
        let mut pipe = Pipeline::new();
        pipe.set_path("guild:1", "$", "{}", Some(Duration::from_secs(60)))
            .set_path("guild:2", "$", "{}", None)
            .exists("guild:3");

        assert_eq!(pipe.len(), 4);
        assert_eq!(
            pipe.ops[1],
            KvOp::Expire {
                key: "guild:1".into(),
                ttl: Duration::from_secs(60)
            }
        );
        assert!(matches!(pipe.ops[3], KvOp::Exists { .. }));
    }
}
