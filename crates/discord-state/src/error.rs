//! Error types shared by the cache layer.
//!
//! Every error is `Clone`: a single remote fetch hands the same outcome to all callers
//! waiting on it, so foreign errors are captured as strings at the boundary.

use std::fmt;
use std::time::Duration;

/// The kind of entity an accessor resolves. Used for "not found" reporting, metrics
/// labels and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Guild,
    Member,
    Roles,
    Role,
    User,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Guild => "guild",
            EntityKind::Member => "member",
            EntityKind::Roles => "roles",
            EntityKind::Role => "role",
            EntityKind::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the key-value store client.
///
/// A missing key is never an error; operations report it through `Option`/`bool`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("cache store connection error: {0}")]
    Connection(String),

    #[error("cache store command error: {0}")]
    Command(String),

    #[error("unexpected cache store reply: {0}")]
    UnexpectedReply(String),

    #[error("unsupported JSON path: {0}")]
    UnsupportedPath(String),
}

/// Errors returned by the remote Discord API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("discord api returned {status}: {message} (code {code})")]
    Api {
        status: u16,
        code: u64,
        message: String,
    },

    #[error("rate limited by discord api, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, global: bool },

    #[error("discord api transport error: {0}")]
    Transport(String),

    #[error("failed to decode discord api response: {0}")]
    Decode(String),

    #[error("discord gateway is not connected")]
    GatewayClosed,
}

impl RemoteError {
    /// Discord JSON error code, when the API returned one.
    pub fn code(&self) -> Option<u64> {
        match self {
            RemoteError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the API reported that the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Api { status: 404, .. })
    }
}

/// Discord JSON error codes the cache layer cares about.
pub mod codes {
    pub const UNKNOWN_GUILD: u64 = 10004;
    pub const UNKNOWN_MEMBER: u64 = 10007;
    pub const UNKNOWN_ROLE: u64 = 10011;
    pub const UNKNOWN_USER: u64 = 10013;
}

/// Errors returned by the entity accessors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    /// The entity does not exist, either confirmed by the remote API or by a negative
    /// cache entry.
    #[error("{0} not found")]
    NotFound(EntityKind),

    #[error(transparent)]
    Cache(#[from] KvError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The shared fetch task for this key panicked or was aborted.
    #[error("in-flight fetch for {0} aborted")]
    Aborted(String),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}

pub type StateResult<T> = Result<T, StateError>;
