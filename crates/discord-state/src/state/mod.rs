//! Read-through accessors for Discord entities.
//!
//! ## Read path
//!
//! ```text
//! accessor(ctx, ids)
//!   ↓
//! JSON.GET key $ ──hit──────────────→ value
//!   │          └──negative entry────→ NotFound
//!   ↓ miss
//! single-flight(key)
//!   ├─ re-check cache (a flight that just finished may have filled it)
//!   ├─ fetch from Discord
//!   ├─ write document + expiry (atomically), or a negative entry
//!   └─ hand the outcome to every joined caller
//! ```
//!
//! Cache write failures after a successful fetch are logged and the fetched value is
//! still returned. Transient remote errors are never cached.

mod guilds;
mod members;
mod roles;
mod users;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{self, Cached, CodecError, NEGATIVE_MARKER, ROOT};
use crate::context::RequestContext;
use crate::error::{EntityKind, KvError, RemoteError, StateError, StateResult};
use crate::kv::{KvClient, Pipeline};
use crate::listener::InvalidationListener;
use crate::metrics;
use crate::model::{Guild, Member, Role, User};
use crate::policy::TtlPolicy;
use crate::remote::DiscordApi;
use crate::singleflight::SingleFlight;

/// Entry point for cached entity reads. Cheap to clone.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<Inner>,
}

struct Inner {
    kv: KvClient,
    api: Arc<dyn DiscordApi>,
    ttl: TtlPolicy,
    guilds: SingleFlight<Guild>,
    members: SingleFlight<Member>,
    roles: SingleFlight<Vec<Role>>,
    users: SingleFlight<User>,
    member_requests: SingleFlight<()>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("kv", &self.inner.kv)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl StateManager {
    pub fn new(kv: KvClient, api: Arc<dyn DiscordApi>) -> Self {
        Self::with_ttl(kv, api, TtlPolicy::default())
    }

    pub fn with_ttl(kv: KvClient, api: Arc<dyn DiscordApi>, ttl: TtlPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                kv,
                api,
                ttl,
                guilds: SingleFlight::new(),
                members: SingleFlight::new(),
                roles: SingleFlight::new(),
                users: SingleFlight::new(),
                member_requests: SingleFlight::new(),
            }),
        }
    }

    pub fn kv(&self) -> &KvClient {
        &self.inner.kv
    }

    pub fn ttl(&self) -> &TtlPolicy {
        &self.inner.ttl
    }

    /// A listener writing gateway events into the same store with the same expiries.
    pub fn invalidation_listener(&self) -> InvalidationListener {
        InvalidationListener::new(self.inner.kv.clone(), self.inner.ttl)
    }

    /// Serve `plan.key` from the cache, or fetch it once through `flight` and cache
    /// the result.
    async fn read_through<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        flight: &SingleFlight<T>,
        plan: ReadThrough<T>,
        fetch: F,
    ) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let kind = plan.kind;
        match ctx.run(lookup::<T>(&self.inner.kv, kind, &plan.key)).await? {
            Lookup::Hit(value) => {
                tracing::trace!(key = %plan.key, "cache hit");
                metrics::record_cache_hit(kind);
                return Ok(value);
            }
            Lookup::Absent => {
                tracing::trace!(key = %plan.key, "negative cache hit");
                metrics::record_negative_hit(kind);
                return Err(StateError::NotFound(kind));
            }
            Lookup::Miss => metrics::record_cache_miss(kind),
        }

        let kv = self.inner.kv.clone();
        let key = plan.key.clone();
        flight
            .run(ctx, &key, move || fetch_and_cache(kv, plan, fetch))
            .await
    }
}

/// Outcome of a cache read.
pub(crate) enum Lookup<T> {
    Hit(T),
    /// A negative entry: the entity is known not to exist.
    Absent,
    Miss,
}

/// Read and decode one cached document. Undecodable documents count as misses so the
/// next fetch overwrites them.
pub(crate) async fn lookup<T: DeserializeOwned>(
    kv: &KvClient,
    kind: EntityKind,
    key: &str,
) -> Result<Lookup<T>, KvError> {
    let Some(raw) = kv.get_path(key, ROOT).await? else {
        return Ok(Lookup::Miss);
    };

    match codec::decode_root::<T>(&raw) {
        Ok(Some(Cached::Present(value))) => Ok(Lookup::Hit(value)),
        Ok(Some(Cached::Absent)) => Ok(Lookup::Absent),
        Ok(None) => Ok(Lookup::Miss),
        Err(e) => {
            tracing::warn!(
                key = %key,
                entity = %kind,
                error = %e,
                "discarding undecodable cache entry"
            );
            metrics::record_decode_error(kind);
            Ok(Lookup::Miss)
        }
    }
}

type Persist<T> = Box<dyn FnOnce(&T, &mut Pipeline) -> Result<(), CodecError> + Send>;

/// How one entity is cached: its key, how a fetched value is written and whether a
/// confirmed absence is remembered.
pub(crate) struct ReadThrough<T> {
    kind: EntityKind,
    key: String,
    persist: Persist<T>,
    negative: Option<NegativeCaching>,
}

struct NegativeCaching {
    ttl: Duration,
    /// Discord error codes that confirm the entity does not exist.
    codes: &'static [u64],
}

impl<T: Serialize + 'static> ReadThrough<T> {
    /// Store the fetched value as a single document under `key`.
    pub(crate) fn document(kind: EntityKind, key: String, ttl: Duration) -> Self {
        let doc_key = key.clone();
        Self {
            kind,
            key,
            persist: Box::new(move |value, pipe| {
                pipe.set_path(doc_key, ROOT, codec::encode(value)?, Some(ttl));
                Ok(())
            }),
            negative: None,
        }
    }

    /// Store the fetched value with a custom batch of writes.
    pub(crate) fn with_persist(
        kind: EntityKind,
        key: String,
        persist: impl FnOnce(&T, &mut Pipeline) -> Result<(), CodecError> + Send + 'static,
    ) -> Self {
        Self {
            kind,
            key,
            persist: Box::new(persist),
            negative: None,
        }
    }

    /// Write a negative entry for `ttl` when the API answers 404 with one of `codes`.
    pub(crate) fn remember_absence(mut self, ttl: Duration, codes: &'static [u64]) -> Self {
        self.negative = Some(NegativeCaching { ttl, codes });
        self
    }
}

async fn fetch_and_cache<T, F, Fut>(kv: KvClient, plan: ReadThrough<T>, fetch: F) -> StateResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let ReadThrough {
        kind,
        key,
        persist,
        negative,
    } = plan;

    match lookup::<T>(&kv, kind, &key).await? {
        Lookup::Hit(value) => return Ok(value),
        Lookup::Absent => return Err(StateError::NotFound(kind)),
        Lookup::Miss => {}
    }

    tracing::debug!(key = %key, entity = %kind, "fetching from discord");
    match fetch().await {
        Ok(value) => {
            metrics::record_remote_fetch(kind, "ok");
            let mut pipe = Pipeline::new();
            match persist(&value, &mut pipe) {
                Ok(()) => store(&kv, &key, pipe).await,
                Err(e) => tracing::warn!(key = %key, error = %e, "failed to encode fetched entity"),
            }
            Ok(value)
        }
        Err(err) if err.is_not_found() => {
            metrics::record_remote_fetch(kind, "not_found");
            let confirmed = negative
                .as_ref()
                .filter(|n| err.code().is_some_and(|code| n.codes.contains(&code)));
            if let Some(negative) = confirmed {
                let mut pipe = Pipeline::new();
                pipe.set_path(key.as_str(), ROOT, NEGATIVE_MARKER, Some(negative.ttl));
                store(&kv, &key, pipe).await;
            }
            Err(StateError::NotFound(kind))
        }
        Err(err) => {
            metrics::record_remote_fetch(kind, "error");
            tracing::warn!(key = %key, entity = %kind, error = %err, "discord fetch failed");
            Err(StateError::Remote(err))
        }
    }
}

async fn store(kv: &KvClient, key: &str, pipe: Pipeline) {
    match kv.execute(pipe).await {
        Ok(_) => tracing::debug!(key = %key, "cached"),
        Err(e) => tracing::warn!(key = %key, error = %e, "failed to write cache entry"),
    }
}
