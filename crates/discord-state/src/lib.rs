//! Shared Discord state cache.
//!
//! Guilds, members, roles and users are served from Redis (RedisJSON documents with
//! expiries) and fetched from Discord on a miss. Concurrent misses for one entity
//! share a single fetch, confirmed-absent members are remembered for a while, and
//! gateway events keep cached documents current.
//!
//! ```ignore
//! let (gateway, events, _task) = Gateway::spawn(GatewayConfig::new(token.clone()));
//! let api = DiscordClient::new(RestClient::new(RestConfig::new(token))?, gateway);
//! let state = StateManager::new(KvClient::redis(pool), Arc::new(api));
//! state.invalidation_listener().spawn(events);
//!
//! let member = state.guild_member(&RequestContext::background(), guild_id, user_id).await?;
//! ```

pub mod codec;
pub mod context;
pub mod error;
pub mod events;
pub mod keys;
pub mod kv;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod remote;
pub mod singleflight;
pub mod state;

pub use context::RequestContext;
pub use error::{EntityKind, KvError, RemoteError, StateError, StateResult};
pub use events::GatewayEvent;
pub use kv::KvClient;
pub use listener::InvalidationListener;
pub use model::{Guild, Member, Role, Snowflake, User};
pub use policy::TtlPolicy;
pub use remote::{
    DiscordApi, DiscordClient, Gateway, GatewayConfig, GatewayHandle, MemberRequestOptions,
    RestClient, RestConfig,
};
pub use state::StateManager;
