//! Access to the Discord API, the source of truth behind the cache.
//!
//! Accessors only see the [`DiscordApi`] trait. [`DiscordClient`] implements it on top
//! of the REST API for single-entity fetches and the gateway for member requests;
//! tests substitute their own implementation.

pub mod client;
pub mod gateway;
pub mod rest;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::model::{Guild, Member, Role, Snowflake, User};

pub use client::DiscordClient;
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayHandle};
pub use rest::{RestClient, RestConfig};

/// Options forwarded with a gateway member request (opcode 8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberRequestOptions {
    /// Maximum members to return; zero means no limit when requesting by id.
    pub limit: u32,
    /// Echoed back on the resulting `GUILD_MEMBERS_CHUNK` events.
    pub nonce: Option<String>,
    pub presences: bool,
}

#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn guild(&self, guild_id: &str) -> Result<Guild, RemoteError>;

    async fn guild_member(&self, guild_id: &str, user_id: &str) -> Result<Member, RemoteError>;

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>, RemoteError>;

    async fn user(&self, user_id: &str) -> Result<User, RemoteError>;

    /// Ask the gateway to push the given members. Results arrive asynchronously as
    /// `GUILD_MEMBERS_CHUNK` events; returning `Ok` means the request was queued.
    async fn request_guild_members(
        &self,
        guild_id: &str,
        user_ids: &[Snowflake],
        options: &MemberRequestOptions,
    ) -> Result<(), RemoteError>;
}
