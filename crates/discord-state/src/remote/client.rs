use async_trait::async_trait;

use crate::error::RemoteError;
use crate::model::{Guild, Member, Role, Snowflake, User};
use crate::remote::gateway::GatewayHandle;
use crate::remote::rest::RestClient;
use crate::remote::{DiscordApi, MemberRequestOptions};

/// The production [`DiscordApi`]: REST for entity fetches, the gateway for member
/// requests.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    rest: RestClient,
    gateway: GatewayHandle,
}

impl DiscordClient {
    pub fn new(rest: RestClient, gateway: GatewayHandle) -> Self {
        Self { rest, gateway }
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.gateway
    }
}

#[async_trait]
impl DiscordApi for DiscordClient {
    async fn guild(&self, guild_id: &str) -> Result<Guild, RemoteError> {
        self.rest.guild(guild_id).await
    }

    async fn guild_member(&self, guild_id: &str, user_id: &str) -> Result<Member, RemoteError> {
        self.rest.guild_member(guild_id, user_id).await
    }

    async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>, RemoteError> {
        self.rest.guild_roles(guild_id).await
    }

    async fn user(&self, user_id: &str) -> Result<User, RemoteError> {
        self.rest.user(user_id).await
    }

    async fn request_guild_members(
        &self,
        guild_id: &str,
        user_ids: &[Snowflake],
        options: &MemberRequestOptions,
    ) -> Result<(), RemoteError> {
        self.gateway
            .request_guild_members(guild_id, user_ids, options)
    }
}
