use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::{EntityKind, StateResult};
use crate::keys;
use crate::model::Guild;
use crate::state::{ReadThrough, StateManager};

impl StateManager {
    /// Fetch a guild, from the cache when possible.
    ///
    /// The guild document embeds its roles; role events drop it so the next read sees
    /// the current role set.
    pub async fn guild(&self, ctx: &RequestContext, guild_id: &str) -> StateResult<Guild> {
        let plan =
            ReadThrough::document(EntityKind::Guild, keys::guild(guild_id), self.inner.ttl.guild);
        let api = Arc::clone(&self.inner.api);
        let guild_id = guild_id.to_string();

        self.read_through(ctx, &self.inner.guilds, plan, move || async move {
            api.guild(&guild_id).await
        })
        .await
    }
}
