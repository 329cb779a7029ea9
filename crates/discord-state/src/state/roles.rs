use std::sync::Arc;

use crate::codec::{self, CodecError, ROOT};
use crate::context::RequestContext;
use crate::error::{EntityKind, StateError, StateResult};
use crate::keys;
use crate::kv::Pipeline;
use crate::metrics;
use crate::model::Role;
use crate::state::{Lookup, ReadThrough, StateManager, lookup};

impl StateManager {
    /// Fetch every role of a guild.
    ///
    /// A fetched list is stored under the guild's role list key and each role is also
    /// stored under its own key, in one batch.
    pub async fn guild_roles(
        &self,
        ctx: &RequestContext,
        guild_id: &str,
    ) -> StateResult<Vec<Role>> {
        let ttl = self.inner.ttl;
        let owner = guild_id.to_string();
        let key = keys::roles(guild_id);
        let list_key = key.clone();
        let persist = move |roles: &Vec<Role>, pipe: &mut Pipeline| -> Result<(), CodecError> {
            pipe.set_path(list_key, ROOT, codec::encode(roles)?, Some(ttl.roles));
            for role in roles {
                let role_key = keys::role(&owner, &role.id);
                pipe.set_path(role_key, ROOT, codec::encode(role)?, Some(ttl.role));
            }
            Ok(())
        };
        let plan = ReadThrough::with_persist(EntityKind::Roles, key, persist);

        let api = Arc::clone(&self.inner.api);
        let guild_id = guild_id.to_string();
        self.read_through(ctx, &self.inner.roles, plan, move || async move {
            api.guild_roles(&guild_id).await
        })
        .await
    }

    /// Fetch one role.
    ///
    /// Served from the role's own key when cached; otherwise resolved through
    /// [`guild_roles`](Self::guild_roles), which caches the whole list. A role missing
    /// from the list is `NotFound`.
    pub async fn guild_role(
        &self,
        ctx: &RequestContext,
        guild_id: &str,
        role_id: &str,
    ) -> StateResult<Role> {
        let key = keys::role(guild_id, role_id);
        let cached = lookup::<Role>(&self.inner.kv, EntityKind::Role, &key);
        if let Lookup::Hit(role) = ctx.run(cached).await? {
            metrics::record_cache_hit(EntityKind::Role);
            return Ok(role);
        }
        metrics::record_cache_miss(EntityKind::Role);

        self.guild_roles(ctx, guild_id)
            .await?
            .into_iter()
            .find(|role| role.id == role_id)
            .ok_or(StateError::NotFound(EntityKind::Role))
    }
}
