use std::sync::Arc;

use crate::codec::{self, ROOT};
use crate::context::RequestContext;
use crate::error::{EntityKind, StateResult, codes};
use crate::keys;
use crate::kv::KvClient;
use crate::model::{Member, Snowflake};
use crate::remote::{DiscordApi, MemberRequestOptions};
use crate::state::{ReadThrough, StateManager};

/// Error codes confirming a member is not in the guild.
const ABSENT_MEMBER_CODES: &[u64] = &[codes::UNKNOWN_MEMBER, codes::UNKNOWN_USER];

impl StateManager {
    /// Fetch a guild member.
    ///
    /// A member Discord reports as unknown is remembered as absent for
    /// [`TtlPolicy::member_absent`](crate::TtlPolicy::member_absent), so repeated lookups
    /// of non-members do not reach the API. A later `GUILD_MEMBER_ADD` overwrites the
    /// entry.
    pub async fn guild_member(
        &self,
        ctx: &RequestContext,
        guild_id: &str,
        user_id: &str,
    ) -> StateResult<Member> {
        let ttl = self.inner.ttl;
        let key = keys::member(guild_id, user_id);
        let member_key = key.clone();
        let plan = ReadThrough::with_persist(EntityKind::Member, key, move |member: &Member, pipe| {
            pipe.set_path(member_key, ROOT, codec::encode(member)?, Some(ttl.member));
            if let Some(user) = &member.user {
                pipe.set_path(keys::user(&user.id), ROOT, codec::encode(user)?, Some(ttl.user));
            }
            Ok(())
        })
        .remember_absence(ttl.member_absent, ABSENT_MEMBER_CODES);

        let api = Arc::clone(&self.inner.api);
        let (guild_id, user_id) = (guild_id.to_string(), user_id.to_string());
        self.read_through(ctx, &self.inner.members, plan, move || async move {
            api.guild_member(&guild_id, &user_id).await
        })
        .await
    }

    /// Ask the gateway for the members among `user_ids` that are not cached yet.
    ///
    /// Members arrive later through `GUILD_MEMBERS_CHUNK` events and are written by the
    /// invalidation listener; this call only checks the cache and queues the request.
    /// Ids with a negative entry count as cached. Concurrent calls for the same id set
    /// share one check and at most one request.
    pub async fn request_guild_members_list(
        &self,
        ctx: &RequestContext,
        guild_id: &str,
        user_ids: &[Snowflake],
        options: MemberRequestOptions,
    ) -> StateResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let flight_key = keys::member_request(guild_id, user_ids);
        let mut ids = user_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let kv = self.inner.kv.clone();
        let api = Arc::clone(&self.inner.api);
        let guild_id = guild_id.to_string();

        self.inner
            .member_requests
            .run(ctx, &flight_key, move || {
                request_missing_members(kv, api, guild_id, ids, options)
            })
            .await
    }
}

async fn request_missing_members(
    kv: KvClient,
    api: Arc<dyn DiscordApi>,
    guild_id: Snowflake,
    ids: Vec<Snowflake>,
    options: MemberRequestOptions,
) -> StateResult<()> {
    let mut pipe = kv.pipeline();
    for id in &ids {
        pipe.exists(keys::member(&guild_id, id));
    }
    let replies = kv.execute(pipe).await?;

    let missing: Vec<Snowflake> = ids
        .iter()
        .zip(&replies)
        .filter(|(_, reply)| !reply.exists())
        .map(|(id, _)| id.clone())
        .collect();
    let cached = ids.len() - missing.len();
    crate::metrics::record_member_request(missing.len(), cached);

    if missing.is_empty() {
        tracing::debug!(guild_id = %guild_id, cached, "all requested members already cached");
        return Ok(());
    }

    tracing::debug!(
        guild_id = %guild_id,
        requested = missing.len(),
        cached,
        "requesting uncached guild members"
    );
    api.request_guild_members(&guild_id, &missing, &options).await?;
    Ok(())
}
