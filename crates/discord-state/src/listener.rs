//! Push-driven cache maintenance from gateway events.
//!
//! ## How It Works
//!
//! 1. The gateway client turns dispatches into [`GatewayEvent`]s and sends them down a
//!    channel
//! 2. The listener turns each event into one batch of cache writes and deletes
//! 3. The batch runs atomically on Redis, so readers never see half an event
//!
//! ```text
//! GUILD_ROLE_UPDATE { guild_id: 1, role: 9 }
//!   ↓
//! JSON.SET guild:1:role:9 $ {...}  PEXPIRE guild:1:role:9
//! JSON.DEL guild:1:roles $
//! JSON.DEL guild:1 $
//! ```
//!
//! Every event is idempotent: applying it twice leaves the cache as applying it once.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{self, CodecError, NEGATIVE_MARKER, ROOT};
use crate::error::StateResult;
use crate::events::GatewayEvent;
use crate::keys;
use crate::kv::{KvClient, Pipeline};
use crate::model::Member;
use crate::policy::TtlPolicy;

#[derive(Debug, Clone)]
pub struct InvalidationListener {
    kv: KvClient,
    ttl: TtlPolicy,
}

impl InvalidationListener {
    pub fn new(kv: KvClient, ttl: TtlPolicy) -> Self {
        Self { kv, ttl }
    }

    /// Build the batch of cache operations for `event`.
    pub fn plan(&self, event: &GatewayEvent) -> Result<Pipeline, CodecError> {
        let mut pipe = Pipeline::new();
        match event {
            GatewayEvent::GuildUpdated(guild) => {
                pipe.set_path(
                    keys::guild(&guild.id),
                    ROOT,
                    codec::encode(guild)?,
                    Some(self.ttl.guild),
                );
            }
            GatewayEvent::GuildDeleted { guild_id } => {
                pipe.delete_path(keys::guild(guild_id), ROOT)
                    .delete_path(keys::roles(guild_id), ROOT);
            }
            GatewayEvent::MemberUpdated { guild_id, member } => {
                self.plan_member(&mut pipe, guild_id, member)?;
            }
            GatewayEvent::MembersChunk {
                guild_id,
                members,
                not_found,
            } => {
                for member in members {
                    self.plan_member(&mut pipe, guild_id, member)?;
                }
                for user_id in not_found {
                    pipe.set_path(
                        keys::member(guild_id, user_id),
                        ROOT,
                        NEGATIVE_MARKER,
                        Some(self.ttl.member_absent),
                    );
                }
            }
            GatewayEvent::MemberRemoved { guild_id, user_id } => {
                pipe.delete_path(keys::member(guild_id, user_id), ROOT);
            }
            GatewayEvent::RoleUpserted { guild_id, role } => {
                pipe.set_path(
                    keys::role(guild_id, &role.id),
                    ROOT,
                    codec::encode(role)?,
                    Some(self.ttl.role),
                )
                .delete_path(keys::roles(guild_id), ROOT)
                .delete_path(keys::guild(guild_id), ROOT);
            }
            GatewayEvent::RoleDeleted { guild_id, role_id } => {
                pipe.delete_path(keys::role(guild_id, role_id), ROOT)
                    .delete_path(keys::roles(guild_id), ROOT)
                    .delete_path(keys::guild(guild_id), ROOT);
            }
        }
        Ok(pipe)
    }

    fn plan_member(
        &self,
        pipe: &mut Pipeline,
        guild_id: &str,
        member: &Member,
    ) -> Result<(), CodecError> {
        let Some(user) = member.user.as_ref() else {
            tracing::warn!(guild_id = %guild_id, "skipping member event without a user");
            return Ok(());
        };
        pipe.set_path(
            keys::member(guild_id, &user.id),
            ROOT,
            codec::encode(member)?,
            Some(self.ttl.member),
        )
        .set_path(
            keys::user(&user.id),
            ROOT,
            codec::encode(user)?,
            Some(self.ttl.user),
        );
        Ok(())
    }

    /// Apply one event to the cache.
    pub async fn apply(&self, event: &GatewayEvent) -> StateResult<()> {
        let pipe = self.plan(event)?;
        if pipe.is_empty() {
            return Ok(());
        }
        self.kv.execute(pipe).await?;
        Ok(())
    }

    /// Apply events until the channel closes.
    ///
    /// A failed event is logged and skipped; the next gateway update or the entry's
    /// expiry corrects the cache.
    pub async fn run(self, mut events: mpsc::Receiver<GatewayEvent>) {
        tracing::info!(backend = self.kv.mode(), "cache invalidation listener started");

        while let Some(event) = events.recv().await {
            match self.apply(&event).await {
                Ok(()) => {
                    tracing::debug!(
                        event = event.name(),
                        guild_id = %event.guild_id(),
                        "applied gateway event"
                    );
                    crate::metrics::record_invalidation(event.name(), "ok");
                }
                Err(e) => {
                    tracing::warn!(
                        event = event.name(),
                        guild_id = %event.guild_id(),
                        error = %e,
                        "failed to apply gateway event to cache"
                    );
                    crate::metrics::record_invalidation(event.name(), "error");
                }
            }
        }

        tracing::info!("gateway event channel closed, invalidation listener stopped");
    }

    pub fn spawn(self, events: mpsc::Receiver<GatewayEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;
    use crate::model::{Guild, Role, User};
    use serde_json::Map;
    use std::time::Duration;

    fn role(id: &str) -> Role {
        Role {
            id: id.to_string(),
            name: format!("role-{id}"),
            color: 0,
            position: 1,
            permissions: "0".to_string(),
            hoist: false,
            managed: false,
            mentionable: false,
            extra: Map::new(),
        }
    }

    fn member(user_id: &str) -> Member {
        Member {
            user: Some(User {
                id: user_id.to_string(),
                username: format!("user-{user_id}"),
                global_name: None,
                discriminator: None,
                avatar: None,
                bot: false,
                extra: Map::new(),
            }),
            nick: None,
            avatar: None,
            roles: vec![],
            joined_at: None,
            extra: Map::new(),
        }
    }

    fn listener() -> (InvalidationListener, KvClient) {
        let kv = KvClient::memory();
        (InvalidationListener::new(kv.clone(), TtlPolicy::default()), kv)
    }

    #[tokio::test]
    async fn role_update_writes_role_and_drops_aggregates() {
        let (listener, kv) = listener();
        kv.set_path("guild:1", ROOT, r#"{"id":"1","name":"g"}"#, None)
            .await
            .unwrap();
        kv.set_path("guild:1:roles", ROOT, "[]", None).await.unwrap();

        let event = GatewayEvent::RoleUpserted {
            guild_id: "1".into(),
            role: role("9"),
        };
        listener.apply(&event).await.unwrap();
        listener.apply(&event).await.unwrap();

        assert!(kv.exists("guild:1:role:9").await.unwrap());
        assert!(!kv.exists("guild:1:roles").await.unwrap());
        assert!(!kv.exists("guild:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn chunk_caches_members_users_and_absences() {
        let (listener, kv) = listener();
        let event = GatewayEvent::MembersChunk {
            guild_id: "1".into(),
            members: vec![member("5")],
            not_found: vec!["6".into()],
        };
        listener.apply(&event).await.unwrap();

        assert!(kv.exists("guild:1:member:5").await.unwrap());
        assert!(kv.exists("user:5").await.unwrap());
        assert_eq!(
            kv.get_path("guild:1:member:6", ROOT).await.unwrap().as_deref(),
            Some("[null]")
        );
        let store = kv.memory_store().unwrap();
        assert_eq!(store.ttl("guild:1:member:6"), Some(Duration::from_secs(24 * 60 * 60)));
    }

    #[tokio::test]
    async fn member_without_user_is_skipped() {
        let (listener, kv) = listener();
        let mut anonymous = member("5");
        anonymous.user = None;
        listener
            .apply(&GatewayEvent::MemberUpdated {
                guild_id: "1".into(),
                member: anonymous,
            })
            .await
            .unwrap();
        assert!(kv.memory_store().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_drains_channel_until_closed() {
        let (listener, kv) = listener();
        kv.set_path("guild:2", ROOT, r#"{"id":"2","name":"gone"}"#, None)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handle = listener.spawn(rx);

        tx.send(GatewayEvent::GuildUpdated(Guild {
            id: "1".into(),
            name: "g".into(),
            icon: None,
            owner_id: None,
            roles: vec![],
            extra: Map::new(),
        }))
        .await
        .unwrap();
        tx.send(GatewayEvent::GuildDeleted {
            guild_id: "2".into(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(kv.exists("guild:1").await.unwrap());
        assert!(!kv.exists("guild:2").await.unwrap());
    }

    fn unreachable_listener() -> InvalidationListener {
        let mut config = deadpool_redis::Config::from_url("redis://127.0.0.1:1/0");
        let mut pool_config = deadpool_redis::PoolConfig::new(1);
        pool_config.timeouts.wait = Some(Duration::from_millis(200));
        pool_config.timeouts.create = Some(Duration::from_millis(200));
        config.pool = Some(pool_config);
        let pool = config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        InvalidationListener::new(KvClient::redis(pool), TtlPolicy::default())
    }

    fn guild_deleted(id: &str) -> GatewayEvent {
        GatewayEvent::GuildDeleted {
            guild_id: id.into(),
        }
    }

    #[tokio::test]
    async fn guild_delete_removes_guild_and_role_list() {
        let (listener, kv) = listener();
        kv.set_path("guild:1", ROOT, r#"{"id":"1","name":"g"}"#, None)
            .await
            .unwrap();
        kv.set_path("guild:1:roles", ROOT, "[]", None).await.unwrap();
        kv.set_path("guild:2", ROOT, r#"{"id":"2","name":"other"}"#, None)
            .await
            .unwrap();

        listener.apply(&guild_deleted("1")).await.unwrap();

        assert!(!kv.exists("guild:1").await.unwrap());
        assert!(!kv.exists("guild:1:roles").await.unwrap());
        assert!(kv.exists("guild:2").await.unwrap());
    }

    #[tokio::test]
    async fn apply_reports_store_failures() {
        let listener = unreachable_listener();
        let err = listener.apply(&guild_deleted("1")).await.unwrap_err();
        assert!(matches!(err, StateError::Cache(_)));
    }

    #[tokio::test]
    async fn run_keeps_consuming_after_failed_writes() {
        let listener = unreachable_listener();
        let (tx, rx) = mpsc::channel(8);
        let handle = listener.spawn(rx);

        for id in ["1", "2", "3"] {
            tx.send(guild_deleted(id)).await.unwrap();
        }
        // Every event is taken off the channel even though each write fails.
        tokio::time::timeout(Duration::from_secs(10), async {
            while tx.capacity() < tx.max_capacity() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.is_finished());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
