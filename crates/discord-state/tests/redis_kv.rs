//! Integration tests against a real Redis Stack (RedisJSON) instance.
//!
//! Tests use testcontainers to spin up Redis Stack; run with `--ignored` where docker
//! is available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use discord_state::kv::Pipeline;
use discord_state::{
    DiscordApi, Guild, GatewayEvent, KvClient, Member, MemberRequestOptions, RemoteError,
    RequestContext, Role, Snowflake, StateManager, User,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, RedisStack};
use tokio::sync::OnceCell;

// Shared Redis Stack container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<RedisStack>, String)> = OnceCell::const_new();

async fn redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = RedisStack::default()
                .start()
                .await
                .expect("start redis stack container");
            let port = container
                .get_host_port_ipv4(REDIS_PORT)
                .await
                .expect("get port");
            (container, format!("redis://127.0.0.1:{port}"))
        })
        .await;
    url.clone()
}

async fn redis_client() -> KvClient {
    let pool = deadpool_redis::Config::from_url(redis_url().await)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("create pool");
    let kv = KvClient::redis(pool);
    kv.ping().await.expect("redis reachable");
    kv
}

/// Only serves users; everything else is unknown.
struct UsersOnly;

#[async_trait]
impl DiscordApi for UsersOnly {
    async fn guild(&self, _: &str) -> Result<Guild, RemoteError> {
        Err(RemoteError::GatewayClosed)
    }

    async fn guild_member(&self, _: &str, _: &str) -> Result<Member, RemoteError> {
        Err(RemoteError::Api {
            status: 404,
            code: 10007,
            message: "Unknown Member".into(),
        })
    }

    async fn guild_roles(&self, _: &str) -> Result<Vec<Role>, RemoteError> {
        Err(RemoteError::GatewayClosed)
    }

    async fn user(&self, user_id: &str) -> Result<User, RemoteError> {
        Ok(serde_json::from_value(serde_json::json!({"id": user_id, "username": "redis"}))
            .expect("user"))
    }

    async fn request_guild_members(
        &self,
        _: &str,
        _: &[Snowflake],
        _: &MemberRequestOptions,
    ) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn json_documents_round_trip_with_expiry() {
    let kv = redis_client().await;

    kv.set_path("it:user:1", "$", r#"{"id":"1","username":"a"}"#, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(
        kv.get_path("it:user:1", "$").await.unwrap().as_deref(),
        Some(r#"[{"id":"1","username":"a"}]"#)
    );
    assert_eq!(
        kv.get_path("it:user:1", "$.username").await.unwrap().as_deref(),
        Some(r#"["a"]"#)
    );
    assert_eq!(kv.get_path("it:missing", "$").await.unwrap(), None);

    assert_eq!(kv.delete_path("it:user:1", "$").await.unwrap(), 1);
    assert!(!kv.exists("it:user:1").await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn pipelined_exists_reports_each_key() {
    let kv = redis_client().await;
    kv.set_path("it:member:a", "$", "null", None).await.unwrap();

    let mut pipe = Pipeline::new();
    pipe.exists("it:member:a").exists("it:member:b");
    let replies = kv.execute(pipe).await.unwrap();
    assert!(replies[0].exists());
    assert!(!replies[1].exists());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn short_expiry_removes_the_document() {
    let kv = redis_client().await;
    kv.set_path("it:short", "$", "{}", Some(Duration::from_millis(100)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!kv.exists("it:short").await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn state_manager_reads_through_redis() {
    let kv = redis_client().await;
    let state = StateManager::new(kv.clone(), Arc::new(UsersOnly));
    let ctx = RequestContext::background();

    let user = state.user(&ctx, "42").await.unwrap();
    assert_eq!(user.username, "redis");
    assert!(kv.exists("user:42").await.unwrap());

    assert!(state.guild_member(&ctx, "9", "42").await.unwrap_err().is_not_found());
    assert_eq!(
        kv.get_path("guild:9:member:42", "$").await.unwrap().as_deref(),
        Some("[null]")
    );

    state
        .invalidation_listener()
        .apply(&GatewayEvent::MemberRemoved {
            guild_id: "9".into(),
            user_id: "42".into(),
        })
        .await
        .unwrap();
    assert!(!kv.exists("guild:9:member:42").await.unwrap());
}
