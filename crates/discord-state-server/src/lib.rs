pub mod config;
pub mod observability;

use std::time::Duration;

use discord_state::KvClient;

pub use config::{
    AppConfig, CacheConfig, DiscordSettings, LoggingConfig, MetricsConfig, RedisConfig,
};

/// Create the cache store client based on configuration.
///
/// ## Cache Modes
///
/// - **Redis disabled**: process-local store (DashMap), not shared with other services
/// - **Redis enabled**: connects to Redis, falls back to the local store on failure
///
/// ## Graceful Degradation
///
/// If Redis is unreachable at startup, the daemon keeps running on the local store and
/// logs a warning, so gateway processing never stops because of the cache.
pub async fn create_kv_client(config: &RedisConfig) -> KvClient {
    if !config.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return KvClient::memory();
    }

    tracing::info!(url = %config.display_url(), "Connecting to Redis");

    let timeout = Duration::from_millis(config.timeout_ms);
    let mut redis_config = deadpool_redis::Config::from_url(config.connection_url());
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);
    redis_config.pool = Some(pool_config);

    let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
        Ok(pool) => pool,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to create Redis pool. Falling back to local cache."
            );
            return KvClient::memory();
        }
    };

    let kv = KvClient::redis(pool);
    match kv.ping().await {
        Ok(()) => {
            tracing::info!("✓ Connected to Redis successfully");
            kv
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            KvClient::memory()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_redis_uses_local_store() {
        let config = RedisConfig {
            enabled: false,
            ..Default::default()
        };
        let kv = create_kv_client(&config).await;
        assert!(!kv.is_redis());
        assert_eq!(kv.mode(), "memory");
    }

    #[tokio::test]
    async fn unreachable_redis_falls_back_to_local_store() {
        let config = RedisConfig {
            url: Some("redis://127.0.0.1:1/0".into()),
            timeout_ms: 200,
            ..Default::default()
        };
        let kv = create_kv_client(&config).await;
        assert!(!kv.is_redis());
    }
}
