use std::fmt;
use std::time::Duration;

use discord_state::remote::gateway::{DEFAULT_GATEWAY_URL, intents};
use discord_state::remote::rest::DEFAULT_API_BASE;
use discord_state::{GatewayConfig, RestConfig, TtlPolicy};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub discord: DiscordSettings,
    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Document lifetimes
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Discord validations
        if self.discord.token.trim().is_empty() {
            return Err("discord.token must be set".into());
        }
        if self.discord.request_timeout_ms == 0 {
            return Err("discord.request_timeout_ms must be > 0".into());
        }
        if self.discord.event_buffer == 0 {
            return Err("discord.event_buffer must be > 0".into());
        }
        // Redis validations
        if self.redis.enabled {
            if self.redis.pool_size == 0 {
                return Err("redis.pool_size must be > 0".into());
            }
            if self.redis.url.is_none() && self.redis.host.is_empty() {
                return Err("redis requires either 'url' or 'host' to be set".into());
            }
        }
        // Cache validations
        let ttls = [
            ("cache.guild_ttl_secs", self.cache.guild_ttl_secs),
            ("cache.member_ttl_secs", self.cache.member_ttl_secs),
            ("cache.member_absent_ttl_secs", self.cache.member_absent_ttl_secs),
            ("cache.roles_ttl_secs", self.cache.roles_ttl_secs),
            ("cache.role_ttl_secs", self.cache.role_ttl_secs),
            ("cache.user_ttl_secs", self.cache.user_ttl_secs),
        ];
        if let Some((name, _)) = ttls.iter().find(|(_, secs)| *secs == 0) {
            return Err(format!("{name} must be > 0"));
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Metrics validation
        if self.metrics.enabled && self.metrics.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err("metrics.listen must be a socket address (e.g. 0.0.0.0:9090)".into());
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize)]
pub struct DiscordSettings {
    /// Bot token. Prefer DISCORD_STATE__DISCORD__TOKEN over the config file.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Gateway events buffered between the gateway and the cache writer
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base_url: default_api_base_url(),
            gateway_url: default_gateway_url(),
            intents: default_intents(),
            request_timeout_ms: default_request_timeout_ms(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl fmt::Debug for DiscordSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordSettings")
            .field("token", &"<redacted>")
            .field("api_base_url", &self.api_base_url)
            .field("gateway_url", &self.gateway_url)
            .field("intents", &self.intents)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("max_rate_limit_retries", &self.max_rate_limit_retries)
            .field("event_buffer", &self.event_buffer)
            .finish()
    }
}

impl DiscordSettings {
    pub fn rest_config(&self) -> RestConfig {
        RestConfig {
            base_url: self.api_base_url.clone(),
            token: self.token.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
            max_rate_limit_retries: self.max_rate_limit_retries,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            url: self.gateway_url.clone(),
            token: self.token.clone(),
            intents: self.intents,
            event_buffer: self.event_buffer,
        }
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_intents() -> u64 {
    intents::GUILDS | intents::GUILD_MEMBERS
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_max_rate_limit_retries() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    1024
}

#[derive(Clone, Deserialize)]
pub struct RedisConfig {
    /// Enable Redis. Without it the cache lives in process memory and is not shared.
    #[serde(default = "default_redis_enabled")]
    pub enabled: bool,

    /// Full connection URL; overrides the individual connection fields when set.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: default_redis_enabled(),
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            username: None,
            password: None,
            db: 0,
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("enabled", &self.enabled)
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("pool_size", &self.pool_size)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl RedisConfig {
    /// Connection URL, assembled from the individual fields unless `url` is set.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }

    /// Connection URL with credentials removed, for logs.
    pub fn display_url(&self) -> String {
        if self.url.is_some() {
            return "<configured url>".to_string();
        }
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

fn default_redis_enabled() -> bool {
    true
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_pool_size() -> usize {
    16
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_guild_ttl_secs")]
    pub guild_ttl_secs: u64,
    #[serde(default = "default_member_ttl_secs")]
    pub member_ttl_secs: u64,
    /// How long a member Discord reported as unknown is remembered
    #[serde(default = "default_member_ttl_secs")]
    pub member_absent_ttl_secs: u64,
    #[serde(default = "default_guild_ttl_secs")]
    pub roles_ttl_secs: u64,
    #[serde(default = "default_guild_ttl_secs")]
    pub role_ttl_secs: u64,
    #[serde(default = "default_member_ttl_secs")]
    pub user_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            guild_ttl_secs: default_guild_ttl_secs(),
            member_ttl_secs: default_member_ttl_secs(),
            member_absent_ttl_secs: default_member_ttl_secs(),
            roles_ttl_secs: default_guild_ttl_secs(),
            role_ttl_secs: default_guild_ttl_secs(),
            user_ttl_secs: default_member_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            guild: Duration::from_secs(self.guild_ttl_secs),
            member: Duration::from_secs(self.member_ttl_secs),
            member_absent: Duration::from_secs(self.member_absent_ttl_secs),
            roles: Duration::from_secs(self.roles_ttl_secs),
            role: Duration::from_secs(self.role_ttl_secs),
            user: Duration::from_secs(self.user_ttl_secs),
        }
    }
}

fn default_guild_ttl_secs() -> u64 {
    TtlPolicy::default().guild.as_secs()
}

fn default_member_ttl_secs() -> u64 {
    TtlPolicy::default().member.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Address the Prometheus scrape endpoint listens on
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9090".to_string()
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_FILE: &str = "discord-state.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., DISCORD_STATE__REDIS__PORT=6380
        builder = builder.add_source(
            Environment::with_prefix("DISCORD_STATE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
