//! Discord REST API client for single-entity fetches.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::RemoteError;
use crate::model::{Guild, Member, Role, User};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Longest rate-limit wait the client sleeps through before giving up.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    /// Bot token, without the `Bot ` prefix.
    pub token: String,
    pub timeout: Duration,
    /// How many times a rate-limited request is retried after waiting.
    pub max_rate_limit_retries: u32,
}

impl RestConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            token: token.into(),
            timeout: Duration::from_secs(10),
            max_rate_limit_retries: 3,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: u64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    max_rate_limit_retries: u32,
}

impl RestClient {
    pub fn new(config: RestConfig) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bot {}", config.token))
            .map_err(|_| RemoteError::Transport("bot token is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!(
                "DiscordBot (https://github.com/typical-developers/discord-state, ",
                env!("CARGO_PKG_VERSION"),
                ")"
            )),
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_rate_limit_retries: config.max_rate_limit_retries,
        })
    }

    pub async fn guild(&self, guild_id: &str) -> Result<Guild, RemoteError> {
        self.get(&format!("/guilds/{}", snowflake(guild_id)?)).await
    }

    pub async fn guild_member(&self, guild_id: &str, user_id: &str) -> Result<Member, RemoteError> {
        self.get(&format!(
            "/guilds/{}/members/{}",
            snowflake(guild_id)?,
            snowflake(user_id)?
        ))
        .await
    }

    pub async fn guild_roles(&self, guild_id: &str) -> Result<Vec<Role>, RemoteError> {
        self.get(&format!("/guilds/{}/roles", snowflake(guild_id)?))
            .await
    }

    pub async fn user(&self, user_id: &str) -> Result<User, RemoteError> {
        self.get(&format!("/users/{}", snowflake(user_id)?)).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let mut retries = 0;

        loop {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;

            match read_response(response).await {
                Err(RemoteError::RateLimited {
                    retry_after,
                    global,
                }) if retries < self.max_rate_limit_retries
                    && retry_after <= MAX_RATE_LIMIT_WAIT =>
                {
                    retries += 1;
                    tracing::warn!(
                        path = %path,
                        retry_after_ms = retry_after.as_millis() as u64,
                        global,
                        attempt = retries,
                        "rate limited by discord api, waiting"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                other => return other,
            }
        }
    }
}

/// Snowflakes are decimal ids; anything else cannot name an entity and must not be
/// spliced into a request path.
fn snowflake(id: &str) -> Result<&str, RemoteError> {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(id)
    } else {
        Err(RemoteError::Api {
            status: StatusCode::NOT_FOUND.as_u16(),
            code: 0,
            message: format!("invalid snowflake {id:?}"),
        })
    }
}

async fn read_response<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let status = response.status();
    if status.is_success() {
        let body = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        return serde_json::from_slice(&body).map_err(|e| RemoteError::Decode(e.to_string()));
    }

    let retry_after_header = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|s| s.is_finite());
    let body = response.bytes().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let parsed: RateLimitBody = serde_json::from_slice(&body).unwrap_or_default();
        let seconds = parsed
            .retry_after
            .filter(|s| s.is_finite())
            .or(retry_after_header)
            .unwrap_or(1.0);
        return Err(RemoteError::RateLimited {
            retry_after: Duration::from_secs_f64(seconds.clamp(0.0, 3600.0)),
            global: parsed.global,
        });
    }

    let parsed: ApiErrorBody = serde_json::from_slice(&body).unwrap_or_default();
    Err(RemoteError::Api {
        status: status.as_u16(),
        code: parsed.code,
        message: parsed
            .message
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_numeric_ids() {
        assert_eq!(snowflake("123456789012345678"), Ok("123456789012345678"));
        let err = snowflake("1/../../users/@me").unwrap_err();
        assert!(err.is_not_found());
        assert!(snowflake("").is_err());
    }
}
