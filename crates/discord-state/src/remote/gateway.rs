//! Discord gateway client.
//!
//! Maintains one gateway session, turns cache-relevant dispatches into
//! [`GatewayEvent`]s and sends member requests (opcode 8) on behalf of
//! [`GatewayHandle`].
//!
//! ## Connection lifecycle
//!
//! ```text
//! connect → Hello (op 10) → Identify (op 2) or Resume (op 6)
//!        → Heartbeat (op 1) every interval, expecting Heartbeat ACK (op 11)
//!        → Dispatch (op 0) ... until Reconnect (op 7), Invalid Session (op 9),
//!          a missed ACK or a close frame
//! ```
//!
//! Connection failures are retried with exponential backoff, resuming the session
//! when Discord allows it. Close codes that can never succeed on retry (bad token,
//! disallowed intents) stop the client.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::error::RemoteError;
use crate::events::GatewayEvent;
use crate::model::Snowflake;
use crate::remote::MemberRequestOptions;

pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Gateway intents this cache needs.
pub mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
}

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RESUME: u8 = 6;
const OP_RECONNECT: u8 = 7;
const OP_REQUEST_GUILD_MEMBERS: u8 = 8;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Discord accepts at most this many user ids per member request.
const MAX_USER_IDS_PER_REQUEST: usize = 100;

/// How long a fresh connection may take to send Hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    /// Bot token, without the `Bot ` prefix.
    pub token: String,
    pub intents: u64,
    /// Capacity of the event channel handed to the listener. Events arriving while it
    /// is full are dropped; the affected entries fall back to their expiry.
    pub event_buffer: usize,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            token: token.into(),
            intents: intents::GUILDS | intents::GUILD_MEMBERS,
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid gateway payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("gateway connection closed (code {0:?})")]
    Closed(Option<u16>),

    #[error("gateway closed the connection with fatal code {0}")]
    Fatal(u16),

    #[error("gateway heartbeat was not acknowledged")]
    HeartbeatTimeout,

    #[error("gateway requested a reconnect")]
    Reconnect,

    #[error("gateway session invalidated")]
    InvalidSession,

    #[error("expected hello, got opcode {0}")]
    UnexpectedOpcode(u8),

    #[error("gateway sent no hello within {0:?}")]
    HelloTimeout(Duration),
}

impl GatewayError {
    /// Close codes after which reconnecting cannot succeed.
    fn from_close_code(code: Option<u16>) -> Self {
        match code {
            Some(code @ (4004 | 4010..=4014)) => GatewayError::Fatal(code),
            other => GatewayError::Closed(other),
        }
    }

    /// Whether the error ends the current session, so the next connection identifies
    /// instead of resuming.
    fn ends_session(&self) -> bool {
        matches!(self, GatewayError::Closed(Some(4007 | 4009)))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ready {
    session_id: String,
    resume_gateway_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct MemberChunkRequest {
    pub guild_id: Snowflake,
    pub user_ids: Vec<Snowflake>,
    pub limit: u32,
    pub presences: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    resume_url: String,
}

/// Cheap handle for sending commands to a running [`Gateway`].
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    commands: mpsc::UnboundedSender<MemberChunkRequest>,
    shutdown: CancellationToken,
}

impl GatewayHandle {
    /// Queue a member request. Ids are split into requests of at most 100 ids.
    ///
    /// Requests queued while the gateway is reconnecting are sent once it is back.
    pub fn request_guild_members(
        &self,
        guild_id: &str,
        user_ids: &[Snowflake],
        options: &MemberRequestOptions,
    ) -> Result<(), RemoteError> {
        if self.shutdown.is_cancelled() {
            return Err(RemoteError::GatewayClosed);
        }
        for chunk in user_ids.chunks(MAX_USER_IDS_PER_REQUEST) {
            self.commands
                .send(MemberChunkRequest {
                    guild_id: guild_id.to_string(),
                    user_ids: chunk.to_vec(),
                    limit: options.limit,
                    presences: options.presences,
                    nonce: options.nonce.clone(),
                })
                .map_err(|_| RemoteError::GatewayClosed)?;
        }
        Ok(())
    }

    /// Close the connection and stop reconnecting.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.commands.is_closed()
    }

    /// Resolves once the gateway client has stopped or was told to stop.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }
}

pub struct Gateway {
    config: GatewayConfig,
    session: Option<Session>,
    sequence: Option<u64>,
    /// Set once a connection reaches READY or RESUMED; resets the backoff.
    established: bool,
    events: mpsc::Sender<GatewayEvent>,
    commands: mpsc::UnboundedReceiver<MemberChunkRequest>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Start the gateway client in the background.
    ///
    /// Returns the command handle, the receiving end of the event channel and the
    /// task handle. The task ends when the handle is shut down, the event receiver is
    /// dropped or Discord closes with a fatal code.
    pub fn spawn(
        config: GatewayConfig,
    ) -> (GatewayHandle, mpsc::Receiver<GatewayEvent>, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let gateway = Gateway {
            config,
            session: None,
            sequence: None,
            established: false,
            events: event_tx,
            commands: command_rx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(gateway.run());

        (
            GatewayHandle {
                commands: command_tx,
                shutdown,
            },
            event_rx,
            task,
        )
    }

    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let result = self.connect_once().await;
            if self.established {
                self.established = false;
                backoff = INITIAL_BACKOFF;
            }

            let delay = match result {
                Ok(()) => break,
                Err(GatewayError::Fatal(code)) => {
                    tracing::error!(
                        close_code = code,
                        "gateway rejected the connection, giving up"
                    );
                    break;
                }
                Err(GatewayError::Reconnect) => {
                    tracing::info!(
                        resumable = self.session.is_some(),
                        "gateway requested a reconnect"
                    );
                    Duration::ZERO
                }
                Err(GatewayError::InvalidSession) => {
                    let delay = invalid_session_delay();
                    tracing::info!(
                        resumable = self.session.is_some(),
                        delay_ms = delay.as_millis() as u64,
                        "gateway session invalidated, reconnecting"
                    );
                    delay
                }
                Err(e) => {
                    if e.ends_session() {
                        self.forget_session();
                    }
                    tracing::error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "gateway connection error, reconnecting..."
                    );
                    let delay = backoff;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    delay
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shutdown.cancel();
        tracing::info!("gateway client stopped");
    }

    fn forget_session(&mut self) {
        self.session = None;
        self.sequence = None;
    }

    /// Run one connection until it fails. `Ok` means the client should stop.
    async fn connect_once(&mut self) -> Result<(), GatewayError> {
        let url = match &self.session {
            Some(session) => format!(
                "{}/?v=10&encoding=json",
                session.resume_url.trim_end_matches('/')
            ),
            None => self.config.url.clone(),
        };

        let (socket, _) = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            connected = connect_async(url.as_str()) => connected?,
        };
        let (mut sink, mut stream) = socket.split();

        let hello = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            hello = tokio::time::timeout(HELLO_TIMEOUT, next_payload(&mut stream)) => {
                hello.map_err(|_| GatewayError::HelloTimeout(HELLO_TIMEOUT))??
            }
        };
        let hello = match hello {
            Some(payload) if payload.op == OP_HELLO => payload,
            Some(payload) => return Err(GatewayError::UnexpectedOpcode(payload.op)),
            None => return Err(GatewayError::Closed(None)),
        };
        let interval = Duration::from_millis(
            hello
                .d
                .get("heartbeat_interval")
                .and_then(Value::as_u64)
                .unwrap_or(41_250),
        );
        tracing::debug!(heartbeat_ms = interval.as_millis() as u64, "gateway hello");

        let resume = match (&self.session, self.sequence) {
            (Some(session), Some(seq)) => {
                tracing::info!(session_id = %session.id, seq, "resuming gateway session");
                Some(json!({
                    "op": OP_RESUME,
                    "d": {"token": self.config.token, "session_id": session.id, "seq": seq}
                }))
            }
            _ => None,
        };
        let handshake = match resume {
            Some(payload) => payload,
            None => {
                self.forget_session();
                json!({
                    "op": OP_IDENTIFY,
                    "d": {
                        "token": self.config.token,
                        "intents": self.config.intents,
                        "properties": {
                            "os": std::env::consts::OS,
                            "browser": "discord-state",
                            "device": "discord-state"
                        }
                    }
                })
            }
        };
        send_json(&mut sink, &handshake).await?;

        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval / 2, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if awaiting_ack {
                        return Err(GatewayError::HeartbeatTimeout);
                    }
                    send_json(&mut sink, &json!({"op": OP_HEARTBEAT, "d": self.sequence})).await?;
                    awaiting_ack = true;
                }
                Some(request) = self.commands.recv() => {
                    tracing::debug!(
                        guild_id = %request.guild_id,
                        user_ids = request.user_ids.len(),
                        "requesting guild members"
                    );
                    let command = json!({"op": OP_REQUEST_GUILD_MEMBERS, "d": request});
                    send_json(&mut sink, &command).await?;
                }
                payload = next_payload(&mut stream) => {
                    let Some(payload) = payload? else {
                        return Err(GatewayError::Closed(None));
                    };
                    match payload.op {
                        OP_DISPATCH => {
                            if let Some(seq) = payload.s {
                                self.sequence = Some(seq);
                            }
                            if !self.dispatch(payload.t.as_deref(), payload.d) {
                                tracing::info!("gateway event receiver dropped");
                                return Ok(());
                            }
                        }
                        OP_HEARTBEAT => {
                            let beat = json!({"op": OP_HEARTBEAT, "d": self.sequence});
                            send_json(&mut sink, &beat).await?;
                        }
                        OP_HEARTBEAT_ACK => awaiting_ack = false,
                        OP_RECONNECT => return Err(GatewayError::Reconnect),
                        OP_INVALID_SESSION => {
                            if !payload.d.as_bool().unwrap_or(false) {
                                self.forget_session();
                            }
                            return Err(GatewayError::InvalidSession);
                        }
                        op => tracing::trace!(op, "ignoring gateway opcode"),
                    }
                }
            }
        }
    }

    /// Handle one dispatch. Returns `false` when nobody listens for events any more.
    ///
    /// Never waits on the event channel, so a slow listener cannot delay heartbeats.
    fn dispatch(&mut self, event_type: Option<&str>, data: Value) -> bool {
        let Some(event_type) = event_type else {
            return true;
        };

        match event_type {
            "READY" => match serde_json::from_value::<Ready>(data) {
                Ok(ready) => {
                    tracing::info!(session_id = %ready.session_id, "gateway session ready");
                    self.session = Some(Session {
                        id: ready.session_id,
                        resume_url: ready.resume_gateway_url,
                    });
                    self.established = true;
                }
                Err(e) => tracing::warn!(error = %e, "failed to parse READY payload"),
            },
            "RESUMED" => {
                tracing::info!("gateway session resumed");
                self.established = true;
            }
            _ => match GatewayEvent::from_dispatch(event_type, data) {
                Ok(events) => {
                    for event in events {
                        match self.events.try_send(event) {
                            Ok(()) => {}
                            Err(TrySendError::Full(event)) => {
                                tracing::warn!(
                                    event = event.name(),
                                    guild_id = %event.guild_id(),
                                    "gateway event buffer full, dropping event"
                                );
                                crate::metrics::record_dropped_event(event.name());
                            }
                            Err(TrySendError::Closed(_)) => return false,
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        event = %event_type,
                        error = %e,
                        "failed to parse gateway dispatch"
                    );
                }
            },
        }
        true
    }
}

/// Discord asks for a random 1 to 5 second pause before identifying again after an
/// invalid session.
fn invalid_session_delay() -> Duration {
    Duration::from_millis(fastrand::u64(1_000..=5_000))
}

async fn next_payload<S>(stream: &mut S) -> Result<Option<GatewayPayload>, GatewayError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message? {
            Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
            Message::Close(frame) => {
                return Err(GatewayError::from_close_code(
                    frame.map(|f| u16::from(f.code)),
                ));
            }
            _ => {}
        }
    }
    Ok(None)
}

async fn send_json<S>(sink: &mut S, payload: &Value) -> Result<(), GatewayError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(payload.to_string())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_close_codes() {
        assert!(matches!(GatewayError::from_close_code(Some(4004)), GatewayError::Fatal(4004)));
        assert!(matches!(GatewayError::from_close_code(Some(4014)), GatewayError::Fatal(4014)));
        assert!(matches!(
            GatewayError::from_close_code(Some(4000)),
            GatewayError::Closed(Some(4000))
        ));
        assert!(GatewayError::from_close_code(Some(4009)).ends_session());
        assert!(!GatewayError::from_close_code(None).ends_session());
    }

    #[test]
    fn invalid_session_pause_is_jittered_within_bounds() {
        for _ in 0..100 {
            let delay = invalid_session_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn member_requests_are_chunked() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let handle = GatewayHandle {
            commands,
            shutdown: CancellationToken::new(),
        };
        let ids: Vec<Snowflake> = (0..250).map(|i| i.to_string()).collect();
        let options = MemberRequestOptions {
            nonce: Some("n".into()),
            ..Default::default()
        };

        handle.request_guild_members("1", &ids, &options).unwrap();

        let sizes: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| {
                assert_eq!(r.nonce.as_deref(), Some("n"));
                r.user_ids.len()
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn closed_handle_reports_gateway_closed() {
        let (commands, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = GatewayHandle {
            commands,
            shutdown: CancellationToken::new(),
        };
        assert!(handle.is_closed());
        assert_eq!(
            handle.request_guild_members("1", &["2".into()], &MemberRequestOptions::default()),
            Err(RemoteError::GatewayClosed)
        );
    }

    #[test]
    fn request_payload_omits_missing_nonce() {
        let request = MemberChunkRequest {
            guild_id: "1".into(),
            user_ids: vec!["2".into()],
            limit: 0,
            presences: false,
            nonce: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"guild_id": "1", "user_ids": ["2"], "limit": 0, "presences": false})
        );
    }
}
