use crate::domain::{IngestResult, normalize_frame, parse_frame};
use crate::session::{SessionToken, SessionWatch};
use crate::store::SharedStore;
use futures_util::{SinkExt as _, StreamExt as _};
use rand_core::OsRng;
use rand_core::RngCore as _;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

mod fixture;

pub use fixture::FixtureSource;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub url: Url,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed connect attempts tolerated before the channel
    /// degrades. Resets whenever a connection is actually established.
    pub max_attempts: u32,
    pub ping_interval: Duration,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
            ping_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Externally observable channel condition, published over a watch channel.
/// `degraded` plus the per-event counters are the only failure signals the
/// channel ever surfaces; everything else self-heals internally.
#[derive(Clone, Debug)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    /// Failed connect attempts in the current retry run.
    pub attempts: u32,
    pub ingested: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            state: ChannelState::Disconnected,
            degraded: false,
            degraded_reason: None,
            attempts: 0,
            ingested: 0,
            duplicates: 0,
            dropped: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    Ws(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

enum CycleEnd {
    /// The session token changed or went away; re-read it and start over.
    SessionChanged,
    /// The session source itself is gone; shut down.
    SourceClosed,
    Degraded(String),
}

enum ConnectionEnd {
    SessionChanged,
    SourceClosed,
    ServerClosed,
}

/// Owns the single push connection aligned with the current session token
/// and translates wire events into store ingests. Runs as one task; the
/// session watch is the only external control surface.
pub struct LiveChannelClient {
    config: ChannelConfig,
    store: SharedStore,
    session_rx: SessionWatch,
    status_tx: watch::Sender<ChannelStatus>,
    state: ChannelState,
    /// Bumped at the start of every connect cycle. Event handling for a
    /// superseded cycle checks this and becomes inert.
    epoch: u64,
    attempts: u32,
    ingested: u64,
    duplicates: u64,
    dropped: u64,
    degraded: bool,
    degraded_reason: Option<String>,
}

impl LiveChannelClient {
    pub fn new(
        config: ChannelConfig,
        store: SharedStore,
        session_rx: SessionWatch,
    ) -> (Self, watch::Receiver<ChannelStatus>) {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::default());
        (
            Self {
                config,
                store,
                session_rx,
                status_tx,
                state: ChannelState::Disconnected,
                epoch: 0,
                attempts: 0,
                ingested: 0,
                duplicates: 0,
                dropped: 0,
                degraded: false,
                degraded_reason: None,
            },
            status_rx,
        )
    }

    /// Drive the connection lifecycle until the session source goes away.
    pub async fn run(mut self) {
        loop {
            let Some(token) = self.wait_for_token().await else {
                return;
            };

            self.epoch += 1;
            let cycle = self.epoch;
            self.degraded = false;
            self.degraded_reason = None;
            self.attempts = 0;

            let mut session_rx = self.session_rx.clone();
            match self.connect_cycle(&token, cycle, &mut session_rx).await {
                CycleEnd::SessionChanged => continue,
                CycleEnd::SourceClosed => {
                    self.set_state(ChannelState::Disconnected);
                    return;
                }
                CycleEnd::Degraded(reason) => {
                    tracing::warn!(reason = %reason, "push channel degraded");
                    self.degraded = true;
                    self.degraded_reason = Some(reason);
                    self.set_state(ChannelState::Disconnected);
                    // Parked until the next session transition re-arms us.
                    if self.session_rx.changed().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn wait_for_token(&mut self) -> Option<SessionToken> {
        loop {
            if let Some(token) = self.session_rx.borrow_and_update().clone() {
                return Some(token);
            }
            self.degraded = false;
            self.degraded_reason = None;
            self.set_state(ChannelState::Disconnected);
            if self.session_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    async fn connect_cycle(
        &mut self,
        token: &SessionToken,
        cycle: u64,
        session_rx: &mut SessionWatch,
    ) -> CycleEnd {
        let mut backoff = self.config.base_delay;
        let mut attempts: u32 = 0;

        loop {
            if session_rx.borrow().as_ref() != Some(token) {
                return CycleEnd::SessionChanged;
            }

            attempts += 1;
            self.attempts = attempts;
            self.set_state(ChannelState::Connecting);

            match self.connect_and_run_once(token, cycle, session_rx).await {
                Ok(ConnectionEnd::SessionChanged) => return CycleEnd::SessionChanged,
                Ok(ConnectionEnd::SourceClosed) => return CycleEnd::SourceClosed,
                Ok(ConnectionEnd::ServerClosed) => {
                    tracing::debug!("push channel closed, reconnecting");
                    backoff = self.config.base_delay;
                    attempts = 0;
                }
                Err(ChannelError::Unauthorized(reason)) => {
                    // The credential is no longer good; retrying would spin.
                    // Whether to log the user out is the session source's
                    // call, not ours.
                    return CycleEnd::Degraded(format!("unauthorized: {reason}"));
                }
                Err(error) => {
                    tracing::warn!(%error, attempt = attempts, "push channel connect failed");
                    if self.state == ChannelState::Connected {
                        // The connection was up before it broke; start the
                        // retry count over.
                        backoff = self.config.base_delay;
                        attempts = 0;
                    }
                }
            }

            if attempts >= self.config.max_attempts {
                return CycleEnd::Degraded(format!("connect attempts exhausted ({attempts})"));
            }

            self.set_state(ChannelState::Reconnecting);
            let delay =
                backoff.saturating_add(Duration::from_millis(jitter_ms(duration_ms(backoff) / 4)));
            tokio::select! {
                biased;
                changed = session_rx.changed() => {
                    // Logout while waiting: the retry timer dies right here.
                    return match changed {
                        Ok(()) => CycleEnd::SessionChanged,
                        Err(_) => CycleEnd::SourceClosed,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = backoff.saturating_mul(2).min(self.config.max_delay);
        }
    }

    async fn connect_and_run_once(
        &mut self,
        token: &SessionToken,
        cycle: u64,
        session_rx: &mut SessionWatch,
    ) -> Result<ConnectionEnd, ChannelError> {
        let url = authenticated_url(&self.config.url, token);
        let connect = tokio_tungstenite::connect_async(url.as_str().to_string());
        tokio::pin!(connect);

        let (mut ws, _response) = tokio::select! {
            biased;
            changed = session_rx.changed() => {
                // The in-flight handshake future is dropped here; it can
                // never reach ingest.
                return Ok(match changed {
                    Ok(()) => ConnectionEnd::SessionChanged,
                    Err(_) => ConnectionEnd::SourceClosed,
                });
            }
            result = &mut connect => result.map_err(map_connect_error)?,
        };

        self.set_state(ChannelState::Connected);
        tracing::debug!(url = %self.config.url, "push channel connected");

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = session_rx.changed() => {
                    // Synchronous teardown: the socket is closed before this
                    // returns, so a later login can never race a stale
                    // connection's events.
                    let _ = ws.send(Message::Close(None)).await;
                    return Ok(match changed {
                        Ok(()) => ConnectionEnd::SessionChanged,
                        Err(_) => ConnectionEnd::SourceClosed,
                    });
                }
                _ = ping_interval.tick() => {
                    ws.send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(|error| ChannelError::Ws(error.to_string()))?;
                }
                msg = ws.next() => {
                    let Some(msg) = msg else {
                        return Ok(ConnectionEnd::ServerClosed);
                    };
                    let msg = msg.map_err(|error| ChannelError::Ws(error.to_string()))?;
                    match msg {
                        Message::Text(text) => self.handle_text(text.as_str(), cycle),
                        Message::Ping(bytes) => {
                            ws.send(Message::Pong(bytes))
                                .await
                                .map_err(|error| ChannelError::Ws(error.to_string()))?;
                        }
                        Message::Close(_) => return Ok(ConnectionEnd::ServerClosed),
                        _ => {}
                    }
                }
            }
        }
    }

    /// One inbound text frame: parse, normalize, ingest. Malformed or
    /// unrecognized input is dropped and counted, never an error.
    fn handle_text(&mut self, text: &str, cycle: u64) {
        if cycle != self.epoch {
            return;
        }

        let Some(frame) = parse_frame(text) else {
            self.dropped += 1;
            tracing::warn!(total = self.dropped, "dropped malformed push frame");
            self.publish_status();
            return;
        };
        let Some(input) = normalize_frame(frame) else {
            self.dropped += 1;
            tracing::warn!(total = self.dropped, "dropped unrecognized push event");
            self.publish_status();
            return;
        };

        tracing::debug!(kind = input.kind.label(), "push event received");
        match self.store.ingest(input) {
            IngestResult::Inserted => self.ingested += 1,
            IngestResult::DuplicateIgnored => self.duplicates += 1,
        }
        self.publish_status();
    }

    fn set_state(&mut self, state: ChannelState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send_replace(ChannelStatus {
            state: self.state,
            degraded: self.degraded,
            degraded_reason: self.degraded_reason.clone(),
            attempts: self.attempts,
            ingested: self.ingested,
            duplicates: self.duplicates,
            dropped: self.dropped,
        });
    }
}

/// The token is presented as the authentication credential at handshake
/// time, carried in the websocket URL's query string.
fn authenticated_url(base: &Url, token: &SessionToken) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("token", token.as_str());
    url
}

fn map_connect_error(error: tungstenite::Error) -> ChannelError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == tungstenite::http::StatusCode::UNAUTHORIZED
                || status == tungstenite::http::StatusCode::FORBIDDEN
            {
                ChannelError::Unauthorized(status.to_string())
            } else {
                ChannelError::Connect(format!("unexpected status {status}"))
            }
        }
        other => ChannelError::Connect(other.to_string()),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut rng = OsRng;
    let mut buf = [0u8; 8];
    rng.fill_bytes(&mut buf);
    let n = u64::from_le_bytes(buf);
    n % (max_ms + 1)
}
