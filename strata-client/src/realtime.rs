//! WebSocket push channel with heartbeat and reconnect backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use strata_cache::{CacheManager, PushMessage};
use strata_core::Timestamp;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::api_client::ApiClientError;
use crate::channel::{
    BackoffPolicy, ChannelState, CloseDecision, ConnectionState, CLOSE_FORBIDDEN,
    CLOSE_UNAUTHORIZED,
};
use crate::config::{AuthConfig, ClientConfig};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Channel lifecycle events surfaced to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { code: Option<u16> },
    Reconnecting { attempt: u32, delay: Duration },
    /// The server rejected the credentials. No reconnect follows.
    AuthFailed { code: u16 },
    GaveUp { attempts: u32 },
    TokenExpiringSoon { expires_at: Option<Timestamp> },
    /// A data message was folded into the cache.
    Applied {
        message_type: &'static str,
        applied: usize,
        dropped: usize,
        refetch: usize,
    },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Subscribe { entity_code: String, ids: Vec<String> },
    Unsubscribe { entity_code: String, ids: Vec<String> },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: String,
    pub auth: AuthConfig,
    pub heartbeat: Duration,
    pub backoff: BackoffPolicy,
}

impl ChannelConfig {
    pub fn from_client(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.ws_endpoint.clone(),
            auth: config.auth.clone(),
            heartbeat: config.heartbeat_interval(),
            backoff: BackoffPolicy::from(&config.reconnect),
        }
    }

    fn token(&self) -> Option<String> {
        self.auth.jwt.clone().or_else(|| self.auth.api_key.clone())
    }
}

/// Handle to a running channel task.
pub struct ChannelHandle {
    commands: mpsc::Sender<ChannelCommand>,
    token: watch::Sender<Option<String>>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub async fn subscribe(&self, entity_code: &str, ids: Vec<String>) -> bool {
        self.send(ChannelCommand::Subscribe {
            entity_code: entity_code.to_string(),
            ids,
        })
        .await
    }

    pub async fn unsubscribe(&self, entity_code: &str, ids: Vec<String>) -> bool {
        self.send(ChannelCommand::Unsubscribe {
            entity_code: entity_code.to_string(),
            ids,
        })
        .await
    }

    /// Hand the channel a new token. A connected channel announces it with
    /// `TOKEN_REFRESH`; `None` stops reconnects after the next drop.
    pub fn refresh_token(&self, token: Option<String>) {
        self.token.send_replace(token);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(ChannelCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Push channel task failed");
        }
    }

    /// Wait for the task to end on its own.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Push channel task failed");
        }
    }

    async fn send(&self, command: ChannelCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }
}

pub struct PushChannel {
    config: ChannelConfig,
    cache: Arc<CacheManager>,
}

enum ConnectionEnd {
    Closed(Option<u16>),
    Shutdown,
}

impl PushChannel {
    pub fn new(config: ChannelConfig, cache: Arc<CacheManager>) -> Self {
        Self { config, cache }
    }

    pub fn spawn(self, events: mpsc::Sender<ChannelEvent>) -> ChannelHandle {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (token_tx, token_rx) = watch::channel(self.config.token());
        let task = tokio::spawn(self.run(command_rx, token_rx, events));
        ChannelHandle {
            commands: command_tx,
            token: token_tx,
            task,
        }
    }

    async fn run(
        self,
        mut commands: mpsc::Receiver<ChannelCommand>,
        mut token: watch::Receiver<Option<String>>,
        events: mpsc::Sender<ChannelEvent>,
    ) {
        let initial = token.borrow_and_update().clone();
        let mut state = ChannelState::new(self.config.backoff.clone(), initial);

        loop {
            state.begin_connect();
            let connected = self.connect(state.token()).await;
            let end = match connected {
                Ok(stream) => {
                    info!(endpoint = %self.config.endpoint, "Push channel connected");
                    let _ = events.send(ChannelEvent::Connected).await;
                    self.run_connection(stream, &mut state, &mut commands, &mut token, &events)
                        .await
                }
                Err(e) => {
                    warn!(endpoint = %self.config.endpoint, error = %e, "Push channel connect failed");
                    ConnectionEnd::Closed(handshake_close_code(&e))
                }
            };

            let code = match end {
                ConnectionEnd::Shutdown => break,
                ConnectionEnd::Closed(code) => code,
            };
            if state.state() == ConnectionState::Connected {
                let _ = events.send(ChannelEvent::Disconnected { code }).await;
            }

            match state.on_close(code) {
                CloseDecision::Reconnect { attempt, delay } => {
                    info!(attempt, delay_ms = delay.as_millis() as u64, "Push channel reconnecting");
                    let _ = events.send(ChannelEvent::Reconnecting { attempt, delay }).await;
                    if !wait_for_retry(delay, &mut state, &mut commands, &mut token).await {
                        break;
                    }
                }
                CloseDecision::AuthFailed { code } => {
                    error!(code, "Push channel rejected credentials");
                    let _ = events.send(ChannelEvent::AuthFailed { code }).await;
                    return;
                }
                CloseDecision::GiveUp { attempts } => {
                    error!(attempts, "Push channel gave up reconnecting");
                    let _ = events.send(ChannelEvent::GaveUp { attempts }).await;
                    return;
                }
                CloseDecision::Idle => {
                    info!("Push channel idle: no token held");
                    break;
                }
            }
        }
        let _ = events.send(ChannelEvent::Stopped).await;
    }

    async fn connect(&self, token: Option<&str>) -> Result<WsStream, ApiClientError> {
        let mut request = self.config.endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(api_key) = &self.config.auth.api_key {
            headers.insert(
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_str(api_key).map_err(|e| ApiClientError::Config(e.to_string()))?,
            );
        }
        if let (Some(_), Some(token)) = (&self.config.auth.jwt, token) {
            let value = format!("Bearer {}", token);
            headers.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&value).map_err(|e| ApiClientError::Config(e.to_string()))?,
            );
        }
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(stream)
    }

    async fn run_connection(
        &self,
        stream: WsStream,
        state: &mut ChannelState,
        commands: &mut mpsc::Receiver<ChannelCommand>,
        token: &mut watch::Receiver<Option<String>>,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> ConnectionEnd {
        let (mut sink, mut source) = stream.split();

        for message in state.on_open() {
            if let Err(e) = send_message(&mut sink, &message).await {
                warn!(error = %e, "Failed to flush subscription");
                return ConnectionEnd::Closed(None);
            }
        }

        let period = self.config.heartbeat;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut token_open = true;

        loop {
            let outgoing = tokio::select! {
                _ = heartbeat.tick() => {
                    if state.on_heartbeat() {
                        warn!("PONG not received before next heartbeat, dropping connection");
                        return ConnectionEnd::Closed(None);
                    }
                    Some(PushMessage::Ping)
                }
                command = commands.recv() => match command {
                    Some(ChannelCommand::Subscribe { entity_code, ids }) => {
                        state.subscribe(&entity_code, &ids)
                    }
                    Some(ChannelCommand::Unsubscribe { entity_code, ids }) => {
                        state.unsubscribe(&entity_code, &ids)
                    }
                    Some(ChannelCommand::Shutdown) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return ConnectionEnd::Shutdown;
                    }
                },
                changed = token.changed(), if token_open => match changed {
                    Ok(()) => {
                        let next = token.borrow_and_update().clone();
                        state.set_token(next)
                    }
                    Err(_) => {
                        token_open = false;
                        None
                    }
                },
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.on_text(&text, state, events).await,
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        debug!(?code, "Push channel closed by server");
                        return ConnectionEnd::Closed(code);
                    }
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        warn!(error = %e, "Push channel read failed");
                        return ConnectionEnd::Closed(None);
                    }
                    None => return ConnectionEnd::Closed(None),
                },
            };

            if let Some(message) = outgoing {
                if let Err(e) = send_message(&mut sink, &message).await {
                    warn!(error = %e, message_type = message.message_type(), "Push channel write failed");
                    return ConnectionEnd::Closed(None);
                }
            }
        }
    }

    /// Handle one text frame. Returns a reply to send, if any.
    async fn on_text(
        &self,
        text: &str,
        state: &mut ChannelState,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> Option<PushMessage> {
        let message = match serde_json::from_str::<PushMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Undecodable push message");
                return None;
            }
        };

        match &message {
            PushMessage::Ping => return Some(PushMessage::Pong),
            PushMessage::Pong => state.on_pong(),
            PushMessage::TokenExpiringSoon(payload) => {
                info!("Push channel token expiring soon");
                let _ = events
                    .send(ChannelEvent::TokenExpiringSoon {
                        expires_at: payload.expires_at,
                    })
                    .await;
            }
            _ if message.is_invalidation() => match self.cache.apply_push(&message) {
                Ok(outcome) => {
                    let _ = events
                        .send(ChannelEvent::Applied {
                            message_type: message.message_type(),
                            applied: outcome.applied,
                            dropped: outcome.dropped,
                            refetch: outcome.refetch.len(),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(message_type = message.message_type(), error = %e, "Push message not applied");
                }
            },
            other => debug!(message_type = other.message_type(), "Ignoring control message"),
        }
        None
    }
}

async fn send_message<S>(sink: &mut S, message: &PushMessage) -> Result<(), ApiClientError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|e| ApiClientError::InvalidResponse {
        endpoint: "push-channel".to_string(),
        reason: e.to_string(),
    })?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

/// Sleep out a reconnect delay while still accepting commands. Returns
/// false when the channel was shut down meanwhile.
async fn wait_for_retry(
    delay: Duration,
    state: &mut ChannelState,
    commands: &mut mpsc::Receiver<ChannelCommand>,
    token: &mut watch::Receiver<Option<String>>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    let mut token_open = true;
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = commands.recv() => match command {
                Some(ChannelCommand::Subscribe { entity_code, ids }) => {
                    state.subscribe(&entity_code, &ids);
                }
                Some(ChannelCommand::Unsubscribe { entity_code, ids }) => {
                    state.unsubscribe(&entity_code, &ids);
                }
                Some(ChannelCommand::Shutdown) | None => return false,
            },
            changed = token.changed(), if token_open => match changed {
                Ok(()) => {
                    let next = token.borrow_and_update().clone();
                    state.set_token(next);
                }
                Err(_) => token_open = false,
            },
        }
    }
}

/// Map a rejected handshake to the equivalent close code.
fn handshake_close_code(err: &ApiClientError) -> Option<u16> {
    use tokio_tungstenite::tungstenite::Error;

    let ApiClientError::WebSocket(inner) = err else {
        return None;
    };
    match inner.as_ref() {
        Error::Http(response) => match response.status().as_u16() {
            401 => Some(CLOSE_UNAUTHORIZED),
            403 => Some(CLOSE_FORBIDDEN),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_prefers_jwt() {
        let mut config = ChannelConfig {
            endpoint: "ws://localhost/ws".to_string(),
            auth: AuthConfig {
                api_key: Some("key".to_string()),
                jwt: Some("jwt".to_string()),
            },
            heartbeat: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        };
        assert_eq!(config.token(), Some("jwt".to_string()));

        config.auth.jwt = None;
        assert_eq!(config.token(), Some("key".to_string()));
    }

    #[test]
    fn test_non_websocket_errors_have_no_close_code() {
        let err = ApiClientError::Config("bad header".to_string());
        assert_eq!(handshake_close_code(&err), None);
    }
}
