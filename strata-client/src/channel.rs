//! Push channel connection state.
//!
//! Everything here is synchronous. The socket loop in [`crate::realtime`]
//! feeds transport events in and sends whatever messages come back out.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use strata_cache::{PushMessage, SubscriptionPayload, TokenPayload};

use crate::config::ReconnectConfig;

/// Policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;

/// Close codes after which reconnecting with the same credentials is pointless.
pub fn is_auth_failure(code: u16) -> bool {
    matches!(code, CLOSE_UNAUTHORIZED | CLOSE_FORBIDDEN | CLOSE_POLICY_VIOLATION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until the session starts the channel again.
    Error,
}

/// What to do after a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseDecision {
    Reconnect { attempt: u32, delay: Duration },
    AuthFailed { code: u16 },
    GiveUp { attempts: u32 },
    /// No token is held, so there is nothing to reconnect with.
    Idle,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts: 10,
        }
    }
}

impl From<&ReconnectConfig> for BackoffPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_ms: config.initial_ms,
            max_ms: config.max_ms,
            multiplier: config.multiplier,
            jitter_ms: config.jitter_ms,
            max_attempts: config.max_attempts,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_ms as f64 * self.multiplier.powi(exponent);
        if delay >= self.max_ms as f64 {
            self.max_ms
        } else {
            delay as u64
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(jittered_backoff(self.base_delay_ms(attempt), self.jitter_ms))
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}

#[derive(Debug)]
pub struct ChannelState {
    state: ConnectionState,
    policy: BackoffPolicy,
    attempts: u32,
    token: Option<String>,
    /// Every subscription the session wants, by entity code.
    wanted: BTreeMap<String, BTreeSet<String>>,
    /// Subscriptions sent on the current connection.
    sent: BTreeMap<String, BTreeSet<String>>,
    awaiting_pong: bool,
}

impl ChannelState {
    pub fn new(policy: BackoffPolicy, token: Option<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts: 0,
            token,
            wanted: BTreeMap::new(),
            sent: BTreeMap::new(),
            awaiting_pong: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// The socket opened. Returns the subscriptions to send now: those
    /// queued while disconnected and those a previous connection held.
    pub fn on_open(&mut self) -> Vec<PushMessage> {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.awaiting_pong = false;
        self.sent = self.wanted.clone();
        self.wanted
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(code, ids)| {
                PushMessage::Subscribe(SubscriptionPayload {
                    entity_code: code.clone(),
                    entity_ids: ids.iter().cloned().collect(),
                })
            })
            .collect()
    }

    /// The socket closed, or a connect attempt failed (`code` is `None`
    /// when no close frame arrived).
    pub fn on_close(&mut self, code: Option<u16>) -> CloseDecision {
        self.sent.clear();
        self.awaiting_pong = false;

        if let Some(code) = code.filter(|c| is_auth_failure(*c)) {
            self.state = ConnectionState::Error;
            return CloseDecision::AuthFailed { code };
        }
        if self.token.is_none() {
            self.state = ConnectionState::Disconnected;
            return CloseDecision::Idle;
        }
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Error;
            return CloseDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        self.state = ConnectionState::Disconnected;
        self.attempts += 1;
        CloseDecision::Reconnect {
            attempt: self.attempts,
            delay: self.policy.delay(self.attempts),
        }
    }

    /// Record interest in `ids`. Returns the message to send, if the
    /// channel is connected and any id is new.
    pub fn subscribe(&mut self, entity_code: &str, ids: &[String]) -> Option<PushMessage> {
        let wanted = self.wanted.entry(entity_code.to_string()).or_default();
        let fresh: Vec<String> = ids
            .iter()
            .filter(|id| wanted.insert((*id).clone()))
            .cloned()
            .collect();
        if fresh.is_empty() || !self.is_connected() {
            return None;
        }
        self.sent
            .entry(entity_code.to_string())
            .or_default()
            .extend(fresh.iter().cloned());
        Some(PushMessage::Subscribe(SubscriptionPayload {
            entity_code: entity_code.to_string(),
            entity_ids: fresh,
        }))
    }

    pub fn unsubscribe(&mut self, entity_code: &str, ids: &[String]) -> Option<PushMessage> {
        let Some(wanted) = self.wanted.get_mut(entity_code) else {
            return None;
        };
        let removed: Vec<String> = ids.iter().filter(|id| wanted.remove(*id)).cloned().collect();
        if wanted.is_empty() {
            self.wanted.remove(entity_code);
        }

        let sent = self.sent.get_mut(entity_code);
        let was_sent: Vec<String> = match sent {
            Some(sent) => removed.into_iter().filter(|id| sent.remove(id)).collect(),
            None => Vec::new(),
        };
        if was_sent.is_empty() || !self.is_connected() {
            return None;
        }
        Some(PushMessage::Unsubscribe(SubscriptionPayload {
            entity_code: entity_code.to_string(),
            entity_ids: was_sent,
        }))
    }

    /// Ids wanted but not yet sent on the current connection.
    pub fn queued(&self) -> usize {
        self.wanted
            .iter()
            .map(|(code, ids)| {
                let sent = self.sent.get(code);
                ids.iter()
                    .filter(|id| !sent.is_some_and(|s| s.contains(*id)))
                    .count()
            })
            .sum()
    }

    /// Swap the held token. Returns `TOKEN_REFRESH` when connected and the
    /// token actually changed.
    pub fn set_token(&mut self, token: Option<String>) -> Option<PushMessage> {
        if self.token == token {
            return None;
        }
        self.token = token;
        match (&self.token, self.is_connected()) {
            (Some(token), true) => Some(PushMessage::TokenRefresh(TokenPayload {
                token: token.clone(),
            })),
            _ => None,
        }
    }

    /// A heartbeat tick. Returns true when the previous `PING` was never
    /// answered, in which case the connection is dead and must be closed.
    pub fn on_heartbeat(&mut self) -> bool {
        let missed = self.awaiting_pong;
        self.awaiting_pong = true;
        missed
    }

    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn state() -> ChannelState {
        ChannelState::new(BackoffPolicy::default(), Some("token".to_string()))
    }

    #[test]
    fn test_state_transitions() {
        let mut channel = state();
        assert_eq!(channel.state(), ConnectionState::Disconnected);

        channel.begin_connect();
        assert_eq!(channel.state(), ConnectionState::Connecting);

        channel.on_open();
        assert_eq!(channel.state(), ConnectionState::Connected);

        assert!(matches!(
            channel.on_close(Some(1006)),
            CloseDecision::Reconnect { attempt: 1, .. }
        ));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_auth_close_codes_stop_reconnect() {
        for code in [CLOSE_UNAUTHORIZED, CLOSE_FORBIDDEN, CLOSE_POLICY_VIOLATION] {
            let mut channel = state();
            channel.begin_connect();
            channel.on_open();
            assert_eq!(channel.on_close(Some(code)), CloseDecision::AuthFailed { code });
            assert_eq!(channel.state(), ConnectionState::Error);
        }
    }

    #[test]
    fn test_no_token_means_no_reconnect() {
        let mut channel = ChannelState::new(BackoffPolicy::default(), None);
        channel.begin_connect();
        assert_eq!(channel.on_close(None), CloseDecision::Idle);
    }

    #[test]
    fn test_backoff_doubles_caps_and_gives_up() {
        let mut channel = state();
        let mut delays = Vec::new();
        for _ in 0..10 {
            channel.begin_connect();
            match channel.on_close(None) {
                CloseDecision::Reconnect { delay, .. } => delays.push(delay.as_millis() as u64),
                other => panic!("unexpected decision {:?}", other),
            }
        }
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(channel.on_close(None), CloseDecision::GiveUp { attempts: 10 });
        assert_eq!(channel.state(), ConnectionState::Error);
    }

    #[test]
    fn test_open_resets_attempts() {
        let mut channel = state();
        channel.on_close(None);
        channel.on_close(None);
        assert_eq!(channel.attempts(), 2);

        channel.on_open();
        assert_eq!(channel.attempts(), 0);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = BackoffPolicy {
            jitter_ms: 250,
            ..BackoffPolicy::default()
        };
        let delay = policy.delay(1).as_millis() as u64;
        assert!((1_000..1_250).contains(&delay));
    }

    #[test]
    fn test_subscriptions_queue_while_disconnected_then_flush() {
        let mut channel = state();
        assert_eq!(channel.subscribe("task", &ids(&["t1", "t2"])), None);
        assert_eq!(channel.subscribe("project", &ids(&["P1"])), None);
        assert_eq!(channel.queued(), 3);

        let flushed = channel.on_open();
        assert_eq!(flushed.len(), 2);
        assert!(flushed.contains(&PushMessage::Subscribe(SubscriptionPayload {
            entity_code: "task".to_string(),
            entity_ids: ids(&["t1", "t2"]),
        })));
        assert_eq!(channel.queued(), 0);
    }

    #[test]
    fn test_subscribe_deduplicates_against_active_set() {
        let mut channel = state();
        channel.on_open();

        let first = channel.subscribe("task", &ids(&["t1", "t2"]));
        assert!(first.is_some());
        assert_eq!(channel.subscribe("task", &ids(&["t1", "t2"])), None);
        assert_eq!(
            channel.subscribe("task", &ids(&["t2", "t3"])),
            Some(PushMessage::Subscribe(SubscriptionPayload {
                entity_code: "task".to_string(),
                entity_ids: ids(&["t3"]),
            }))
        );
    }

    #[test]
    fn test_reconnect_resubscribes_everything() {
        let mut channel = state();
        channel.on_open();
        channel.subscribe("task", &ids(&["t1"]));
        channel.on_close(Some(1006));
        assert_eq!(channel.queued(), 1);

        let flushed = channel.on_open();
        assert_eq!(flushed.len(), 1);
    }

    #[test]
    fn test_unsubscribe_only_sends_what_was_sent() {
        let mut channel = state();
        channel.subscribe("task", &ids(&["t1"]));
        assert_eq!(channel.unsubscribe("task", &ids(&["t1"])), None);
        assert!(channel.on_open().is_empty());

        channel.subscribe("task", &ids(&["t2"]));
        assert_eq!(
            channel.unsubscribe("task", &ids(&["t2", "t9"])),
            Some(PushMessage::Unsubscribe(SubscriptionPayload {
                entity_code: "task".to_string(),
                entity_ids: ids(&["t2"]),
            }))
        );
        assert_eq!(channel.unsubscribe("project", &ids(&["P1"])), None);
    }

    #[test]
    fn test_token_refresh_only_when_changed_and_connected() {
        let mut channel = state();
        assert_eq!(channel.set_token(Some("next".to_string())), None);

        channel.on_open();
        assert_eq!(channel.set_token(Some("next".to_string())), None);
        assert_eq!(
            channel.set_token(Some("third".to_string())),
            Some(PushMessage::TokenRefresh(TokenPayload {
                token: "third".to_string(),
            }))
        );
        assert_eq!(channel.set_token(None), None);
        assert_eq!(channel.token(), None);
    }

    #[test]
    fn test_missed_pong_detected_on_next_tick() {
        let mut channel = state();
        channel.on_open();
        assert!(!channel.on_heartbeat());
        channel.on_pong();
        assert!(!channel.on_heartbeat());
        assert!(channel.on_heartbeat());
    }

    #[test]
    fn test_dead_connection_reconnects_and_resets_heartbeat() {
        let mut channel = state();
        channel.on_open();
        channel.on_heartbeat();
        assert!(channel.on_heartbeat());

        assert!(matches!(
            channel.on_close(None),
            CloseDecision::Reconnect { attempt: 1, .. }
        ));
        channel.begin_connect();
        channel.on_open();
        assert!(!channel.on_heartbeat());
    }
}
