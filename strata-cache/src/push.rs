//! Push channel message model.
//!
//! Messages are JSON objects `{ "type": ..., "payload": ... }`. Control
//! messages without data (`PING`, `PONG`) omit the payload.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_core::{EntityLink, EntityRef, Timestamp, DEFAULT_RELATIONSHIP};

fn default_relationship() -> String {
    DEFAULT_RELATIONSHIP.to_string()
}

/// Kind of change reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

/// One message on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushMessage {
    /// Versioned changes to instances of one code.
    Invalidate(InvalidatePayload),
    /// Table-level change notification.
    NormalizedInvalidate(NormalizedPayload),
    /// One edge inserted or deleted.
    LinkChange(LinkChangePayload),
    Subscribe(SubscriptionPayload),
    Unsubscribe(SubscriptionPayload),
    Ping,
    Pong,
    TokenRefresh(TokenPayload),
    TokenExpiringSoon(TokenExpiryPayload),
}

impl PushMessage {
    /// Wire name of the message type, for logs.
    pub fn message_type(&self) -> &'static str {
        match self {
            PushMessage::Invalidate(_) => "INVALIDATE",
            PushMessage::NormalizedInvalidate(_) => "NORMALIZED_INVALIDATE",
            PushMessage::LinkChange(_) => "LINK_CHANGE",
            PushMessage::Subscribe(_) => "SUBSCRIBE",
            PushMessage::Unsubscribe(_) => "UNSUBSCRIBE",
            PushMessage::Ping => "PING",
            PushMessage::Pong => "PONG",
            PushMessage::TokenRefresh(_) => "TOKEN_REFRESH",
            PushMessage::TokenExpiringSoon(_) => "TOKEN_EXPIRING_SOON",
        }
    }

    /// True for messages that change cached data.
    pub fn is_invalidation(&self) -> bool {
        matches!(
            self,
            PushMessage::Invalidate(_)
                | PushMessage::NormalizedInvalidate(_)
                | PushMessage::LinkChange(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidatePayload {
    pub entity_code: String,
    pub changes: Vec<EntityChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    pub entity_id: String,
    pub action: ChangeAction,
    pub version: u64,
    /// Full instance payload, when the server embeds it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Table-level notification. Columns beyond the common ones stay in
/// `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPayload {
    pub table: String,
    pub action: ChangeAction,
    #[serde(default)]
    pub entity_code: Option<String>,
    #[serde(default)]
    pub entity_instance_id: Option<String>,
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

impl NormalizedPayload {
    pub fn entity(&self) -> Option<EntityRef> {
        match (&self.entity_code, &self.entity_instance_id) {
            (Some(code), Some(id)) => Some(EntityRef::new(code, id)),
            _ => None,
        }
    }

    pub fn column_str(&self, name: &str) -> Option<&str> {
        self.columns.get(name).and_then(Value::as_str)
    }

    /// The edge described by a link-table row, when every column is there.
    pub fn as_link(&self) -> Option<EntityLink> {
        let parent = self.entity()?;
        let child_code = self.column_str("child_entity_code")?;
        let child_id = self.column_str("child_entity_instance_id")?;
        let relationship = self
            .column_str("relationship_type")
            .unwrap_or(DEFAULT_RELATIONSHIP);
        Some(
            EntityLink::new(parent.entity_code, parent.entity_id, child_code, child_id)
                .with_relationship(relationship),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkChangePayload {
    pub action: ChangeAction,
    pub entity_code: String,
    pub entity_instance_id: String,
    pub child_entity_code: String,
    pub child_entity_instance_id: String,
    #[serde(default = "default_relationship")]
    pub relationship_type: String,
}

impl LinkChangePayload {
    pub fn link(&self) -> EntityLink {
        EntityLink::new(
            &self.entity_code,
            &self.entity_instance_id,
            &self.child_entity_code,
            &self.child_entity_instance_id,
        )
        .with_relationship(&self.relationship_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    pub entity_code: String,
    pub entity_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenExpiryPayload {
    #[serde(default)]
    pub expires_at: Option<Timestamp>,
}

// ============================================================================
// VERSION ORDERING
// ============================================================================

/// Entities tracked before the least recently changed one is forgotten.
pub const DEFAULT_VERSION_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy)]
struct Seen {
    version: u64,
    touched: u64,
}

/// Last seen version per instance.
///
/// A change is admitted only when its version is strictly greater than the
/// last one seen for that instance, so out-of-order delivery can never roll
/// state backward. Deletes are terminal and always admitted, and keep the
/// version they closed so a late insert cannot resurrect the instance.
///
/// At most `capacity` instances are tracked; past that the one changed
/// least recently is forgotten and its next change is admitted as new.
#[derive(Debug, Clone)]
pub struct VersionTracker {
    last_seen: HashMap<EntityRef, Seen>,
    order: BTreeMap<u64, EntityRef>,
    clock: u64,
    capacity: usize,
}

impl Default for VersionTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_VERSION_CAPACITY)
    }
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            last_seen: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    /// Decide whether a change applies, recording its version when it does.
    pub fn admit(&mut self, entity: &EntityRef, action: ChangeAction, version: u64) -> bool {
        let last = self.last_seen.get(entity).copied();
        let admitted = action == ChangeAction::Delete
            || last.map_or(true, |seen| version > seen.version);
        if !admitted {
            return false;
        }

        if let Some(seen) = last {
            self.order.remove(&seen.touched);
        }
        self.clock += 1;
        let next = Seen {
            version: last.map_or(version, |seen| seen.version.max(version)),
            touched: self.clock,
        };
        self.last_seen.insert(entity.clone(), next);
        self.order.insert(self.clock, entity.clone());

        while self.last_seen.len() > self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.last_seen.remove(&oldest);
                }
                None => break,
            }
        }
        true
    }

    pub fn last_seen(&self, entity: &EntityRef) -> Option<u64> {
        self.last_seen.get(entity).map(|seen| seen.version)
    }

    /// Number of instances tracked.
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_invalidate() {
        let message: PushMessage = serde_json::from_value(json!({
            "type": "INVALIDATE",
            "payload": {
                "entityCode": "task",
                "changes": [
                    {"entityId": "t1", "action": "UPDATE", "version": 4},
                    {"entityId": "t2", "action": "DELETE", "version": 1}
                ]
            }
        }))
        .expect("valid message");

        match message {
            PushMessage::Invalidate(payload) => {
                assert_eq!(payload.entity_code, "task");
                assert_eq!(payload.changes.len(), 2);
                assert_eq!(payload.changes[1].action, ChangeAction::Delete);
                assert!(payload.changes[0].data.is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_link_change_defaults_relationship() {
        let message: PushMessage = serde_json::from_value(json!({
            "type": "LINK_CHANGE",
            "payload": {
                "action": "INSERT",
                "entity_code": "project",
                "entity_instance_id": "P1",
                "child_entity_code": "task",
                "child_entity_instance_id": "t1"
            }
        }))
        .expect("valid message");

        let PushMessage::LinkChange(payload) = message else {
            panic!("expected LINK_CHANGE");
        };
        assert_eq!(payload.link(), EntityLink::new("project", "P1", "task", "t1"));
    }

    #[test]
    fn test_parse_normalized_link_row() {
        let message: PushMessage = serde_json::from_value(json!({
            "type": "NORMALIZED_INVALIDATE",
            "payload": {
                "table": "entity_instance_link",
                "action": "DELETE",
                "entity_code": "project",
                "entity_instance_id": "P1",
                "child_entity_code": "form",
                "child_entity_instance_id": "f1",
                "relationship_type": "owns"
            }
        }))
        .expect("valid message");

        let PushMessage::NormalizedInvalidate(payload) = message else {
            panic!("expected NORMALIZED_INVALIDATE");
        };
        let link = payload.as_link().expect("row carries a full edge");
        assert_eq!(link.child(), EntityRef::new("form", "f1"));
        assert_eq!(link.relationship_type, "owns");
    }

    #[test]
    fn test_control_messages_roundtrip() {
        let ping = serde_json::to_value(&PushMessage::Ping).expect("serialize");
        assert_eq!(ping, json!({"type": "PING"}));

        let pong: PushMessage = serde_json::from_value(json!({"type": "PONG"})).expect("parse");
        assert_eq!(pong, PushMessage::Pong);

        let subscribe = PushMessage::Subscribe(SubscriptionPayload {
            entity_code: "task".to_string(),
            entity_ids: vec!["t1".to_string()],
        });
        let value = serde_json::to_value(&subscribe).expect("serialize");
        assert_eq!(value["type"], "SUBSCRIBE");
        assert_eq!(value["payload"]["entityIds"][0], "t1");
    }

    #[test]
    fn test_version_tracker_drops_stale_versions() {
        let mut tracker = VersionTracker::new();
        let entity = EntityRef::new("task", "t1");

        let applied: Vec<u64> = [3, 1, 2, 5]
            .into_iter()
            .filter(|v| tracker.admit(&entity, ChangeAction::Update, *v))
            .collect();
        assert_eq!(applied, vec![3, 5]);
        assert_eq!(tracker.last_seen(&entity), Some(5));
    }

    #[test]
    fn test_version_tracker_always_admits_delete() {
        let mut tracker = VersionTracker::new();
        let entity = EntityRef::new("task", "t1");

        assert!(tracker.admit(&entity, ChangeAction::Update, 7));
        assert!(tracker.admit(&entity, ChangeAction::Delete, 2));
        assert_eq!(tracker.last_seen(&entity), Some(7));
        assert!(!tracker.admit(&entity, ChangeAction::Insert, 7));
        assert!(tracker.admit(&entity, ChangeAction::Insert, 8));
    }

    #[test]
    fn test_version_tracker_forgets_least_recently_changed() {
        let mut tracker = VersionTracker::with_capacity(2);
        let t1 = EntityRef::new("task", "t1");
        let t2 = EntityRef::new("task", "t2");
        let t3 = EntityRef::new("task", "t3");

        assert!(tracker.admit(&t1, ChangeAction::Update, 4));
        assert!(tracker.admit(&t2, ChangeAction::Update, 4));
        assert!(tracker.admit(&t1, ChangeAction::Update, 5));
        assert!(tracker.admit(&t3, ChangeAction::Update, 1));

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.last_seen(&t2), None);
        assert_eq!(tracker.last_seen(&t1), Some(5));
        assert!(!tracker.admit(&t1, ChangeAction::Update, 5));
    }

    #[test]
    fn test_version_tracker_is_per_entity() {
        let mut tracker = VersionTracker::new();
        assert!(tracker.admit(&EntityRef::new("task", "t1"), ChangeAction::Update, 5));
        assert!(tracker.admit(&EntityRef::new("task", "t2"), ChangeAction::Update, 1));
        assert!(tracker.admit(&EntityRef::new("form", "t1"), ChangeAction::Update, 1));
    }
}
