//! Core entity structures

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Relationship type assumed when a link record does not carry one.
pub const DEFAULT_RELATIONSHIP: &str = "contains";

fn default_relationship() -> String {
    DEFAULT_RELATIONSHIP.to_string()
}

fn default_true() -> bool {
    true
}

/// Reference to an entity instance by code and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRef {
    pub entity_code: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_code: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_code: entity_code.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.entity_code, self.entity_id)
    }
}

/// A category of business object ("project", "task", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityType {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub ui_label: Option<String>,
    #[serde(default)]
    pub ui_icon: Option<String>,
    /// Codes this type may parent, in display order.
    #[serde(default)]
    pub child_entity_codes: Vec<String>,
    #[serde(default)]
    pub display_order: i32,
    #[serde(default = "default_true")]
    pub active_flag: bool,
}

impl EntityType {
    /// Label for display, falling back to the name.
    pub fn label(&self) -> &str {
        self.ui_label.as_deref().unwrap_or(&self.name)
    }

    pub fn may_parent(&self, child_code: &str) -> bool {
        self.child_entity_codes.iter().any(|c| c == child_code)
    }
}

/// One concrete record of an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInstance {
    pub entity_code: String,
    pub entity_instance_id: String,
    pub name: String,
    #[serde(default)]
    pub business_code: Option<String>,
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub synced_at: Option<Timestamp>,
    /// False only in delta responses, for records removed upstream.
    #[serde(default = "default_true")]
    pub active_flag: bool,
    /// Remaining columns of the record, carried through untouched.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityInstance {
    pub fn new(
        entity_code: impl Into<String>,
        entity_instance_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            entity_code: entity_code.into(),
            entity_instance_id: entity_instance_id.into(),
            name: name.into(),
            business_code: None,
            order_id: None,
            synced_at: None,
            active_flag: true,
            fields: Map::new(),
        }
    }

    pub fn with_order(mut self, order_id: i64) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(&self.entity_code, &self.entity_instance_id)
    }

    /// Build an instance from a row of a per-type list response.
    ///
    /// Rows carry `id` and `name`; `code` is the business code and
    /// `order_id` the ordering hint. Everything else lands in `fields`.
    /// Returns `None` for rows without an id.
    pub fn from_row(entity_code: &str, row: &Value) -> Option<Self> {
        let object = row.as_object()?;
        let id = match object.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let business_code = object.get("code").and_then(Value::as_str).map(str::to_string);
        let order_id = object.get("order_id").and_then(Value::as_i64);

        let mut fields = object.clone();
        for column in ["id", "name", "code", "order_id"] {
            fields.remove(column);
        }

        Some(Self {
            entity_code: entity_code.to_string(),
            entity_instance_id: id,
            name,
            business_code,
            order_id,
            synced_at: None,
            active_flag: true,
            fields,
        })
    }
}

/// A directed parent -> child edge. Raw links are the source of truth for
/// both link indexes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityLink {
    pub parent_code: String,
    pub parent_id: String,
    pub child_code: String,
    pub child_id: String,
    #[serde(default = "default_relationship")]
    pub relationship_type: String,
    /// False only in delta responses, for links removed upstream.
    #[serde(default = "default_true")]
    pub active_flag: bool,
}

impl EntityLink {
    pub fn new(
        parent_code: impl Into<String>,
        parent_id: impl Into<String>,
        child_code: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        Self {
            parent_code: parent_code.into(),
            parent_id: parent_id.into(),
            child_code: child_code.into(),
            child_id: child_id.into(),
            relationship_type: default_relationship(),
            active_flag: true,
        }
    }

    pub fn with_relationship(mut self, relationship_type: impl Into<String>) -> Self {
        self.relationship_type = relationship_type.into();
        self
    }

    pub fn parent(&self) -> EntityRef {
        EntityRef::new(&self.parent_code, &self.parent_id)
    }

    pub fn child(&self) -> EntityRef {
        EntityRef::new(&self.child_code, &self.child_id)
    }
}

/// Display name projection for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInstanceName {
    pub entity_code: String,
    pub entity_instance_id: String,
    pub name: String,
}

/// Name side payload: `entityCode -> entityInstanceId -> name`.
pub type NameMap = BTreeMap<String, BTreeMap<String, String>>;

/// One parent entry of a reverse record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub parent_code: String,
    pub parent_id: String,
    pub relationship_type: String,
}

impl ParentRef {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(&self.parent_code, &self.parent_id)
    }

    pub fn is(&self, parent: &EntityRef) -> bool {
        self.parent_code == parent.entity_code && self.parent_id == parent.entity_id
    }
}

/// Whether a forward record holds the parent's full child set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Every child of this type is listed.
    #[default]
    Complete,
    /// Built from a single page; some children may be missing.
    Partial,
}

/// Forward index record: parent -> ordered child ids of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRecord {
    pub parent_code: String,
    pub parent_id: String,
    pub child_code: String,
    pub child_ids: Vec<String>,
    pub relationships: BTreeMap<String, String>,
    #[serde(default)]
    pub completeness: Completeness,
    /// Total reported by the server for partial records.
    #[serde(default)]
    pub expected_total: Option<usize>,
}

impl ForwardRecord {
    pub fn empty(parent: &EntityRef, child_code: &str, completeness: Completeness) -> Self {
        Self {
            parent_code: parent.entity_code.clone(),
            parent_id: parent.entity_id.clone(),
            child_code: child_code.to_string(),
            child_ids: Vec::new(),
            relationships: BTreeMap::new(),
            completeness,
            expected_total: None,
        }
    }

    pub fn parent(&self) -> EntityRef {
        EntityRef::new(&self.parent_code, &self.parent_id)
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    pub fn contains(&self, child_id: &str) -> bool {
        self.relationships.contains_key(child_id)
    }

    /// Insert a child id, keeping the id list a set. Returns false when the
    /// id was already present (the relationship type is still refreshed).
    pub fn insert(&mut self, child_id: &str, relationship_type: &str) -> bool {
        let fresh = self
            .relationships
            .insert(child_id.to_string(), relationship_type.to_string())
            .is_none();
        if fresh {
            self.child_ids.push(child_id.to_string());
        }
        fresh
    }

    /// Remove a child id. Returns true when it was present.
    pub fn remove(&mut self, child_id: &str) -> bool {
        if self.relationships.remove(child_id).is_none() {
            return false;
        }
        self.child_ids.retain(|id| id != child_id);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.child_ids.is_empty()
    }
}

/// Reverse index record: child -> its parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseRecord {
    pub child_code: String,
    pub child_id: String,
    pub parents: Vec<ParentRef>,
}

impl ReverseRecord {
    pub fn empty(child: &EntityRef) -> Self {
        Self {
            child_code: child.entity_code.clone(),
            child_id: child.entity_id.clone(),
            parents: Vec::new(),
        }
    }

    pub fn child(&self) -> EntityRef {
        EntityRef::new(&self.child_code, &self.child_id)
    }

    /// Insert a parent, de-duplicated on `(parentCode, parentId)`.
    pub fn insert(&mut self, parent: &EntityRef, relationship_type: &str) -> bool {
        if let Some(existing) = self.parents.iter_mut().find(|p| p.is(parent)) {
            existing.relationship_type = relationship_type.to_string();
            return false;
        }
        self.parents.push(ParentRef {
            parent_code: parent.entity_code.clone(),
            parent_id: parent.entity_id.clone(),
            relationship_type: relationship_type.to_string(),
        });
        true
    }

    pub fn remove(&mut self, parent: &EntityRef) -> bool {
        let before = self.parents.len();
        self.parents.retain(|p| !p.is(parent));
        self.parents.len() != before
    }

    pub fn contains(&self, parent: &EntityRef) -> bool {
        self.parents.iter().any(|p| p.is(parent))
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}
