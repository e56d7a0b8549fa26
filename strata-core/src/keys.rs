//! Composite string keys for persisted tables.
//!
//! Every persisted record is addressed by a deterministic concatenation of
//! its typed fields, so a key can always be rebuilt from the record itself
//! without a lookup. Entity codes never contain the separator; instance ids
//! may, which is why decoding anchors on the code positions.
//!
//! | table              | key                                   |
//! |--------------------|---------------------------------------|
//! | entity_types       | `code`                                |
//! | entity_instances   | `code:id`                             |
//! | entity_names       | `code:id`                             |
//! | entity_links       | `parentCode:parentId:childCode:childId` |
//! | forward_links      | `parentCode:parentId:childCode`       |
//! | reverse_links      | `childCode:childId`                   |
//! | drafts             | `code:id`                             |

use crate::{EntityLink, EntityRef};

/// Separator between key components.
pub const SEPARATOR: char = ':';

/// A key that encodes to a stable string for persisted tables.
pub trait CompositeKey {
    /// Encode this key to its persisted string form.
    fn encode(&self) -> String;
}

impl CompositeKey for EntityRef {
    fn encode(&self) -> String {
        format!("{}{}{}", self.entity_code, SEPARATOR, self.entity_id)
    }
}

impl EntityRef {
    /// Decode a `code:id` key. The id may itself contain the separator.
    pub fn decode(key: &str) -> Option<Self> {
        let (code, id) = key.split_once(SEPARATOR)?;
        if code.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(code, id))
    }

    /// Prefix matching every key of one entity code.
    pub fn code_prefix(entity_code: &str) -> String {
        format!("{}{}", entity_code, SEPARATOR)
    }
}

/// Key of a forward index record: one parent, one child type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForwardKey {
    pub parent: EntityRef,
    pub child_code: String,
}

impl ForwardKey {
    pub fn new(
        parent_code: impl Into<String>,
        parent_id: impl Into<String>,
        child_code: impl Into<String>,
    ) -> Self {
        Self {
            parent: EntityRef::new(parent_code, parent_id),
            child_code: child_code.into(),
        }
    }

    /// Decode `parentCode:parentId:childCode`. The parent id sits between
    /// the first and the last separator.
    pub fn decode(key: &str) -> Option<Self> {
        let (parent_code, rest) = key.split_once(SEPARATOR)?;
        let (parent_id, child_code) = rest.rsplit_once(SEPARATOR)?;
        if parent_code.is_empty() || parent_id.is_empty() || child_code.is_empty() {
            return None;
        }
        Some(Self::new(parent_code, parent_id, child_code))
    }
}

impl CompositeKey for ForwardKey {
    fn encode(&self) -> String {
        format!("{}{}{}", self.parent.encode(), SEPARATOR, self.child_code)
    }
}

/// Key of a raw link record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub parent: EntityRef,
    pub child: EntityRef,
}

impl LinkKey {
    pub fn of(link: &EntityLink) -> Self {
        Self {
            parent: link.parent(),
            child: link.child(),
        }
    }

    /// The forward index key this link contributes to.
    pub fn forward_key(&self) -> ForwardKey {
        ForwardKey {
            parent: self.parent.clone(),
            child_code: self.child.entity_code.clone(),
        }
    }
}

impl CompositeKey for LinkKey {
    fn encode(&self) -> String {
        format!("{}{}{}", self.parent.encode(), SEPARATOR, self.child.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_entity_ref_encode() {
        let key = EntityRef::new("project", "proj-1");
        assert_eq!(key.encode(), "project:proj-1");
    }

    #[test]
    fn test_entity_ref_decode_keeps_separator_in_id() {
        let key = EntityRef::decode("form:a:b").expect("decode should succeed");
        assert_eq!(key.entity_code, "form");
        assert_eq!(key.entity_id, "a:b");
    }

    #[test]
    fn test_entity_ref_decode_rejects_malformed() {
        assert!(EntityRef::decode("project").is_none());
        assert!(EntityRef::decode(":id").is_none());
        assert!(EntityRef::decode("project:").is_none());
    }

    #[test]
    fn test_forward_key_encode_decode() {
        let key = ForwardKey::new("project", "P1", "task");
        assert_eq!(key.encode(), "project:P1:task");
        assert_eq!(ForwardKey::decode("project:P1:task"), Some(key));
    }

    #[test]
    fn test_forward_key_decode_with_separator_in_parent_id() {
        let key = ForwardKey::decode("project:a:b:task").expect("decode should succeed");
        assert_eq!(key.parent.entity_id, "a:b");
        assert_eq!(key.child_code, "task");
    }

    #[test]
    fn test_link_key_is_prefixed_by_forward_key() {
        let link = EntityLink::new("project", "P1", "task", "t1");
        let key = LinkKey::of(&link);
        assert_eq!(key.encode(), "project:P1:task:t1");
        assert!(key.encode().starts_with(&key.forward_key().encode()));
    }

    #[test]
    fn test_code_prefix() {
        let prefix = EntityRef::code_prefix("task");
        assert!(EntityRef::new("task", "t1").encode().starts_with(&prefix));
        assert!(!EntityRef::new("tasks", "t1").encode().starts_with(&prefix));
    }

    proptest! {
        #[test]
        fn prop_forward_key_roundtrip(
            parent_code in "[a-z_]{1,12}",
            parent_id in "[a-zA-Z0-9:-]{1,24}",
            child_code in "[a-z_]{1,12}",
        ) {
            let key = ForwardKey::new(parent_code, parent_id, child_code);
            prop_assert_eq!(ForwardKey::decode(&key.encode()), Some(key));
        }
    }
}
