//! Draft layer: per-entity edit buffers with undo and redo.
//!
//! A draft holds the data an edit started from, the data as edited, and
//! bounded undo/redo stacks. Whether a draft has changes is always derived
//! by comparing the two, never stored. Drafts are persisted write-behind
//! and survive logout so unsaved work can be recovered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strata_core::keys::CompositeKey;
use strata_core::{EntityRef, StrataResult, Timestamp, ValidationError};
use strata_storage::{load_records, PersistentStore, StoreWriter, Table, WriteOp};
use tracing::{debug, warn};

use crate::index::{read, write};
use crate::notify::{ChangeEvent, ChangeNotifier};

/// Edit buffer for one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub entity_code: String,
    pub entity_id: String,
    pub original_data: Value,
    pub current_data: Value,
    pub undo_stack: VecDeque<Value>,
    pub redo_stack: Vec<Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Draft {
    fn new(entity: &EntityRef, original: Value) -> Self {
        let now = Utc::now();
        Self {
            entity_code: entity.entity_code.clone(),
            entity_id: entity.entity_id.clone(),
            current_data: original.clone(),
            original_data: original,
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef::new(&self.entity_code, &self.entity_id)
    }

    /// Deep comparison against the data the edit started from.
    pub fn has_changes(&self) -> bool {
        self.current_data != self.original_data
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    fn replace_current(&mut self, next: Value, undo_limit: usize) {
        let previous = std::mem::replace(&mut self.current_data, next);
        self.undo_stack.push_back(previous);
        while self.undo_stack.len() > undo_limit {
            self.undo_stack.pop_front();
        }
        self.redo_stack.clear();
        self.updated_at = Utc::now();
    }

    fn undo(&mut self) -> bool {
        let Some(previous) = self.undo_stack.pop_back() else {
            return false;
        };
        let displaced = std::mem::replace(&mut self.current_data, previous);
        self.redo_stack.push(displaced);
        self.updated_at = Utc::now();
        true
    }

    fn redo(&mut self) -> bool {
        let Some(next) = self.redo_stack.pop() else {
            return false;
        };
        let displaced = std::mem::replace(&mut self.current_data, next);
        self.undo_stack.push_back(displaced);
        self.updated_at = Utc::now();
        true
    }

    fn patched(&self, field: &str, patch: Map<String, Value>) -> StrataResult<Value> {
        let mut next = match &self.current_data {
            Value::Object(object) => object.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(ValidationError::InvalidValue {
                    field: field.to_string(),
                    reason: "draft data is not an object".to_string(),
                }
                .into())
            }
        };
        next.extend(patch);
        Ok(Value::Object(next))
    }
}

/// Recovery listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftSummary {
    pub entity: EntityRef,
    pub updated_at: Timestamp,
    pub has_changes: bool,
}

/// All drafts of the session.
pub struct DraftStore {
    drafts: RwLock<HashMap<EntityRef, Draft>>,
    undo_limit: usize,
    writer: StoreWriter,
    notifier: ChangeNotifier,
}

impl DraftStore {
    pub fn new(undo_limit: usize, writer: StoreWriter, notifier: ChangeNotifier) -> Self {
        Self {
            drafts: RwLock::new(HashMap::new()),
            undo_limit: undo_limit.max(1),
            writer,
            notifier,
        }
    }

    /// Load persisted drafts. Returns how many were restored.
    pub async fn load(&self, store: &Arc<dyn PersistentStore>) -> StrataResult<usize> {
        let records: Vec<(String, Draft)> = load_records(store, Table::Drafts, "").await?;
        let count = records.len();
        let mut drafts = write(&self.drafts);
        for (_, draft) in records {
            drafts.insert(draft.entity(), draft);
        }
        debug!(count, "Drafts restored");
        Ok(count)
    }

    /// Begin editing an entity. An existing draft for the same entity is
    /// resumed as is.
    pub fn start_edit(&self, entity: &EntityRef, original: Value) -> Draft {
        let (draft, created) = {
            let mut drafts = write(&self.drafts);
            match drafts.get(entity) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let draft = Draft::new(entity, original);
                    drafts.insert(entity.clone(), draft.clone());
                    (draft, true)
                }
            }
        };
        if created {
            self.persist(&draft);
            self.notifier.emit(ChangeEvent::DraftChanged {
                entity: entity.clone(),
            });
        }
        draft
    }

    /// Set one field.
    pub fn update_field(&self, entity: &EntityRef, key: &str, value: Value) -> StrataResult<Draft> {
        let mut patch = Map::new();
        patch.insert(key.to_string(), value);
        self.mutate(entity, |draft, limit| {
            let next = draft.patched(key, patch)?;
            draft.replace_current(next, limit);
            Ok(())
        })
    }

    /// Set several fields as one undoable step.
    pub fn update_fields(&self, entity: &EntityRef, patch: Map<String, Value>) -> StrataResult<Draft> {
        self.mutate(entity, |draft, limit| {
            let next = draft.patched("patch", patch)?;
            draft.replace_current(next, limit);
            Ok(())
        })
    }

    /// Step back. Without history this returns the draft unchanged.
    pub fn undo(&self, entity: &EntityRef) -> StrataResult<Draft> {
        self.mutate(entity, |draft, _| {
            draft.undo();
            Ok(())
        })
    }

    /// Step forward again after an undo.
    pub fn redo(&self, entity: &EntityRef) -> StrataResult<Draft> {
        self.mutate(entity, |draft, _| {
            draft.redo();
            Ok(())
        })
    }

    /// Restore the original data. The reset itself can be undone.
    pub fn reset(&self, entity: &EntityRef) -> StrataResult<Draft> {
        self.mutate(entity, |draft, limit| {
            if draft.has_changes() {
                let original = draft.original_data.clone();
                draft.replace_current(original, limit);
            }
            Ok(())
        })
    }

    /// Throw the draft away. Returns false when there was none.
    pub fn discard(&self, entity: &EntityRef) -> bool {
        let removed = write(&self.drafts).remove(entity).is_some();
        if removed {
            self.writer
                .submit(vec![WriteOp::delete(Table::Drafts, entity.encode())]);
            self.notifier.emit(ChangeEvent::DraftChanged {
                entity: entity.clone(),
            });
        }
        removed
    }

    /// The edit was saved upstream; the draft is no longer needed.
    pub fn mark_saved(&self, entity: &EntityRef) -> bool {
        self.discard(entity)
    }

    pub fn get(&self, entity: &EntityRef) -> Option<Draft> {
        read(&self.drafts).get(entity).cloned()
    }

    pub fn has_changes(&self, entity: &EntityRef) -> bool {
        read(&self.drafts)
            .get(entity)
            .is_some_and(Draft::has_changes)
    }

    /// Every draft, most recently edited first.
    pub fn list_unsaved(&self) -> Vec<DraftSummary> {
        let mut summaries: Vec<DraftSummary> = read(&self.drafts)
            .values()
            .map(|draft| DraftSummary {
                entity: draft.entity(),
                updated_at: draft.updated_at,
                has_changes: draft.has_changes(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.entity.cmp(&b.entity))
        });
        summaries
    }

    fn mutate(
        &self,
        entity: &EntityRef,
        f: impl FnOnce(&mut Draft, usize) -> StrataResult<()>,
    ) -> StrataResult<Draft> {
        let draft = {
            let mut drafts = write(&self.drafts);
            let draft = drafts
                .get_mut(entity)
                .ok_or_else(|| ValidationError::DraftNotFound {
                    entity_code: entity.entity_code.clone(),
                    entity_id: entity.entity_id.clone(),
                })?;
            f(draft, self.undo_limit)?;
            draft.clone()
        };
        self.persist(&draft);
        self.notifier.emit(ChangeEvent::DraftChanged {
            entity: entity.clone(),
        });
        Ok(draft)
    }

    fn persist(&self, draft: &Draft) {
        match WriteOp::put_json(Table::Drafts, draft.entity().encode(), draft) {
            Ok(op) => self.writer.submit(vec![op]),
            Err(e) => warn!(
                entity = %draft.entity(),
                error = %e,
                "Draft not persisted"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_storage::MemoryStore;

    fn setup(limit: usize) -> (DraftStore, Arc<MemoryStore>, StoreWriter) {
        let store = Arc::new(MemoryStore::new());
        let (writer, _handle) = StoreWriter::spawn(store.clone());
        let drafts = DraftStore::new(limit, writer.clone(), ChangeNotifier::new(16));
        (drafts, store, writer)
    }

    fn entity() -> EntityRef {
        EntityRef::new("task", "t1")
    }

    #[tokio::test]
    async fn test_undo_redo_roundtrip() {
        let (drafts, _store, _writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        drafts.update_field(&entity(), "a", json!(2)).expect("update");
        drafts.update_field(&entity(), "a", json!(3)).expect("update");

        drafts.undo(&entity()).expect("undo");
        let draft = drafts.undo(&entity()).expect("undo");
        assert_eq!(draft.current_data, json!({"a": 1}));
        assert!(!draft.has_changes());

        drafts.redo(&entity()).expect("redo");
        let draft = drafts.redo(&entity()).expect("redo");
        assert_eq!(draft.current_data, json!({"a": 3}));
        assert!(draft.has_changes());
    }

    #[tokio::test]
    async fn test_mutation_clears_redo() {
        let (drafts, _store, _writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        drafts.update_field(&entity(), "a", json!(2)).expect("update");
        drafts.undo(&entity()).expect("undo");

        let draft = drafts.update_field(&entity(), "b", json!(true)).expect("update");
        assert!(!draft.can_redo());
        assert_eq!(draft.current_data, json!({"a": 1, "b": true}));
    }

    #[tokio::test]
    async fn test_undo_stack_is_capped() {
        let (drafts, _store, _writer) = setup(2);
        drafts.start_edit(&entity(), json!({"n": 0}));
        for n in 1..=5 {
            drafts.update_field(&entity(), "n", json!(n)).expect("update");
        }

        let draft = drafts.get(&entity()).expect("draft exists");
        assert_eq!(draft.undo_stack.len(), 2);
        drafts.undo(&entity()).expect("undo");
        let draft = drafts.undo(&entity()).expect("undo");
        assert_eq!(draft.current_data, json!({"n": 3}));
        assert!(!draft.can_undo());
    }

    #[tokio::test]
    async fn test_update_fields_is_one_step() {
        let (drafts, _store, _writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        let mut patch = Map::new();
        patch.insert("a".to_string(), json!(2));
        patch.insert("b".to_string(), json!("x"));
        drafts.update_fields(&entity(), patch).expect("update");

        let draft = drafts.undo(&entity()).expect("undo");
        assert_eq!(draft.current_data, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_reset_is_undoable() {
        let (drafts, _store, _writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        drafts.update_field(&entity(), "a", json!(9)).expect("update");

        let draft = drafts.reset(&entity()).expect("reset");
        assert!(!draft.has_changes());
        let draft = drafts.undo(&entity()).expect("undo");
        assert_eq!(draft.current_data, json!({"a": 9}));
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing_behind() {
        let (drafts, store, writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        drafts.update_field(&entity(), "a", json!(2)).expect("update");
        writer.flush().await.expect("flush");
        assert_eq!(store.len(Table::Drafts), 1);

        assert!(drafts.discard(&entity()));
        writer.flush().await.expect("flush");
        assert!(drafts.get(&entity()).is_none());
        assert!(drafts.list_unsaved().is_empty());
        assert_eq!(store.len(Table::Drafts), 0);
        assert!(!drafts.discard(&entity()));
    }

    #[tokio::test]
    async fn test_start_edit_resumes_existing_draft() {
        let (drafts, _store, _writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        drafts.update_field(&entity(), "a", json!(2)).expect("update");

        let resumed = drafts.start_edit(&entity(), json!({"a": 100}));
        assert_eq!(resumed.original_data, json!({"a": 1}));
        assert_eq!(resumed.current_data, json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_missing_draft_is_an_error() {
        let (drafts, _store, _writer) = setup(10);
        let err = drafts.undo(&entity()).unwrap_err();
        assert!(err.to_string().contains("task:t1"));
    }

    #[tokio::test]
    async fn test_update_on_scalar_draft_rejected() {
        let (drafts, _store, _writer) = setup(10);
        drafts.start_edit(&entity(), json!("plain"));
        assert!(drafts.update_field(&entity(), "a", json!(1)).is_err());
        assert_eq!(drafts.get(&entity()).map(|d| d.undo_stack.len()), Some(0));
    }

    #[tokio::test]
    async fn test_load_restores_persisted_drafts() {
        let (drafts, store, writer) = setup(10);
        drafts.start_edit(&entity(), json!({"a": 1}));
        drafts.update_field(&entity(), "a", json!(2)).expect("update");
        writer.flush().await.expect("flush");

        let (restored, _store, _writer) = setup(10);
        let store: Arc<dyn PersistentStore> = store;
        assert_eq!(restored.load(&store).await.expect("load"), 1);

        let summaries = restored.list_unsaved();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].entity, entity());
        assert!(summaries[0].has_changes);
    }
}
