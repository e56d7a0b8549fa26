//! In-memory index store.
//!
//! Synchronous maps mirroring the persisted tables. Each layer sits behind
//! its own `std::sync::RwLock`; critical sections are short and never span
//! an `.await`. Mutations return the store writes that mirror them so the
//! caller decides how to persist.
//!
//! The maps are only a cache of the store and the server, so a poisoned
//! lock is recovered rather than propagated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use strata_core::keys::CompositeKey;
use strata_core::{EntityInstance, EntityRef, EntityType, NameMap, StrataResult, SyncLayer};
use strata_storage::{Table, WriteOp};

use crate::link_graph::{GraphChanges, LinkGraph};

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Sort key for cached lists: `orderId` ascending with missing values last,
/// then id.
fn display_order(instance: &EntityInstance) -> (bool, i64, &str) {
    (
        instance.order_id.is_none(),
        instance.order_id.unwrap_or_default(),
        instance.entity_instance_id.as_str(),
    )
}

/// Everything loaded from the store at startup.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub types: Vec<EntityType>,
    pub instances: Vec<EntityInstance>,
    pub names: Vec<(EntityRef, String)>,
    pub graph: LinkGraph,
}

/// Synchronous mirror of every cache layer.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    types: RwLock<BTreeMap<String, EntityType>>,
    instances: RwLock<HashMap<String, BTreeMap<String, EntityInstance>>>,
    names: RwLock<HashMap<EntityRef, String>>,
    graph: RwLock<LinkGraph>,
    loading: RwLock<HashSet<SyncLayer>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every layer with a snapshot.
    pub fn restore(&self, snapshot: IndexSnapshot) {
        *write(&self.types) = snapshot
            .types
            .into_iter()
            .map(|t| (t.code.clone(), t))
            .collect();

        let mut instances: HashMap<String, BTreeMap<String, EntityInstance>> = HashMap::new();
        for instance in snapshot.instances {
            instances
                .entry(instance.entity_code.clone())
                .or_default()
                .insert(instance.entity_instance_id.clone(), instance);
        }
        *write(&self.instances) = instances;
        *write(&self.names) = snapshot.names.into_iter().collect();
        *write(&self.graph) = snapshot.graph;
    }

    /// Drop everything.
    pub fn clear(&self) {
        write(&self.types).clear();
        write(&self.instances).clear();
        write(&self.names).clear();
        *write(&self.graph) = LinkGraph::new();
        write(&self.loading).clear();
    }

    // ------------------------------------------------------------------
    // Entity types
    // ------------------------------------------------------------------

    /// Replace the type layer wholesale.
    pub fn replace_types(&self, types: &[EntityType]) -> StrataResult<Vec<WriteOp>> {
        let mut ops = vec![WriteOp::Clear {
            table: Table::EntityTypes,
        }];
        for entity_type in types {
            ops.push(WriteOp::put_json(
                Table::EntityTypes,
                entity_type.code.as_str(),
                entity_type,
            )?);
        }

        *write(&self.types) = types.iter().map(|t| (t.code.clone(), t.clone())).collect();
        Ok(ops)
    }

    pub fn entity_type(&self, code: &str) -> Option<EntityType> {
        read(&self.types).get(code).cloned()
    }

    /// Active types by display order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        let mut types: Vec<EntityType> = read(&self.types)
            .values()
            .filter(|t| t.active_flag)
            .cloned()
            .collect();
        types.sort_by(|a, b| {
            a.display_order
                .cmp(&b.display_order)
                .then_with(|| a.code.cmp(&b.code))
        });
        types
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Insert or update instances in place. Each instance also refreshes
    /// its entry in the name layer.
    pub fn upsert_instances(&self, batch: &[EntityInstance]) -> StrataResult<Vec<WriteOp>> {
        let mut ops = Vec::with_capacity(batch.len() * 2);
        for instance in batch {
            let key = instance.entity_ref().encode();
            ops.push(WriteOp::put_json(Table::EntityInstances, key.as_str(), instance)?);
            ops.push(WriteOp::put_json(Table::EntityNames, key, &instance.name)?);
        }

        {
            let mut instances = write(&self.instances);
            for instance in batch {
                instances
                    .entry(instance.entity_code.clone())
                    .or_default()
                    .insert(instance.entity_instance_id.clone(), instance.clone());
            }
        }
        {
            let mut names = write(&self.names);
            for instance in batch {
                names.insert(instance.entity_ref(), instance.name.clone());
            }
        }
        Ok(ops)
    }

    /// Replace the instance layer wholesale.
    pub fn replace_instances(&self, batch: &[EntityInstance]) -> StrataResult<Vec<WriteOp>> {
        write(&self.instances).clear();
        let mut ops = vec![WriteOp::Clear {
            table: Table::EntityInstances,
        }];
        ops.extend(self.upsert_instances(batch)?);
        Ok(ops)
    }

    /// Hard-delete an instance and its name. Returns `None` when nothing
    /// was cached for it.
    pub fn remove_instance(&self, entity: &EntityRef) -> Option<Vec<WriteOp>> {
        let removed = {
            let mut instances = write(&self.instances);
            let removed = instances
                .get_mut(&entity.entity_code)
                .and_then(|by_id| by_id.remove(&entity.entity_id));
            if instances
                .get(&entity.entity_code)
                .is_some_and(BTreeMap::is_empty)
            {
                instances.remove(&entity.entity_code);
            }
            removed.is_some()
        };
        let named = write(&self.names).remove(entity).is_some();

        if !removed && !named {
            return None;
        }
        let key = entity.encode();
        Some(vec![
            WriteOp::delete(Table::EntityInstances, key.as_str()),
            WriteOp::delete(Table::EntityNames, key),
        ])
    }

    pub fn instance(&self, entity: &EntityRef) -> Option<EntityInstance> {
        read(&self.instances)
            .get(&entity.entity_code)
            .and_then(|by_id| by_id.get(&entity.entity_id))
            .cloned()
    }

    /// Every cached instance of one code in display order.
    pub fn instances_of(&self, entity_code: &str) -> Vec<EntityInstance> {
        let instances = read(&self.instances);
        let Some(by_id) = instances.get(entity_code) else {
            return Vec::new();
        };
        let mut list: Vec<&EntityInstance> = by_id.values().collect();
        list.sort_by(|a, b| display_order(a).cmp(&display_order(b)));
        list.into_iter().cloned().collect()
    }

    /// Look up several instances of one code, keeping the order of `ids`
    /// and skipping ids not cached yet.
    pub fn instances_by_ids(&self, entity_code: &str, ids: &[String]) -> Vec<EntityInstance> {
        let instances = read(&self.instances);
        let Some(by_id) = instances.get(entity_code) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
    }

    pub fn instance_count(&self, entity_code: &str) -> usize {
        read(&self.instances)
            .get(entity_code)
            .map_or(0, BTreeMap::len)
    }

    // ------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------

    /// Merge a name side payload. Returns the writes for entries that
    /// actually changed.
    pub fn merge_names(&self, names: &NameMap) -> StrataResult<Vec<WriteOp>> {
        let mut ops = Vec::new();
        let mut cached = write(&self.names);
        for (entity_code, by_id) in names {
            for (entity_id, name) in by_id {
                let entity = EntityRef::new(entity_code, entity_id);
                if cached.get(&entity) == Some(name) {
                    continue;
                }
                ops.push(WriteOp::put_json(Table::EntityNames, entity.encode(), name)?);
                cached.insert(entity, name.clone());
            }
        }
        Ok(ops)
    }

    /// Display name: the instance record wins, the name layer fills in.
    pub fn name(&self, entity: &EntityRef) -> Option<String> {
        if let Some(instance) = self.instance(entity) {
            return Some(instance.name);
        }
        read(&self.names).get(entity).cloned()
    }

    pub fn name_count(&self) -> usize {
        read(&self.names).len()
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Read the link graph.
    pub fn with_graph<R>(&self, f: impl FnOnce(&LinkGraph) -> R) -> R {
        f(&*read(&self.graph))
    }

    /// Mutate the link graph. The persistence writes are computed under the
    /// same lock so they match the state the mutation produced.
    pub fn update_graph(
        &self,
        f: impl FnOnce(&mut LinkGraph) -> GraphChanges,
    ) -> StrataResult<(GraphChanges, Vec<WriteOp>)> {
        let mut graph = write(&self.graph);
        let changes = f(&mut *graph);
        let ops = graph.persist_ops(&changes)?;
        Ok((changes, ops))
    }

    // ------------------------------------------------------------------
    // Loading flags
    // ------------------------------------------------------------------

    pub fn set_loading(&self, layer: SyncLayer, loading: bool) {
        let mut flags = write(&self.loading);
        if loading {
            flags.insert(layer);
        } else {
            flags.remove(&layer);
        }
    }

    pub fn is_loading(&self, layer: SyncLayer) -> bool {
        read(&self.loading).contains(&layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{EntityLink, ForwardKey};

    fn task(id: &str, name: &str) -> EntityInstance {
        EntityInstance::new("task", id, name)
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let index = MemoryIndex::new();
        let batch = vec![task("t1", "Write docs")];

        let first = index.upsert_instances(&batch).expect("upsert should succeed");
        let second = index.upsert_instances(&batch).expect("upsert should succeed");

        assert_eq!(first, second);
        assert_eq!(index.instance_count("task"), 1);
        assert_eq!(index.instances_of("task"), batch);
    }

    #[test]
    fn test_instances_ordered_by_order_id_then_id() {
        let index = MemoryIndex::new();
        index
            .upsert_instances(&[
                task("t3", "c"),
                task("t2", "b").with_order(2),
                task("t1", "a").with_order(5),
                task("t0", "z"),
            ])
            .expect("upsert should succeed");

        let ids: Vec<_> = index
            .instances_of("task")
            .into_iter()
            .map(|i| i.entity_instance_id)
            .collect();
        assert_eq!(ids, vec!["t2", "t1", "t0", "t3"]);
    }

    #[test]
    fn test_instance_name_wins_over_name_layer() {
        let index = MemoryIndex::new();
        let entity = EntityRef::new("task", "t1");

        let mut names = NameMap::new();
        names
            .entry("task".to_string())
            .or_default()
            .insert("t1".to_string(), "Old name".to_string());
        index.merge_names(&names).expect("merge should succeed");
        assert_eq!(index.name(&entity).as_deref(), Some("Old name"));

        index
            .upsert_instances(&[task("t1", "New name")])
            .expect("upsert should succeed");
        assert_eq!(index.name(&entity).as_deref(), Some("New name"));
    }

    #[test]
    fn test_merge_names_skips_unchanged_entries() {
        let index = MemoryIndex::new();
        let mut names = NameMap::new();
        names
            .entry("project".to_string())
            .or_default()
            .insert("P1".to_string(), "Apollo".to_string());

        assert_eq!(index.merge_names(&names).expect("merge").len(), 1);
        assert!(index.merge_names(&names).expect("merge").is_empty());
        assert!(index.merge_names(&NameMap::new()).expect("merge").is_empty());
        assert_eq!(index.name_count(), 1);
    }

    #[test]
    fn test_remove_instance() {
        let index = MemoryIndex::new();
        index
            .upsert_instances(&[task("t1", "a"), task("t2", "b")])
            .expect("upsert should succeed");

        let ops = index
            .remove_instance(&EntityRef::new("task", "t1"))
            .expect("instance was cached");
        assert_eq!(ops.len(), 2);
        assert_eq!(index.instance_count("task"), 1);
        assert!(index.name(&EntityRef::new("task", "t1")).is_none());
        assert!(index.remove_instance(&EntityRef::new("task", "t1")).is_none());
    }

    #[test]
    fn test_replace_instances_drops_missing_records() {
        let index = MemoryIndex::new();
        index
            .upsert_instances(&[task("t1", "a"), task("t2", "b")])
            .expect("upsert should succeed");
        let ops = index
            .replace_instances(&[task("t3", "c")])
            .expect("replace should succeed");

        assert_eq!(
            ops[0],
            WriteOp::Clear {
                table: Table::EntityInstances
            }
        );
        assert!(index.instance(&EntityRef::new("task", "t1")).is_none());
        assert_eq!(index.instance_count("task"), 1);
    }

    #[test]
    fn test_instances_by_ids_keeps_requested_order() {
        let index = MemoryIndex::new();
        index
            .upsert_instances(&[task("t1", "a"), task("t2", "b")])
            .expect("upsert should succeed");

        let ids = vec!["t2".to_string(), "missing".to_string(), "t1".to_string()];
        let found: Vec<_> = index
            .instances_by_ids("task", &ids)
            .into_iter()
            .map(|i| i.entity_instance_id)
            .collect();
        assert_eq!(found, vec!["t2", "t1"]);
    }

    #[test]
    fn test_update_graph_returns_matching_writes() {
        let index = MemoryIndex::new();
        let (changes, ops) = index
            .update_graph(|graph| graph.add_link(&EntityLink::new("project", "P1", "task", "t1")))
            .expect("update should succeed");

        assert_eq!(changes.links.len(), 1);
        assert_eq!(ops.len(), 3);
        assert!(index.with_graph(|g| g.forward(&ForwardKey::new("project", "P1", "task")).is_some()));
    }

    #[test]
    fn test_types_sorted_and_inactive_hidden() {
        let index = MemoryIndex::new();
        let mut hidden = EntityType {
            code: "legacy".to_string(),
            name: "Legacy".to_string(),
            ui_label: None,
            ui_icon: None,
            child_entity_codes: vec![],
            display_order: 0,
            active_flag: false,
        };
        let project = EntityType {
            code: "project".to_string(),
            name: "Project".to_string(),
            display_order: 1,
            active_flag: true,
            ..hidden.clone()
        };
        let task_type = EntityType {
            code: "task".to_string(),
            name: "Task".to_string(),
            display_order: 2,
            active_flag: true,
            ..hidden.clone()
        };
        hidden.display_order = 3;

        index
            .replace_types(&[task_type, hidden, project])
            .expect("replace should succeed");
        let codes: Vec<_> = index.entity_types().into_iter().map(|t| t.code).collect();
        assert_eq!(codes, vec!["project", "task"]);
        assert!(index.entity_type("legacy").is_some());
    }

    #[test]
    fn test_loading_flags() {
        let index = MemoryIndex::new();
        index.set_loading(SyncLayer::EntityInstances, true);
        assert!(index.is_loading(SyncLayer::EntityInstances));
        index.set_loading(SyncLayer::EntityInstances, false);
        assert!(!index.is_loading(SyncLayer::EntityInstances));
    }
}
