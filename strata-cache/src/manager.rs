//! Cache manager: one object owning every cache layer of a session.
//!
//! Constructed once per session with [`CacheManager::open`], which hydrates
//! the in-memory index from the persistent store, and torn down on logout
//! with [`CacheManager::clear`]. Reads are synchronous. Writes update
//! memory first and reach the store through the ordered write-behind queue.
//!
//! # Generations
//!
//! Every clear bumps a generation counter. Work that started before a clear
//! (a fetch in flight during logout) carries the generation it started
//! under and is rejected with `RemoteError::StaleGeneration` when it tries
//! to apply its result.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use strata_core::{
    EntityInstance, EntityLink, EntityRef, EntityType, ForwardKey, ForwardRecord, LinkKey,
    NameMap, ParentRef, RemoteError, StrataResult, SyncLayer, SyncStamp, Timestamp,
    ValidationError,
};
use strata_storage::{
    load_records, PersistentStore, StoreStats, StoreWriter, SyncWatermarks, Table, WriteOp,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::drafts::DraftStore;
use crate::index::{read, write, IndexSnapshot, MemoryIndex};
use crate::link_graph::{GraphChanges, LinkGraph};
use crate::notify::{ChangeEvent, ChangeNotifier};
use crate::optimistic::{LinkPatch, OptimisticLedger};
use crate::push::VersionTracker;

/// Name shown for an instance no layer knows yet.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Something a consumer can invalidate and later revalidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A whole sync layer.
    Layer(SyncLayer),
    /// Children of one type under one parent.
    ChildList { parent: EntityRef, child_code: String },
    /// One instance.
    Entity(EntityRef),
}

/// Owner of every cache layer.
pub struct CacheManager {
    config: CacheConfig,
    store: Arc<dyn PersistentStore>,
    writer: StoreWriter,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    index: MemoryIndex,
    watermarks: SyncWatermarks,
    drafts: DraftStore,
    pub(crate) ledger: Mutex<OptimisticLedger>,
    pub(crate) versions: Mutex<VersionTracker>,
    stale: RwLock<HashSet<SyncLayer>>,
    generation: RwLock<u64>,
    notifier: ChangeNotifier,
}

impl CacheManager {
    /// Open a session over `store`, restoring every persisted layer.
    ///
    /// Spawns the write-behind task, so it must run inside a tokio runtime.
    pub async fn open(
        store: Arc<dyn PersistentStore>,
        config: CacheConfig,
    ) -> StrataResult<Arc<Self>> {
        config.validate()?;

        let (writer, writer_task) = StoreWriter::spawn(store.clone());
        let notifier = ChangeNotifier::new(config.notify_capacity);
        let watermarks = SyncWatermarks::load(&store).await?;
        let drafts = DraftStore::new(config.draft_undo_limit, writer.clone(), notifier.clone());
        let versions = VersionTracker::with_capacity(config.version_capacity);

        let manager = Self {
            config,
            store,
            writer,
            writer_task: Mutex::new(Some(writer_task)),
            index: MemoryIndex::new(),
            watermarks,
            drafts,
            ledger: Mutex::new(OptimisticLedger::new()),
            versions: Mutex::new(versions),
            stale: RwLock::new(HashSet::new()),
            generation: RwLock::new(0),
            notifier,
        };
        manager.hydrate().await?;
        Ok(Arc::new(manager))
    }

    async fn hydrate(&self) -> StrataResult<()> {
        let types: Vec<(String, EntityType)> =
            load_records(&self.store, Table::EntityTypes, "").await?;
        let instances: Vec<(String, EntityInstance)> =
            load_records(&self.store, Table::EntityInstances, "").await?;
        let names: Vec<(String, String)> =
            load_records(&self.store, Table::EntityNames, "").await?;
        let links: Vec<(String, EntityLink)> =
            load_records(&self.store, Table::EntityLinks, "").await?;
        let forward: Vec<(String, ForwardRecord)> =
            load_records(&self.store, Table::ForwardLinks, "").await?;

        let names: Vec<(EntityRef, String)> = names
            .into_iter()
            .filter_map(|(key, name)| EntityRef::decode(&key).map(|entity| (entity, name)))
            .collect();
        let graph = LinkGraph::restore(
            links.iter().map(|(_, link)| link),
            forward.into_iter().map(|(_, record)| record),
            self.watermarks.last_sync(SyncLayer::EntityLinks).is_some(),
        );

        info!(
            types = types.len(),
            instances = instances.len(),
            names = names.len(),
            links = graph.len(),
            "Cache hydrated from store"
        );

        self.index.restore(IndexSnapshot {
            types: types.into_iter().map(|(_, t)| t).collect(),
            instances: instances.into_iter().map(|(_, i)| i).collect(),
            names,
            graph,
        });
        let drafts = self.drafts.load(&self.store).await?;
        debug!(drafts, "Draft layer hydrated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current generation. Capture it before starting remote work.
    pub fn generation(&self) -> u64 {
        *read(&self.generation)
    }

    /// Run `apply` only if no clear happened since `started`. The
    /// generation stays locked for the duration, so a concurrent clear
    /// waits for the apply to finish and then wipes it.
    pub(crate) fn guarded<R>(
        &self,
        started: u64,
        layer: SyncLayer,
        apply: impl FnOnce() -> StrataResult<R>,
    ) -> StrataResult<R> {
        let current = read(&self.generation);
        if *current != started {
            debug!(%layer, started, current = *current, "Discarding result from a previous session");
            return Err(RemoteError::StaleGeneration {
                layer,
                started,
                current: *current,
            }
            .into());
        }
        apply()
    }

    /// Log out: drop every session layer from memory and store and bump the
    /// generation. Drafts are kept for recovery.
    pub async fn clear(&self) -> StrataResult<()> {
        {
            let mut generation = write(&self.generation);
            *generation += 1;
            self.index.clear();
            self.watermarks.clear();
            write(&self.stale).clear();
            self.versions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            self.ledger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            info!(generation = *generation, "Cache cleared");
        }

        let ops: Vec<WriteOp> = Table::ALL
            .into_iter()
            .filter(Table::is_session_scoped)
            .map(|table| WriteOp::Clear { table })
            .collect();
        self.writer.submit_and_wait(ops).await?;
        self.notifier.emit(ChangeEvent::Cleared);
        Ok(())
    }

    /// Flush pending writes and stop the write-behind task. The cache stays
    /// readable; later writes only reach memory.
    pub async fn close(&self) -> StrataResult<()> {
        self.writer.shutdown().await?;
        let task = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Store writer task ended abnormally");
            }
        }
        info!("Cache closed");
        Ok(())
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    pub(crate) fn notify(&self, event: ChangeEvent) {
        self.notifier.emit(event);
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    pub(crate) fn index(&self) -> &MemoryIndex {
        &self.index
    }

    /// Wait until every queued store write has been applied.
    pub async fn flush(&self) -> StrataResult<()> {
        self.writer.flush().await
    }

    pub async fn store_stats(&self) -> StrataResult<StoreStats> {
        self.store.stats().await
    }

    /// Queue writes without waiting.
    pub(crate) fn persist(&self, ops: Vec<WriteOp>) {
        self.writer.submit(ops);
    }

    /// Queue writes and report whether they reached the store.
    pub(crate) async fn persist_confirmed(&self, ops: Vec<WriteOp>) -> bool {
        if ops.is_empty() {
            return true;
        }
        match self.writer.submit_and_wait(ops).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Persistence failed; memory index stays authoritative");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Synchronous reads
    // ------------------------------------------------------------------

    pub fn entity_type(&self, code: &str) -> Option<EntityType> {
        self.index.entity_type(code)
    }

    /// Active entity types in display order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.index.entity_types()
    }

    pub fn instance(&self, entity: &EntityRef) -> Option<EntityInstance> {
        self.index.instance(entity)
    }

    /// Cached instances of one code in display order.
    pub fn instances(&self, entity_code: &str) -> Vec<EntityInstance> {
        self.index.instances_of(entity_code)
    }

    pub fn instance_count(&self, entity_code: &str) -> usize {
        self.index.instance_count(entity_code)
    }

    /// Display name from the instance layer, else the name layer.
    pub fn entity_name(&self, entity: &EntityRef) -> Option<String> {
        self.index.name(entity)
    }

    /// Display name with a placeholder for instances not seen yet.
    pub fn display_name(&self, entity: &EntityRef) -> String {
        self.entity_name(entity)
            .unwrap_or_else(|| UNKNOWN_NAME.to_string())
    }

    pub fn forward_record(&self, key: &ForwardKey) -> Option<ForwardRecord> {
        self.index.with_graph(|graph| graph.forward(key).cloned())
    }

    /// Child ids of one type under a parent, if the full set is known.
    pub fn children(&self, parent: &EntityRef, child_code: &str) -> Option<Vec<String>> {
        let key = ForwardKey {
            parent: parent.clone(),
            child_code: child_code.to_string(),
        };
        self.index.with_graph(|graph| {
            graph
                .forward(&key)
                .filter(|record| record.is_complete())
                .map(|record| record.child_ids.clone())
        })
    }

    /// Parents of an instance.
    pub fn parents(&self, child: &EntityRef) -> Vec<ParentRef> {
        self.index.with_graph(|graph| {
            graph
                .reverse(child)
                .map(|record| record.parents.clone())
                .unwrap_or_default()
        })
    }

    pub fn link_count(&self) -> usize {
        self.index.with_graph(LinkGraph::len)
    }

    pub fn last_sync(&self, layer: SyncLayer) -> Option<Timestamp> {
        self.watermarks.last_sync(layer)
    }

    pub fn is_loading(&self, layer: SyncLayer) -> bool {
        self.index.is_loading(layer)
    }

    pub fn is_stale(&self, layer: SyncLayer) -> bool {
        read(&self.stale).contains(&layer)
    }

    pub fn stale_layers(&self) -> Vec<SyncLayer> {
        let stale = read(&self.stale);
        SyncLayer::ALL
            .into_iter()
            .filter(|layer| stale.contains(layer))
            .collect()
    }

    /// Optimistic patches not yet confirmed by the server.
    pub fn pending_patches(&self) -> usize {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ------------------------------------------------------------------
    // Layer writes (fetchers)
    // ------------------------------------------------------------------

    pub(crate) fn set_loading(&self, layer: SyncLayer, loading: bool) {
        self.index.set_loading(layer, loading);
    }

    /// Replace the type layer. Returns whether the store accepted it.
    pub async fn apply_entity_types(
        &self,
        started: u64,
        types: &[EntityType],
    ) -> StrataResult<bool> {
        let ops = self.guarded(started, SyncLayer::EntityTypes, || {
            self.index.replace_types(types)
        })?;
        self.notify(ChangeEvent::TypesReplaced);
        Ok(self.persist_confirmed(ops).await)
    }

    /// Apply a page of instances. With `replace` the page becomes the whole
    /// layer. Inactive records are removals.
    pub async fn apply_instances(
        &self,
        started: u64,
        batch: &[EntityInstance],
        replace: bool,
    ) -> StrataResult<bool> {
        let (ops, codes) = self.guarded(started, SyncLayer::EntityInstances, || {
            let (active, removed): (Vec<EntityInstance>, Vec<EntityInstance>) =
                batch.iter().cloned().partition(|i| i.active_flag);

            let mut ops = if replace {
                self.index.replace_instances(&active)?
            } else {
                self.index.upsert_instances(&active)?
            };
            for instance in &removed {
                if let Some(remove_ops) = self.index.remove_instance(&instance.entity_ref()) {
                    ops.extend(remove_ops);
                }
            }

            let codes: HashSet<String> = batch.iter().map(|i| i.entity_code.clone()).collect();
            Ok((ops, codes))
        })?;

        for entity_code in codes {
            self.notify(ChangeEvent::InstancesChanged { entity_code });
        }
        Ok(self.persist_confirmed(ops).await)
    }

    /// Apply a page of links. With `replace` the page rebuilds the graph;
    /// otherwise each link is applied on its own.
    pub async fn apply_links(
        &self,
        started: u64,
        links: &[EntityLink],
        replace: bool,
    ) -> StrataResult<bool> {
        let ops = self.guarded(started, SyncLayer::EntityLinks, || {
            let (_, ops) = self.index.update_graph(|graph| {
                if replace {
                    return graph.replace_all(links);
                }
                let mut changes = GraphChanges::default();
                for link in links {
                    changes.merge(graph.apply(link));
                }
                changes
            })?;
            Ok(ops)
        })?;

        if replace || !ops.is_empty() {
            self.notify(ChangeEvent::ListsInvalidated);
        }
        Ok(self.persist_confirmed(ops).await)
    }

    /// Merge a name side payload. `None` (no payload) is a no-op, as is an
    /// empty map. Returns how many names changed.
    pub fn merge_names(&self, started: u64, names: Option<&NameMap>) -> StrataResult<usize> {
        let Some(names) = names else {
            return Ok(0);
        };
        let ops = self.guarded(started, SyncLayer::EntityInstances, || {
            self.index.merge_names(names)
        })?;
        let changed = ops.len();
        if changed > 0 {
            self.persist(ops);
            self.notify(ChangeEvent::NamesChanged);
        }
        Ok(changed)
    }

    /// Record a completed sync cycle. The watermark only moves forward and
    /// only once its write is confirmed.
    pub async fn advance_sync(&self, stamp: SyncStamp) -> StrataResult<bool> {
        let advanced = match self.watermarks.prepare(stamp)? {
            Some(op) => {
                self.writer.submit_and_wait(vec![op]).await?;
                self.watermarks.commit(stamp)?
            }
            None => false,
        };
        write(&self.stale).remove(&stamp.layer);
        self.notify(ChangeEvent::LayerSynced { layer: stamp.layer });
        Ok(advanced)
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Mark a key outdated. Layers wait for `revalidate`; child lists stop
    /// being served from cache until fetched again.
    pub fn invalidate(&self, key: &CacheKey) {
        match key {
            CacheKey::Layer(layer) => self.mark_stale(*layer),
            CacheKey::ChildList { parent, child_code } => {
                let forward_key = ForwardKey {
                    parent: parent.clone(),
                    child_code: child_code.clone(),
                };
                match self
                    .index
                    .update_graph(|graph| graph.mark_partial(&forward_key))
                {
                    Ok((_, ops)) => self.persist(ops),
                    Err(e) => warn!(error = %e, "Child list invalidation not persisted"),
                }
                self.notify(ChangeEvent::LinksChanged {
                    parent: parent.clone(),
                    child_code: child_code.clone(),
                });
            }
            CacheKey::Entity(entity) => {
                self.mark_stale(SyncLayer::EntityInstances);
                self.notify(ChangeEvent::NeedsRefetch {
                    entity: entity.clone(),
                });
            }
        }
    }

    pub(crate) fn mark_stale(&self, layer: SyncLayer) {
        let fresh = write(&self.stale).insert(layer);
        if fresh {
            debug!(%layer, "Layer marked stale");
        }
        self.notify(ChangeEvent::LayerStale { layer });
    }

    /// Remove one instance from memory and store.
    pub fn remove_instance(&self, entity: &EntityRef) -> bool {
        match self.index.remove_instance(entity) {
            Some(ops) => {
                self.persist(ops);
                self.notify(ChangeEvent::InstanceRemoved {
                    entity: entity.clone(),
                });
                true
            }
            None => false,
        }
    }

    /// Upsert instances outside a sync cycle.
    pub(crate) fn upsert_instances(&self, batch: &[EntityInstance]) -> StrataResult<()> {
        let ops = self.index.upsert_instances(batch)?;
        self.persist(ops);
        let codes: HashSet<&str> = batch.iter().map(|i| i.entity_code.as_str()).collect();
        for entity_code in codes {
            self.notify(ChangeEvent::InstancesChanged {
                entity_code: entity_code.to_string(),
            });
        }
        Ok(())
    }

    /// Apply one link change outside a sync cycle.
    pub(crate) fn apply_link(&self, link: &EntityLink) -> StrataResult<GraphChanges> {
        let (changes, ops) = self.index.update_graph(|graph| graph.apply(link))?;
        self.persist(ops);
        self.notify(ChangeEvent::LinksChanged {
            parent: link.parent(),
            child_code: link.child_code.clone(),
        });
        self.notify(ChangeEvent::ListsInvalidated);
        Ok(changes)
    }

    // ------------------------------------------------------------------
    // Optimistic link patches
    // ------------------------------------------------------------------

    /// Apply a local link change before the server confirms it. Returns the
    /// operation id to confirm or roll back with.
    pub fn apply_optimistic(&self, patch: LinkPatch) -> StrataResult<Uuid> {
        let previous = self
            .index
            .with_graph(|graph| graph.link(&LinkKey::of(patch.link())).cloned());
        let patch = match patch {
            LinkPatch::Add(link) => LinkPatch::Add(EntityLink {
                active_flag: true,
                ..link
            }),
            LinkPatch::Remove(link) => LinkPatch::Remove(EntityLink {
                active_flag: false,
                ..link
            }),
        };

        self.apply_link(patch.link())?;
        let op_id = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(patch, previous);
        debug!(%op_id, "Optimistic link patch applied");
        Ok(op_id)
    }

    /// Undo an optimistic patch after its mutation failed. The edge goes
    /// back to what it was before the patch, not to the patch's opposite.
    pub fn rollback_optimistic(&self, op_id: &Uuid) -> StrataResult<()> {
        let pending = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(op_id)
            .ok_or_else(|| ValidationError::UnknownOperation {
                op_id: op_id.to_string(),
            })?;

        self.apply_link(&pending.restoring_change())?;
        info!(%op_id, "Optimistic link patch rolled back");
        Ok(())
    }

    /// Drop the tag of a patch the server acknowledged. Returns false when
    /// the id is unknown (already settled by a push message).
    pub fn confirm_optimistic(&self, op_id: &Uuid) -> bool {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(op_id)
            .is_some()
    }

    /// Ids of cached instances of one code, for push subscriptions.
    pub fn cached_ids(&self, entity_code: &str) -> Vec<String> {
        self.index
            .instances_of(entity_code)
            .into_iter()
            .map(|i| i.entity_instance_id)
            .collect()
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("generation", &self.generation())
            .field("links", &self.link_count())
            .finish()
    }
}
