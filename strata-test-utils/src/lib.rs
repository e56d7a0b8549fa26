//! Strata Test Utilities
//!
//! Centralized test infrastructure for the Strata workspace:
//! - A scripted mock of the remote system of record
//! - Proptest generators for the entity model
//! - Fixtures for common cache scenarios
//! - Assertions for Strata-specific error variants

pub use strata_cache::{
    CacheConfig, CacheManager, EntityTypesResponse, LinkGraph, ListQuery, ListResponse,
    RemoteSource, SyncPage, SyncQuery,
};
pub use strata_core::{
    EntityInstance, EntityLink, EntityRef, EntityType, NameMap, RemoteError, StrataError,
    StrataResult, Timestamp, ValidationError,
};
pub use strata_storage::{MemoryStore, PersistentStore};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ============================================================================
// MOCK REMOTE
// ============================================================================

/// One endpoint of the remote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    EntityTypes,
    EntityInstances,
    EntityLinks,
    List,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::EntityTypes => "entity-types",
            Endpoint::EntityInstances => "entity-instances",
            Endpoint::EntityLinks => "entity-links",
            Endpoint::List => "list",
        }
    }

    fn slot(&self) -> usize {
        match self {
            Endpoint::EntityTypes => 0,
            Endpoint::EntityInstances => 1,
            Endpoint::EntityLinks => 2,
            Endpoint::List => 3,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    types: Vec<EntityType>,
    instances: Vec<EntityInstance>,
    links: Vec<EntityLink>,
    delta_instances: Vec<EntityInstance>,
    delta_links: Vec<EntityLink>,
    lists: HashMap<(String, Option<EntityRef>), ListResponse>,
    failing: Vec<Endpoint>,
    synced_at: Option<Timestamp>,
    sync_queries: Vec<(Endpoint, SyncQuery)>,
}

/// Scripted in-memory remote source.
///
/// Sync endpoints page through the scripted records by `limit`/`offset`.
/// A query with `since` serves the separate delta script instead. List
/// requests are answered per `(entity_code, parent)`; unscripted lists are
/// empty. Every endpoint counts its calls and can be told to fail.
#[derive(Debug, Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
    calls: [AtomicUsize; 4],
}

fn page_of<T: Clone>(records: &[T], query: &SyncQuery, synced_at: Timestamp) -> SyncPage<T> {
    let end = records.len().min(query.offset.saturating_add(query.limit));
    let data = records
        .get(query.offset..end)
        .map(<[T]>::to_vec)
        .unwrap_or_default();
    SyncPage {
        data,
        synced_at,
        has_more: end < records.len(),
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_types(self, types: Vec<EntityType>) -> Self {
        self.state().types = types;
        self
    }

    pub fn with_instances(self, instances: Vec<EntityInstance>) -> Self {
        self.state().instances = instances;
        self
    }

    pub fn with_links(self, links: Vec<EntityLink>) -> Self {
        self.state().links = links;
        self
    }

    pub fn set_instances(&self, instances: Vec<EntityInstance>) {
        self.state().instances = instances;
    }

    pub fn set_links(&self, links: Vec<EntityLink>) {
        self.state().links = links;
    }

    /// Records served to queries carrying `since`.
    pub fn set_delta_instances(&self, instances: Vec<EntityInstance>) {
        self.state().delta_instances = instances;
    }

    pub fn set_delta_links(&self, links: Vec<EntityLink>) {
        self.state().delta_links = links;
    }

    pub fn set_list(&self, entity_code: &str, parent: Option<&EntityRef>, response: ListResponse) {
        self.state()
            .lists
            .insert((entity_code.to_string(), parent.cloned()), response);
    }

    /// Server time reported by every sync response.
    pub fn set_synced_at(&self, synced_at: Timestamp) {
        self.state().synced_at = Some(synced_at);
    }

    pub fn set_failing(&self, endpoint: Endpoint, failing: bool) {
        let mut state = self.state();
        state.failing.retain(|e| *e != endpoint);
        if failing {
            state.failing.push(endpoint);
        }
    }

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.calls[endpoint.slot()].load(Ordering::SeqCst)
    }

    /// Sync queries seen by one endpoint, in order.
    pub fn sync_queries(&self, endpoint: Endpoint) -> Vec<SyncQuery> {
        self.state()
            .sync_queries
            .iter()
            .filter(|(e, _)| *e == endpoint)
            .map(|(_, q)| *q)
            .collect()
    }

    fn enter(&self, endpoint: Endpoint) -> StrataResult<MutexGuard<'_, MockState>> {
        self.calls[endpoint.slot()].fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state.failing.contains(&endpoint) {
            return Err(RemoteError::RequestFailed {
                endpoint: endpoint.path().to_string(),
                status: 503,
                message: "scripted failure".to_string(),
            }
            .into());
        }
        Ok(state)
    }
}

#[async_trait]
impl RemoteSource for MockRemote {
    async fn fetch_entity_types(&self) -> StrataResult<EntityTypesResponse> {
        let state = self.enter(Endpoint::EntityTypes)?;
        Ok(EntityTypesResponse {
            data: state.types.clone(),
            synced_at: state.synced_at.unwrap_or_else(Utc::now),
        })
    }

    async fn fetch_entity_instances(
        &self,
        query: SyncQuery,
    ) -> StrataResult<SyncPage<EntityInstance>> {
        let mut state = self.enter(Endpoint::EntityInstances)?;
        state.sync_queries.push((Endpoint::EntityInstances, query));
        let synced_at = state.synced_at.unwrap_or_else(Utc::now);
        let records = if query.is_delta() {
            &state.delta_instances
        } else {
            &state.instances
        };
        Ok(page_of(records, &query, synced_at))
    }

    async fn fetch_entity_links(&self, query: SyncQuery) -> StrataResult<SyncPage<EntityLink>> {
        let mut state = self.enter(Endpoint::EntityLinks)?;
        state.sync_queries.push((Endpoint::EntityLinks, query));
        let synced_at = state.synced_at.unwrap_or_else(Utc::now);
        let records = if query.is_delta() {
            &state.delta_links
        } else {
            &state.links
        };
        Ok(page_of(records, &query, synced_at))
    }

    async fn list_entities(
        &self,
        entity_code: &str,
        query: &ListQuery,
    ) -> StrataResult<ListResponse> {
        let state = self.enter(Endpoint::List)?;
        let key = (entity_code.to_string(), query.parent());
        Ok(state.lists.get(&key).cloned().unwrap_or(ListResponse {
            data: Vec::new(),
            total: 0,
            names: None,
        }))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for the Strata entity model.

    use super::*;
    use proptest::prelude::*;

    /// Generate an entity code from a small fixed vocabulary so generated
    /// links collide often.
    pub fn arb_entity_code() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("project".to_string()),
            Just("task".to_string()),
            Just("form".to_string()),
            Just("artifact".to_string()),
        ]
    }

    /// Generate an instance id. Colons are legal inside ids.
    pub fn arb_entity_id() -> impl Strategy<Value = String> {
        prop_oneof![
            4 => (0u8..6).prop_map(|n| format!("id{}", n)),
            1 => Just("urn:x:1".to_string()),
        ]
    }

    pub fn arb_entity_ref() -> impl Strategy<Value = EntityRef> {
        (arb_entity_code(), arb_entity_id()).prop_map(|(code, id)| EntityRef::new(code, id))
    }

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1735689600i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_relationship() -> impl Strategy<Value = String> {
        prop_oneof![
            3 => Just("contains".to_string()),
            1 => Just("owns".to_string()),
        ]
    }

    /// Generate an active link.
    pub fn arb_entity_link() -> impl Strategy<Value = EntityLink> {
        (arb_entity_ref(), arb_entity_ref(), arb_relationship()).prop_map(
            |(parent, child, relationship)| {
                EntityLink::new(
                    parent.entity_code,
                    parent.entity_id,
                    child.entity_code,
                    child.entity_id,
                )
                .with_relationship(relationship)
            },
        )
    }

    /// Generate a link set with duplicates likely.
    pub fn arb_link_set(max: usize) -> impl Strategy<Value = Vec<EntityLink>> {
        prop::collection::vec(arb_entity_link(), 0..max)
    }

    pub fn arb_entity_instance(entity_code: &'static str) -> impl Strategy<Value = EntityInstance> {
        (arb_entity_id(), "[A-Za-z ]{1,24}", proptest::option::of(0i64..100)).prop_map(
            move |(id, name, order)| {
                let instance = EntityInstance::new(entity_code, id, name);
                match order {
                    Some(order) => instance.with_order(order),
                    None => instance,
                }
            },
        )
    }

    pub fn arb_name_map() -> impl Strategy<Value = NameMap> {
        prop::collection::vec((arb_entity_ref(), "[A-Za-z]{1,16}"), 0..12).prop_map(|entries| {
            let mut names = NameMap::new();
            for (entity, name) in entries {
                names
                    .entry(entity.entity_code)
                    .or_default()
                    .insert(entity.entity_id, name);
            }
            names
        })
    }

    /// Generate a delivery order of push versions.
    pub fn arb_version_sequence() -> impl Strategy<Value = Vec<u64>> {
        prop::collection::vec(1u64..50, 1..30)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common cache scenarios.

    use super::*;
    use std::sync::Arc;

    pub fn entity_type(code: &str, display_order: i32, children: &[&str]) -> EntityType {
        EntityType {
            code: code.to_string(),
            name: code.to_string(),
            ui_label: None,
            ui_icon: None,
            child_entity_codes: children.iter().map(|c| c.to_string()).collect(),
            display_order,
            active_flag: true,
        }
    }

    /// `project` parenting `task` and `form`.
    pub fn entity_types() -> Vec<EntityType> {
        vec![
            entity_type("project", 1, &["task", "form"]),
            entity_type("task", 2, &[]),
            entity_type("form", 3, &[]),
        ]
    }

    pub fn task(id: &str, name: &str) -> EntityInstance {
        EntityInstance::new("task", id, name)
    }

    /// Tasks t1, t2, t3.
    pub fn three_tasks() -> Vec<EntityInstance> {
        vec![
            task("t1", "Draft charter"),
            task("t2", "Review budget"),
            task("t3", "Book venue"),
        ]
    }

    pub fn link(parent: &EntityRef, child: &EntityRef) -> EntityLink {
        EntityLink::new(
            &parent.entity_code,
            &parent.entity_id,
            &child.entity_code,
            &child.entity_id,
        )
    }

    pub fn names(entries: &[(&str, &str, &str)]) -> NameMap {
        let mut names = NameMap::new();
        for (code, id, name) in entries {
            names
                .entry(code.to_string())
                .or_default()
                .insert(id.to_string(), name.to_string());
        }
        names
    }

    pub fn list_response(rows: Vec<serde_json::Value>, total: usize) -> ListResponse {
        ListResponse {
            data: rows,
            total,
            names: None,
        }
    }

    /// Open a cache over an in-memory store.
    pub async fn memory_cache() -> (Arc<MemoryStore>, Arc<CacheManager>) {
        let store = Arc::new(MemoryStore::new());
        let cache = open_cache(store.clone(), CacheConfig::default()).await;
        (store, cache)
    }

    /// Open a cache over any store.
    ///
    /// # Panics
    ///
    /// Panics when the cache cannot be opened.
    pub async fn open_cache(
        store: Arc<dyn PersistentStore>,
        config: CacheConfig,
    ) -> Arc<CacheManager> {
        match CacheManager::open(store, config).await {
            Ok(cache) => cache,
            Err(e) => panic!("cache should open: {}", e),
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for Strata-specific validation.

    use super::*;

    /// Assert that a result is Ok.
    pub fn assert_ok<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a result is Err.
    pub fn assert_err<T: std::fmt::Debug>(result: &StrataResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    /// Assert that a result was rejected as belonging to a cleared session.
    pub fn assert_stale_generation<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Remote(RemoteError::StaleGeneration { .. })) => {}
            other => panic!("Expected StaleGeneration, got {:?}", other),
        }
    }

    pub fn assert_validation_error<T: std::fmt::Debug>(result: &StrataResult<T>) {
        match result {
            Err(StrataError::Validation(_)) => {}
            other => panic!("Expected ValidationError, got {:?}", other),
        }
    }

    /// Assert that both link indexes agree with the raw links.
    pub fn assert_symmetric(graph: &LinkGraph) {
        assert!(graph.is_symmetric(), "Link indexes diverged from raw links");
    }
}
