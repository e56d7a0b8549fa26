//! Layered fetchers.
//!
//! One fetcher per remote sync endpoint plus the name merger. Fetchers are
//! stateless per call: each call fetches one page, applies it to memory and
//! store, and reports whether the store accepted it. Paging and sync
//! watermarks belong to the caller (`SyncEngine`).

use std::sync::Arc;

use strata_core::{EntityInstance, EntityLink, EntityType, NameMap, StrataResult, Timestamp};
use tracing::{debug, warn};

use crate::manager::CacheManager;
use crate::remote::{RemoteSource, SyncQuery};

/// Result of one fetch call.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<T> {
    pub records: Vec<T>,
    /// Server time the page was produced at.
    pub synced_at: Timestamp,
    pub has_more: bool,
    /// Whether every write of this page reached the store.
    pub persisted: bool,
}

/// Window of one page. `since` is dropped when delta sync is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Generation the enclosing sync cycle started under.
    pub generation: u64,
    pub since: Option<Timestamp>,
    pub offset: usize,
}

impl PageRequest {
    fn query(&self, cache: &CacheManager) -> SyncQuery {
        let config = cache.config();
        SyncQuery {
            since: self.since.filter(|_| config.delta_sync),
            limit: config.page_size,
            offset: self.offset,
        }
    }
}

/// Fetches the entity-type layer. Types are always fetched in full and
/// replace the layer.
pub struct EntityTypeFetcher {
    cache: Arc<CacheManager>,
    remote: Arc<dyn RemoteSource>,
}

impl EntityTypeFetcher {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteSource>) -> Self {
        Self { cache, remote }
    }

    pub async fn fetch_all(&self) -> StrataResult<FetchOutcome<EntityType>> {
        self.fetch(self.cache.generation()).await
    }

    pub async fn fetch(&self, generation: u64) -> StrataResult<FetchOutcome<EntityType>> {
        let response = self.remote.fetch_entity_types().await?;
        let persisted = self
            .cache
            .apply_entity_types(generation, &response.data)
            .await?;
        debug!(types = response.data.len(), persisted, "Entity types fetched");
        Ok(FetchOutcome {
            records: response.data,
            synced_at: response.synced_at,
            has_more: false,
            persisted,
        })
    }
}

/// Fetches the entity-instance layer.
pub struct EntityInstanceFetcher {
    cache: Arc<CacheManager>,
    remote: Arc<dyn RemoteSource>,
}

impl EntityInstanceFetcher {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteSource>) -> Self {
        Self { cache, remote }
    }

    /// First page changed after `since`, or of everything without it.
    pub async fn fetch_all(
        &self,
        since: Option<Timestamp>,
    ) -> StrataResult<FetchOutcome<EntityInstance>> {
        self.fetch_page(PageRequest {
            generation: self.cache.generation(),
            since,
            offset: 0,
        })
        .await
    }

    /// One page. A full fetch replaces the layer on its first page and
    /// extends it afterwards; a delta page is merged.
    pub async fn fetch_page(
        &self,
        request: PageRequest,
    ) -> StrataResult<FetchOutcome<EntityInstance>> {
        let query = request.query(&self.cache);
        let page = self.remote.fetch_entity_instances(query).await?;
        let replace = !query.is_delta() && query.offset == 0;

        let persisted = self
            .cache
            .apply_instances(request.generation, &page.data, replace)
            .await?;
        if !persisted {
            warn!(offset = query.offset, "Instance page not persisted");
        }
        debug!(
            instances = page.data.len(),
            delta = query.is_delta(),
            offset = query.offset,
            has_more = page.has_more,
            "Entity instances fetched"
        );
        Ok(FetchOutcome {
            records: page.data,
            synced_at: page.synced_at,
            has_more: page.has_more,
            persisted,
        })
    }
}

/// Fetches raw links and maintains the forward and reverse indexes.
pub struct EntityLinkFetcher {
    cache: Arc<CacheManager>,
    remote: Arc<dyn RemoteSource>,
}

impl EntityLinkFetcher {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteSource>) -> Self {
        Self { cache, remote }
    }

    pub async fn fetch_all(&self, since: Option<Timestamp>) -> StrataResult<FetchOutcome<EntityLink>> {
        self.fetch_page(PageRequest {
            generation: self.cache.generation(),
            since,
            offset: 0,
        })
        .await
    }

    /// One page. The first page of a full fetch rebuilds both indexes;
    /// every other page applies its links one by one.
    pub async fn fetch_page(&self, request: PageRequest) -> StrataResult<FetchOutcome<EntityLink>> {
        let query = request.query(&self.cache);
        let page = self.remote.fetch_entity_links(query).await?;
        let replace = !query.is_delta() && query.offset == 0;

        let persisted = self
            .cache
            .apply_links(request.generation, &page.data, replace)
            .await?;
        if !persisted {
            warn!(offset = query.offset, "Link page not persisted");
        }
        debug!(
            links = page.data.len(),
            delta = query.is_delta(),
            rebuild = replace,
            has_more = page.has_more,
            "Entity links fetched"
        );
        Ok(FetchOutcome {
            records: page.data,
            synced_at: page.synced_at,
            has_more: page.has_more,
            persisted,
        })
    }
}

/// Merges name side payloads into the name layer.
pub struct EntityNameMerger {
    cache: Arc<CacheManager>,
}

impl EntityNameMerger {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }

    /// Merge one payload. An absent payload and an empty one both leave
    /// existing names alone. Returns how many names changed.
    pub fn merge(&self, generation: u64, names: Option<&NameMap>) -> StrataResult<usize> {
        if names.is_none() {
            debug!("Response carried no name payload");
        }
        self.cache.merge_names(generation, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use strata_core::{EntityRef, ForwardKey};
    use strata_storage::MemoryStore;

    use crate::config::CacheConfig;
    use crate::remote::{EntityTypesResponse, ListQuery, ListResponse, SyncPage};

    /// Serves fixed pages and records the queries it saw.
    #[derive(Default)]
    struct PagedRemote {
        instance_pages: Vec<SyncPage<EntityInstance>>,
        link_pages: Vec<SyncPage<EntityLink>>,
        queries: Mutex<Vec<SyncQuery>>,
    }

    fn page_for<T: Clone>(pages: &[SyncPage<T>], query: &SyncQuery) -> SyncPage<T> {
        let index = query.offset / query.limit.max(1);
        pages[index.min(pages.len() - 1)].clone()
    }

    #[async_trait]
    impl RemoteSource for PagedRemote {
        async fn fetch_entity_types(&self) -> StrataResult<EntityTypesResponse> {
            Ok(EntityTypesResponse {
                data: Vec::new(),
                synced_at: at(0),
            })
        }

        async fn fetch_entity_instances(
            &self,
            query: SyncQuery,
        ) -> StrataResult<SyncPage<EntityInstance>> {
            self.queries.lock().unwrap().push(query);
            Ok(page_for(&self.instance_pages, &query))
        }

        async fn fetch_entity_links(&self, query: SyncQuery) -> StrataResult<SyncPage<EntityLink>> {
            self.queries.lock().unwrap().push(query);
            Ok(page_for(&self.link_pages, &query))
        }

        async fn list_entities(
            &self,
            _entity_code: &str,
            _query: &ListQuery,
        ) -> StrataResult<ListResponse> {
            Ok(ListResponse {
                data: Vec::new(),
                total: 0,
                names: None,
            })
        }
    }

    fn at(minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap()
    }

    fn page<T>(data: Vec<T>, has_more: bool) -> SyncPage<T> {
        SyncPage {
            data,
            synced_at: at(5),
            has_more,
        }
    }

    async fn cache_with(config: CacheConfig) -> Arc<CacheManager> {
        CacheManager::open(Arc::new(MemoryStore::new()), config)
            .await
            .expect("open should succeed")
    }

    #[tokio::test]
    async fn test_full_instance_fetch_replaces_then_extends() {
        let cache = cache_with(CacheConfig::default().with_page_size(1)).await;
        cache
            .apply_instances(cache.generation(), &[EntityInstance::new("task", "old", "gone")], false)
            .await
            .expect("apply should succeed");

        let remote = Arc::new(PagedRemote {
            instance_pages: vec![
                page(vec![EntityInstance::new("task", "t1", "a")], true),
                page(vec![EntityInstance::new("task", "t2", "b")], false),
            ],
            ..PagedRemote::default()
        });
        let fetcher = EntityInstanceFetcher::new(cache.clone(), remote);
        let generation = cache.generation();

        let first = fetcher
            .fetch_page(PageRequest { generation, since: None, offset: 0 })
            .await
            .expect("fetch should succeed");
        assert!(first.has_more);
        fetcher
            .fetch_page(PageRequest { generation, since: None, offset: 1 })
            .await
            .expect("fetch should succeed");

        let ids: Vec<_> = cache
            .instances("task")
            .into_iter()
            .map(|i| i.entity_instance_id)
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn test_delta_disabled_drops_since() {
        let cache = cache_with(CacheConfig::default().with_delta_sync(false)).await;
        let remote = Arc::new(PagedRemote {
            instance_pages: vec![page(Vec::new(), false)],
            ..PagedRemote::default()
        });
        let fetcher = EntityInstanceFetcher::new(cache, remote.clone());

        fetcher.fetch_all(Some(at(1))).await.expect("fetch should succeed");
        let queries = remote.queries.lock().unwrap();
        assert_eq!(queries[0].since, None);
    }

    #[tokio::test]
    async fn test_delta_inactive_instance_is_removed() {
        let cache = cache_with(CacheConfig::default()).await;
        cache
            .apply_instances(
                cache.generation(),
                &[EntityInstance::new("task", "t1", "a"), EntityInstance::new("task", "t2", "b")],
                false,
            )
            .await
            .expect("apply should succeed");

        let mut removed = EntityInstance::new("task", "t1", "a");
        removed.active_flag = false;
        let remote = Arc::new(PagedRemote {
            instance_pages: vec![page(vec![removed], false)],
            ..PagedRemote::default()
        });
        let fetcher = EntityInstanceFetcher::new(cache.clone(), remote);
        fetcher.fetch_all(Some(at(1))).await.expect("fetch should succeed");

        assert!(cache.instance(&EntityRef::new("task", "t1")).is_none());
        assert!(cache.instance(&EntityRef::new("task", "t2")).is_some());
    }

    #[tokio::test]
    async fn test_full_link_fetch_rebuilds_indexes() {
        let cache = cache_with(CacheConfig::default()).await;
        cache
            .apply_links(
                cache.generation(),
                &[EntityLink::new("project", "P0", "task", "stale")],
                false,
            )
            .await
            .expect("apply should succeed");

        let remote = Arc::new(PagedRemote {
            link_pages: vec![page(
                vec![
                    EntityLink::new("project", "P1", "task", "t1"),
                    EntityLink::new("project", "P1", "task", "t1"),
                    EntityLink::new("project", "P1", "task", "t2"),
                ],
                false,
            )],
            ..PagedRemote::default()
        });
        let fetcher = EntityLinkFetcher::new(cache.clone(), remote);
        let outcome = fetcher.fetch_all(None).await.expect("fetch should succeed");

        assert!(outcome.persisted);
        assert!(cache
            .forward_record(&ForwardKey::new("project", "P0", "task"))
            .is_none());
        assert_eq!(
            cache.children(&EntityRef::new("project", "P1"), "task"),
            Some(vec!["t1".to_string(), "t2".to_string()])
        );
    }

    #[tokio::test]
    async fn test_name_merger_leaves_existing_names_on_empty_payload() {
        let cache = cache_with(CacheConfig::default()).await;
        let merger = EntityNameMerger::new(cache.clone());
        let generation = cache.generation();

        let mut names = NameMap::new();
        names
            .entry("project".to_string())
            .or_default()
            .insert("P1".to_string(), "Apollo".to_string());
        assert_eq!(merger.merge(generation, Some(&names)).expect("merge"), 1);
        assert_eq!(merger.merge(generation, None).expect("merge"), 0);
        assert_eq!(merger.merge(generation, Some(&NameMap::new())).expect("merge"), 0);
        assert_eq!(
            cache.display_name(&EntityRef::new("project", "P1")),
            "Apollo"
        );
    }
}
