//! Derived list resolver.
//!
//! Answers "instances of type T, optionally under parent P" from the cache
//! when the cache can prove the answer, and falls back to the per-type list
//! endpoint otherwise. A fallback response is written back into every layer
//! it touches so the next identical request is a cache hit.

use std::sync::Arc;

use strata_core::{EntityInstance, ForwardKey, StrataResult, SyncLayer};
use tracing::{debug, warn};

use crate::fetchers::EntityNameMerger;
use crate::link_graph::PageCoverage;
use crate::manager::CacheManager;
use crate::notify::ChangeEvent;
use crate::remote::{ListQuery, ListResponse, RemoteSource};

/// Where a resolved list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListSource {
    Cache,
    Api,
}

/// One page of a resolved list.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedList {
    pub data: Vec<EntityInstance>,
    /// Size of the whole list, not of this page.
    pub total: usize,
    pub source: ListSource,
}

fn paginate(list: Vec<EntityInstance>, query: &ListQuery) -> ResolvedList {
    let total = list.len();
    let data = list
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect();
    ResolvedList {
        data,
        total,
        source: ListSource::Cache,
    }
}

pub struct DerivedListResolver {
    cache: Arc<CacheManager>,
    remote: Arc<dyn RemoteSource>,
    names: EntityNameMerger,
}

impl DerivedListResolver {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteSource>) -> Self {
        let names = EntityNameMerger::new(cache.clone());
        Self {
            cache,
            remote,
            names,
        }
    }

    /// Resolve a list, from cache when possible.
    pub async fn resolve_list(
        &self,
        entity_code: &str,
        query: &ListQuery,
    ) -> StrataResult<ResolvedList> {
        if let Some(hit) = self.derive(entity_code, query) {
            return Ok(hit);
        }

        debug!(
            entity_code,
            parent = ?query.parent(),
            offset = query.offset,
            "List cache miss; fetching"
        );
        let generation = self.cache.generation();
        let response = self.remote.list_entities(entity_code, query).await?;
        let data = self.back_fill(generation, entity_code, query, &response)?;

        Ok(ResolvedList {
            data,
            total: response.total,
            source: ListSource::Api,
        })
    }

    /// Derive a list from cache only. `None` is a miss.
    ///
    /// With a parent filter only a complete forward record counts. An
    /// empty complete record is a valid hit with zero rows.
    pub fn derive(&self, entity_code: &str, query: &ListQuery) -> Option<ResolvedList> {
        if self.cache.instance_count(entity_code) == 0
            || self.cache.is_loading(SyncLayer::EntityInstances)
        {
            return None;
        }

        let Some(parent) = query.parent() else {
            return Some(paginate(self.cache.instances(entity_code), query));
        };

        let record = self
            .cache
            .forward_record(&ForwardKey {
                parent,
                child_code: entity_code.to_string(),
            })
            .filter(|record| record.is_complete())?;
        let children = self
            .cache
            .index()
            .instances_by_ids(entity_code, &record.child_ids);
        Some(paginate(children, query))
    }

    /// Write a list response into the name, instance, and link layers.
    /// Returns the instances the response carried, in response order.
    fn back_fill(
        &self,
        generation: u64,
        entity_code: &str,
        query: &ListQuery,
        response: &ListResponse,
    ) -> StrataResult<Vec<EntityInstance>> {
        self.names.merge(generation, response.names.as_ref())?;

        let instances: Vec<EntityInstance> = response
            .data
            .iter()
            .filter_map(|row| {
                let instance = EntityInstance::from_row(entity_code, row);
                if instance.is_none() {
                    warn!(entity_code, "Skipping list row without an id");
                }
                instance
            })
            .collect();

        let parent = query.parent();
        let ops = self.cache.guarded(generation, SyncLayer::EntityInstances, || {
            let index = self.cache.index();
            let mut ops = index.upsert_instances(&instances)?;
            if let Some(parent) = &parent {
                let ids: Vec<String> = instances
                    .iter()
                    .map(|i| i.entity_instance_id.clone())
                    .collect();
                let coverage = PageCoverage {
                    offset: query.offset,
                    total: response.total,
                };
                let (_, link_ops) = index.update_graph(|graph| {
                    graph.record_child_page(parent, entity_code, &ids, coverage)
                })?;
                ops.extend(link_ops);
            }
            Ok(ops)
        })?;

        self.cache.persist(ops);
        if !instances.is_empty() {
            self.cache.notify(ChangeEvent::InstancesChanged {
                entity_code: entity_code.to_string(),
            });
        }
        if let Some(parent) = parent {
            self.cache.notify(ChangeEvent::LinksChanged {
                parent,
                child_code: entity_code.to_string(),
            });
        }
        Ok(instances)
    }
}
