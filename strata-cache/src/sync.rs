//! Sync engine.
//!
//! Drives the layered fetchers through complete sync cycles. A cycle keeps
//! the `since` it started with for every page and advances the layer's
//! watermark only after the final page, and only if every page of the cycle
//! reached the store. A cycle that fails part way leaves the watermark
//! alone so the next cycle asks for the same window again.

use std::sync::Arc;

use strata_core::{StrataError, StrataResult, SyncLayer, SyncStamp, Timestamp};
use tracing::{error, info, warn};

use crate::fetchers::{EntityInstanceFetcher, EntityLinkFetcher, EntityTypeFetcher, PageRequest};
use crate::manager::{CacheKey, CacheManager};
use crate::remote::{ListQuery, RemoteSource};
use crate::resolver::DerivedListResolver;

/// Outcome of one completed layer cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub layer: SyncLayer,
    pub delta: bool,
    pub pages: usize,
    pub records: usize,
    pub synced_at: Option<Timestamp>,
    /// Whether the stored watermark moved.
    pub advanced: bool,
}

/// Outcome of a sync of every layer.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub reports: Vec<SyncReport>,
    pub failures: Vec<(SyncLayer, StrataError)>,
}

impl SyncSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, layer: SyncLayer, result: StrataResult<SyncReport>) {
        match result {
            Ok(report) => self.reports.push(report),
            Err(e) => self.failures.push((layer, e)),
        }
    }
}

pub struct SyncEngine {
    cache: Arc<CacheManager>,
    types: EntityTypeFetcher,
    instances: EntityInstanceFetcher,
    links: EntityLinkFetcher,
    resolver: DerivedListResolver,
}

impl SyncEngine {
    pub fn new(cache: Arc<CacheManager>, remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            types: EntityTypeFetcher::new(cache.clone(), remote.clone()),
            instances: EntityInstanceFetcher::new(cache.clone(), remote.clone()),
            links: EntityLinkFetcher::new(cache.clone(), remote.clone()),
            resolver: DerivedListResolver::new(cache.clone(), remote),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn resolver(&self) -> &DerivedListResolver {
        &self.resolver
    }

    /// Run one full cycle of a layer. The layer reads as loading for the
    /// duration, error or not.
    pub async fn sync_layer(&self, layer: SyncLayer) -> StrataResult<SyncReport> {
        self.cache.set_loading(layer, true);
        let result = self.run_cycle(layer).await;
        self.cache.set_loading(layer, false);

        match &result {
            Ok(report) => info!(
                %layer,
                delta = report.delta,
                pages = report.pages,
                records = report.records,
                advanced = report.advanced,
                "Layer synced"
            ),
            Err(e) if e.is_transient() => warn!(%layer, error = %e, "Layer sync failed; will retry"),
            Err(e) => error!(%layer, error = %e, "Layer sync failed"),
        }
        result
    }

    async fn run_cycle(&self, layer: SyncLayer) -> StrataResult<SyncReport> {
        let generation = self.cache.generation();
        let since = if layer.supports_delta() {
            self.cache.last_sync(layer)
        } else {
            None
        };

        let mut report = SyncReport {
            layer,
            delta: since.is_some() && self.cache.config().delta_sync,
            pages: 0,
            records: 0,
            synced_at: None,
            advanced: false,
        };
        let mut persisted = true;
        let mut offset = 0;

        loop {
            let request = PageRequest {
                generation,
                since,
                offset,
            };
            let (count, synced_at, has_more, page_persisted) = match layer {
                SyncLayer::EntityTypes => {
                    let outcome = self.types.fetch(generation).await?;
                    (outcome.records.len(), outcome.synced_at, false, outcome.persisted)
                }
                SyncLayer::EntityInstances => {
                    let outcome = self.instances.fetch_page(request).await?;
                    (outcome.records.len(), outcome.synced_at, outcome.has_more, outcome.persisted)
                }
                SyncLayer::EntityLinks => {
                    let outcome = self.links.fetch_page(request).await?;
                    (outcome.records.len(), outcome.synced_at, outcome.has_more, outcome.persisted)
                }
            };

            report.pages += 1;
            report.records += count;
            report.synced_at = Some(synced_at);
            persisted &= page_persisted;

            if !has_more || count == 0 {
                break;
            }
            offset += count;
        }

        match (persisted, report.synced_at) {
            (true, Some(synced_at)) => {
                report.advanced = self
                    .cache
                    .advance_sync(SyncStamp::new(layer, synced_at))
                    .await?;
            }
            _ => warn!(%layer, "Store rejected part of the cycle; watermark not advanced"),
        }
        Ok(report)
    }

    /// Sync every layer: types, then instances, then links. A failing
    /// layer does not stop the others.
    pub async fn sync_all(&self) -> SyncSummary {
        let mut summary = SyncSummary::default();
        for layer in SyncLayer::ALL {
            summary.record(layer, self.sync_layer(layer).await);
        }
        summary
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.cache.invalidate(key);
    }

    /// Refresh whatever `key` names from the server.
    pub async fn revalidate(&self, key: &CacheKey) -> StrataResult<()> {
        match key {
            CacheKey::Layer(layer) => {
                self.sync_layer(*layer).await?;
            }
            CacheKey::ChildList { parent, child_code } => {
                let query = ListQuery::under(parent, self.cache.config().page_size, 0);
                self.resolver.resolve_list(child_code, &query).await?;
            }
            CacheKey::Entity(_) => {
                self.sync_layer(SyncLayer::EntityInstances).await?;
            }
        }
        Ok(())
    }

    /// Sync every layer currently marked stale.
    pub async fn revalidate_stale(&self) -> SyncSummary {
        let mut summary = SyncSummary::default();
        for layer in self.cache.stale_layers() {
            summary.record(layer, self.sync_layer(layer).await);
        }
        summary
    }
}
