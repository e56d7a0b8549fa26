//! Remote read endpoints consumed by the cache.
//!
//! One explicit response type per endpoint. The name side payload is an
//! `Option` so "no names sent" and "names sent, none listed" stay distinct.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_core::{
    EntityInstance, EntityLink, EntityRef, EntityType, NameMap, StrataResult, Timestamp,
};

/// `GET entity-types`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTypesResponse {
    pub data: Vec<EntityType>,
    pub synced_at: Timestamp,
}

/// One page of a sync endpoint (`entity-instances`, `entity-links`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPage<T> {
    pub data: Vec<T>,
    pub synced_at: Timestamp,
    #[serde(default)]
    pub has_more: bool,
}

/// `GET <entityCode>` list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub data: Vec<Value>,
    pub total: usize,
    #[serde(default)]
    pub names: Option<NameMap>,
}

/// Query for one page of a sync endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncQuery {
    /// Only records changed after this time. `None` requests everything.
    pub since: Option<Timestamp>,
    pub limit: usize,
    pub offset: usize,
}

impl SyncQuery {
    pub fn is_delta(&self) -> bool {
        self.since.is_some()
    }
}

/// Filter and window of a per-type list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub parent_code: Option<String>,
    pub parent_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ListQuery {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            parent_code: None,
            parent_id: None,
            limit,
            offset,
        }
    }

    pub fn under(parent: &EntityRef, limit: usize, offset: usize) -> Self {
        Self {
            parent_code: Some(parent.entity_code.clone()),
            parent_id: Some(parent.entity_id.clone()),
            limit,
            offset,
        }
    }

    /// The parent filter, when both halves are present.
    pub fn parent(&self) -> Option<EntityRef> {
        match (&self.parent_code, &self.parent_id) {
            (Some(code), Some(id)) => Some(EntityRef::new(code, id)),
            _ => None,
        }
    }
}

/// The remote system of record.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_entity_types(&self) -> StrataResult<EntityTypesResponse>;

    async fn fetch_entity_instances(&self, query: SyncQuery)
        -> StrataResult<SyncPage<EntityInstance>>;

    async fn fetch_entity_links(&self, query: SyncQuery) -> StrataResult<SyncPage<EntityLink>>;

    async fn list_entities(&self, entity_code: &str, query: &ListQuery)
        -> StrataResult<ListResponse>;
}
