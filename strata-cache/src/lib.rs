//! Strata Cache - Normalized Entity Cache
//!
//! A layered, normalized cache of entity types, instances, display names,
//! and parent -> child links, kept consistent with a remote system of record
//! through delta sync and push invalidation.
//!
//! # Layers
//!
//! - [`MemoryIndex`]: synchronous maps answering every lookup without I/O
//! - [`LinkGraph`]: raw links with their forward and reverse projections
//! - [`DraftStore`]: per-entity edit buffers with undo/redo
//!
//! [`CacheManager`] owns all of them for one session. [`SyncEngine`] drives
//! the layered fetchers, [`DerivedListResolver`] answers list queries, and
//! [`CacheManager::apply_push`] folds push-channel messages in.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheManager::open(store, CacheConfig::default()).await?;
//! let engine = SyncEngine::new(cache.clone(), remote);
//! engine.sync_all().await;
//!
//! let tasks = engine
//!     .resolver()
//!     .resolve_list("task", &ListQuery::under(&project, 50, 0))
//!     .await?;
//! ```

pub mod config;
pub mod drafts;
pub mod fetchers;
pub mod index;
pub mod invalidation;
pub mod link_graph;
pub mod manager;
pub mod notify;
pub mod optimistic;
pub mod push;
pub mod remote;
pub mod resolver;
pub mod sync;

pub use config::CacheConfig;
pub use drafts::{Draft, DraftStore, DraftSummary};
pub use fetchers::{
    EntityInstanceFetcher, EntityLinkFetcher, EntityNameMerger, EntityTypeFetcher, FetchOutcome,
    PageRequest,
};
pub use index::{IndexSnapshot, MemoryIndex};
pub use invalidation::PushOutcome;
pub use link_graph::{GraphChanges, LinkGraph, PageCoverage};
pub use manager::{CacheKey, CacheManager, UNKNOWN_NAME};
pub use notify::{ChangeEvent, ChangeNotifier};
pub use optimistic::{LinkPatch, OptimisticLedger, PendingPatch};
pub use push::{
    ChangeAction, EntityChange, InvalidatePayload, LinkChangePayload, NormalizedPayload,
    PushMessage, SubscriptionPayload, TokenExpiryPayload, TokenPayload, VersionTracker,
};
pub use remote::{
    EntityTypesResponse, ListQuery, ListResponse, RemoteSource, SyncPage, SyncQuery,
};
pub use resolver::{DerivedListResolver, ListSource, ResolvedList};
pub use sync::{SyncEngine, SyncReport, SyncSummary};
