//! Change notifications for cache consumers.
//!
//! The cache never pushes data into consumers. It announces what changed
//! and consumers re-read through the synchronous getters.

use strata_core::{EntityRef, SyncLayer};
use tokio::sync::broadcast;
use tracing::debug;

/// What changed in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The entity-type layer was replaced.
    TypesReplaced,
    /// Instances of one code were added, updated, or removed.
    InstancesChanged { entity_code: String },
    /// One instance was removed.
    InstanceRemoved { entity: EntityRef },
    /// An instance changed upstream and the cached copy is outdated.
    NeedsRefetch { entity: EntityRef },
    /// Display names changed.
    NamesChanged,
    /// Child lists of one parent/child-type pair changed.
    LinksChanged { parent: EntityRef, child_code: String },
    /// Every derived list may be outdated.
    ListsInvalidated,
    /// A layer was marked stale and awaits revalidation.
    LayerStale { layer: SyncLayer },
    /// A layer finished a sync cycle.
    LayerSynced { layer: SyncLayer },
    /// A draft was created, edited, or removed.
    DraftChanged { entity: EntityRef },
    /// The whole cache was cleared (logout).
    Cleared,
}

impl ChangeEvent {
    /// Short event name for logs.
    pub fn event_type(&self) -> &'static str {
        match self {
            ChangeEvent::TypesReplaced => "types_replaced",
            ChangeEvent::InstancesChanged { .. } => "instances_changed",
            ChangeEvent::InstanceRemoved { .. } => "instance_removed",
            ChangeEvent::NeedsRefetch { .. } => "needs_refetch",
            ChangeEvent::NamesChanged => "names_changed",
            ChangeEvent::LinksChanged { .. } => "links_changed",
            ChangeEvent::ListsInvalidated => "lists_invalidated",
            ChangeEvent::LayerStale { .. } => "layer_stale",
            ChangeEvent::LayerSynced { .. } => "layer_synced",
            ChangeEvent::DraftChanged { .. } => "draft_changed",
            ChangeEvent::Cleared => "cleared",
        }
    }
}

/// Fan-out of [`ChangeEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Announce a change. Never blocks; with no subscribers the event is
    /// simply dropped.
    pub fn emit(&self, event: ChangeEvent) {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(event_type, receivers, "Cache change emitted");
            }
            Err(_) => {
                debug!(event_type, "No subscribers for cache change");
            }
        }
    }

    /// Subscribe to future changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}
