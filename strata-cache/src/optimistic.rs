//! Two-phase optimistic link patches.
//!
//! A link added or removed locally is applied to the indexes immediately
//! and tagged with a local operation id. When the server's own link change
//! for the same edge arrives, the server state is applied and the tag is
//! dropped. A failed mutation rolls the patch back by id, restoring the
//! edge as it was captured when the patch was applied.

use std::collections::HashMap;

use chrono::Utc;
use strata_core::{EntityLink, LinkKey, Timestamp};
use uuid::Uuid;

/// Local link mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPatch {
    Add(EntityLink),
    Remove(EntityLink),
}

impl LinkPatch {
    pub fn link(&self) -> &EntityLink {
        match self {
            LinkPatch::Add(link) | LinkPatch::Remove(link) => link,
        }
    }
}

/// A patch, the edge it replaced, and when it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPatch {
    pub op_id: Uuid,
    pub patch: LinkPatch,
    /// The edge before the patch; `None` when it did not exist.
    pub previous: Option<EntityLink>,
    pub applied_at: Timestamp,
}

impl PendingPatch {
    /// The link change that puts the edge back to `previous`.
    pub fn restoring_change(&self) -> EntityLink {
        match &self.previous {
            Some(link) => EntityLink {
                active_flag: true,
                ..link.clone()
            },
            None => EntityLink {
                active_flag: false,
                ..self.patch.link().clone()
            },
        }
    }
}

/// Outstanding optimistic patches by operation id.
#[derive(Debug, Default)]
pub struct OptimisticLedger {
    pending: HashMap<Uuid, PendingPatch>,
}

impl OptimisticLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag a patch with a fresh operation id.
    pub fn record(&mut self, patch: LinkPatch, previous: Option<EntityLink>) -> Uuid {
        let op_id = Uuid::now_v7();
        self.pending.insert(
            op_id,
            PendingPatch {
                op_id,
                patch,
                previous,
                applied_at: Utc::now(),
            },
        );
        op_id
    }

    /// Remove and return a pending patch.
    pub fn take(&mut self, op_id: &Uuid) -> Option<PendingPatch> {
        self.pending.remove(op_id)
    }

    /// Drop every patch touching the same edge as a server-confirmed
    /// change. Returns the dropped patches.
    pub fn settle(&mut self, key: &LinkKey) -> Vec<PendingPatch> {
        let matching: Vec<Uuid> = self
            .pending
            .values()
            .filter(|p| &LinkKey::of(p.patch.link()) == key)
            .map(|p| p.op_id)
            .collect();
        let mut settled: Vec<PendingPatch> = matching
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect();
        settled.sort_by_key(|p| p.op_id);
        settled
    }

    pub fn get(&self, op_id: &Uuid) -> Option<&PendingPatch> {
        self.pending.get(op_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
