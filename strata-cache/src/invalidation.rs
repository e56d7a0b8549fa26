//! Applying push-channel messages to the cache.
//!
//! Per-entity changes are filtered through the version tracker so a stale
//! or replayed message never rolls state back. Link changes mutate both
//! link indexes incrementally and reconcile pending optimistic patches.
//! Every path is idempotent.

use std::sync::PoisonError;

use serde_json::Value;
use strata_core::{
    EntityInstance, EntityLink, EntityRef, LinkKey, NameMap, StrataResult, SyncLayer,
};
use tracing::{debug, info, warn};

use crate::manager::CacheManager;
use crate::notify::ChangeEvent;
use crate::push::{ChangeAction, EntityChange, NormalizedPayload, PushMessage};

const INSTANCE_TABLE: &str = "entity_instance";
const LINK_TABLE: &str = "entity_instance_link";
const TYPE_TABLES: [&str; 2] = ["entity", "entity_type"];

/// What one push message did to the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Changes applied to memory and store.
    pub applied: usize,
    /// Changes dropped as stale.
    pub dropped: usize,
    /// Instances whose cached copy is outdated and must be fetched again.
    pub refetch: Vec<EntityRef>,
}

impl PushOutcome {
    fn applied(count: usize) -> Self {
        Self {
            applied: count,
            ..Self::default()
        }
    }
}

/// Build an instance from an embedded change payload. Accepts either the
/// sync-endpoint shape or a list-endpoint row.
fn embedded_instance(entity: &EntityRef, data: &Value) -> Option<EntityInstance> {
    let instance = serde_json::from_value::<EntityInstance>(data.clone())
        .ok()
        .or_else(|| EntityInstance::from_row(&entity.entity_code, data))?;
    (instance.entity_ref() == *entity).then_some(instance)
}

impl CacheManager {
    /// Apply one push message.
    pub fn apply_push(&self, message: &PushMessage) -> StrataResult<PushOutcome> {
        let outcome = match message {
            PushMessage::Invalidate(payload) => {
                self.apply_entity_changes(&payload.entity_code, &payload.changes)?
            }
            PushMessage::LinkChange(payload) => {
                let mut link = payload.link();
                link.active_flag = payload.action != ChangeAction::Delete;
                self.apply_server_link(&link)?;
                PushOutcome::applied(1)
            }
            PushMessage::NormalizedInvalidate(payload) => self.apply_table_change(payload)?,
            other => {
                debug!(message_type = other.message_type(), "Control message carries no cache change");
                PushOutcome::default()
            }
        };

        if outcome.applied > 0 || outcome.dropped > 0 {
            debug!(
                message_type = message.message_type(),
                applied = outcome.applied,
                dropped = outcome.dropped,
                refetch = outcome.refetch.len(),
                "Push message applied"
            );
        }
        Ok(outcome)
    }

    fn admit(&self, entity: &EntityRef, action: ChangeAction, version: u64) -> bool {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(entity, action, version)
    }

    fn apply_entity_changes(
        &self,
        entity_code: &str,
        changes: &[EntityChange],
    ) -> StrataResult<PushOutcome> {
        let mut outcome = PushOutcome::default();
        let mut upserts = Vec::new();

        for change in changes {
            let entity = EntityRef::new(entity_code, &change.entity_id);
            if !self.admit(&entity, change.action, change.version) {
                debug!(%entity, version = change.version, "Dropping stale change");
                outcome.dropped += 1;
                continue;
            }

            match change.action {
                ChangeAction::Delete => {
                    self.remove_instance(&entity);
                    outcome.applied += 1;
                }
                ChangeAction::Insert | ChangeAction::Update => {
                    match change
                        .data
                        .as_ref()
                        .and_then(|data| embedded_instance(&entity, data))
                    {
                        Some(instance) => {
                            upserts.push(instance);
                            outcome.applied += 1;
                        }
                        None => outcome.refetch.push(entity),
                    }
                }
            }
        }

        if !upserts.is_empty() {
            self.upsert_instances(&upserts)?;
        }
        self.signal_refetch(&outcome.refetch);
        Ok(outcome)
    }

    fn signal_refetch(&self, entities: &[EntityRef]) {
        if entities.is_empty() {
            return;
        }
        for entity in entities {
            self.notify(ChangeEvent::NeedsRefetch {
                entity: entity.clone(),
            });
        }
        self.mark_stale(SyncLayer::EntityInstances);
    }

    /// Apply the server's view of one edge. Pending optimistic patches on
    /// the same edge are settled: an agreeing change confirms them, a
    /// disagreeing one overwrites them.
    fn apply_server_link(&self, link: &EntityLink) -> StrataResult<()> {
        let settled = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle(&LinkKey::of(link));
        if !settled.is_empty() {
            info!(
                parent = %link.parent(),
                child = %link.child(),
                settled = settled.len(),
                "Server link change settled optimistic patches"
            );
        }
        self.apply_link(link)?;
        Ok(())
    }

    fn apply_table_change(&self, payload: &NormalizedPayload) -> StrataResult<PushOutcome> {
        let table = payload.table.as_str();

        if table == LINK_TABLE {
            return match payload.as_link() {
                Some(mut link) => {
                    link.active_flag = payload.action != ChangeAction::Delete;
                    self.apply_server_link(&link)?;
                    Ok(PushOutcome::applied(1))
                }
                None => {
                    warn!(table, "Link row without full edge columns");
                    self.mark_stale(SyncLayer::EntityLinks);
                    Ok(PushOutcome::default())
                }
            };
        }

        if TYPE_TABLES.contains(&table) {
            self.mark_stale(SyncLayer::EntityTypes);
            return Ok(PushOutcome::default());
        }

        let Some(entity) = payload.entity() else {
            debug!(table, "Table change without an instance key");
            self.mark_stale(SyncLayer::EntityInstances);
            return Ok(PushOutcome::default());
        };

        if payload.action == ChangeAction::Delete && table == INSTANCE_TABLE {
            self.remove_instance(&entity);
            return Ok(PushOutcome::applied(1));
        }

        let mut outcome = PushOutcome::default();
        if let Some(name) = payload.column_str("name") {
            let mut names = NameMap::new();
            names
                .entry(entity.entity_code.clone())
                .or_default()
                .insert(entity.entity_id.clone(), name.to_string());
            outcome.applied = self.merge_names(self.generation(), Some(&names))?;
        }
        outcome.refetch.push(entity);
        self.signal_refetch(&outcome.refetch);
        Ok(outcome)
    }
}
