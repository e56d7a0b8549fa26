//! Link graph: raw parent -> child links and their two derived indexes.
//!
//! Raw links are the source of truth. The forward index answers "children
//! of type T under parent P" and the reverse index answers "parents of C".
//! Both are sets persisted as arrays, both are kept symmetric with the raw
//! link set, and neither ever holds an empty record produced by link
//! removal.
//!
//! Every mutation returns the [`GraphChanges`] it caused so the caller can
//! turn exactly those keys into store writes.
//!
//! A forward record created by a single link addition is only `Complete`
//! when the graph holds the full link set. Before the first full link fetch
//! such a record is `Partial`: one pushed edge says nothing about the
//! parent's other children.

use std::collections::{BTreeMap, BTreeSet};

use strata_core::keys::CompositeKey;
use strata_core::{
    Completeness, EntityLink, EntityRef, ForwardKey, ForwardRecord, LinkKey, ReverseRecord,
    StrataResult, DEFAULT_RELATIONSHIP,
};
use strata_storage::{Table, WriteOp};

/// Keys touched by a graph mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphChanges {
    /// The whole graph was replaced.
    pub rebuilt: bool,
    pub links: BTreeSet<LinkKey>,
    pub forward: BTreeSet<ForwardKey>,
    pub reverse: BTreeSet<EntityRef>,
}

impl GraphChanges {
    pub fn is_empty(&self) -> bool {
        !self.rebuilt && self.links.is_empty() && self.forward.is_empty() && self.reverse.is_empty()
    }

    pub fn merge(&mut self, other: GraphChanges) {
        self.rebuilt |= other.rebuilt;
        self.links.extend(other.links);
        self.forward.extend(other.forward);
        self.reverse.extend(other.reverse);
    }
}

/// How much of a parent's child set one list response covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCoverage {
    pub offset: usize,
    /// Total number of children the server reported.
    pub total: usize,
}

impl PageCoverage {
    /// A page proves the full set only when it starts at zero and holds
    /// every child the server counted.
    pub fn is_complete(&self, returned: usize) -> bool {
        self.offset == 0 && returned >= self.total
    }
}

/// Raw links plus forward and reverse indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkGraph {
    links: BTreeMap<LinkKey, EntityLink>,
    forward: BTreeMap<ForwardKey, ForwardRecord>,
    reverse: BTreeMap<EntityRef, ReverseRecord>,
    /// Built from a full link fetch.
    full_set: bool,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build both indexes from a complete link set. Inactive and duplicate
    /// links are skipped.
    pub fn build<'a>(links: impl IntoIterator<Item = &'a EntityLink>) -> Self {
        let mut graph = Self {
            full_set: true,
            ..Self::new()
        };
        for link in links {
            if link.active_flag {
                graph.add_link(link);
            }
        }
        graph
    }

    /// Rebuild from persisted state.
    ///
    /// Indexes are re-derived from the raw links; persisted forward records
    /// only contribute what links cannot express: completeness markers and
    /// records that are known to be empty. `full_set` says whether a full
    /// link fetch ever completed for the persisted links.
    pub fn restore<'a>(
        links: impl IntoIterator<Item = &'a EntityLink>,
        persisted_forward: impl IntoIterator<Item = ForwardRecord>,
        full_set: bool,
    ) -> Self {
        let mut graph = Self::build(links);
        graph.full_set = full_set;
        if !full_set {
            for record in graph.forward.values_mut() {
                record.completeness = Completeness::Partial;
            }
        }
        for record in persisted_forward {
            let key = ForwardKey::new(&record.parent_code, &record.parent_id, &record.child_code);
            match graph.forward.get_mut(&key) {
                Some(derived) => {
                    derived.completeness = record.completeness;
                    derived.expected_total = record.expected_total;
                }
                None if record.is_empty() && record.is_complete() => {
                    graph.forward.insert(key, record);
                }
                None => {}
            }
        }
        graph
    }

    /// Replace the whole graph with a complete link set.
    pub fn replace_all<'a>(
        &mut self,
        links: impl IntoIterator<Item = &'a EntityLink>,
    ) -> GraphChanges {
        *self = Self::build(links);
        GraphChanges {
            rebuilt: true,
            ..Default::default()
        }
    }

    /// Apply one link from a delta: active links are added, inactive ones
    /// removed.
    pub fn apply(&mut self, link: &EntityLink) -> GraphChanges {
        if link.active_flag {
            self.add_link(link)
        } else {
            self.remove_link(&link.parent(), &link.child())
        }
    }

    /// Add one link. Adding an existing link only refreshes its
    /// relationship type. A new forward record is `Complete` only when the
    /// graph holds the full link set.
    pub fn add_link(&mut self, link: &EntityLink) -> GraphChanges {
        let mut changes = GraphChanges::default();
        let key = LinkKey::of(link);
        let stored = EntityLink {
            active_flag: true,
            ..link.clone()
        };

        if self.links.get(&key) != Some(&stored) {
            self.links.insert(key.clone(), stored);
            changes.links.insert(key.clone());
        }

        let forward_key = key.forward_key();
        let completeness = if self.full_set {
            Completeness::Complete
        } else {
            Completeness::Partial
        };
        let record = self.forward.entry(forward_key.clone()).or_insert_with(|| {
            ForwardRecord::empty(&key.parent, &key.child.entity_code, completeness)
        });
        let previous = record.relationships.get(&key.child.entity_id).cloned();
        record.insert(&key.child.entity_id, &link.relationship_type);
        if previous.as_deref() != Some(link.relationship_type.as_str()) {
            changes.forward.insert(forward_key);
        }

        let reverse = self
            .reverse
            .entry(key.child.clone())
            .or_insert_with(|| ReverseRecord::empty(&key.child));
        let previous = reverse
            .parents
            .iter()
            .find(|p| p.is(&key.parent))
            .map(|p| p.relationship_type.clone());
        reverse.insert(&key.parent, &link.relationship_type);
        if previous.as_deref() != Some(link.relationship_type.as_str()) {
            changes.reverse.insert(key.child.clone());
        }

        changes
    }

    /// Remove one link. Records left empty are deleted.
    pub fn remove_link(&mut self, parent: &EntityRef, child: &EntityRef) -> GraphChanges {
        let mut changes = GraphChanges::default();
        let key = LinkKey {
            parent: parent.clone(),
            child: child.clone(),
        };

        if self.links.remove(&key).is_some() {
            changes.links.insert(key.clone());
        }

        let forward_key = key.forward_key();
        if let Some(record) = self.forward.get_mut(&forward_key) {
            if record.remove(&child.entity_id) {
                if record.is_empty() {
                    self.forward.remove(&forward_key);
                }
                changes.forward.insert(forward_key);
            }
        }

        if let Some(record) = self.reverse.get_mut(child) {
            if record.remove(parent) {
                if record.is_empty() {
                    self.reverse.remove(child);
                }
                changes.reverse.insert(child.clone());
            }
        }

        changes
    }

    /// Record the children returned by one page of a filtered list call.
    ///
    /// A page that covers the whole set makes the forward record `Complete`
    /// and drops links the server no longer reports, and may leave an empty
    /// record behind: that is how "zero children" is remembered. A narrower
    /// page only adds links and marks a new or partial record `Partial`
    /// until the accumulated ids reach the reported total. A partial page
    /// never downgrades a complete record.
    pub fn record_child_page(
        &mut self,
        parent: &EntityRef,
        child_code: &str,
        child_ids: &[String],
        coverage: PageCoverage,
    ) -> GraphChanges {
        let mut changes = GraphChanges::default();
        let forward_key = ForwardKey {
            parent: parent.clone(),
            child_code: child_code.to_string(),
        };
        let complete = coverage.is_complete(child_ids.len());
        let was_complete = self
            .forward
            .get(&forward_key)
            .map(ForwardRecord::is_complete);

        if complete {
            let returned: BTreeSet<&str> = child_ids.iter().map(String::as_str).collect();
            let gone: Vec<String> = self
                .forward
                .get(&forward_key)
                .map(|r| {
                    r.child_ids
                        .iter()
                        .filter(|id| !returned.contains(id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for id in gone {
                changes.merge(self.remove_link(parent, &EntityRef::new(child_code, id)));
            }
        }

        for id in child_ids {
            let relationship = self
                .forward
                .get(&forward_key)
                .and_then(|r| r.relationships.get(id))
                .cloned()
                .unwrap_or_else(|| DEFAULT_RELATIONSHIP.to_string());
            let link = EntityLink::new(&parent.entity_code, &parent.entity_id, child_code, id)
                .with_relationship(relationship);
            changes.merge(self.add_link(&link));
        }

        let marker = if complete || was_complete == Some(true) {
            (Completeness::Complete, None)
        } else {
            (Completeness::Partial, Some(coverage.total))
        };

        if complete && !self.forward.contains_key(&forward_key) {
            self.forward.insert(
                forward_key.clone(),
                ForwardRecord::empty(parent, child_code, Completeness::Complete),
            );
            changes.forward.insert(forward_key.clone());
        }

        if let Some(record) = self.forward.get_mut(&forward_key) {
            let (mut completeness, mut expected_total) = marker;
            if completeness == Completeness::Partial && record.child_ids.len() >= coverage.total {
                completeness = Completeness::Complete;
                expected_total = None;
            }
            if record.completeness != completeness || record.expected_total != expected_total {
                record.completeness = completeness;
                record.expected_total = expected_total;
                changes.forward.insert(forward_key);
            }
        }

        changes
    }

    /// Stop trusting a forward record without touching the links behind it.
    /// The next list request for that pair goes to the server.
    pub fn mark_partial(&mut self, key: &ForwardKey) -> GraphChanges {
        let mut changes = GraphChanges::default();
        if let Some(record) = self.forward.get_mut(key) {
            if record.is_empty() {
                self.forward.remove(key);
                changes.forward.insert(key.clone());
            } else if record.is_complete() {
                record.completeness = Completeness::Partial;
                record.expected_total = None;
                changes.forward.insert(key.clone());
            }
        }
        changes
    }

    /// Whether the graph was built from a full link fetch.
    pub fn is_full_set(&self) -> bool {
        self.full_set
    }

    pub fn link(&self, key: &LinkKey) -> Option<&EntityLink> {
        self.links.get(key)
    }

    pub fn links(&self) -> impl Iterator<Item = &EntityLink> {
        self.links.values()
    }

    pub fn forward(&self, key: &ForwardKey) -> Option<&ForwardRecord> {
        self.forward.get(key)
    }

    pub fn forward_records(&self) -> impl Iterator<Item = &ForwardRecord> {
        self.forward.values()
    }

    pub fn reverse(&self, child: &EntityRef) -> Option<&ReverseRecord> {
        self.reverse.get(child)
    }

    pub fn reverse_records(&self) -> impl Iterator<Item = &ReverseRecord> {
        self.reverse.values()
    }

    /// Number of raw links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.forward.is_empty()
    }

    /// Check that both indexes match the raw link set exactly.
    pub fn is_symmetric(&self) -> bool {
        let derived = Self::build(self.links.values());

        let forward_ok = self.forward.iter().all(|(key, record)| match derived.forward.get(key) {
            Some(expected) => {
                as_set(&record.child_ids) == as_set(&expected.child_ids)
                    && record.child_ids.len() == expected.child_ids.len()
            }
            None => record.is_empty(),
        }) && derived.forward.keys().all(|key| self.forward.contains_key(key));

        let reverse_ok = self.reverse.len() == derived.reverse.len()
            && self.reverse.iter().all(|(key, record)| {
                derived.reverse.get(key).is_some_and(|expected| {
                    record.parents.len() == expected.parents.len()
                        && expected.parents.iter().all(|p| record.contains(&p.entity_ref()))
                })
            });

        forward_ok && reverse_ok
    }

    /// Store writes that bring the persisted tables in line with `changes`.
    pub fn persist_ops(&self, changes: &GraphChanges) -> StrataResult<Vec<WriteOp>> {
        let mut ops = Vec::new();

        if changes.rebuilt {
            ops.push(WriteOp::Clear {
                table: Table::EntityLinks,
            });
            ops.push(WriteOp::Clear {
                table: Table::ForwardLinks,
            });
            ops.push(WriteOp::Clear {
                table: Table::ReverseLinks,
            });
            for (key, link) in &self.links {
                ops.push(WriteOp::put_json(Table::EntityLinks, key.encode(), link)?);
            }
            for (key, record) in &self.forward {
                ops.push(WriteOp::put_json(Table::ForwardLinks, key.encode(), record)?);
            }
            for (key, record) in &self.reverse {
                ops.push(WriteOp::put_json(Table::ReverseLinks, key.encode(), record)?);
            }
            return Ok(ops);
        }

        for key in &changes.links {
            match self.links.get(key) {
                Some(link) => ops.push(WriteOp::put_json(Table::EntityLinks, key.encode(), link)?),
                None => ops.push(WriteOp::delete(Table::EntityLinks, key.encode())),
            }
        }
        for key in &changes.forward {
            match self.forward.get(key) {
                Some(record) => {
                    ops.push(WriteOp::put_json(Table::ForwardLinks, key.encode(), record)?)
                }
                None => ops.push(WriteOp::delete(Table::ForwardLinks, key.encode())),
            }
        }
        for key in &changes.reverse {
            match self.reverse.get(key) {
                Some(record) => {
                    ops.push(WriteOp::put_json(Table::ReverseLinks, key.encode(), record)?)
                }
                None => ops.push(WriteOp::delete(Table::ReverseLinks, key.encode())),
            }
        }
        Ok(ops)
    }
}

fn as_set(ids: &[String]) -> BTreeSet<&str> {
    ids.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn link(pc: &str, pid: &str, cc: &str, cid: &str) -> EntityLink {
        EntityLink::new(pc, pid, cc, cid)
    }

    fn project(id: &str) -> EntityRef {
        EntityRef::new("project", id)
    }

    fn task(id: &str) -> EntityRef {
        EntityRef::new("task", id)
    }

    fn child_ids(graph: &LinkGraph, key: &ForwardKey) -> Vec<String> {
        graph
            .forward(key)
            .map(|r| r.child_ids.clone())
            .unwrap_or_default()
    }

    #[test]
    fn test_build_groups_by_parent_and_child_type() {
        let links = vec![
            link("project", "P1", "task", "t1"),
            link("project", "P1", "task", "t2"),
            link("project", "P1", "form", "f1"),
            link("project", "P2", "task", "t1"),
        ];
        let graph = LinkGraph::build(&links);

        assert_eq!(
            child_ids(&graph, &ForwardKey::new("project", "P1", "task")),
            vec!["t1", "t2"]
        );
        assert_eq!(
            child_ids(&graph, &ForwardKey::new("project", "P1", "form")),
            vec!["f1"]
        );
        let parents = graph.reverse(&task("t1")).expect("reverse record should exist");
        assert_eq!(parents.parents.len(), 2);
        assert!(graph.is_symmetric());
    }

    #[test]
    fn test_duplicate_links_do_not_duplicate_entries() {
        let links = vec![
            link("project", "P1", "task", "t1"),
            link("project", "P1", "task", "t1"),
        ];
        let graph = LinkGraph::build(&links);

        assert_eq!(graph.len(), 1);
        assert_eq!(
            child_ids(&graph, &ForwardKey::new("project", "P1", "task")),
            vec!["t1"]
        );
        assert_eq!(
            graph.reverse(&task("t1")).map(|r| r.parents.len()),
            Some(1)
        );
    }

    #[test]
    fn test_build_skips_inactive_links() {
        let mut removed = link("project", "P1", "task", "t2");
        removed.active_flag = false;
        let graph = LinkGraph::build(&[link("project", "P1", "task", "t1"), removed]);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_add_twice_remove_once_leaves_no_trace() {
        let mut graph = LinkGraph::new();
        let edge = link("project", "P1", "task", "t1");

        graph.add_link(&edge);
        let second = graph.add_link(&edge);
        assert!(second.is_empty());

        graph.remove_link(&project("P1"), &task("t1"));
        assert!(graph.forward(&ForwardKey::new("project", "P1", "task")).is_none());
        assert!(graph.reverse(&task("t1")).is_none());
        assert!(graph.is_empty());
    }

    #[test]
    fn test_remove_keeps_sibling_entries() {
        let mut graph = LinkGraph::build(&[
            link("project", "P1", "task", "t1"),
            link("project", "P1", "task", "t2"),
        ]);
        let changes = graph.remove_link(&project("P1"), &task("t1"));

        assert_eq!(
            child_ids(&graph, &ForwardKey::new("project", "P1", "task")),
            vec!["t2"]
        );
        assert!(changes.reverse.contains(&task("t1")));
        assert!(graph.is_symmetric());
    }

    #[test]
    fn test_relationship_refresh_is_a_change() {
        let mut graph = LinkGraph::new();
        graph.add_link(&link("project", "P1", "task", "t1"));
        let changes = graph.add_link(&link("project", "P1", "task", "t1").with_relationship("owns"));

        assert!(changes.forward.contains(&ForwardKey::new("project", "P1", "task")));
        let record = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("record should exist");
        assert_eq!(record.relationships.get("t1").map(String::as_str), Some("owns"));
        assert_eq!(record.child_ids.len(), 1);
    }

    #[test]
    fn test_replace_all_drops_previous_links() {
        let mut graph = LinkGraph::build(&[link("project", "P1", "task", "t1")]);
        let changes = graph.replace_all(&[link("project", "P2", "task", "t9")]);

        assert!(changes.rebuilt);
        assert!(graph.reverse(&task("t1")).is_none());
        assert_eq!(
            child_ids(&graph, &ForwardKey::new("project", "P2", "task")),
            vec!["t9"]
        );
    }

    #[test]
    fn test_complete_page_with_no_children_leaves_empty_record() {
        let mut graph = LinkGraph::new();
        graph.record_child_page(
            &project("P1"),
            "task",
            &[],
            PageCoverage { offset: 0, total: 0 },
        );

        let record = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("empty record should be present");
        assert!(record.is_empty());
        assert!(record.is_complete());
        assert!(graph.is_symmetric());
    }

    #[test]
    fn test_complete_page_drops_children_no_longer_reported() {
        let mut graph = LinkGraph::build(&[
            link("project", "P1", "task", "t1"),
            link("project", "P1", "task", "t2"),
        ]);
        graph.record_child_page(
            &project("P1"),
            "task",
            &["t2".to_string(), "t3".to_string()],
            PageCoverage { offset: 0, total: 2 },
        );

        assert_eq!(
            child_ids(&graph, &ForwardKey::new("project", "P1", "task")),
            vec!["t2", "t3"]
        );
        assert!(graph.reverse(&task("t1")).is_none());
        assert!(graph.is_symmetric());
    }

    #[test]
    fn test_partial_pages_accumulate_until_total() {
        let mut graph = LinkGraph::new();
        let key = ForwardKey::new("project", "P1", "task");

        graph.record_child_page(
            &project("P1"),
            "task",
            &["t1".to_string(), "t2".to_string()],
            PageCoverage { offset: 0, total: 3 },
        );
        let record = graph.forward(&key).expect("record should exist");
        assert_eq!(record.completeness, Completeness::Partial);
        assert_eq!(record.expected_total, Some(3));

        graph.record_child_page(
            &project("P1"),
            "task",
            &["t3".to_string()],
            PageCoverage { offset: 2, total: 3 },
        );
        let record = graph.forward(&key).expect("record should exist");
        assert!(record.is_complete());
        assert_eq!(record.child_ids, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_partial_page_never_downgrades_complete_record() {
        let mut graph = LinkGraph::build(&[
            link("project", "P1", "task", "t1"),
            link("project", "P1", "task", "t2"),
        ]);
        graph.record_child_page(
            &project("P1"),
            "task",
            &["t2".to_string()],
            PageCoverage { offset: 1, total: 2 },
        );

        let record = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("record should exist");
        assert!(record.is_complete());
        assert_eq!(record.child_ids.len(), 2);
    }

    #[test]
    fn test_mark_partial() {
        let mut graph = LinkGraph::build(&[link("project", "P1", "task", "t1")]);
        let key = ForwardKey::new("project", "P1", "task");
        let changes = graph.mark_partial(&key);

        assert!(changes.forward.contains(&key));
        assert!(!graph.forward(&key).expect("record should exist").is_complete());
        assert!(graph.reverse(&task("t1")).is_some());
    }

    #[test]
    fn test_restore_keeps_markers_and_empty_records() {
        let links = vec![link("project", "P1", "task", "t1")];
        let mut partial = ForwardRecord::empty(&project("P1"), "task", Completeness::Partial);
        partial.insert("t1", DEFAULT_RELATIONSHIP);
        partial.expected_total = Some(5);
        let empty = ForwardRecord::empty(&project("P2"), "task", Completeness::Complete);
        let stale_partial = ForwardRecord::empty(&project("P3"), "task", Completeness::Partial);

        let graph = LinkGraph::restore(&links, vec![partial, empty, stale_partial], true);

        let p1 = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("P1 record should exist");
        assert_eq!(p1.completeness, Completeness::Partial);
        assert_eq!(p1.expected_total, Some(5));
        assert!(graph.forward(&ForwardKey::new("project", "P2", "task")).is_some());
        assert!(graph.forward(&ForwardKey::new("project", "P3", "task")).is_none());
    }

    #[test]
    fn test_restore_without_full_fetch_keeps_derived_records_partial() {
        let links = vec![link("project", "P1", "task", "t1")];
        let graph = LinkGraph::restore(&links, Vec::new(), false);

        let record = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("record derived from link");
        assert_eq!(record.completeness, Completeness::Partial);
        assert!(!graph.is_full_set());
    }

    #[test]
    fn test_single_add_before_full_fetch_is_partial() {
        let mut graph = LinkGraph::new();
        graph.add_link(&link("project", "P1", "task", "t3"));

        let record = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("record should exist");
        assert_eq!(record.completeness, Completeness::Partial);
        assert_eq!(record.expected_total, None);
        assert!(graph.reverse(&task("t3")).is_some());
    }

    #[test]
    fn test_single_add_after_full_fetch_is_complete() {
        let mut graph = LinkGraph::build(&[link("project", "P1", "task", "t1")]);
        graph.add_link(&link("project", "P2", "task", "t2"));

        let record = graph
            .forward(&ForwardKey::new("project", "P2", "task"))
            .expect("record should exist");
        assert!(record.is_complete());
    }

    #[test]
    fn test_complete_page_upgrades_record_before_full_fetch() {
        let mut graph = LinkGraph::new();
        graph.record_child_page(
            &project("P1"),
            "task",
            &["t1".to_string()],
            PageCoverage { offset: 0, total: 1 },
        );

        let record = graph
            .forward(&ForwardKey::new("project", "P1", "task"))
            .expect("record should exist");
        assert!(record.is_complete());
    }

    #[test]
    fn test_persist_ops_put_and_delete() {
        let mut graph = LinkGraph::build(&[
            link("project", "P1", "task", "t1"),
            link("project", "P1", "task", "t2"),
        ]);
        let changes = graph.remove_link(&project("P1"), &task("t1"));
        let ops = graph.persist_ops(&changes).expect("persist_ops should succeed");

        assert!(ops.contains(&WriteOp::delete(Table::EntityLinks, "project:P1:task:t1")));
        assert!(ops.contains(&WriteOp::delete(Table::ReverseLinks, "task:t1")));
        assert!(ops.iter().any(|op| matches!(
            op,
            WriteOp::Put { table: Table::ForwardLinks, key, .. } if key == "project:P1:task"
        )));
    }

    #[test]
    fn test_persist_ops_for_rebuild_clears_tables_first() {
        let mut graph = LinkGraph::new();
        let changes = graph.replace_all(&[link("project", "P1", "task", "t1")]);
        let ops = graph.persist_ops(&changes).expect("persist_ops should succeed");

        assert_eq!(
            ops[0],
            WriteOp::Clear {
                table: Table::EntityLinks
            }
        );
        assert_eq!(ops.len(), 6);
    }

    fn arb_link() -> impl Strategy<Value = EntityLink> {
        (
            prop::sample::select(vec!["project", "folder"]),
            "[a-c]",
            prop::sample::select(vec!["task", "form"]),
            "[a-d]",
        )
            .prop_map(|(pc, pid, cc, cid)| EntityLink::new(pc, pid, cc, cid))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_build_is_symmetric(links in prop::collection::vec(arb_link(), 0..40)) {
            let graph = LinkGraph::build(&links);
            prop_assert!(graph.is_symmetric());

            for l in &links {
                let key = LinkKey::of(l).forward_key();
                let in_forward = graph.forward(&key).is_some_and(|r| r.contains(&l.child_id));
                let in_reverse = graph.reverse(&l.child()).is_some_and(|r| r.contains(&l.parent()));
                prop_assert!(in_forward && in_reverse);
            }
        }

        #[test]
        fn prop_incremental_matches_rebuild(
            adds in prop::collection::vec(arb_link(), 0..30),
            removes in prop::collection::vec(arb_link(), 0..30),
        ) {
            let mut graph = LinkGraph::new();
            for l in &adds {
                graph.add_link(l);
            }
            for l in &removes {
                graph.remove_link(&l.parent(), &l.child());
            }
            prop_assert!(graph.is_symmetric());

            let rebuilt = LinkGraph::build(graph.links());
            prop_assert_eq!(graph.len(), rebuilt.len());
            prop_assert_eq!(
                graph.forward_records().count(),
                rebuilt.forward_records().count()
            );
        }
    }
}
