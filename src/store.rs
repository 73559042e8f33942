//! # Relationship Store
//!
//! Typed edges between records kept in an arena keyed by UUID. Edges never
//! hold references to records, only their keys, so the Master/Local/Duplicate
//! graph has no ownership cycles. All writes go through [`ChangeSet`]s which
//! are validated and applied atomically.

use crate::error::{MdmError, Result};
use crate::model::RecordKey;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;
use uuid::Uuid;

/// Edge kinds maintained by the MDM core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// Local -> Master, exactly one active per Local
    MasterRecord,
    /// (Master | Local) -> Master candidate awaiting review
    Duplicate,
    /// Surviving Master -> Master it absorbed in a merge
    Replaces,
    /// Local -> Master it must never be linked to again
    IgnoreCandidate,
}

/// A directed edge between two records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub kind: RelationshipKind,
    pub source: RecordKey,
    pub target: RecordKey,
    /// Match score that produced the edge, if any
    pub score: Option<f64>,
    /// Local whose resolution computed this edge
    pub computed_by: Option<RecordKey>,
    /// Master the Local belonged to before a merge moved it
    pub merged_from: Option<RecordKey>,
    /// Asserted by a privileged caller rather than computed
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(kind: RelationshipKind, source: RecordKey, target: RecordKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source,
            target,
            score: None,
            computed_by: None,
            merged_from: None,
            verified: false,
            created_at: Utc::now(),
        }
    }

    pub fn master_record(local: RecordKey, master: RecordKey) -> Self {
        Self::new(RelationshipKind::MasterRecord, local, master)
    }

    pub fn duplicate(source: RecordKey, candidate: RecordKey, score: f64) -> Self {
        Self::new(RelationshipKind::Duplicate, source, candidate).with_score(score)
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn computed_by(mut self, local: RecordKey) -> Self {
        self.computed_by = Some(local);
        self
    }

    pub fn merged_from(mut self, master: RecordKey) -> Self {
        self.merged_from = Some(master);
        self
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }

    /// Same edge ignoring identity, timestamps and score jitter
    pub fn same_edge(&self, other: &Relationship) -> bool {
        self.kind == other.kind
            && self.source == other.source
            && self.target == other.target
            && self.computed_by == other.computed_by
    }
}

/// A single edge mutation
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeMutation {
    Insert(Relationship),
    Remove(Uuid),
}

/// Ordered set of edge mutations applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    mutations: Vec<EdgeMutation>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, relationship: Relationship) {
        self.mutations.push(EdgeMutation::Insert(relationship));
    }

    pub fn remove(&mut self, id: Uuid) {
        if !self
            .mutations
            .iter()
            .any(|m| matches!(m, EdgeMutation::Remove(existing) if *existing == id))
        {
            self.mutations.push(EdgeMutation::Remove(id));
        }
    }

    pub fn mutations(&self) -> &[EdgeMutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

/// Receipt of an applied change set; sufficient to undo it
#[derive(Debug, Clone, Default)]
pub struct AppliedChangeSet {
    pub inserted: Vec<Uuid>,
    pub removed: Vec<Relationship>,
}

impl AppliedChangeSet {
    /// Change set restoring the state before this one was applied
    pub fn inverse(&self) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for id in &self.inserted {
            changes.remove(*id);
        }
        for rel in &self.removed {
            changes.insert(rel.clone());
        }
        changes
    }
}

/// Data-access contract for the relationship graph
pub trait RelationshipStore: Send + Sync {
    /// Edges of `kind` whose source is `source`
    fn outgoing(&self, source: RecordKey, kind: RelationshipKind) -> Vec<Relationship>;

    /// Edges of `kind` whose target is `target`
    fn incoming(&self, target: RecordKey, kind: RelationshipKind) -> Vec<Relationship>;

    /// Edges of `kind` computed by a Local's resolution
    fn computed_by(&self, local: RecordKey, kind: RelationshipKind) -> Vec<Relationship>;

    /// Validate and apply every mutation, or none
    fn apply(&self, changes: ChangeSet) -> Result<AppliedChangeSet>;

    /// Total number of edge mutations applied so far
    fn mutation_count(&self) -> u64;

    /// The single active master edge of a Local, if linked
    fn master_of(&self, local: RecordKey) -> Result<Option<Relationship>> {
        let mut edges = self.outgoing(local, RelationshipKind::MasterRecord);
        match edges.len() {
            0 => Ok(None),
            1 => Ok(edges.pop()),
            n => {
                error!(%local, edges = n, "local has more than one active master");
                Err(MdmError::ConsistencyViolation {
                    record: local,
                    detail: format!("{n} active master relationships"),
                })
            }
        }
    }

    /// Locals currently attached to a Master
    fn locals_of(&self, master: RecordKey) -> Vec<RecordKey> {
        let mut locals: Vec<RecordKey> = self
            .incoming(master, RelationshipKind::MasterRecord)
            .into_iter()
            .map(|rel| rel.source)
            .collect();
        locals.sort();
        locals
    }

    /// Masters a Local must never be attached to
    fn ignored_masters(&self, local: RecordKey) -> BTreeSet<RecordKey> {
        self.outgoing(local, RelationshipKind::IgnoreCandidate)
            .into_iter()
            .map(|rel| rel.target)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Arena {
    edges: HashMap<Uuid, Relationship>,
    by_source: HashMap<RecordKey, Vec<Uuid>>,
    by_target: HashMap<RecordKey, Vec<Uuid>>,
    by_computed: HashMap<RecordKey, Vec<Uuid>>,
}

impl Arena {
    fn collect(&self, ids: Option<&Vec<Uuid>>, kind: RelationshipKind) -> Vec<Relationship> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.edges.get(id))
                .filter(|rel| rel.kind == kind)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    fn master_count(&self, source: RecordKey) -> usize {
        self.collect(self.by_source.get(&source), RelationshipKind::MasterRecord)
            .len()
    }

    fn insert(&mut self, rel: Relationship) {
        self.by_source.entry(rel.source).or_default().push(rel.id);
        self.by_target.entry(rel.target).or_default().push(rel.id);
        if let Some(local) = rel.computed_by {
            self.by_computed.entry(local).or_default().push(rel.id);
        }
        self.edges.insert(rel.id, rel);
    }

    fn remove(&mut self, id: Uuid) -> Option<Relationship> {
        let rel = self.edges.remove(&id)?;
        unindex(&mut self.by_source, rel.source, id);
        unindex(&mut self.by_target, rel.target, id);
        if let Some(local) = rel.computed_by {
            unindex(&mut self.by_computed, local, id);
        }
        Some(rel)
    }

    fn validate(&self, changes: &ChangeSet) -> Result<()> {
        let mut master_delta: HashMap<RecordKey, isize> = HashMap::new();
        let mut seen_inserts: BTreeSet<Uuid> = BTreeSet::new();

        for mutation in changes.mutations() {
            match mutation {
                EdgeMutation::Insert(rel) => {
                    if rel.source == rel.target {
                        return Err(MdmError::InvalidOperation(format!(
                            "self-referencing {:?} edge on {}",
                            rel.kind, rel.source
                        )));
                    }
                    if self.edges.contains_key(&rel.id) || !seen_inserts.insert(rel.id) {
                        return Err(MdmError::InvalidOperation(format!(
                            "relationship {} already exists",
                            rel.id
                        )));
                    }
                    if rel.kind == RelationshipKind::MasterRecord {
                        *master_delta.entry(rel.source).or_default() += 1;
                    }
                }
                EdgeMutation::Remove(id) => {
                    let rel = self.edges.get(id).ok_or_else(|| {
                        MdmError::NotFound(format!("relationship {id}"))
                    })?;
                    if rel.kind == RelationshipKind::MasterRecord {
                        *master_delta.entry(rel.source).or_default() -= 1;
                    }
                }
            }
        }

        for (local, delta) in master_delta {
            let after = self.master_count(local) as isize + delta;
            if after > 1 {
                error!(%local, after, "change set would leave several active masters");
                return Err(MdmError::ConsistencyViolation {
                    record: local,
                    detail: format!("change set leaves {after} active master relationships"),
                });
            }
        }
        Ok(())
    }
}

fn unindex(index: &mut HashMap<RecordKey, Vec<Uuid>>, key: RecordKey, id: Uuid) {
    if let Some(ids) = index.get_mut(&key) {
        ids.retain(|existing| *existing != id);
        if ids.is_empty() {
            index.remove(&key);
        }
    }
}

/// In-memory relationship store
#[derive(Debug, Default)]
pub struct MemoryRelationshipStore {
    arena: RwLock<Arena>,
    mutations: AtomicU64,
}

impl MemoryRelationshipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of edges currently stored
    pub fn len(&self) -> usize {
        self.arena.read().edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every edge of the given kind, for audits and invariant checks
    pub fn all_of_kind(&self, kind: RelationshipKind) -> Vec<Relationship> {
        self.arena
            .read()
            .edges
            .values()
            .filter(|rel| rel.kind == kind)
            .cloned()
            .collect()
    }
}

impl RelationshipStore for MemoryRelationshipStore {
    fn outgoing(&self, source: RecordKey, kind: RelationshipKind) -> Vec<Relationship> {
        let arena = self.arena.read();
        arena.collect(arena.by_source.get(&source), kind)
    }

    fn incoming(&self, target: RecordKey, kind: RelationshipKind) -> Vec<Relationship> {
        let arena = self.arena.read();
        arena.collect(arena.by_target.get(&target), kind)
    }

    fn computed_by(&self, local: RecordKey, kind: RelationshipKind) -> Vec<Relationship> {
        let arena = self.arena.read();
        arena.collect(arena.by_computed.get(&local), kind)
    }

    fn apply(&self, changes: ChangeSet) -> Result<AppliedChangeSet> {
        if changes.is_empty() {
            return Ok(AppliedChangeSet::default());
        }

        let mut arena = self.arena.write();
        arena.validate(&changes)?;

        let mut applied = AppliedChangeSet::default();
        let count = changes.len() as u64;
        for mutation in changes.mutations {
            match mutation {
                EdgeMutation::Insert(rel) => {
                    applied.inserted.push(rel.id);
                    arena.insert(rel);
                }
                EdgeMutation::Remove(id) => {
                    if let Some(rel) = arena.remove(id) {
                        applied.removed.push(rel);
                    }
                }
            }
        }
        self.mutations.fetch_add(count, Ordering::Relaxed);
        Ok(applied)
    }

    fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }
}
