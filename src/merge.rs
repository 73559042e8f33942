//! # Merge Coordinator
//!
//! Administrative merge and unmerge of Masters. Both operations work on the
//! relationship store directly and apply every edge change as one change
//! set; follow-up record writes that fail roll the change set back.

use crate::config::{LockingConfig, MdmConfig, ResourceConfig};
use crate::engine::{collapse_candidates, Candidate};
use crate::error::{MdmError, Result};
use crate::matching::{Classification, MatcherRegistry};
use crate::model::{Principal, Record, RecordKey, ResourceType};
use crate::projection::SyntheticMasterProjector;
use crate::repository::RecordRepository;
use crate::store::{
    AppliedChangeSet, ChangeSet, EdgeMutation, Relationship, RelationshipKind, RelationshipStore,
};
use crate::sync::{KeyedGuard, KeyedLocks};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of splitting Locals off a Master
#[derive(Debug, Clone, PartialEq)]
pub struct UnmergeOutcome {
    /// The original master; obsoleted when nothing was left on it
    pub master: Record,
    /// The newly created master holding the split Locals
    pub split: Record,
}

pub struct MergeCoordinator {
    repository: Arc<dyn RecordRepository>,
    relationships: Arc<dyn RelationshipStore>,
    projector: Arc<SyntheticMasterProjector>,
    matchers: MatcherRegistry,
    resources: HashMap<ResourceType, ResourceConfig>,
    master_locks: Arc<KeyedLocks<RecordKey>>,
    locking: LockingConfig,
    system_policy: String,
    principal: Principal,
}

impl MergeCoordinator {
    pub fn new(
        config: &MdmConfig,
        repository: Arc<dyn RecordRepository>,
        relationships: Arc<dyn RelationshipStore>,
        projector: Arc<SyntheticMasterProjector>,
        matchers: MatcherRegistry,
        master_locks: Arc<KeyedLocks<RecordKey>>,
    ) -> Self {
        Self {
            repository,
            relationships,
            projector,
            matchers,
            resources: config
                .resources
                .iter()
                .map(|resource| (resource.resource_type.clone(), resource.clone()))
                .collect(),
            master_locks,
            locking: config.locking.clone(),
            system_policy: config.security.system_policy.clone(),
            principal: Principal::new("mdm-merge").with_policy(&config.security.system_policy),
        }
    }

    fn require_system(&self, principal: &Principal, action: &str) -> Result<()> {
        if principal.has_policy(&self.system_policy) {
            Ok(())
        } else {
            Err(MdmError::Permission(format!(
                "{principal} may not {action} without the {} policy",
                self.system_policy
            )))
        }
    }

    /// Acquire master sections, giving up at `deadline`
    fn lock(
        &self,
        keys: impl IntoIterator<Item = RecordKey>,
        deadline: Instant,
    ) -> Result<KeyedGuard<'_, RecordKey>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.master_locks
            .try_lock_all_for(keys, remaining)
            .map_err(|busy| {
                warn!(master = %busy, "master busy; merge refused");
                MdmError::MergeConflict {
                    master: busy,
                    retry_after: self.locking.retry_after(),
                }
            })
    }

    fn active_master(&self, key: RecordKey) -> Result<Record> {
        let record = self
            .repository
            .fetch(key)
            .ok_or_else(|| MdmError::NotFound(format!("master {key}")))?;
        if !record.is_master() || record.obsoleted {
            return Err(MdmError::InvalidOperation(format!(
                "{key} is not an active master"
            )));
        }
        if record.resource_type.is_bundle() {
            return Err(MdmError::NotSupported(
                "bundle masters cannot be merged".to_string(),
            ));
        }
        Ok(record)
    }

    /// Undo edge changes and re-activate obsoleted masters after a failed write
    fn compensate(&self, applied: &AppliedChangeSet, obsoleted: &[RecordKey]) {
        for key in obsoleted {
            if let Err(err) = self.repository.restore(*key) {
                error!(%key, error = %err, "failed to restore master during rollback");
            }
        }
        if let Err(err) = self.relationships.apply(applied.inverse()) {
            error!(error = %err, "failed to roll back relationship changes");
        }
    }

    /// Fold `duplicates` into `survivor`.
    ///
    /// Every Local of a duplicate moves to the survivor and each duplicate is
    /// obsoleted behind a Replaces edge. Duplicate edges within the set
    /// disappear; duplicate edges to outsiders and IgnoreCandidate edges
    /// aimed at a duplicate are re-pointed at the survivor.
    #[instrument(skip(self, principal), fields(principal = %principal))]
    pub fn merge(
        &self,
        survivor: RecordKey,
        duplicates: &[RecordKey],
        principal: &Principal,
    ) -> Result<Record> {
        self.require_system(principal, "merge masters")?;
        let dups: BTreeSet<RecordKey> = duplicates.iter().copied().collect();
        if dups.is_empty() {
            return Err(MdmError::InvalidOperation(
                "merge needs at least one duplicate".to_string(),
            ));
        }
        if dups.contains(&survivor) {
            return Err(MdmError::InvalidOperation(format!(
                "cannot merge master {survivor} into itself"
            )));
        }

        let deadline = Instant::now() + self.locking.merge_lock_timeout();
        let members: BTreeSet<RecordKey> = dups.iter().copied().chain([survivor]).collect();
        let _members = self.lock(members.iter().copied(), deadline)?;

        let target = self.active_master(survivor)?;
        for dup in &dups {
            let record = self.active_master(*dup)?;
            if record.resource_type != target.resource_type {
                return Err(MdmError::InvalidOperation(format!(
                    "cannot merge {} master {dup} into {} master {survivor}",
                    record.resource_type, target.resource_type
                )));
            }
        }

        let mut duplicate_edges: Vec<Relationship> = Vec::new();
        let mut visited: BTreeSet<Uuid> = BTreeSet::new();
        for member in &members {
            for rel in self
                .relationships
                .outgoing(*member, RelationshipKind::Duplicate)
                .into_iter()
                .chain(self.relationships.incoming(*member, RelationshipKind::Duplicate))
            {
                if visited.insert(rel.id) {
                    duplicate_edges.push(rel);
                }
            }
        }
        let outsiders: BTreeSet<RecordKey> = duplicate_edges
            .iter()
            .flat_map(|rel| [rel.source, rel.target])
            .filter(|key| !members.contains(key))
            .collect();
        let _outsiders = self.lock(outsiders, deadline)?;

        let mut changes = ChangeSet::new();
        for dup in &dups {
            for local in self.relationships.locals_of(*dup) {
                let edge = self.relationships.master_of(local)?.ok_or_else(|| {
                    MdmError::ConsistencyViolation {
                        record: local,
                        detail: "local listed under a master has no master edge".to_string(),
                    }
                })?;
                changes.remove(edge.id);
                let mut moved = Relationship::master_record(local, survivor).merged_from(*dup);
                if let Some(score) = edge.score {
                    moved = moved.with_score(score);
                }
                if edge.verified {
                    moved = moved.verified();
                }
                changes.insert(moved);
            }
            changes.insert(Relationship::new(RelationshipKind::Replaces, survivor, *dup));
        }

        let touches_dup = |rel: &Relationship| dups.contains(&rel.source) || dups.contains(&rel.target);
        let mut kept: Vec<Relationship> = duplicate_edges
            .iter()
            .filter(|rel| !touches_dup(rel))
            .cloned()
            .collect();
        for rel in duplicate_edges.iter().filter(|rel| touches_dup(rel)) {
            changes.remove(rel.id);
            if members.contains(&rel.source) && members.contains(&rel.target) {
                continue;
            }
            let source = if dups.contains(&rel.source) { survivor } else { rel.source };
            let target = if dups.contains(&rel.target) { survivor } else { rel.target };
            let mut repointed = Relationship::new(RelationshipKind::Duplicate, source, target);
            repointed.score = rel.score;
            repointed.computed_by = rel.computed_by;
            if kept.iter().any(|existing| existing.same_edge(&repointed)) {
                continue;
            }
            kept.push(repointed.clone());
            changes.insert(repointed);
        }

        // a Local that refused a duplicate refuses the survivor too
        let mut ignoring: BTreeSet<RecordKey> = BTreeSet::new();
        for dup in &dups {
            for rel in self
                .relationships
                .incoming(*dup, RelationshipKind::IgnoreCandidate)
            {
                changes.remove(rel.id);
                let attached = self
                    .relationships
                    .master_of(rel.source)?
                    .is_some_and(|edge| members.contains(&edge.target));
                if attached
                    || self.relationships.ignored_masters(rel.source).contains(&survivor)
                    || !ignoring.insert(rel.source)
                {
                    continue;
                }
                changes.insert(Relationship::new(
                    RelationshipKind::IgnoreCandidate,
                    rel.source,
                    survivor,
                ));
            }
        }

        let applied = self.relationships.apply(changes)?;
        let mut obsoleted = Vec::with_capacity(dups.len());
        for dup in &dups {
            if let Err(err) = self.repository.obsolete(*dup, &self.principal) {
                error!(master = %dup, error = %err, "merge failed; rolling back");
                self.compensate(&applied, &obsoleted);
                return Err(err);
            }
            obsoleted.push(*dup);
            self.projector.invalidate(*dup);
        }

        self.projector.refresh(survivor);
        info!(%survivor, merged = dups.len(), "masters merged");
        self.committed_view(survivor, principal)
    }

    /// Split `target` off `master` onto a new master.
    ///
    /// `target` is either a Local attached to `master` or a master previously
    /// merged into it, in which case every Local that came with it moves.
    /// The moved Locals will not be linked to `master` again.
    #[instrument(skip(self, principal), fields(principal = %principal))]
    pub fn unmerge(
        &self,
        master: RecordKey,
        target: RecordKey,
        principal: &Principal,
    ) -> Result<UnmergeOutcome> {
        self.require_system(principal, "unmerge masters")?;
        if master == target {
            return Err(MdmError::InvalidOperation(format!(
                "cannot unmerge master {master} from itself"
            )));
        }

        let deadline = Instant::now() + self.locking.merge_lock_timeout();
        let _held = self.lock([master, target], deadline)?;

        let shell = self.active_master(master)?;
        let (moving, replaces) = self.unmerge_edges(master, target)?;
        let config = self.resources.get(&shell.resource_type).ok_or_else(|| {
            MdmError::Configuration(format!(
                "{} is not a monitored resource type",
                shell.resource_type
            ))
        })?;

        let mut candidates: Vec<(RecordKey, Vec<Candidate>)> = Vec::with_capacity(moving.len());
        for edge in &moving {
            candidates.push((edge.source, self.split_candidates(edge.source, master, config)?));
        }

        let split = self
            .repository
            .insert(Record::master(shell.resource_type.clone()), &self.principal)?;
        let others: BTreeSet<RecordKey> = candidates
            .iter()
            .flat_map(|(_, found)| found.iter().map(|candidate| candidate.master))
            .chain([split.key])
            .filter(|key| *key != master && *key != target)
            .collect();
        let _others = match self.lock(others, deadline) {
            Ok(guard) => guard,
            Err(err) => {
                self.discard(split.key);
                return Err(err);
            }
        };

        let mut changes = ChangeSet::new();
        for edge in &moving {
            let local = edge.source;
            changes.remove(edge.id);
            changes.insert(Relationship::master_record(local, split.key));
            if !self.relationships.ignored_masters(local).contains(&master) {
                changes.insert(Relationship::new(
                    RelationshipKind::IgnoreCandidate,
                    local,
                    master,
                ));
            }
            for rel in self
                .relationships
                .computed_by(local, RelationshipKind::Duplicate)
            {
                changes.remove(rel.id);
            }
        }
        for (local, found) in &candidates {
            for candidate in found {
                if candidate.master == split.key {
                    continue;
                }
                let edge = Relationship::duplicate(split.key, candidate.master, candidate.score)
                    .computed_by(*local);
                let already = changes.mutations().iter().any(|mutation| {
                    matches!(mutation, EdgeMutation::Insert(existing) if existing.same_edge(&edge))
                });
                if !already {
                    changes.insert(edge);
                }
            }
        }
        if let Some(rel) = &replaces {
            changes.remove(rel.id);
        }

        let applied = match self.relationships.apply(changes) {
            Ok(applied) => applied,
            Err(err) => {
                self.discard(split.key);
                return Err(err);
            }
        };

        let emptied = self.relationships.locals_of(master).is_empty();
        if emptied {
            if let Err(err) = self.retire(master) {
                error!(%master, error = %err, "unmerge failed; rolling back");
                self.compensate(&applied, &[]);
                self.discard(split.key);
                return Err(err);
            }
        } else {
            self.projector.refresh(master);
        }
        self.projector.refresh(split.key);

        info!(%master, %target, split = %split.key, moved = moving.len(), "master split");
        let master_view = if emptied {
            self.repository
                .fetch(master)
                .ok_or_else(|| MdmError::NotFound(format!("master {master}")))?
        } else {
            self.committed_view(master, principal)?
        };
        Ok(UnmergeOutcome {
            master: master_view,
            split: self.committed_view(split.key, principal)?,
        })
    }

    /// Master edges that move in an unmerge, plus the Replaces edge to drop
    fn unmerge_edges(
        &self,
        master: RecordKey,
        target: RecordKey,
    ) -> Result<(Vec<Relationship>, Option<Relationship>)> {
        let record = self
            .repository
            .fetch(target)
            .ok_or_else(|| MdmError::NotFound(format!("record {target}")))?;

        if record.is_local() {
            let edge = self.relationships.master_of(target)?;
            return match edge {
                Some(edge) if edge.target == master => Ok((vec![edge], None)),
                _ => Err(MdmError::InvalidOperation(format!(
                    "local {target} is not attached to master {master}"
                ))),
            };
        }
        if !record.is_master() {
            return Err(MdmError::InvalidOperation(format!(
                "{target} is neither a local nor a master"
            )));
        }

        let mut edges = Vec::new();
        for local in self.relationships.locals_of(master) {
            if let Some(edge) = self.relationships.master_of(local)? {
                if edge.merged_from == Some(target) {
                    edges.push(edge);
                }
            }
        }
        if edges.is_empty() {
            return Err(MdmError::InvalidOperation(format!(
                "no locals of {target} were merged into {master}"
            )));
        }
        let replaces = self
            .relationships
            .outgoing(master, RelationshipKind::Replaces)
            .into_iter()
            .find(|rel| rel.target == target);
        Ok((edges, replaces))
    }

    /// Duplicate candidates for a Local leaving `master`
    fn split_candidates(
        &self,
        local: RecordKey,
        master: RecordKey,
        config: &ResourceConfig,
    ) -> Result<Vec<Candidate>> {
        let record = self
            .repository
            .fetch(local)
            .ok_or_else(|| MdmError::NotFound(format!("record {local}")))?;
        let matcher = self.matchers.get(&config.match_configuration)?;
        let results = matcher.match_record(&record, &config.match_configuration)?;
        let mut ignored = self.relationships.ignored_masters(local);
        ignored.insert(master);
        Ok(collapse_candidates(&record, results, &ignored)
            .into_iter()
            .filter(|candidate| candidate.classification >= Classification::Probable)
            .collect())
    }

    /// Obsolete a master that has no Locals left.
    ///
    /// The caller must hold the master's exclusive section.
    fn retire(&self, master: RecordKey) -> Result<()> {
        let mut changes = ChangeSet::new();
        for rel in self
            .relationships
            .outgoing(master, RelationshipKind::Duplicate)
            .into_iter()
            .chain(self.relationships.incoming(master, RelationshipKind::Duplicate))
        {
            changes.remove(rel.id);
        }
        let applied = self.relationships.apply(changes)?;
        if let Err(err) = self.repository.obsolete(master, &self.principal) {
            self.compensate(&applied, &[]);
            return Err(err);
        }
        self.projector.invalidate(master);
        Ok(())
    }

    /// Caller's view of a master after a commit, falling back to the stored shell
    fn committed_view(&self, master: RecordKey, principal: &Principal) -> Result<Record> {
        match self.projector.project(master, principal) {
            Ok(projected) => Ok(projected),
            Err(err) => {
                warn!(%master, error = %err, "serving master shell after commit");
                self.repository
                    .fetch(master)
                    .ok_or_else(|| MdmError::NotFound(format!("master {master}")))
            }
        }
    }

    fn discard(&self, master: RecordKey) {
        if let Err(err) = self.repository.obsolete(master, &self.principal) {
            warn!(%master, error = %err, "failed to discard split master");
        }
        self.projector.invalidate(master);
    }
}
