//! # Master Resolution Engine
//!
//! Decides, for each Local, which Master it belongs to and which Masters are
//! candidate duplicates, then applies the decision to the relationship store.
//!
//! Every relationship write happens inside the exclusive sections of all the
//! Masters it touches. Creating a new Master additionally holds a
//! per-resource-type creation section and re-runs the match under it, so two
//! concurrently resolving Locals of one identity cannot both create a Master.

use crate::config::{MdmConfig, ResourceConfig};
use crate::error::{MdmError, Result};
use crate::matching::{Classification, MatchResult, MatcherRegistry};
use crate::model::{Principal, Record, RecordKey, ResourceType, MDM_RESOLVED_TAG};
use crate::projection::SyntheticMasterProjector;
use crate::repository::{RecordRepository, TagStore};
use crate::store::{ChangeSet, Relationship, RelationshipKind, RelationshipStore};
use crate::sync::{KeyedLocks, TaskContext};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Resolution state of a Local
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionState {
    Unlinked,
    Resolving,
    Linked,
}

#[derive(Debug, Clone, Copy)]
struct StateEntry {
    state: ResolutionState,
    since: Instant,
}

/// Work item for the resolution workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionTask {
    /// (Re-)resolve a written Local
    Resolve {
        key: RecordKey,
        resource_type: ResourceType,
    },
    /// Remove an obsoleted Local from its Master
    Detach { key: RecordKey },
}

impl ResolutionTask {
    pub fn key(&self) -> RecordKey {
        match self {
            ResolutionTask::Resolve { key, .. } | ResolutionTask::Detach { key } => *key,
        }
    }
}

/// What a resolution did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Relationships already reflected the decision
    Unchanged { master: RecordKey },
    /// Linked to an existing Master
    Attached {
        master: RecordKey,
        previous: Option<RecordKey>,
        duplicates: usize,
    },
    /// Linked to a newly created Master
    Created {
        master: RecordKey,
        previous: Option<RecordKey>,
        duplicates: usize,
        collision: bool,
    },
    /// Removed from its Master after being obsoleted
    Detached { previous: Option<RecordKey> },
    /// Not a monitored Local
    Skipped,
}

impl ResolutionOutcome {
    pub fn master(&self) -> Option<RecordKey> {
        match self {
            ResolutionOutcome::Unchanged { master }
            | ResolutionOutcome::Attached { master, .. }
            | ResolutionOutcome::Created { master, .. } => Some(*master),
            ResolutionOutcome::Detached { .. } | ResolutionOutcome::Skipped => None,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(
            self,
            ResolutionOutcome::Unchanged { .. } | ResolutionOutcome::Skipped
        )
    }
}

/// Best classification of one Master for the Local being resolved
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub master: RecordKey,
    pub classification: Classification,
    pub score: f64,
}

impl Candidate {
    fn precedence(&self, other: &Candidate) -> Ordering {
        self.classification
            .cmp(&other.classification)
            .then_with(|| self.score.total_cmp(&other.score))
    }
}

/// Decision for a Local given its candidates
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Attach {
        master: RecordKey,
        score: f64,
        duplicates: Vec<Candidate>,
    },
    CreateMaster {
        duplicates: Vec<Candidate>,
        collision: bool,
    },
}

/// Reduce raw match results to one candidate per eligible Master.
///
/// Only active Masters of the Local's own type are eligible; NonMatch
/// results and ignored Masters are dropped. The result is ordered by
/// precedence, best first.
pub fn collapse_candidates(
    local: &Record,
    results: Vec<MatchResult>,
    ignored: &BTreeSet<RecordKey>,
) -> Vec<Candidate> {
    let mut best: BTreeMap<RecordKey, Candidate> = BTreeMap::new();
    for result in results {
        let candidate = &result.candidate;
        if candidate.key == local.key
            || !candidate.is_master()
            || candidate.obsoleted
            || candidate.resource_type != local.resource_type
            || ignored.contains(&candidate.key)
            || result.classification == Classification::NonMatch
        {
            continue;
        }
        let next = Candidate {
            master: candidate.key,
            classification: result.classification,
            score: result.score,
        };
        match best.get(&next.master) {
            Some(existing) if existing.precedence(&next) != Ordering::Less => {}
            _ => {
                best.insert(next.master, next);
            }
        }
    }

    let mut candidates: Vec<Candidate> = best.into_values().collect();
    candidates.sort_by(|a, b| b.precedence(a).then_with(|| a.master.cmp(&b.master)));
    candidates
}

/// Apply the resolution rules to ordered candidates.
///
/// A single Match attaches (when auto-merge is enabled); anything else gets a
/// Master of its own with every Match and Probable recorded as a duplicate
/// candidate. Several Matches are a collision and are never merged here.
pub fn decide(candidates: &[Candidate], auto_merge_on_single_match: bool) -> Decision {
    let matches: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.classification == Classification::Match)
        .collect();
    let probables: Vec<Candidate> = candidates
        .iter()
        .filter(|c| c.classification == Classification::Probable)
        .cloned()
        .collect();

    match matches.as_slice() {
        [single] if auto_merge_on_single_match => Decision::Attach {
            master: single.master,
            score: single.score,
            duplicates: probables,
        },
        found => Decision::CreateMaster {
            duplicates: candidates
                .iter()
                .filter(|c| c.classification >= Classification::Probable)
                .cloned()
                .collect(),
            collision: found.len() > 1,
        },
    }
}

struct Plan {
    target: RecordKey,
    created: bool,
    collision: bool,
    score: Option<f64>,
    verified: bool,
    duplicates: Vec<Candidate>,
}

impl Plan {
    fn attach(target: RecordKey, score: Option<f64>, duplicates: Vec<Candidate>) -> Self {
        Self {
            target,
            created: false,
            collision: false,
            score,
            verified: false,
            duplicates,
        }
    }

    fn create(target: RecordKey, duplicates: Vec<Candidate>, collision: bool) -> Self {
        Self {
            target,
            created: true,
            collision,
            score: None,
            verified: false,
            duplicates,
        }
    }
}

enum Attempt {
    Done(ResolutionOutcome),
    Stale(&'static str),
}

/// The identity-resolution core
pub struct MasterResolutionEngine {
    repository: Arc<dyn RecordRepository>,
    tags: Arc<dyn TagStore>,
    relationships: Arc<dyn RelationshipStore>,
    projector: Arc<SyntheticMasterProjector>,
    matchers: MatcherRegistry,
    resources: HashMap<ResourceType, ResourceConfig>,
    principal: Principal,
    local_locks: KeyedLocks<RecordKey>,
    master_locks: Arc<KeyedLocks<RecordKey>>,
    creation_locks: KeyedLocks<ResourceType>,
    states: DashMap<RecordKey, StateEntry>,
    max_attempts: u32,
}

impl MasterResolutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &MdmConfig,
        repository: Arc<dyn RecordRepository>,
        tags: Arc<dyn TagStore>,
        relationships: Arc<dyn RelationshipStore>,
        projector: Arc<SyntheticMasterProjector>,
        matchers: MatcherRegistry,
        master_locks: Arc<KeyedLocks<RecordKey>>,
    ) -> Self {
        Self {
            repository,
            tags,
            relationships,
            projector,
            matchers,
            resources: config
                .resources
                .iter()
                .map(|resource| (resource.resource_type.clone(), resource.clone()))
                .collect(),
            principal: Principal::new("mdm-engine").with_policy(&config.security.system_policy),
            local_locks: KeyedLocks::new(),
            master_locks,
            creation_locks: KeyedLocks::new(),
            states: DashMap::new(),
            max_attempts: config.workers.max_resolution_attempts.max(1),
        }
    }

    pub fn state(&self, key: RecordKey) -> Option<ResolutionState> {
        self.states.get(&key).map(|entry| entry.state)
    }

    fn set_state(&self, key: RecordKey, state: ResolutionState) {
        self.states.insert(
            key,
            StateEntry {
                state,
                since: Instant::now(),
            },
        );
    }

    /// Record that a task for `key` was queued
    pub fn mark_enqueued(&self, key: RecordKey) {
        if self.state(key) != Some(ResolutionState::Resolving) {
            self.set_state(key, ResolutionState::Unlinked);
        }
    }

    pub fn run(&self, task: &ResolutionTask, ctx: &TaskContext) -> Result<ResolutionOutcome> {
        match task {
            ResolutionTask::Resolve { key, .. } => self.resolve(*key, ctx),
            ResolutionTask::Detach { key } => self.detach(*key, ctx),
        }
    }

    /// Resolve one Local, retrying when concurrent changes invalidate the decision
    #[instrument(skip(self, ctx), fields(key = %key))]
    pub fn resolve(&self, key: RecordKey, ctx: &TaskContext) -> Result<ResolutionOutcome> {
        let _local = self.local_locks.lock(&key);
        self.set_state(key, ResolutionState::Resolving);

        let result = self.resolve_with_retry(key, ctx);
        let linked = matches!(self.relationships.master_of(key), Ok(Some(_)));
        match &result {
            Ok(ResolutionOutcome::Skipped) => {
                self.states.remove(&key);
            }
            Ok(ResolutionOutcome::Detached { .. }) => {
                self.states.remove(&key);
            }
            Ok(outcome) => {
                self.set_state(
                    key,
                    if linked {
                        ResolutionState::Linked
                    } else {
                        ResolutionState::Unlinked
                    },
                );
                if let Err(err) = self
                    .tags
                    .set_tag(key, MDM_RESOLVED_TAG, &Utc::now().to_rfc3339())
                {
                    warn!(error = %err, "failed to stamp resolution tag");
                }
                debug!(?outcome, "resolution finished");
            }
            Err(_) => {
                self.set_state(
                    key,
                    if linked {
                        ResolutionState::Linked
                    } else {
                        ResolutionState::Unlinked
                    },
                );
            }
        }
        result
    }

    fn resolve_with_retry(&self, key: RecordKey, ctx: &TaskContext) -> Result<ResolutionOutcome> {
        for attempt in 1..=self.max_attempts {
            match self.attempt(key, ctx)? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Stale(reason) => {
                    debug!(attempt, reason, "inputs changed during resolution, retrying");
                }
            }
        }
        Err(MdmError::InvalidOperation(format!(
            "resolution of {key} kept racing concurrent changes"
        )))
    }

    fn attempt(&self, key: RecordKey, ctx: &TaskContext) -> Result<Attempt> {
        ctx.checkpoint()?;
        let local = self
            .repository
            .fetch(key)
            .ok_or_else(|| MdmError::NotFound(format!("record {key}")))?;
        if local.obsoleted {
            return self.detach_locked(key, ctx).map(Attempt::Done);
        }
        if !local.is_local() {
            return Ok(Attempt::Done(ResolutionOutcome::Skipped));
        }
        let Some(config) = self.resources.get(&local.resource_type) else {
            return Ok(Attempt::Done(ResolutionOutcome::Skipped));
        };
        let current = self.relationships.master_of(key)?;

        if let Some(target) = local.asserted_master() {
            let mut plan = Plan::attach(target, None, Vec::new());
            plan.verified = true;
            return self.apply(&local, current, plan, ctx);
        }

        let candidates = self.candidates(&local, config)?;
        ctx.checkpoint()?;

        // links made by an administrator or a merge outlive matcher opinion
        if let Some(existing) = current.as_ref().filter(|edge| edge.verified || edge.merged_from.is_some()) {
            let duplicates = candidates
                .into_iter()
                .filter(|candidate| candidate.master != existing.target)
                .collect();
            let plan = Plan::attach(existing.target, existing.score, duplicates);
            return self.apply(&local, current.clone(), plan, ctx);
        }

        match decide(&candidates, config.auto_merge_on_single_match) {
            Decision::Attach {
                master,
                score,
                duplicates,
            } => self.apply(&local, current, Plan::attach(master, Some(score), duplicates), ctx),
            Decision::CreateMaster { duplicates, .. } => {
                if let Some(existing) = &current {
                    // a Local alone on its master keeps it rather than trading it for a new one
                    if self.relationships.locals_of(existing.target) == vec![key] {
                        let plan = Plan::attach(existing.target, existing.score, duplicates);
                        return self.apply(&local, current.clone(), plan, ctx);
                    }
                }
                self.create_and_attach(&local, current, config, ctx)
            }
        }
    }

    /// Create a master for `local` under the type's creation section.
    fn create_and_attach(
        &self,
        local: &Record,
        current: Option<Relationship>,
        config: &ResourceConfig,
        ctx: &TaskContext,
    ) -> Result<Attempt> {
        let _creation = self.creation_locks.lock(&local.resource_type);

        // another Local may have created the right master while we waited
        let candidates = self.candidates(local, config)?;
        ctx.checkpoint()?;
        let (duplicates, collision) = match decide(&candidates, config.auto_merge_on_single_match)
        {
            Decision::Attach {
                master,
                score,
                duplicates,
            } => {
                return self.apply(local, current, Plan::attach(master, Some(score), duplicates), ctx)
            }
            Decision::CreateMaster {
                duplicates,
                collision,
            } => (duplicates, collision),
        };

        if collision {
            info!(
                key = %local.key,
                masters = duplicates.len(),
                "match collision; new master flagged for review"
            );
        }

        let master = self
            .repository
            .insert(Record::master(local.resource_type.clone()), &self.principal)?;
        let result = self.apply(
            local,
            current,
            Plan::create(master.key, duplicates, collision),
            ctx,
        );
        if !matches!(result, Ok(Attempt::Done(_))) {
            self.discard_master(master.key);
        }
        result
    }

    fn discard_master(&self, master: RecordKey) {
        if let Err(err) = self.repository.obsolete(master, &self.principal) {
            warn!(%master, error = %err, "failed to discard unused master");
        }
        self.projector.invalidate(master);
    }

    fn candidates(&self, local: &Record, config: &ResourceConfig) -> Result<Vec<Candidate>> {
        let matcher = self.matchers.get(&config.match_configuration)?;
        let blocked = matcher.block(local, &config.match_configuration)?;
        if !blocked
            .iter()
            .any(|record| record.is_master() && !record.obsoleted && record.key != local.key)
        {
            return Ok(Vec::new());
        }
        let results = matcher.match_record(local, &config.match_configuration)?;
        let ignored = self.relationships.ignored_masters(local.key);
        Ok(collapse_candidates(local, results, &ignored))
    }

    fn is_active_master(&self, key: RecordKey) -> bool {
        self.repository
            .fetch(key)
            .map(|record| record.is_master() && !record.obsoleted)
            .unwrap_or(false)
    }

    fn apply(
        &self,
        local: &Record,
        current: Option<Relationship>,
        mut plan: Plan,
        ctx: &TaskContext,
    ) -> Result<Attempt> {
        let key = local.key;
        for asserted in local.asserted_duplicates() {
            if !plan.duplicates.iter().any(|candidate| candidate.master == asserted) {
                plan.duplicates.push(Candidate {
                    master: asserted,
                    classification: Classification::Probable,
                    score: 1.0,
                });
            }
        }
        let previous = current.as_ref().map(|rel| rel.target);
        let existing_dups = self
            .relationships
            .computed_by(key, RelationshipKind::Duplicate);

        let mut lock_keys = vec![plan.target];
        lock_keys.extend(previous);
        lock_keys.extend(plan.duplicates.iter().map(|candidate| candidate.master));
        lock_keys.extend(existing_dups.iter().flat_map(|rel| [rel.source, rel.target]));
        let _masters = self.master_locks.lock_all(lock_keys);
        ctx.checkpoint()?;

        let now = self.relationships.master_of(key)?;
        if now.as_ref().map(|rel| rel.id) != current.as_ref().map(|rel| rel.id) {
            return Ok(Attempt::Stale("master edge changed"));
        }
        let dup_ids: BTreeSet<_> = existing_dups.iter().map(|rel| rel.id).collect();
        let now_dup_ids: BTreeSet<_> = self
            .relationships
            .computed_by(key, RelationshipKind::Duplicate)
            .iter()
            .map(|rel| rel.id)
            .collect();
        if dup_ids != now_dup_ids {
            return Ok(Attempt::Stale("duplicate set changed"));
        }
        if !self.is_active_master(plan.target) {
            if plan.verified {
                return Err(MdmError::InvalidOperation(format!(
                    "asserted master {} is not an active master",
                    plan.target
                )));
            }
            return Ok(Attempt::Stale("target master retired"));
        }

        let mut changes = ChangeSet::new();
        if previous != Some(plan.target) {
            if let Some(current) = &current {
                changes.remove(current.id);
            }
            let mut edge = Relationship::master_record(key, plan.target);
            if let Some(score) = plan.score {
                edge = edge.with_score(score);
            }
            if plan.verified {
                edge = edge.verified();
            }
            changes.insert(edge);
        }

        let desired: Vec<Relationship> = plan
            .duplicates
            .iter()
            .filter(|candidate| candidate.master != plan.target)
            .filter(|candidate| self.is_active_master(candidate.master))
            .map(|candidate| {
                Relationship::duplicate(plan.target, candidate.master, candidate.score)
                    .computed_by(key)
            })
            .collect();
        for rel in &existing_dups {
            if !desired.iter().any(|wanted| wanted.same_edge(rel)) {
                changes.remove(rel.id);
            }
        }
        let duplicates = desired.len();
        for rel in desired {
            if !existing_dups.iter().any(|existing| existing.same_edge(&rel)) {
                changes.insert(rel);
            }
        }

        if changes.is_empty() {
            return Ok(Attempt::Done(ResolutionOutcome::Unchanged {
                master: plan.target,
            }));
        }

        ctx.checkpoint()?;
        self.relationships.apply(changes)?;
        if let Some(old) = previous.filter(|old| *old != plan.target) {
            self.settle_master(old)?;
        }
        self.projector.refresh(plan.target);

        let outcome = if plan.created {
            info!(%key, master = %plan.target, duplicates, "local linked to new master");
            ResolutionOutcome::Created {
                master: plan.target,
                previous,
                duplicates,
                collision: plan.collision,
            }
        } else {
            debug!(%key, master = %plan.target, duplicates, "local linked to existing master");
            ResolutionOutcome::Attached {
                master: plan.target,
                previous,
                duplicates,
            }
        };
        Ok(Attempt::Done(outcome))
    }

    /// Re-project a Master that lost a Local, or retire it if it is now empty.
    ///
    /// The caller must hold the Master's exclusive section.
    fn settle_master(&self, master: RecordKey) -> Result<()> {
        if !self.relationships.locals_of(master).is_empty() {
            self.projector.refresh(master);
            return Ok(());
        }

        let mut changes = ChangeSet::new();
        for rel in self
            .relationships
            .outgoing(master, RelationshipKind::Duplicate)
            .into_iter()
            .chain(self.relationships.incoming(master, RelationshipKind::Duplicate))
        {
            changes.remove(rel.id);
        }
        self.relationships.apply(changes)?;
        self.repository.obsolete(master, &self.principal)?;
        self.projector.invalidate(master);
        info!(%master, "empty master obsoleted");
        Ok(())
    }

    /// Detach an obsoleted Local from its Master
    #[instrument(skip(self, ctx), fields(key = %key))]
    pub fn detach(&self, key: RecordKey, ctx: &TaskContext) -> Result<ResolutionOutcome> {
        let _local = self.local_locks.lock(&key);
        let outcome = self.detach_locked(key, ctx);
        if outcome.is_ok() {
            self.states.remove(&key);
        }
        outcome
    }

    fn detach_locked(&self, key: RecordKey, ctx: &TaskContext) -> Result<ResolutionOutcome> {
        for _ in 0..self.max_attempts {
            ctx.checkpoint()?;
            let current = self.relationships.master_of(key)?;
            let dups = self
                .relationships
                .computed_by(key, RelationshipKind::Duplicate);
            if current.is_none() && dups.is_empty() {
                return Ok(ResolutionOutcome::Detached { previous: None });
            }

            let mut lock_keys: Vec<RecordKey> = current.iter().map(|rel| rel.target).collect();
            lock_keys.extend(dups.iter().flat_map(|rel| [rel.source, rel.target]));
            let _masters = self.master_locks.lock_all(lock_keys);

            let now = self.relationships.master_of(key)?;
            if now.as_ref().map(|rel| rel.id) != current.as_ref().map(|rel| rel.id) {
                continue;
            }

            let mut changes = ChangeSet::new();
            if let Some(rel) = &current {
                changes.remove(rel.id);
            }
            for rel in self
                .relationships
                .computed_by(key, RelationshipKind::Duplicate)
            {
                changes.remove(rel.id);
            }
            self.relationships.apply(changes)?;

            let previous = current.map(|rel| rel.target);
            if let Some(master) = previous {
                self.settle_master(master)?;
            }
            info!(%key, ?previous, "obsoleted local detached");
            return Ok(ResolutionOutcome::Detached { previous });
        }
        Err(MdmError::InvalidOperation(format!(
            "detach of {key} kept racing concurrent changes"
        )))
    }

    /// Locals of monitored types without a master whose last enqueue is older
    /// than `older_than` (or that were never enqueued).
    pub fn unlinked_locals(&self, older_than: Duration) -> Vec<(RecordKey, ResourceType)> {
        let mut found = Vec::new();
        for resource_type in self.resources.keys() {
            for record in self.repository.scan(resource_type) {
                if !record.is_local() {
                    continue;
                }
                if matches!(self.relationships.master_of(record.key), Ok(Some(_))) {
                    continue;
                }
                let stale = self
                    .states
                    .get(&record.key)
                    .map(|entry| entry.since.elapsed() >= older_than)
                    .unwrap_or(true);
                if stale {
                    found.push((record.key, resource_type.clone()));
                }
            }
        }
        found.sort();
        found
    }
}
