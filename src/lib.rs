//! # mdm-rs
//!
//! Master data management for clinical records: identity resolution,
//! duplicate detection and merge.
//!
//! Source systems write *Local* records through a [`RecordRepository`]. The
//! MDM layer tags and gates those writes, resolves every Local to exactly one
//! *Master* in the background, and serves Masters as a projection aggregated
//! from their Locals. Administrators merge and unmerge Masters through
//! [`MdmService`].

pub mod bundle;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod matching;
pub mod merge;
pub mod model;
pub mod projection;
pub mod repository;
pub mod store;
pub mod sync;
pub mod worker;

// Re-export main types for convenience
pub use bundle::{Bundle, BundleChainer};
pub use config::{ConfigOverrides, MdmConfig, ResourceConfig};
pub use engine::{MasterResolutionEngine, ResolutionOutcome, ResolutionState, ResolutionTask};
pub use error::{MdmError, Result};
pub use listener::{ListenerContext, ListenerRegistry, RecordEventListener};
pub use matching::{Classification, MatchResult, MatcherRegistry, MatchingService};
pub use merge::{MergeCoordinator, UnmergeOutcome};
pub use model::{Principal, Record, RecordKey, RecordKind, ResourceType};
pub use projection::SyntheticMasterProjector;
pub use repository::{
    LifecycleHandler, MdmView, MemoryRepository, RecordQuery, RecordRepository, TagStore,
};
pub use store::{MemoryRelationshipStore, Relationship, RelationshipKind, RelationshipStore};
pub use sync::CancelToken;
pub use worker::WorkerStats;

use crate::sync::KeyedLocks;
use crate::worker::ResolutionWorkers;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Main API: one MDM instance owning every component
pub struct MdmService {
    config: MdmConfig,
    repository: Arc<dyn RecordRepository>,
    relationships: Arc<dyn RelationshipStore>,
    projector: Arc<SyntheticMasterProjector>,
    engine: Arc<MasterResolutionEngine>,
    workers: Arc<ResolutionWorkers>,
    listeners: ListenerRegistry,
    merges: MergeCoordinator,
    bundles: BundleChainer,
}

impl MdmService {
    /// Start with the in-memory repository and relationship store
    pub fn start(config: MdmConfig, matchers: MatcherRegistry) -> Result<Self> {
        let repository = Arc::new(MemoryRepository::new());
        Self::with_collaborators(
            config,
            matchers,
            repository.clone(),
            repository,
            Arc::new(MemoryRelationshipStore::new()),
        )
    }

    /// Start on caller-supplied collaborators.
    ///
    /// Configuration problems abort startup with [`MdmError::Configuration`].
    pub fn with_collaborators(
        config: MdmConfig,
        matchers: MatcherRegistry,
        repository: Arc<dyn RecordRepository>,
        tags: Arc<dyn TagStore>,
        relationships: Arc<dyn RelationshipStore>,
    ) -> Result<Self> {
        config.validate(&matchers)?;

        let projector = Arc::new(SyntheticMasterProjector::new(
            Arc::clone(&repository),
            Arc::clone(&relationships),
            &config.security.system_policy,
        ));
        let master_locks = Arc::new(KeyedLocks::new());
        let engine = Arc::new(MasterResolutionEngine::new(
            &config,
            Arc::clone(&repository),
            tags,
            Arc::clone(&relationships),
            Arc::clone(&projector),
            matchers.clone(),
            Arc::clone(&master_locks),
        ));
        let workers = Arc::new(ResolutionWorkers::start(
            Arc::clone(&engine),
            &config.workers,
        )?);
        let merges = MergeCoordinator::new(
            &config,
            Arc::clone(&repository),
            Arc::clone(&relationships),
            Arc::clone(&projector),
            matchers,
            master_locks,
        );
        let bundles = BundleChainer::new(Arc::clone(&repository));

        let listeners = ListenerRegistry::new();
        for resource in &config.resources {
            let ctx = ListenerContext {
                resource: resource.clone(),
                system_policy: config.security.system_policy.clone(),
                relationships: Arc::clone(&relationships),
                projector: Arc::clone(&projector),
                workers: Arc::clone(&workers),
            };
            if let Err(err) = listeners.attach(repository.as_ref(), ctx) {
                listeners.detach_all(repository.as_ref());
                workers.shutdown(config.workers.shutdown_grace());
                return Err(err);
            }
        }
        info!(
            resources = config.resources.len(),
            workers = config.workers.worker_count,
            "mdm service started"
        );

        Ok(Self {
            config,
            repository,
            relationships,
            projector,
            engine,
            workers,
            listeners,
            merges,
            bundles,
        })
    }

    pub fn config(&self) -> &MdmConfig {
        &self.config
    }

    /// Repository that source systems write through
    pub fn repository(&self) -> &Arc<dyn RecordRepository> {
        &self.repository
    }

    pub fn relationships(&self) -> &Arc<dyn RelationshipStore> {
        &self.relationships
    }

    /// Submit several records as one all-or-nothing unit
    pub fn submit_bundle(
        &self,
        bundle: Bundle,
        principal: &Principal,
        cancel: &CancelToken,
    ) -> Result<Vec<Record>> {
        self.bundles.submit(bundle, principal, cancel)
    }

    pub fn merge(
        &self,
        master: RecordKey,
        duplicates: &[RecordKey],
        principal: &Principal,
    ) -> Result<Record> {
        self.merges.merge(master, duplicates, principal)
    }

    pub fn unmerge(
        &self,
        master: RecordKey,
        target: RecordKey,
        principal: &Principal,
    ) -> Result<UnmergeOutcome> {
        self.merges.unmerge(master, target, principal)
    }

    /// Re-queue Locals still lacking a master; returns how many were queued
    pub fn reconcile(&self) -> usize {
        let due = self
            .engine
            .unlinked_locals(self.config.reconciliation.unlinked_timeout());
        let mut queued = 0;
        for (key, resource_type) in due {
            match self.workers.enqueue(ResolutionTask::Resolve { key, resource_type }) {
                Ok(()) => queued += 1,
                Err(err) => warn!(%key, error = %err, "reconciliation could not queue local"),
            }
        }
        info!(queued, "reconciliation sweep finished");
        queued
    }

    /// Duplicate candidate edges from or to `master`
    pub fn duplicates_of(&self, master: RecordKey) -> Vec<Relationship> {
        let mut edges = self
            .relationships
            .outgoing(master, RelationshipKind::Duplicate);
        edges.extend(
            self.relationships
                .incoming(master, RelationshipKind::Duplicate),
        );
        edges
    }

    pub fn locals_of(&self, master: RecordKey) -> Vec<RecordKey> {
        self.relationships.locals_of(master)
    }

    pub fn master_of(&self, local: RecordKey) -> Result<Option<RecordKey>> {
        Ok(self.relationships.master_of(local)?.map(|edge| edge.target))
    }

    /// Master projection as seen by `principal`
    pub fn project(&self, master: RecordKey, principal: &Principal) -> Result<Record> {
        self.projector.project(master, principal)
    }

    pub fn resolution_state(&self, key: RecordKey) -> Option<ResolutionState> {
        self.engine.state(key)
    }

    /// Whether background resolution still accepts work
    pub fn is_running(&self) -> bool {
        self.workers.is_running()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.workers.stats()
    }

    /// Block until queued resolutions finish; false if `timeout` passed first
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.workers.wait_idle(timeout)
    }

    /// Release subscriptions and stop the workers.
    ///
    /// Returns whether pending work drained within the configured grace
    /// period. Safe to call more than once.
    pub fn shutdown(&self) -> bool {
        let released = self.listeners.detach_all(self.repository.as_ref());
        let drained = self
            .workers
            .shutdown(self.config.workers.shutdown_grace());
        if released > 0 {
            info!(released, drained, "mdm service stopped");
        }
        drained
    }
}

impl Drop for MdmService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
