//! # Record Event Listener
//!
//! Lifecycle handler subscribed once per monitored resource type. It tags and
//! gates writes synchronously, hands Locals to the resolution workers after
//! they are persisted, and rewrites reads so callers see Masters through
//! their projections.
//!
//! Handlers are built by typed factories registered per [`RecordKind`]; the
//! registry keeps every subscription handle so shutdown can release them.

use crate::config::ResourceConfig;
use crate::engine::ResolutionTask;
use crate::error::{MdmError, Result};
use crate::model::{MdmRole, Principal, Record, RecordKind, MDM_TYPE_TAG};
use crate::projection::SyntheticMasterProjector;
use crate::repository::{
    LifecycleHandler, MdmView, RecordQuery, RecordRepository, RetrieveDirective, Subscription,
};
use crate::store::RelationshipStore;
use crate::worker::ResolutionWorkers;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared collaborators handed to every listener factory
#[derive(Clone)]
pub struct ListenerContext {
    pub resource: ResourceConfig,
    pub system_policy: String,
    pub relationships: Arc<dyn RelationshipStore>,
    pub projector: Arc<SyntheticMasterProjector>,
    pub workers: Arc<ResolutionWorkers>,
}

/// Builds the handler for one monitored resource type
pub type ListenerFactory = fn(ListenerContext) -> Arc<dyn LifecycleHandler>;

pub struct RecordEventListener {
    kind: RecordKind,
    ctx: ListenerContext,
}

impl RecordEventListener {
    pub fn new(kind: RecordKind, ctx: ListenerContext) -> Self {
        Self { kind, ctx }
    }

    fn require_system(&self, principal: &Principal, action: &str) -> Result<()> {
        if principal.has_policy(&self.ctx.system_policy) {
            return Ok(());
        }
        warn!(
            principal = %principal,
            resource_type = %self.ctx.resource.resource_type,
            kind = ?self.kind,
            action,
            "write rejected"
        );
        Err(MdmError::Permission(format!(
            "{principal} may not {action} without the {} policy",
            self.ctx.system_policy
        )))
    }

    fn enqueue(&self, task: ResolutionTask) {
        let key = task.key();
        if let Err(err) = self.ctx.workers.enqueue(task) {
            warn!(%key, error = %err, "could not queue resolution; left for reconciliation");
        }
    }

    fn invalidate_master_of(&self, local: &Record) {
        match self.ctx.relationships.master_of(local.key) {
            Ok(Some(edge)) => self.ctx.projector.invalidate(edge.target),
            Ok(None) => {}
            Err(err) => warn!(key = %local.key, error = %err, "master lookup failed"),
        }
    }

    fn after_write(&self, record: &Record) {
        match record.role() {
            Some(MdmRole::Local) => {
                self.invalidate_master_of(record);
                self.enqueue(ResolutionTask::Resolve {
                    key: record.key,
                    resource_type: record.resource_type.clone(),
                });
            }
            Some(MdmRole::Master) => self.ctx.projector.invalidate(record.key),
            None => {}
        }
    }
}

/// Strip what a principal may not see from a restricted Local
fn redact_local(record: &mut Record) {
    record.names.clear();
    record.addresses.clear();
    record.birth_date = None;
    record.gender = None;
}

impl LifecycleHandler for RecordEventListener {
    fn inserting(&self, record: &mut Record, principal: &Principal) -> Result<()> {
        if !record.relationship_assertions.is_empty() {
            self.require_system(principal, "assert MDM relationships")?;
        }
        let tagged = record.tag(MDM_TYPE_TAG).map(str::to_string);
        match (record.role(), tagged) {
            (Some(MdmRole::Master), _) => self.require_system(principal, "create masters")?,
            (Some(MdmRole::Local), _) => {}
            (None, Some(other)) => {
                return Err(MdmError::InvalidOperation(format!(
                    "unknown {MDM_TYPE_TAG} value '{other}'"
                )))
            }
            (None, None) => {
                record.tags.insert(
                    MDM_TYPE_TAG.to_string(),
                    MdmRole::Local.tag_value().to_string(),
                );
            }
        }
        Ok(())
    }

    fn inserted(&self, record: &Record, _principal: &Principal) {
        self.after_write(record);
    }

    fn updating(&self, record: &mut Record, existing: &Record, principal: &Principal) -> Result<()> {
        if record.relationship_assertions != existing.relationship_assertions {
            self.require_system(principal, "assert MDM relationships")?;
        }
        if existing.is_master() || record.is_master() {
            self.require_system(principal, "modify masters")?;
        }
        let incoming = record.tag(MDM_TYPE_TAG).map(str::to_string);
        match (incoming, existing.tag(MDM_TYPE_TAG)) {
            (None, Some(kept)) => {
                record
                    .tags
                    .insert(MDM_TYPE_TAG.to_string(), kept.to_string());
            }
            (incoming, stored) if incoming.as_deref() != stored => {
                self.require_system(principal, "change a record's MDM role")?
            }
            _ => {}
        }
        Ok(())
    }

    fn updated(&self, record: &Record, _principal: &Principal) {
        self.after_write(record);
    }

    fn obsoleting(&self, record: &Record, principal: &Principal) -> Result<()> {
        if record.is_master() {
            self.require_system(principal, "obsolete masters")?;
        }
        Ok(())
    }

    fn obsoleted(&self, record: &Record, _principal: &Principal) {
        match record.role() {
            Some(MdmRole::Local) => {
                self.invalidate_master_of(record);
                self.enqueue(ResolutionTask::Detach { key: record.key });
            }
            Some(MdmRole::Master) => self.ctx.projector.invalidate(record.key),
            None => {}
        }
    }

    fn retrieving(
        &self,
        record: &Record,
        view: MdmView,
        _principal: &Principal,
    ) -> Result<RetrieveDirective> {
        if view == MdmView::Local || !record.is_local() {
            return Ok(RetrieveDirective::Continue);
        }
        match self.ctx.relationships.master_of(record.key)? {
            Some(edge) => {
                debug!(key = %record.key, master = %edge.target, "redirecting local to master");
                Ok(RetrieveDirective::Redirect(edge.target))
            }
            None => Ok(RetrieveDirective::Continue),
        }
    }

    fn retrieved(&self, record: &mut Record, principal: &Principal) -> Result<()> {
        if record.is_master() && !record.obsoleted {
            *record = self.ctx.projector.project(record.key, principal)?;
        } else if record.is_local() && !self.ctx.projector.can_see(record, principal) {
            redact_local(record);
        }
        Ok(())
    }

    fn querying(&self, query: &mut RecordQuery, _principal: &Principal) -> Result<()> {
        let role = match query.view {
            MdmView::Master => MdmRole::Master,
            MdmView::Local => MdmRole::Local,
        };
        query
            .tags
            .insert(MDM_TYPE_TAG.to_string(), role.tag_value().to_string());
        Ok(())
    }

    fn queried(&self, results: &mut Vec<Record>, principal: &Principal) -> Result<()> {
        for record in results.iter_mut() {
            if record.is_master() && !record.obsoleted {
                *record = self.ctx.projector.project(record.key, principal)?;
            } else if record.is_local() && !self.ctx.projector.can_see(record, principal) {
                redact_local(record);
            }
        }
        Ok(())
    }
}

fn entity_listener(ctx: ListenerContext) -> Arc<dyn LifecycleHandler> {
    Arc::new(RecordEventListener::new(RecordKind::EntityLike, ctx))
}

fn act_listener(ctx: ListenerContext) -> Arc<dyn LifecycleHandler> {
    Arc::new(RecordEventListener::new(RecordKind::ActLike, ctx))
}

/// Typed listener factories and the subscriptions they produced
pub struct ListenerRegistry {
    factories: HashMap<RecordKind, ListenerFactory>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    /// Registry with the built-in factory for each record kind
    pub fn new() -> Self {
        let mut factories: HashMap<RecordKind, ListenerFactory> = HashMap::new();
        factories.insert(RecordKind::EntityLike, entity_listener);
        factories.insert(RecordKind::ActLike, act_listener);
        Self {
            factories,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Build and subscribe the listener for one monitored resource type
    pub fn attach(
        &self,
        repository: &dyn RecordRepository,
        ctx: ListenerContext,
    ) -> Result<Subscription> {
        let kind = ctx.resource.kind;
        let factory = self.factories.get(&kind).ok_or_else(|| {
            MdmError::Configuration(format!("no listener factory for {kind:?} resources"))
        })?;
        let resource_type = ctx.resource.resource_type.clone();
        let subscription = repository.subscribe(resource_type.clone(), factory(ctx));
        info!(%resource_type, ?kind, subscription = subscription.id, "listener attached");
        self.subscriptions.lock().push(subscription.clone());
        Ok(subscription)
    }

    /// Release every subscription; returns how many were still live
    pub fn detach_all(&self, repository: &dyn RecordRepository) -> usize {
        let released = self
            .subscriptions
            .lock()
            .drain(..)
            .filter(|subscription| repository.unsubscribe(subscription))
            .count();
        debug!(released, "listeners detached");
        released
    }
}
