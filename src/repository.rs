//! # Repository
//!
//! Persistence and tag collaborator contracts consumed by the MDM core, and
//! an in-memory reference implementation.
//!
//! The repository raises lifecycle events around every write, retrieve and
//! query. Handlers are subscribed per resource type and receive an explicit
//! [`Subscription`] handle that must be released with
//! [`RecordRepository::unsubscribe`].

use crate::error::{MdmError, Result};
use crate::model::{Identifier, Principal, Record, RecordKey, ResourceType};
use crate::sync::CancelToken;
use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which side of the MDM layer a read should see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MdmView {
    /// Masters only; Locals are redirected to their Master
    #[default]
    Master,
    /// Locals only, no redirection
    Local,
}

/// Query filter understood by the repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub resource_type: ResourceType,
    pub identifier: Option<Identifier>,
    /// Every tag listed here must be present with the given value
    pub tags: BTreeMap<String, String>,
    pub include_obsolete: bool,
    pub view: MdmView,
}

impl RecordQuery {
    pub fn new(resource_type: impl Into<ResourceType>) -> Self {
        Self {
            resource_type: resource_type.into(),
            identifier: None,
            tags: BTreeMap::new(),
            include_obsolete: false,
            view: MdmView::Master,
        }
    }

    pub fn with_identifier(mut self, domain: &str, value: &str) -> Self {
        self.identifier = Some(Identifier::new(domain, value));
        self
    }

    pub fn with_tag(mut self, name: &str, value: &str) -> Self {
        self.tags.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_view(mut self, view: MdmView) -> Self {
        self.view = view;
        self
    }

    /// Stored-record filter: type, lifecycle and tags
    pub fn selects(&self, record: &Record) -> bool {
        if record.resource_type != self.resource_type {
            return false;
        }
        if record.obsoleted && !self.include_obsolete {
            return false;
        }
        self.tags
            .iter()
            .all(|(name, value)| record.tag(name) == Some(value.as_str()))
    }

    /// Attribute filter, evaluated against records as they are served
    pub fn matches_attributes(&self, record: &Record) -> bool {
        if let Some(identifier) = &self.identifier {
            let wanted = identifier.natural_key();
            if !record
                .identifiers
                .iter()
                .any(|candidate| candidate.natural_key() == wanted)
            {
                return false;
            }
        }
        true
    }
}

/// Outcome of a `retrieving` hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveDirective {
    Continue,
    /// Serve this record instead; redirects are followed exactly once
    Redirect(RecordKey),
}

/// Lifecycle events raised by the persistence collaborator.
///
/// Before-events may mutate the record in flight or veto the operation;
/// after-events only observe.
pub trait LifecycleHandler: Send + Sync {
    fn inserting(&self, _record: &mut Record, _principal: &Principal) -> Result<()> {
        Ok(())
    }

    fn inserted(&self, _record: &Record, _principal: &Principal) {}

    fn updating(
        &self,
        _record: &mut Record,
        _existing: &Record,
        _principal: &Principal,
    ) -> Result<()> {
        Ok(())
    }

    fn updated(&self, _record: &Record, _principal: &Principal) {}

    fn obsoleting(&self, _record: &Record, _principal: &Principal) -> Result<()> {
        Ok(())
    }

    fn obsoleted(&self, _record: &Record, _principal: &Principal) {}

    fn retrieving(
        &self,
        _record: &Record,
        _view: MdmView,
        _principal: &Principal,
    ) -> Result<RetrieveDirective> {
        Ok(RetrieveDirective::Continue)
    }

    fn retrieved(&self, _record: &mut Record, _principal: &Principal) -> Result<()> {
        Ok(())
    }

    fn querying(&self, _query: &mut RecordQuery, _principal: &Principal) -> Result<()> {
        Ok(())
    }

    fn queried(&self, _results: &mut Vec<Record>, _principal: &Principal) -> Result<()> {
        Ok(())
    }
}

/// Handle returned by [`RecordRepository::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: u64,
    pub resource_type: ResourceType,
}

/// Per-type CRUD and query service with lifecycle events
pub trait RecordRepository: Send + Sync {
    fn insert(&self, record: Record, principal: &Principal) -> Result<Record>;

    fn update(&self, record: Record, principal: &Principal) -> Result<Record>;

    fn obsolete(&self, key: RecordKey, principal: &Principal) -> Result<Record>;

    /// Insert or update every record as one unit.
    ///
    /// All before-write hooks run first in order; any failure, or a
    /// cancellation observed before commit, persists nothing. After-write
    /// hooks fire in order once everything is committed.
    fn submit_batch(
        &self,
        records: Vec<Record>,
        principal: &Principal,
        cancel: &CancelToken,
    ) -> Result<Vec<Record>>;

    /// Fetch with retrieve hooks applied
    fn get(&self, key: RecordKey, view: MdmView, principal: &Principal)
        -> Result<Option<Record>>;

    /// Query with query hooks applied
    fn query(&self, query: RecordQuery, principal: &Principal) -> Result<Vec<Record>>;

    /// Raw read without hooks, for the MDM core itself
    fn fetch(&self, key: RecordKey) -> Option<Record>;

    /// Raw scan of live records of a type, without hooks
    fn scan(&self, resource_type: &ResourceType) -> Vec<Record>;

    /// Undo an obsolete without raising events (compensation only)
    fn restore(&self, key: RecordKey) -> Result<()>;

    fn subscribe(
        &self,
        resource_type: ResourceType,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Subscription;

    fn unsubscribe(&self, subscription: &Subscription) -> bool;
}

/// Key-value tag persistence keyed by record; writes raise no events
pub trait TagStore: Send + Sync {
    fn tags(&self, key: RecordKey) -> Option<BTreeMap<String, String>>;

    fn set_tag(&self, key: RecordKey, name: &str, value: &str) -> Result<()>;

    fn remove_tag(&self, key: RecordKey, name: &str) -> Result<bool>;
}

type HandlerList = Vec<(u64, Arc<dyn LifecycleHandler>)>;

/// In-memory repository
#[derive(Default)]
pub struct MemoryRepository {
    records: RwLock<HashMap<RecordKey, Record>>,
    handlers: RwLock<HashMap<ResourceType, HandlerList>>,
    next_subscription: AtomicU64,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live subscriptions for a type
    pub fn subscriber_count(&self, resource_type: &ResourceType) -> usize {
        self.handlers
            .read()
            .get(resource_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn handlers_for(&self, resource_type: &ResourceType) -> Vec<Arc<dyn LifecycleHandler>> {
        self.handlers
            .read()
            .get(resource_type)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default()
    }

    /// Run before-write hooks; returns whether the record is an update
    fn prepare_write(&self, record: &mut Record, principal: &Principal) -> Result<bool> {
        if record.resource_type.is_bundle() {
            return Err(MdmError::NotSupported(
                "bundles are persisted through their entries".to_string(),
            ));
        }
        let existing = self.fetch(record.key);
        let handlers = self.handlers_for(&record.resource_type);
        match existing {
            Some(existing) => {
                record.created_at = existing.created_at;
                record.modified_at = Utc::now();
                for handler in &handlers {
                    handler.updating(record, &existing, principal)?;
                }
                Ok(true)
            }
            None => {
                for handler in &handlers {
                    handler.inserting(record, principal)?;
                }
                Ok(false)
            }
        }
    }

    fn notify_written(&self, record: &Record, is_update: bool, principal: &Principal) {
        for handler in self.handlers_for(&record.resource_type) {
            if is_update {
                handler.updated(record, principal);
            } else {
                handler.inserted(record, principal);
            }
        }
    }
}

impl RecordRepository for MemoryRepository {
    fn insert(&self, mut record: Record, principal: &Principal) -> Result<Record> {
        if self.records.read().contains_key(&record.key) {
            return Err(MdmError::InvalidOperation(format!(
                "record {} already exists",
                record.key
            )));
        }
        self.prepare_write(&mut record, principal)?;
        self.records.write().insert(record.key, record.clone());
        debug!(key = %record.key, resource_type = %record.resource_type, "record inserted");
        self.notify_written(&record, false, principal);
        Ok(record)
    }

    fn update(&self, mut record: Record, principal: &Principal) -> Result<Record> {
        if !self.records.read().contains_key(&record.key) {
            return Err(MdmError::NotFound(format!("record {}", record.key)));
        }
        self.prepare_write(&mut record, principal)?;
        self.records.write().insert(record.key, record.clone());
        debug!(key = %record.key, resource_type = %record.resource_type, "record updated");
        self.notify_written(&record, true, principal);
        Ok(record)
    }

    fn obsolete(&self, key: RecordKey, principal: &Principal) -> Result<Record> {
        let record = self
            .fetch(key)
            .ok_or_else(|| MdmError::NotFound(format!("record {key}")))?;
        let handlers = self.handlers_for(&record.resource_type);
        for handler in &handlers {
            handler.obsoleting(&record, principal)?;
        }

        let obsoleted = {
            let mut records = self.records.write();
            let stored = records
                .get_mut(&key)
                .ok_or_else(|| MdmError::NotFound(format!("record {key}")))?;
            stored.obsoleted = true;
            stored.modified_at = Utc::now();
            stored.clone()
        };
        debug!(%key, "record obsoleted");
        for handler in &handlers {
            handler.obsoleted(&obsoleted, principal);
        }
        Ok(obsoleted)
    }

    fn submit_batch(
        &self,
        records: Vec<Record>,
        principal: &Principal,
        cancel: &CancelToken,
    ) -> Result<Vec<Record>> {
        let mut staged = Vec::with_capacity(records.len());
        for mut record in records {
            if cancel.is_cancelled() {
                return Err(MdmError::Cancelled);
            }
            let is_update = self.prepare_write(&mut record, principal)?;
            staged.push((record, is_update));
        }

        {
            let mut stored = self.records.write();
            // checked under the write lock so nothing is persisted once cancelled
            if cancel.is_cancelled() {
                return Err(MdmError::Cancelled);
            }
            for (record, is_update) in &staged {
                if *is_update != stored.contains_key(&record.key) {
                    return Err(MdmError::InvalidOperation(format!(
                        "record {} changed while the batch was staged",
                        record.key
                    )));
                }
            }
            for (record, _) in &staged {
                stored.insert(record.key, record.clone());
            }
        }
        debug!(entries = staged.len(), "batch committed");

        for (record, is_update) in &staged {
            self.notify_written(record, *is_update, principal);
        }
        Ok(staged.into_iter().map(|(record, _)| record).collect())
    }

    fn get(
        &self,
        key: RecordKey,
        view: MdmView,
        principal: &Principal,
    ) -> Result<Option<Record>> {
        let Some(record) = self.fetch(key) else {
            return Ok(None);
        };

        let mut served = record;
        for handler in self.handlers_for(&served.resource_type) {
            if let RetrieveDirective::Redirect(target) =
                handler.retrieving(&served, view, principal)?
            {
                match self.fetch(target) {
                    Some(redirected) => {
                        served = redirected;
                        break;
                    }
                    None => return Ok(None),
                }
            }
        }

        for handler in self.handlers_for(&served.resource_type) {
            handler.retrieved(&mut served, principal)?;
        }
        Ok(Some(served))
    }

    fn query(&self, mut query: RecordQuery, principal: &Principal) -> Result<Vec<Record>> {
        if query.resource_type.is_bundle() {
            return Err(MdmError::NotSupported(
                "bundles cannot be queried; query their entries".to_string(),
            ));
        }
        let handlers = self.handlers_for(&query.resource_type);
        for handler in &handlers {
            handler.querying(&mut query, principal)?;
        }

        let mut results: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|record| query.selects(record))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));

        for handler in &handlers {
            handler.queried(&mut results, principal)?;
        }
        // hooks may serve a different shape (a master's projection)
        results.retain(|record| query.matches_attributes(record));
        Ok(results)
    }

    fn fetch(&self, key: RecordKey) -> Option<Record> {
        self.records.read().get(&key).cloned()
    }

    fn scan(&self, resource_type: &ResourceType) -> Vec<Record> {
        self.records
            .read()
            .values()
            .filter(|record| &record.resource_type == resource_type && !record.obsoleted)
            .cloned()
            .collect()
    }

    fn restore(&self, key: RecordKey) -> Result<()> {
        let mut records = self.records.write();
        let stored = records
            .get_mut(&key)
            .ok_or_else(|| MdmError::NotFound(format!("record {key}")))?;
        stored.obsoleted = false;
        Ok(())
    }

    fn subscribe(
        &self,
        resource_type: ResourceType,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(resource_type.clone())
            .or_default()
            .push((id, handler));
        Subscription { id, resource_type }
    }

    fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&subscription.resource_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&subscription.resource_type);
        }
        removed
    }
}

impl TagStore for MemoryRepository {
    fn tags(&self, key: RecordKey) -> Option<BTreeMap<String, String>> {
        self.records.read().get(&key).map(|record| record.tags.clone())
    }

    fn set_tag(&self, key: RecordKey, name: &str, value: &str) -> Result<()> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&key)
            .ok_or_else(|| MdmError::NotFound(format!("record {key}")))?;
        record.tags.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn remove_tag(&self, key: RecordKey, name: &str) -> Result<bool> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&key)
            .ok_or_else(|| MdmError::NotFound(format!("record {key}")))?;
        Ok(record.tags.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        veto: bool,
    }

    impl LifecycleHandler for Recorder {
        fn inserting(&self, record: &mut Record, _principal: &Principal) -> Result<()> {
            if self.veto {
                return Err(MdmError::Permission("vetoed".to_string()));
            }
            record.tags.insert("seen".to_string(), "yes".to_string());
            self.events.lock().push("inserting".to_string());
            Ok(())
        }

        fn inserted(&self, record: &Record, _principal: &Principal) {
            self.events
                .lock()
                .push(format!("inserted:{}", record.names[0].text));
        }
    }

    #[test]
    fn test_insert_runs_hooks_in_order() {
        let repo = MemoryRepository::new();
        let recorder = Arc::new(Recorder::default());
        repo.subscribe(ResourceType::new("Patient"), recorder.clone());

        let stored = repo
            .insert(Record::new("Patient").with_name("Ann"), &Principal::anonymous())
            .unwrap();
        assert_eq!(stored.tag("seen"), Some("yes"));
        assert_eq!(
            recorder.events.lock().clone(),
            vec!["inserting".to_string(), "inserted:Ann".to_string()]
        );
    }

    #[test]
    fn test_vetoed_insert_is_not_persisted() {
        let repo = MemoryRepository::new();
        let recorder = Arc::new(Recorder {
            veto: true,
            ..Recorder::default()
        });
        repo.subscribe(ResourceType::new("Patient"), recorder);

        let result = repo.insert(Record::new("Patient"), &Principal::anonymous());
        assert!(matches!(result, Err(MdmError::Permission(_))));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_unsubscribe_stops_events() {
        let repo = MemoryRepository::new();
        let recorder = Arc::new(Recorder::default());
        let subscription = repo.subscribe(ResourceType::new("Patient"), recorder.clone());
        assert!(repo.unsubscribe(&subscription));
        assert!(!repo.unsubscribe(&subscription));

        repo.insert(Record::new("Patient").with_name("Bo"), &Principal::anonymous())
            .unwrap();
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_cancelled_batch_persists_nothing() {
        let repo = MemoryRepository::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = repo.submit_batch(
            vec![Record::new("Patient"), Record::new("Patient")],
            &Principal::anonymous(),
            &cancel,
        );
        assert!(matches!(result, Err(MdmError::Cancelled)));
        assert!(repo.is_empty());
    }

    #[test]
    fn test_query_filters_by_identifier_and_tag() {
        let repo = MemoryRepository::new();
        let principal = Principal::anonymous();
        repo.insert(
            Record::new("Patient")
                .with_identifier("MRN", "1")
                .with_tag("colour", "red"),
            &principal,
        )
        .unwrap();
        repo.insert(Record::new("Patient").with_identifier("MRN", "2"), &principal)
            .unwrap();

        let by_id = repo
            .query(
                RecordQuery::new("Patient").with_identifier("mrn", "1"),
                &principal,
            )
            .unwrap();
        assert_eq!(by_id.len(), 1);

        let by_tag = repo
            .query(RecordQuery::new("Patient").with_tag("colour", "red"), &principal)
            .unwrap();
        assert_eq!(by_tag.len(), 1);
    }

    #[test]
    fn test_tag_writes_keep_modified_time() {
        let repo = MemoryRepository::new();
        let stored = repo
            .insert(Record::new("Patient"), &Principal::anonymous())
            .unwrap();
        repo.set_tag(stored.key, "x", "1").unwrap();
        let reloaded = repo.fetch(stored.key).unwrap();
        assert_eq!(reloaded.tag("x"), Some("1"));
        assert_eq!(reloaded.modified_at, stored.modified_at);
        assert!(repo.remove_tag(stored.key, "x").unwrap());
    }
}
