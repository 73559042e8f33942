//! Transactional multi-record submissions.
//!
//! Every entry passes the before-write hooks while staged; one rejection
//! rejects the whole bundle. After-write hooks, and therefore resolution,
//! only run for committed entries, in submission order.

use crate::error::{MdmError, Result};
use crate::model::{Principal, Record};
use crate::repository::RecordRepository;
use crate::sync::CancelToken;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Ordered set of records submitted as one unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub entries: Vec<Record>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a bundle document as received on the wire
    pub fn from_json(document: &str) -> Result<Self> {
        serde_json::from_str(document)
            .map_err(|err| MdmError::InvalidOperation(format!("malformed bundle: {err}")))
    }

    pub fn with_entry(mut self, record: Record) -> Self {
        self.entries.push(record);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct BundleChainer {
    repository: Arc<dyn RecordRepository>,
}

impl BundleChainer {
    pub fn new(repository: Arc<dyn RecordRepository>) -> Self {
        Self { repository }
    }

    #[instrument(skip_all, fields(entries = bundle.len(), principal = %principal))]
    pub fn submit(
        &self,
        bundle: Bundle,
        principal: &Principal,
        cancel: &CancelToken,
    ) -> Result<Vec<Record>> {
        if bundle
            .entries
            .iter()
            .any(|entry| entry.resource_type.is_bundle())
        {
            return Err(MdmError::NotSupported(
                "bundles cannot be nested".to_string(),
            ));
        }
        if bundle.is_empty() {
            return Ok(Vec::new());
        }

        let committed = self
            .repository
            .submit_batch(bundle.entries, principal, cancel)
            .map_err(|err| {
                warn!(error = %err, "bundle rejected; nothing persisted");
                err
            })?;
        info!(committed = committed.len(), "bundle committed");
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceType;
    use crate::repository::{LifecycleHandler, MemoryRepository};

    struct RejectUnnamed;

    impl LifecycleHandler for RejectUnnamed {
        fn inserting(&self, record: &mut Record, _principal: &Principal) -> Result<()> {
            if record.names.is_empty() {
                return Err(MdmError::Permission("name required".to_string()));
            }
            Ok(())
        }
    }

    fn chainer() -> (Arc<MemoryRepository>, BundleChainer) {
        let repository = Arc::new(MemoryRepository::new());
        repository.subscribe(ResourceType::new("Patient"), Arc::new(RejectUnnamed));
        let chainer = BundleChainer::new(repository.clone());
        (repository, chainer)
    }

    #[test]
    fn test_one_rejected_entry_rejects_the_bundle() {
        let (repository, chainer) = chainer();
        let bundle = Bundle::new()
            .with_entry(Record::new("Patient").with_name("Ann"))
            .with_entry(Record::new("Patient"));

        let result = chainer.submit(bundle, &Principal::anonymous(), &CancelToken::new());
        assert!(matches!(result, Err(MdmError::Permission(_))));
        assert!(repository.is_empty());
    }

    #[test]
    fn test_committed_in_submission_order() {
        let (repository, chainer) = chainer();
        let bundle = Bundle::new()
            .with_entry(Record::new("Patient").with_name("Ann"))
            .with_entry(Record::new("Patient").with_name("Bo"));

        let committed = chainer
            .submit(bundle, &Principal::anonymous(), &CancelToken::new())
            .unwrap();
        let names: Vec<&str> = committed.iter().map(|r| r.names[0].text.as_str()).collect();
        assert_eq!(names, vec!["Ann", "Bo"]);
        assert_eq!(repository.len(), 2);
    }

    #[test]
    fn test_nested_bundle_is_not_supported() {
        let (_, chainer) = chainer();
        let bundle = Bundle::new().with_entry(Record::new(ResourceType::BUNDLE));
        assert!(matches!(
            chainer.submit(bundle, &Principal::anonymous(), &CancelToken::new()),
            Err(MdmError::NotSupported(_))
        ));
    }

    #[test]
    fn test_bundle_from_json() {
        let original = Bundle::new().with_entry(Record::new("Patient").with_name("Ann"));
        let document = serde_json::to_string(&original).unwrap();
        assert_eq!(Bundle::from_json(&document).unwrap(), original);
        assert!(matches!(
            Bundle::from_json("{\"entries\": 3}"),
            Err(MdmError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_cancelled_bundle_is_discarded() {
        let (repository, chainer) = chainer();
        let cancel = CancelToken::new();
        cancel.cancel();
        let bundle = Bundle::new().with_entry(Record::new("Patient").with_name("Ann"));
        assert!(matches!(
            chainer.submit(bundle, &Principal::anonymous(), &cancel),
            Err(MdmError::Cancelled)
        ));
        assert!(repository.is_empty());
    }
}
