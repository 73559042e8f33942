mod support;

use mdm_rs::config::{ConfigOverrides, LockingOverrides, WorkerOverrides};
use mdm_rs::{MatcherRegistry, MdmConfig, MdmError, MdmService, RecordKind, ResourceConfig};
use std::io::Write;
use std::sync::Arc;
use support::test_config;

struct Silent;

impl mdm_rs::MatchingService for Silent {
    fn block(&self, _record: &mdm_rs::Record, _config: &str) -> anyhow::Result<Vec<mdm_rs::Record>> {
        Ok(Vec::new())
    }

    fn match_record(
        &self,
        _record: &mdm_rs::Record,
        _config: &str,
    ) -> anyhow::Result<Vec<mdm_rs::MatchResult>> {
        Ok(Vec::new())
    }
}

fn matchers() -> MatcherRegistry {
    MatcherRegistry::new().with("default", Arc::new(Silent))
}

#[test]
fn missing_matcher_prevents_startup() {
    let config = test_config().with_resource(ResourceConfig::new("Encounter", "encounters"));
    let result = MdmService::start(config, matchers());
    assert!(matches!(result, Err(MdmError::Configuration(msg)) if msg.contains("encounters")));
}

#[test]
fn zero_workers_prevents_startup() {
    let mut config = test_config();
    config.workers.worker_count = 0;
    assert!(matches!(
        MdmService::start(config, matchers()),
        Err(MdmError::Configuration(_))
    ));
}

#[test]
fn duplicate_resource_type_prevents_startup() {
    let config = test_config().with_resource(ResourceConfig::new("Patient", "default"));
    assert!(matches!(
        MdmService::start(config, matchers()),
        Err(MdmError::Configuration(_))
    ));
}

#[test]
fn bundle_cannot_be_monitored() {
    let config = test_config().with_resource(ResourceConfig::new("Bundle", "default"));
    assert!(matches!(
        MdmService::start(config, matchers()),
        Err(MdmError::Configuration(_))
    ));
}

#[test]
fn valid_config_starts_and_stops() {
    let config = test_config()
        .with_resource(ResourceConfig::new("Encounter", "default").with_kind(RecordKind::ActLike));
    let service = MdmService::start(config, matchers()).unwrap();
    assert_eq!(service.config().resources.len(), 2);
    assert!(service.shutdown());
}

#[test]
fn file_settings_yield_to_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[[resources]]
resource_type = "Patient"
match_configuration = "default"
auto_merge_on_single_match = false

[workers]
worker_count = 3
task_timeout_ms = 1500

[locking]
merge_lock_timeout_ms = 900
"#
    )
    .unwrap();

    let overrides = ConfigOverrides {
        workers: Some(WorkerOverrides {
            worker_count: Some(1),
            ..Default::default()
        }),
        locking: Some(LockingOverrides {
            merge_lock_timeout_ms: Some(50),
        }),
    };
    let config = MdmConfig::load(Some(file.path()), overrides).unwrap();
    assert_eq!(config.workers.worker_count, 1);
    assert_eq!(config.workers.task_timeout_ms, 1500);
    assert_eq!(config.locking.merge_lock_timeout_ms, 50);
    assert!(!config.resources[0].auto_merge_on_single_match);

    let service = MdmService::start(config, matchers()).unwrap();
    assert_eq!(service.worker_stats().pending, 0);
}
