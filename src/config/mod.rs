//! Configuration for the MDM service.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (mdm.toml)
//! ```toml
//! [[resources]]
//! resource_type = "Patient"
//! match_configuration = "patient-deterministic"
//! auto_merge_on_single_match = true
//!
//! [[resources]]
//! resource_type = "Encounter"
//! match_configuration = "encounter-default"
//! kind = "act-like"
//!
//! [workers]
//! worker_count = 4
//! task_timeout_ms = 10000
//! ```

mod defaults;

pub use defaults::*;

use crate::error::{MdmError, Result};
use crate::matching::MatcherRegistry;
use crate::model::{RecordKind, ResourceType, DEFAULT_SYSTEM_POLICY};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the MDM service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MdmConfig {
    /// Monitored resource types, in registration order
    pub resources: Vec<ResourceConfig>,
    /// Background resolution workers
    pub workers: WorkerConfig,
    /// Exclusive-section tuning
    pub locking: LockingConfig,
    /// Sweep for Locals left without a master
    pub reconciliation: ReconciliationConfig,
    /// Policy names used for gating and redaction
    pub security: SecurityConfig,
}

impl MdmConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - Programmatic overrides applied last
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(MdmConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with MDM_ prefix, `__` between sections
        // (MDM_WORKERS__WORKER_COUNT -> workers.worker_count)
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_SECTION_SEPARATOR));

        // Layer 3: Programmatic overrides
        figment = figment.merge(Serialized::defaults(overrides));

        Ok(figment.extract()?)
    }

    /// Load from environment and optional config file only
    pub fn from_env(config_path: Option<&Path>) -> Result<Self> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Add a monitored resource type
    pub fn with_resource(mut self, resource: ResourceConfig) -> Self {
        self.resources.push(resource);
        self
    }

    /// Check the configuration against the registered matchers.
    ///
    /// Any failure here is fatal: the service must not start.
    pub fn validate(&self, matchers: &MatcherRegistry) -> Result<()> {
        if self.workers.worker_count == 0 {
            return Err(MdmError::Configuration(
                "workers.worker_count must be at least 1".to_string(),
            ));
        }
        if self.workers.queue_capacity == 0 {
            return Err(MdmError::Configuration(
                "workers.queue_capacity must be at least 1".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for resource in &self.resources {
            if resource.resource_type.is_bundle() {
                return Err(MdmError::Configuration(format!(
                    "{} cannot be monitored directly",
                    resource.resource_type
                )));
            }
            if !seen.insert(resource.resource_type.clone()) {
                return Err(MdmError::Configuration(format!(
                    "resource type {} is configured twice",
                    resource.resource_type
                )));
            }
            if !matchers.contains(&resource.match_configuration) {
                return Err(MdmError::Configuration(format!(
                    "no matching service registered for {} (configuration '{}')",
                    resource.resource_type, resource.match_configuration
                )));
            }
        }
        Ok(())
    }
}

/// One monitored resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub resource_type: ResourceType,
    /// Name of the matching configuration to use
    #[serde(default = "default_match_configuration")]
    pub match_configuration: String,
    /// Attach automatically when exactly one master matches
    #[serde(default = "default_true")]
    pub auto_merge_on_single_match: bool,
    #[serde(default)]
    pub kind: RecordKind,
}

impl ResourceConfig {
    pub fn new(resource_type: impl Into<ResourceType>, match_configuration: &str) -> Self {
        Self {
            resource_type: resource_type.into(),
            match_configuration: match_configuration.to_string(),
            auto_merge_on_single_match: true,
            kind: RecordKind::EntityLike,
        }
    }

    pub fn with_auto_merge(mut self, enabled: bool) -> Self {
        self.auto_merge_on_single_match = enabled;
        self
    }

    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.kind = kind;
        self
    }
}

fn default_match_configuration() -> String {
    DEFAULT_MATCH_CONFIGURATION.to_string()
}

fn default_true() -> bool {
    true
}

/// Resolution worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads; tasks are routed by record key
    pub worker_count: usize,
    /// Bounded queue capacity per worker
    pub queue_capacity: usize,
    /// Deadline for one resolution task (milliseconds)
    pub task_timeout_ms: u64,
    /// Shutdown drain budget (milliseconds)
    pub shutdown_grace_ms: u64,
    /// Retries when masters change under a resolution
    pub max_resolution_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task_timeout_ms: DEFAULT_TASK_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            max_resolution_attempts: DEFAULT_MAX_RESOLUTION_ATTEMPTS,
        }
    }
}

impl WorkerConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Exclusive-section configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// How long merge/unmerge wait for busy masters (milliseconds)
    pub merge_lock_timeout_ms: u64,
    /// Backoff hint carried by merge conflicts (milliseconds)
    pub retry_after_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            merge_lock_timeout_ms: DEFAULT_MERGE_LOCK_TIMEOUT_MS,
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
        }
    }
}

impl LockingConfig {
    pub fn merge_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_lock_timeout_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

/// Reconciliation sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Age after which an unlinked Local is re-enqueued (seconds)
    pub unlinked_timeout_secs: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            unlinked_timeout_secs: DEFAULT_UNLINKED_TIMEOUT_SECS,
        }
    }
}

impl ReconciliationConfig {
    pub fn unlinked_timeout(&self) -> Duration {
        Duration::from_secs(self.unlinked_timeout_secs)
    }
}

/// Security configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Policy that allows writing Master data and administering merges
    pub system_policy: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            system_policy: DEFAULT_SYSTEM_POLICY.to_string(),
        }
    }
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locking: Option<LockingOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_lock_timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{MatchResult, MatchingService};
    use crate::model::Record;
    use std::io::Write;
    use std::sync::Arc;

    struct NoMatches;

    impl MatchingService for NoMatches {
        fn block(&self, _record: &Record, _config: &str) -> anyhow::Result<Vec<Record>> {
            Ok(Vec::new())
        }

        fn match_record(&self, _record: &Record, _config: &str) -> anyhow::Result<Vec<MatchResult>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_default_config() {
        let config = MdmConfig::default();
        assert!(config.resources.is_empty());
        assert!(config.workers.worker_count >= 1);
        assert_eq!(config.locking.retry_after_ms, DEFAULT_RETRY_AFTER_MS);
        assert_eq!(config.security.system_policy, DEFAULT_SYSTEM_POLICY);
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[resources]]
resource_type = "Patient"
match_configuration = "patients"

[[resources]]
resource_type = "Encounter"
kind = "act-like"
auto_merge_on_single_match = false

[workers]
worker_count = 3
"#
        )
        .unwrap();

        let config = MdmConfig::from_env(Some(file.path())).unwrap();
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].match_configuration, "patients");
        assert!(config.resources[0].auto_merge_on_single_match);
        assert_eq!(config.resources[1].kind, RecordKind::ActLike);
        assert_eq!(
            config.resources[1].match_configuration,
            DEFAULT_MATCH_CONFIGURATION
        );
        assert!(!config.resources[1].auto_merge_on_single_match);
        assert_eq!(config.workers.worker_count, 3);
    }

    #[test]
    fn test_overrides_win() {
        let overrides = ConfigOverrides {
            workers: Some(WorkerOverrides {
                worker_count: Some(2),
                task_timeout_ms: None,
            }),
            locking: None,
        };
        let config = MdmConfig::load(None, overrides).unwrap();
        assert_eq!(config.workers.worker_count, 2);
        assert_eq!(config.workers.task_timeout_ms, DEFAULT_TASK_TIMEOUT_MS);
    }

    #[test]
    fn test_env_reaches_underscored_fields() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("MDM_LOCKING__RETRY_AFTER_MS", 75);
            jail.set_env("MDM_RECONCILIATION__UNLINKED_TIMEOUT_SECS", 9);
            jail.set_env("MDM_SECURITY__SYSTEM_POLICY", "mdm.admin");

            let config = MdmConfig::from_env(None).map_err(|e| e.to_string())?;
            assert_eq!(config.locking.retry_after_ms, 75);
            assert_eq!(config.reconciliation.unlinked_timeout_secs, 9);
            assert_eq!(config.security.system_policy, "mdm.admin");
            assert_eq!(config.locking.merge_lock_timeout_ms, DEFAULT_MERGE_LOCK_TIMEOUT_MS);
            Ok(())
        });
    }

    #[test]
    fn test_validate_requires_registered_matcher() {
        let config = MdmConfig::default().with_resource(ResourceConfig::new("Patient", "missing"));
        let err = config.validate(&MatcherRegistry::new()).unwrap_err();
        assert!(matches!(err, MdmError::Configuration(_)));

        let registry = MatcherRegistry::new().with("missing", Arc::new(NoMatches));
        assert!(config.validate(&registry).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_bundles() {
        let registry = MatcherRegistry::new().with("m", Arc::new(NoMatches));
        let twice = MdmConfig::default()
            .with_resource(ResourceConfig::new("Patient", "m"))
            .with_resource(ResourceConfig::new("Patient", "m"));
        assert!(twice.validate(&registry).is_err());

        let bundle = MdmConfig::default().with_resource(ResourceConfig::new(ResourceType::BUNDLE, "m"));
        assert!(bundle.validate(&registry).is_err());
    }
}
