use chrono::NaiveDate;
use mdm_rs::config::ResourceConfig;
use mdm_rs::{
    Classification, MatchResult, MatcherRegistry, MatchingService, MdmConfig, MdmService,
    MemoryRelationshipStore, MemoryRepository, Principal, Record, RecordKey, RecordRepository,
    RelationshipKind, RelationshipStore,
};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Deterministic matcher comparing a record with the Locals of each master.
///
/// Shared identifier, or same name and birth date: Match. Same name only:
/// Probable. Anything else is not reported.
pub struct AttributeMatcher {
    repository: Arc<MemoryRepository>,
    relationships: Arc<MemoryRelationshipStore>,
}

impl AttributeMatcher {
    pub fn new(
        repository: Arc<MemoryRepository>,
        relationships: Arc<MemoryRelationshipStore>,
    ) -> Self {
        Self {
            repository,
            relationships,
        }
    }

    /// Live Locals of `master` other than `exclude`
    fn members(&self, master: RecordKey, exclude: RecordKey) -> Vec<Record> {
        self.relationships
            .locals_of(master)
            .into_iter()
            .filter(|key| *key != exclude)
            .filter_map(|key| self.repository.fetch(key))
            .filter(|local| !local.obsoleted)
            .collect()
    }

    fn classify(record: &Record, members: &[Record]) -> Option<(Classification, f64)> {
        let identifiers: HashSet<(String, String)> =
            record.identifiers.iter().map(|id| id.natural_key()).collect();
        let names: HashSet<(String, String)> =
            record.names.iter().map(|name| name.natural_key()).collect();

        let mut best: Option<(Classification, f64)> = None;
        for member in members {
            let shares_identifier = member
                .identifiers
                .iter()
                .any(|id| identifiers.contains(&id.natural_key()));
            let shares_name = member
                .names
                .iter()
                .any(|name| names.contains(&name.natural_key()));
            let same_birth = record.birth_date.is_some() && record.birth_date == member.birth_date;

            let found = if shares_identifier {
                Some((Classification::Match, 1.0))
            } else if shares_name && same_birth {
                Some((Classification::Match, 0.9))
            } else if shares_name {
                Some((Classification::Probable, 0.6))
            } else {
                None
            };
            if let Some(found) = found {
                if best.map_or(true, |(class, score)| {
                    (found.0, found.1) > (class, score)
                }) {
                    best = Some(found);
                }
            }
        }
        best
    }

    fn masters_of_type(&self, record: &Record) -> Vec<Record> {
        self.repository
            .scan(&record.resource_type)
            .into_iter()
            .filter(|candidate| candidate.is_master())
            .collect()
    }
}

impl MatchingService for AttributeMatcher {
    fn block(&self, record: &Record, _config_name: &str) -> anyhow::Result<Vec<Record>> {
        Ok(self
            .masters_of_type(record)
            .into_iter()
            .filter(|master| {
                let members = self.members(master.key, record.key);
                Self::classify(record, &members).is_some()
            })
            .collect())
    }

    fn match_record(&self, record: &Record, _config_name: &str) -> anyhow::Result<Vec<MatchResult>> {
        Ok(self
            .masters_of_type(record)
            .into_iter()
            .filter_map(|master| {
                let members = self.members(master.key, record.key);
                Self::classify(record, &members)
                    .map(|(class, score)| MatchResult::new(master, class, score))
            })
            .collect())
    }
}

#[derive(Default)]
struct GateState {
    closed: bool,
    delay: Duration,
    entered: usize,
}

/// Holds matcher calls back: closed gates block, delays slow every call
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[allow(dead_code)]
impl Gate {
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }

    pub fn open(&self) {
        self.state.lock().unwrap().closed = false;
        self.changed.notify_all();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Wait until `count` matcher calls have reached the gate
    pub fn wait_entered(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while state.entered < count {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            state = self.changed.wait_timeout(state, left).unwrap().0;
        }
        true
    }

    fn pass(&self) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.entered += 1;
            self.changed.notify_all();
            while state.closed {
                state = self.changed.wait(state).unwrap();
            }
            state.delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// [`AttributeMatcher`] whose blocking step passes through a [`Gate`]
pub struct GatedMatcher {
    inner: AttributeMatcher,
    gate: Arc<Gate>,
}

impl MatchingService for GatedMatcher {
    fn block(&self, record: &Record, config_name: &str) -> anyhow::Result<Vec<Record>> {
        self.gate.pass();
        self.inner.block(record, config_name)
    }

    fn match_record(&self, record: &Record, config_name: &str) -> anyhow::Result<Vec<MatchResult>> {
        self.inner.match_record(record, config_name)
    }
}

/// Running service plus handles on its in-memory collaborators
pub struct Harness {
    pub service: MdmService,
    pub repository: Arc<MemoryRepository>,
    pub relationships: Arc<MemoryRelationshipStore>,
}

#[allow(dead_code)]
impl Harness {
    pub fn repo(&self) -> &dyn RecordRepository {
        self.repository.as_ref()
    }

    /// Wait for background resolution to finish
    pub fn settle(&self) {
        assert!(
            self.service.wait_idle(Duration::from_secs(10)),
            "resolution did not settle"
        );
    }

    pub fn insert(&self, record: Record) -> Record {
        let stored = self.repository.insert(record, &clerk()).unwrap();
        self.settle();
        stored
    }

    pub fn update(&self, record: Record) -> Record {
        let stored = self.repository.update(record, &clerk()).unwrap();
        self.settle();
        stored
    }

    pub fn master_of(&self, local: RecordKey) -> RecordKey {
        self.service
            .master_of(local)
            .unwrap()
            .expect("local has no master")
    }

    /// Masters that are still active
    pub fn active_masters(&self) -> Vec<Record> {
        self.repository
            .scan(&"Patient".into())
            .into_iter()
            .filter(Record::is_master)
            .collect()
    }

    /// Every live Local has exactly one master edge
    pub fn assert_invariant(&self) {
        for local in self
            .repository
            .scan(&"Patient".into())
            .into_iter()
            .filter(Record::is_local)
        {
            let edges = self
                .relationships
                .outgoing(local.key, RelationshipKind::MasterRecord);
            assert_eq!(edges.len(), 1, "local {} has {} master edges", local.key, edges.len());
        }
    }
}

#[allow(dead_code)]
pub fn test_config() -> MdmConfig {
    let mut config = MdmConfig::default().with_resource(ResourceConfig::new("Patient", "default"));
    config.workers.worker_count = 2;
    config.workers.queue_capacity = 256;
    config.workers.task_timeout_ms = 5_000;
    config.workers.shutdown_grace_ms = 2_000;
    config.locking.merge_lock_timeout_ms = 200;
    config
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    harness_with(test_config(), MemoryRepository::new())
}

/// Start a service over `repository`, which may already hold records
#[allow(dead_code)]
pub fn harness_with(config: MdmConfig, repository: MemoryRepository) -> Harness {
    build(config, repository, None)
}

/// Start a service whose matcher is held back by the returned gate
#[allow(dead_code)]
pub fn gated_harness(config: MdmConfig) -> (Harness, Arc<Gate>) {
    let gate = Arc::new(Gate::default());
    let harness = build(config, MemoryRepository::new(), Some(gate.clone()));
    (harness, gate)
}

fn build(config: MdmConfig, repository: MemoryRepository, gate: Option<Arc<Gate>>) -> Harness {
    let repository = Arc::new(repository);
    let relationships = Arc::new(MemoryRelationshipStore::new());
    let inner = AttributeMatcher::new(repository.clone(), relationships.clone());
    let matcher: Arc<dyn MatchingService> = match gate {
        Some(gate) => Arc::new(GatedMatcher { inner, gate }),
        None => Arc::new(inner),
    };
    let service = MdmService::with_collaborators(
        config,
        MatcherRegistry::new().with("default", matcher),
        repository.clone(),
        repository.clone(),
        relationships.clone(),
    )
    .unwrap();
    Harness {
        service,
        repository,
        relationships,
    }
}

#[allow(dead_code)]
pub fn clerk() -> Principal {
    Principal::new("clerk")
}

#[allow(dead_code)]
pub fn system() -> Principal {
    Principal::system()
}

#[allow(dead_code)]
pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[allow(dead_code)]
pub fn patient(mrn: &str, name: &str, born: NaiveDate) -> Record {
    Record::new("Patient")
        .with_identifier("MRN", mrn)
        .with_name(name)
        .with_birth_date(born)
}
