//! # Matching
//!
//! Contract of the external matching collaborator. Blocking and scoring are
//! not implemented here; implementations are registered by configuration name
//! and looked up per monitored resource type.

use crate::error::{MdmError, Result};
use crate::model::Record;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Outcome of comparing two records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    NonMatch,
    Probable,
    Match,
}

impl Classification {
    fn rank(self) -> u8 {
        match self {
            Classification::NonMatch => 0,
            Classification::Probable => 1,
            Classification::Match => 2,
        }
    }
}

impl PartialOrd for Classification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Match > Probable > NonMatch
impl Ord for Classification {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::NonMatch => "non-match",
            Classification::Probable => "probable",
            Classification::Match => "match",
        };
        f.write_str(label)
    }
}

/// A scored candidate produced by the matcher
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub candidate: Record,
    pub classification: Classification,
    pub score: f64,
}

impl MatchResult {
    pub fn new(candidate: Record, classification: Classification, score: f64) -> Self {
        Self {
            candidate,
            classification,
            score,
        }
    }
}

/// Blocking and classification contract
pub trait MatchingService: Send + Sync {
    /// Cheap pre-filter narrowing the candidate set
    fn block(&self, record: &Record, config_name: &str) -> anyhow::Result<Vec<Record>>;

    /// Classified and scored candidates for `record`
    fn match_record(&self, record: &Record, config_name: &str)
        -> anyhow::Result<Vec<MatchResult>>;
}

/// Matching services registered by configuration name
#[derive(Clone, Default)]
pub struct MatcherRegistry {
    matchers: BTreeMap<String, Arc<dyn MatchingService>>,
}

impl MatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config_name: impl Into<String>, matcher: Arc<dyn MatchingService>) {
        self.matchers.insert(config_name.into(), matcher);
    }

    pub fn with(mut self, config_name: impl Into<String>, matcher: Arc<dyn MatchingService>) -> Self {
        self.register(config_name, matcher);
        self
    }

    pub fn contains(&self, config_name: &str) -> bool {
        self.matchers.contains_key(config_name)
    }

    pub fn get(&self, config_name: &str) -> Result<Arc<dyn MatchingService>> {
        self.matchers.get(config_name).cloned().ok_or_else(|| {
            MdmError::Configuration(format!(
                "no matching service registered for configuration '{config_name}'"
            ))
        })
    }
}

impl fmt::Debug for MatcherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatcherRegistry")
            .field("configurations", &self.matchers.keys().collect::<Vec<_>>())
            .finish()
    }
}
