//! # Data Model
//!
//! Records, keys, tags and security principals shared by the MDM components.
//! Records are owned by the persistence collaborator; the MDM core only reads
//! their attributes and adds the tags and relationships defined here.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Tag carrying the MDM role of a record (`M` or `L`)
pub const MDM_TYPE_TAG: &str = "mdm.type";
/// Tag naming the policy required to see a record's demographics
pub const MDM_RESTRICTED_TAG: &str = "mdm.restricted";
/// Tag stamped after a successful resolution
pub const MDM_RESOLVED_TAG: &str = "mdm.resolved";

/// Stable identifier of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey(pub Uuid);

impl RecordKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a clinical resource type (e.g. "Patient", "Encounter")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceType(pub String);

impl ResourceType {
    /// Container type for transactional submissions; never stored on its own
    pub const BUNDLE: &'static str = "Bundle";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_bundle(&self) -> bool {
        self.0 == Self::BUNDLE
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Capability set of a monitored resource type, fixed at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    /// People, places, organizations, materials
    #[default]
    EntityLike,
    /// Encounters, observations and other events
    ActLike,
}

/// Role of a record within MDM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MdmRole {
    Master,
    Local,
}

impl MdmRole {
    pub fn tag_value(self) -> &'static str {
        match self {
            MdmRole::Master => "M",
            MdmRole::Local => "L",
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value {
            "M" => Some(MdmRole::Master),
            "L" => Some(MdmRole::Local),
            _ => None,
        }
    }
}

/// Business identifier issued by an assigning domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub domain: String,
    pub value: String,
}

impl Identifier {
    pub fn new(domain: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            value: value.into(),
        }
    }

    /// Natural key used for de-duplication
    pub fn natural_key(&self) -> (String, String) {
        (self.domain.to_ascii_lowercase(), self.value.trim().to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Name {
    /// Name use, e.g. "official", "alias"
    pub name_use: String,
    pub text: String,
}

impl Name {
    pub fn official(text: impl Into<String>) -> Self {
        Self {
            name_use: "official".to_string(),
            text: text.into(),
        }
    }

    pub fn natural_key(&self) -> (String, String) {
        (self.name_use.to_ascii_lowercase(), normalize_text(&self.text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub text: String,
}

impl Address {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn natural_key(&self) -> String {
        normalize_text(&self.text)
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Relationship kinds a caller may assert directly on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssertionKind {
    /// Link this Local to the named Master (verified link)
    MasterRecord,
    /// Flag the named Master as a candidate duplicate
    Duplicate,
}

/// Caller-declared relationship edit carried on a submitted record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipAssertion {
    pub kind: AssertionKind,
    pub target: RecordKey,
}

/// A clinical record participating in MDM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub resource_type: ResourceType,
    pub identifiers: Vec<Identifier>,
    pub names: Vec<Name>,
    pub addresses: Vec<Address>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub relationship_assertions: Vec<RelationshipAssertion>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub obsoleted: bool,
}

impl Record {
    /// Create an empty record of the given type with a fresh key
    pub fn new(resource_type: impl Into<ResourceType>) -> Self {
        let now = Utc::now();
        Self {
            key: RecordKey::new(),
            resource_type: resource_type.into(),
            identifiers: Vec::new(),
            names: Vec::new(),
            addresses: Vec::new(),
            birth_date: None,
            gender: None,
            tags: BTreeMap::new(),
            relationship_assertions: Vec::new(),
            created_at: now,
            modified_at: now,
            obsoleted: false,
        }
    }

    /// Build the synthetic master shell for a resource type
    pub fn master(resource_type: ResourceType) -> Self {
        Self::new(resource_type).with_tag(MDM_TYPE_TAG, MdmRole::Master.tag_value())
    }

    pub fn with_identifier(mut self, domain: &str, value: &str) -> Self {
        self.identifiers.push(Identifier::new(domain, value));
        self
    }

    pub fn with_name(mut self, text: &str) -> Self {
        self.names.push(Name::official(text));
        self
    }

    pub fn with_address(mut self, text: &str) -> Self {
        self.addresses.push(Address::new(text));
        self
    }

    pub fn with_birth_date(mut self, date: NaiveDate) -> Self {
        self.birth_date = Some(date);
        self
    }

    pub fn with_gender(mut self, gender: &str) -> Self {
        self.gender = Some(gender.to_string());
        self
    }

    pub fn with_tag(mut self, name: &str, value: &str) -> Self {
        self.tags.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_assertion(mut self, kind: AssertionKind, target: RecordKey) -> Self {
        self.relationship_assertions
            .push(RelationshipAssertion { kind, target });
        self
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    /// MDM role from the `mdm.type` tag, if present and well formed
    pub fn role(&self) -> Option<MdmRole> {
        self.tag(MDM_TYPE_TAG).and_then(MdmRole::from_tag)
    }

    pub fn is_master(&self) -> bool {
        self.role() == Some(MdmRole::Master)
    }

    pub fn is_local(&self) -> bool {
        self.role() == Some(MdmRole::Local)
    }

    /// Policy required to see this record's demographics, if restricted
    pub fn restriction(&self) -> Option<&str> {
        self.tag(MDM_RESTRICTED_TAG)
    }

    /// System-asserted verified link, if the record carries one
    pub fn asserted_master(&self) -> Option<RecordKey> {
        self.relationship_assertions
            .iter()
            .find(|assertion| assertion.kind == AssertionKind::MasterRecord)
            .map(|assertion| assertion.target)
    }

    /// Masters this record asserts as duplicate candidates
    pub fn asserted_duplicates(&self) -> impl Iterator<Item = RecordKey> + '_ {
        self.relationship_assertions
            .iter()
            .filter(|assertion| assertion.kind == AssertionKind::Duplicate)
            .map(|assertion| assertion.target)
    }
}

/// Policy granting elevated MDM privileges unless configured otherwise
pub const DEFAULT_SYSTEM_POLICY: &str = "mdm.system";

/// Caller identity and granted policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    pub policies: BTreeSet<String>,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policies: BTreeSet::new(),
        }
    }

    /// Principal holding the default system policy
    pub fn system() -> Self {
        Self::new("system").with_policy(DEFAULT_SYSTEM_POLICY)
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }

    pub fn with_policy(mut self, policy: &str) -> Self {
        self.policies.insert(policy.to_string());
        self
    }

    pub fn has_policy(&self, policy: &str) -> bool {
        self.policies.contains(policy)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
