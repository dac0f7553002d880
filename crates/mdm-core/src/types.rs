use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Type alias for resource identifiers (owned by the external repository)
pub type ResourceId = Uuid;

/// Type alias for golden record identifiers
pub type GoldenId = Uuid;

/// Type alias for link identifiers
pub type LinkId = Uuid;

/// Entity type tag, e.g. "patient" or "practitioner".
///
/// Lowercase ASCII letters, digits, hyphens and underscores only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceType(String);

impl ResourceType {
    pub fn new(name: &str) -> Result<Self, String> {
        if name.is_empty() {
            return Err("Resource type must not be empty".to_string());
        }
        if name.len() > 64 {
            return Err(format!("Resource type '{}' exceeds 64 characters", name));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(format!(
                "Resource type '{}' contains invalid characters (lowercase alphanumeric, '-' and '_' only)",
                name
            ));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ResourceType> for String {
    fn from(value: ResourceType) -> Self {
        value.0
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque pointer to a record held by the external repository.
/// The core never copies the record it points to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub id: ResourceId,
    pub resource_type: ResourceType,
}

impl ResourceRef {
    pub fn new(id: ResourceId, resource_type: ResourceType) -> Self {
        Self { id, resource_type }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A record as returned by the repository: a reference plus its comparable attributes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    #[serde(flatten)]
    pub reference: ResourceRef,

    /// Comparable attributes, e.g. `family_name`, `birth_date`, `ssn`.
    /// Ordered so that scoring iterates deterministically.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            reference: ResourceRef::new(Uuid::now_v7(), resource_type),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn id(&self) -> ResourceId {
        self.reference.id
    }

    /// Attribute value, treating blank strings as absent.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Canonical representation of one real-world entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoldenRecord {
    /// Unique identifier. UUIDv7 for time-sortability.
    pub id: GoldenId,

    /// Entity type shared with every target linked to it.
    pub resource_type: ResourceType,

    /// Survivorship snapshot. Seeded from the founding target and
    /// filled in from losers on merge. This is what targets are scored against.
    pub attributes: BTreeMap<String, String>,

    /// Incremented on every merge this record survives.
    pub version: u64,

    /// Set once this record has been merged away. Lookups follow it.
    pub merged_into: Option<GoldenId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GoldenRecord {
    /// Seed a new golden record from the target that founded it
    pub fn from_target(target: &Resource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            resource_type: target.reference.resource_type.clone(),
            attributes: target.attributes.clone(),
            version: 1,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.merged_into.is_none()
    }

    /// Golden records can themselves be link targets (POSSIBLE_DUPLICATE).
    pub fn as_reference(&self) -> ResourceRef {
        ResourceRef::new(self.id, self.resource_type.clone())
    }

    /// View the survivorship snapshot as a resource for scoring
    pub fn as_resource(&self) -> Resource {
        Resource {
            reference: self.as_reference(),
            attributes: self.attributes.clone(),
        }
    }
}

/// Classification of a target/golden comparison
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MatchOutcome {
    NoMatch,
    PossibleMatch,
    Match,
    /// Golden-to-golden ambiguity: the target of the link is another golden record.
    PossibleDuplicate,
}

impl MatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOutcome::NoMatch => "NO_MATCH",
            MatchOutcome::PossibleMatch => "POSSIBLE_MATCH",
            MatchOutcome::Match => "MATCH",
            MatchOutcome::PossibleDuplicate => "POSSIBLE_DUPLICATE",
        }
    }

    pub fn all() -> [MatchOutcome; 4] {
        [
            MatchOutcome::NoMatch,
            MatchOutcome::PossibleMatch,
            MatchOutcome::Match,
            MatchOutcome::PossibleDuplicate,
        ]
    }

    /// Outcomes that leave a link waiting on an operator
    pub fn needs_review(&self) -> bool {
        matches!(
            self,
            MatchOutcome::PossibleMatch | MatchOutcome::PossibleDuplicate
        )
    }
}

impl std::fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MatchOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NO_MATCH" => Ok(MatchOutcome::NoMatch),
            "POSSIBLE_MATCH" => Ok(MatchOutcome::PossibleMatch),
            "MATCH" => Ok(MatchOutcome::Match),
            "POSSIBLE_DUPLICATE" => Ok(MatchOutcome::PossibleDuplicate),
            other => Err(format!("Unknown match outcome '{}'", other)),
        }
    }
}

/// Provenance of a link decision
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LinkSource {
    /// Produced by the match engine
    Auto,
    /// Produced by an operator decision. Sticky against automatic re-scoring.
    Manual,
}

impl std::fmt::Display for LinkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSource::Auto => write!(f, "AUTO"),
            LinkSource::Manual => write!(f, "MANUAL"),
        }
    }
}

/// Storage key of a link. At most one link exists per key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    pub golden: GoldenId,
    pub target: ResourceId,
}

impl LinkKey {
    pub fn new(golden: GoldenId, target: ResourceId) -> Self {
        Self { golden, target }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(self.golden.as_bytes());
        out[16..].copy_from_slice(self.target.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let mut golden = [0u8; 16];
        let mut target = [0u8; 16];
        golden.copy_from_slice(&bytes[..16]);
        target.copy_from_slice(&bytes[16..]);
        Self {
            golden: Uuid::from_bytes(golden),
            target: Uuid::from_bytes(target),
        }
    }
}

impl std::fmt::Display for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} -> {})", self.golden, self.target)
    }
}

/// Stored decision relating a target to a golden record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    /// Stable across re-pointing on merge.
    pub id: LinkId,

    pub golden: GoldenId,

    pub target: ResourceRef,

    pub outcome: MatchOutcome,

    pub source: LinkSource,

    /// Match score in [0.0, 1.0]. None for operator decisions made without scoring.
    pub score: Option<f64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Link {
    pub fn new(
        golden: GoldenId,
        target: ResourceRef,
        outcome: MatchOutcome,
        source: LinkSource,
        score: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            golden,
            target,
            outcome,
            source,
            score: score.map(|s| s.clamp(0.0, 1.0)),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.golden, self.target.id)
    }

    pub fn is_match(&self) -> bool {
        self.outcome == MatchOutcome::Match
    }

    pub fn is_manual(&self) -> bool {
        self.source == LinkSource::Manual
    }

    /// Validate structural rules before persisting
    pub fn validate(&self) -> Result<(), String> {
        if self.golden == self.target.id {
            return Err("A golden record cannot link to itself".to_string());
        }

        if let Some(score) = self.score {
            if !(0.0..=1.0).contains(&score) || score.is_nan() {
                return Err(format!("Score {} out of range [0.0, 1.0]", score));
            }
        }

        Ok(())
    }

    /// Apply a new decision and bump the timestamp
    pub fn set_decision(&mut self, outcome: MatchOutcome, source: LinkSource, score: Option<f64>) {
        self.outcome = outcome;
        self.source = source;
        self.score = score.map(|s| s.clamp(0.0, 1.0));
        self.updated_at = Utc::now();
    }
}

/// Correlation metadata threaded through every mutation.
/// Opaque to the core beyond logging and audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionContext {
    pub transaction_id: String,
    pub reason: ReasonCode,
}

impl TransactionContext {
    pub fn new(transaction_id: impl Into<String>, reason: ReasonCode) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            reason,
        }
    }

    /// Context with a freshly generated correlation id
    pub fn generate(reason: ReasonCode) -> Self {
        Self::new(Uuid::now_v7().to_string(), reason)
    }
}

/// Why a mutation is happening
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    CreateResource,
    UpdateResource,
    ManualLink,
    ManualUnlink,
    ManualMerge,
    ReviewDecision,
    Batch,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::CreateResource => "create_resource",
            ReasonCode::UpdateResource => "update_resource",
            ReasonCode::ManualLink => "manual_link",
            ReasonCode::ManualUnlink => "manual_unlink",
            ReasonCode::ManualMerge => "manual_merge",
            ReasonCode::ReviewDecision => "review_decision",
            ReasonCode::Batch => "batch",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "create_resource" => Ok(ReasonCode::CreateResource),
            "update_resource" => Ok(ReasonCode::UpdateResource),
            "manual_link" => Ok(ReasonCode::ManualLink),
            "manual_unlink" => Ok(ReasonCode::ManualUnlink),
            "manual_merge" => Ok(ReasonCode::ManualMerge),
            "review_decision" => Ok(ReasonCode::ReviewDecision),
            "batch" => Ok(ReasonCode::Batch),
            other => Err(format!("Unknown reason code '{}'", other)),
        }
    }
}
