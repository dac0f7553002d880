use crate::candidates::CandidateConfig;
use crate::error::{MdmError, Result};
use crate::matching::MatchConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a target's previous MATCH link when a new one is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractionPolicy {
    /// Keep the link for audit, downgraded to NO_MATCH.
    #[default]
    MarkNoMatch,
    /// Remove the link entirely.
    Delete,
}

/// Configuration for the link service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkServiceConfig {
    /// Longest a mutation waits for its entity locks. Default: 5000 ms.
    pub lock_timeout_ms: u64,

    pub retraction: RetractionPolicy,

    pub matching: MatchConfig,

    pub candidates: CandidateConfig,
}

impl Default for LinkServiceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
            retraction: RetractionPolicy::MarkNoMatch,
            matching: MatchConfig::default(),
            candidates: CandidateConfig::default(),
        }
    }
}

impl LinkServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retraction(mut self, retraction: RetractionPolicy) -> Self {
        self.retraction = retraction;
        self
    }

    pub fn with_matching(mut self, matching: MatchConfig) -> Self {
        self.matching = matching;
        self
    }

    pub fn with_candidates(mut self, candidates: CandidateConfig) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        self.candidates.validate()?;

        if self.lock_timeout_ms == 0 {
            return Err(MdmError::Validation("lock_timeout_ms must be > 0".into()));
        }

        Ok(())
    }
}
