use crate::types::{GoldenId, LinkSource, MatchOutcome};
use std::collections::HashMap;

/// Filter criteria for listing links
#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    pub outcomes: Option<Vec<MatchOutcome>>,
    pub source: Option<LinkSource>,
    pub golden: Option<GoldenId>,
    pub limit: Option<usize>,
}

impl LinkFilter {
    /// Create a new empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Only links carrying one of these outcomes
    pub fn with_outcomes(mut self, outcomes: Vec<MatchOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub fn with_source(mut self, source: LinkSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_golden(mut self, golden: GoldenId) -> Self {
        self.golden = Some(golden);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub golden_count: u64,
    pub merged_golden_count: u64,
    pub link_count: u64,
    pub link_counts_by_outcome: HashMap<MatchOutcome, u64>,
    pub db_size_bytes: u64,
}
