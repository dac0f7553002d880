//! Candidate search: which golden records could plausibly be this target?
//!
//! Blocking works through the repository: resources sharing an exact value
//! for any configured blocking attribute are fetched, and each one that is
//! already MATCH-linked contributes its golden record. Golden records the
//! target is currently linked to are always re-offered so that re-scoring
//! can confirm or move them. Nothing here writes.

use crate::error::Result;
use crate::repository::{ResourceRepository, SearchCriteria};
use crate::storage::Storage;
use crate::types::{GoldenId, MatchOutcome, Resource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Blocking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Attributes whose exact values define a block.
    pub blocking_attributes: Vec<String>,

    /// Upper bound on candidates returned per target. Default: 50.
    pub max_candidates: usize,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            blocking_attributes: vec![
                "identifier".into(),
                "birth_date".into(),
                "email".into(),
                "phone".into(),
            ],
            max_candidates: 50,
        }
    }
}

impl CandidateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocking_attributes(mut self, attributes: &[&str]) -> Self {
        self.blocking_attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_candidates == 0 {
            return Err(crate::error::MdmError::Validation(
                "max_candidates must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// A golden record proposed for scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub golden: GoldenId,
    /// How many blocking hits pointed at this golden record
    pub hits: usize,
}

pub struct CandidateSearch<S: Storage, R: ResourceRepository> {
    storage: Arc<S>,
    repository: Arc<R>,
    config: CandidateConfig,
}

impl<S: Storage, R: ResourceRepository> CandidateSearch<S, R> {
    pub fn new(storage: Arc<S>, repository: Arc<R>, config: CandidateConfig) -> Self {
        Self {
            storage,
            repository,
            config,
        }
    }

    /// Criteria built from whichever blocking attributes the target carries
    pub fn criteria_for(&self, target: &Resource) -> Option<SearchCriteria> {
        let mut criteria = SearchCriteria::new(target.reference.resource_type.clone())
            .excluding(target.id());
        let mut any = false;
        for attribute in &self.config.blocking_attributes {
            if let Some(value) = target.attribute(attribute) {
                criteria = criteria.with_value(attribute, value);
                any = true;
            }
        }
        any.then_some(criteria)
    }

    /// Active golden records worth scoring, most blocking hits first, ties by id.
    /// Empty when the target looks like a new entity.
    pub fn find(&self, target: &Resource) -> Result<Vec<Candidate>> {
        let mut hits: HashMap<GoldenId, usize> = HashMap::new();

        if let Some(criteria) = self.criteria_for(target) {
            for neighbour in self.repository.find(&criteria)? {
                let shared = self
                    .config
                    .blocking_attributes
                    .iter()
                    .filter(|a| {
                        let value = neighbour.attribute(a);
                        value.is_some() && value == target.attribute(a)
                    })
                    .count();

                for link in self.storage.links_for_target(neighbour.id())? {
                    if link.is_match() {
                        *hits.entry(link.golden).or_default() += shared;
                    }
                }
            }
        }

        // Re-offer whatever the target is already linked to
        for link in self.storage.links_for_target(target.id())? {
            if matches!(
                link.outcome,
                MatchOutcome::Match | MatchOutcome::PossibleMatch
            ) {
                hits.entry(link.golden).or_default();
            }
        }

        // Collapse merged-away records onto their survivors
        let mut resolved: HashMap<GoldenId, usize> = HashMap::new();
        for (golden_id, count) in hits {
            let Some(golden) = self.storage.resolve_golden(golden_id)? else {
                continue;
            };
            if golden.resource_type != target.reference.resource_type {
                continue;
            }
            *resolved.entry(golden.id).or_default() += count;
        }

        let mut candidates: Vec<Candidate> = resolved
            .into_iter()
            .map(|(golden, hits)| Candidate { golden, hits })
            .collect();
        candidates.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.golden.cmp(&b.golden)));
        candidates.truncate(self.config.max_candidates);

        log::debug!(
            "{} candidate golden records for {}",
            candidates.len(),
            target.reference
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use crate::storage::{LinkBatch, RedbStorage};
    use crate::types::{GoldenRecord, Link, LinkSource, ResourceType};
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<RedbStorage>,
        repository: Arc<InMemoryRepository>,
        search: CandidateSearch<RedbStorage, InMemoryRepository>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let storage = Arc::new(RedbStorage::open(temp.path().join("c.redb")).unwrap());
        let repository = Arc::new(InMemoryRepository::new());
        let search = CandidateSearch::new(
            storage.clone(),
            repository.clone(),
            CandidateConfig::new().with_blocking_attributes(&["ssn", "email"]),
        );
        Fixture {
            storage,
            repository,
            search,
            _temp: temp,
        }
    }

    fn patient() -> Resource {
        Resource::new(ResourceType::new("patient").unwrap())
    }

    /// Store `resource` in the repository and give it its own golden record
    fn matched(fx: &Fixture, resource: &Resource) -> GoldenRecord {
        fx.repository.put(resource.clone()).unwrap();
        let golden = GoldenRecord::from_target(resource);
        let mut batch = LinkBatch::new();
        batch.put_golden(golden.clone()).put_link(Link::new(
            golden.id,
            resource.reference.clone(),
            MatchOutcome::Match,
            LinkSource::Auto,
            Some(1.0),
        ));
        fx.storage.apply(&batch).unwrap();
        golden
    }

    #[test]
    fn test_no_candidates_is_empty_not_error() {
        let fx = fixture();
        let target = patient().with_attribute("ssn", "111");
        fx.repository.put(target.clone()).unwrap();
        assert!(fx.search.find(&target).unwrap().is_empty());

        let unblockable = patient().with_attribute("family_name", "Smith");
        assert!(fx.search.find(&unblockable).unwrap().is_empty());
    }

    #[test]
    fn test_ordered_by_blocking_hits() {
        let fx = fixture();
        let weak = matched(&fx, &patient().with_attribute("ssn", "111"));
        let strong = matched(
            &fx,
            &patient()
                .with_attribute("ssn", "111")
                .with_attribute("email", "a@example.com"),
        );
        let _unrelated = matched(&fx, &patient().with_attribute("ssn", "999"));

        let target = patient()
            .with_attribute("ssn", "111")
            .with_attribute("email", "a@example.com");
        let candidates = fx.search.find(&target).unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.golden).collect();
        assert_eq!(ids, vec![strong.id, weak.id]);
        assert_eq!(candidates[0].hits, 2);

        // Restartable: same answer again
        assert_eq!(fx.search.find(&target).unwrap(), candidates);
    }

    #[test]
    fn test_merged_golden_resolves_to_survivor() {
        let fx = fixture();
        let survivor = matched(&fx, &patient().with_attribute("ssn", "222"));
        let mut loser = matched(&fx, &patient().with_attribute("email", "b@example.com"));

        // Move the loser's link by hand and mark it merged
        let links = fx.storage.links_for_golden(loser.id).unwrap();
        let mut batch = LinkBatch::new();
        for link in links {
            let mut moved = link.clone();
            moved.golden = survivor.id;
            batch.delete_link(link.key()).put_link(moved);
        }
        loser.merged_into = Some(survivor.id);
        batch.put_golden(loser);
        fx.storage.apply(&batch).unwrap();

        let target = patient()
            .with_attribute("ssn", "222")
            .with_attribute("email", "b@example.com");
        let candidates = fx.search.find(&target).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].golden, survivor.id);
    }
}
