//! Review queue for links an operator has to decide.
//!
//! Items are keyed by link, so a target that is re-scored while still
//! waiting never appears twice. The queue is rebuilt from persisted
//! POSSIBLE_MATCH and POSSIBLE_DUPLICATE links on startup; the links are the
//! source of truth and the queue is an index over them.

use crate::error::{MdmError, Result};
use crate::linking::{LinkUpdate, MergeOutcome};
use crate::storage::{LinkFilter, Storage};
use crate::types::{
    GoldenId, Link, LinkKey, LinkSource, MatchOutcome, ResourceRef, TransactionContext,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// A link awaiting an operator decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub key: LinkKey,
    pub target: ResourceRef,
    pub outcome: MatchOutcome,
    pub score: Option<f64>,
    pub enqueued_at: DateTime<Utc>,
}

impl ReviewItem {
    pub fn from_link(link: &Link) -> Self {
        Self {
            key: link.key(),
            target: link.target.clone(),
            outcome: link.outcome,
            score: link.score,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.outcome == MatchOutcome::PossibleDuplicate
    }
}

/// Operator verdict on a review item.
///
/// For a POSSIBLE_DUPLICATE item `Match` means "same entity": the target
/// golden record is merged into the owning one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Match,
    NoMatch,
}

impl std::str::FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "match" | "merge" => Ok(ReviewDecision::Match),
            "no_match" | "not_duplicate" => Ok(ReviewDecision::NoMatch),
            other => Err(format!("Unknown review decision '{}'", other)),
        }
    }
}

/// What resolving an item did
#[derive(Debug, Clone)]
pub enum Resolution {
    Linked(LinkUpdate),
    Merged(MergeOutcome),
}

/// The mutations a review decision can trigger
pub trait LinkUpdater {
    fn update_link(
        &self,
        golden: GoldenId,
        target: &ResourceRef,
        outcome: MatchOutcome,
        source: LinkSource,
        score: Option<f64>,
        ctx: &TransactionContext,
    ) -> Result<LinkUpdate>;

    fn merge_golden_records(
        &self,
        survivor: GoldenId,
        loser: GoldenId,
        ctx: &TransactionContext,
    ) -> Result<MergeOutcome>;
}

#[derive(Default)]
struct QueueState {
    items: HashMap<LinkKey, ReviewItem>,
    /// Keys waiting to be handed out, oldest first
    order: VecDeque<LinkKey>,
    /// Keys handed out by `dequeue_for_review` and not yet resolved
    in_review: HashSet<LinkKey>,
}

#[derive(Default)]
pub struct ConflictQueue {
    state: Mutex<QueueState>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload pending items from every review-outcome link in storage
    pub fn rebuild<S: Storage + ?Sized>(&self, storage: &S) -> Result<usize> {
        let links = storage.list_links(
            LinkFilter::new()
                .with_outcomes(vec![MatchOutcome::PossibleMatch, MatchOutcome::PossibleDuplicate]),
        )?;

        let mut state = self.state();
        *state = QueueState::default();
        let mut ordered: Vec<&Link> = links.iter().collect();
        ordered.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.key().cmp(&b.key())));
        for link in ordered {
            let mut item = ReviewItem::from_link(link);
            item.enqueued_at = link.updated_at;
            state.order.push_back(item.key);
            state.items.insert(item.key, item);
        }

        log::info!("Review queue rebuilt with {} pending items", state.items.len());
        Ok(state.items.len())
    }

    /// Add or refresh an item. Returns true if it was not queued before.
    pub fn enqueue(&self, item: ReviewItem) -> bool {
        let mut state = self.state();
        match state.items.get_mut(&item.key) {
            Some(existing) => {
                existing.outcome = item.outcome;
                existing.score = item.score;
                existing.target = item.target;
                false
            }
            None => {
                state.order.push_back(item.key);
                state.items.insert(item.key, item);
                true
            }
        }
    }

    /// Hand out the oldest item nobody is reviewing yet
    pub fn dequeue_for_review(&self) -> Option<ReviewItem> {
        let mut state = self.state();
        while let Some(key) = state.order.pop_front() {
            if let Some(item) = state.items.get(&key).cloned() {
                state.in_review.insert(key);
                return Some(item);
            }
        }
        None
    }

    /// Put a handed-out item back at the front without deciding it
    pub fn release(&self, key: LinkKey) -> bool {
        let mut state = self.state();
        if state.in_review.remove(&key) && state.items.contains_key(&key) {
            state.order.push_front(key);
            true
        } else {
            false
        }
    }

    /// Drop an item because its link no longer needs review
    pub fn remove(&self, key: LinkKey) -> Option<ReviewItem> {
        let mut state = self.state();
        let item = state.items.remove(&key)?;
        state.in_review.remove(&key);
        state.order.retain(|k| *k != key);
        Some(item)
    }

    pub fn contains(&self, key: LinkKey) -> bool {
        self.state().items.contains_key(&key)
    }

    pub fn get(&self, key: LinkKey) -> Option<ReviewItem> {
        self.state().items.get(&key).cloned()
    }

    /// Every queued item, oldest first, whether or not it is in review
    pub fn pending(&self) -> Vec<ReviewItem> {
        let state = self.state();
        let mut items: Vec<ReviewItem> = state.items.values().cloned().collect();
        items.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.key.cmp(&b.key)));
        items
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply an operator decision.
    ///
    /// The item is taken out before the mutation runs, so of two concurrent
    /// resolutions of the same key exactly one proceeds and the other gets
    /// `AlreadyResolved`. If the mutation fails the item goes back to the
    /// front of the queue and the error is returned unchanged.
    pub fn resolve(
        &self,
        updater: &dyn LinkUpdater,
        key: LinkKey,
        decision: ReviewDecision,
        ctx: &TransactionContext,
    ) -> Result<Resolution> {
        let item = self.remove(key).ok_or(MdmError::AlreadyResolved(key))?;

        let result = match (item.is_duplicate(), decision) {
            (true, ReviewDecision::Match) => updater
                .merge_golden_records(key.golden, key.target, ctx)
                .map(Resolution::Merged),
            (_, decision) => {
                let outcome = match decision {
                    ReviewDecision::Match => MatchOutcome::Match,
                    ReviewDecision::NoMatch => MatchOutcome::NoMatch,
                };
                updater
                    .update_link(key.golden, &item.target, outcome, LinkSource::Manual, item.score, ctx)
                    .map(Resolution::Linked)
            }
        };

        match result {
            Ok(resolution) => {
                log::info!(
                    "Review {} resolved as {:?} [txn={} reason={}]",
                    key,
                    decision,
                    ctx.transaction_id,
                    ctx.reason
                );
                Ok(resolution)
            }
            Err(e) => {
                log::warn!("Review {} failed, re-queued: {}", key, e);
                let mut state = self.state();
                state.order.push_front(key);
                state.items.insert(key, item);
                Err(e)
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // Queue state is rebuilt from storage on restart; a poisoned guard is still usable
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;
    use std::cell::RefCell;
    use uuid::Uuid;

    fn item(outcome: MatchOutcome) -> ReviewItem {
        let target = ResourceRef::new(Uuid::now_v7(), ResourceType::new("patient").unwrap());
        let link = Link::new(Uuid::now_v7(), target, outcome, LinkSource::Auto, Some(0.5));
        ReviewItem::from_link(&link)
    }

    /// Records calls and fails on demand
    #[derive(Default)]
    struct RecordingUpdater {
        calls: RefCell<Vec<String>>,
        fail: bool,
    }

    impl LinkUpdater for RecordingUpdater {
        fn update_link(
            &self,
            golden: GoldenId,
            target: &ResourceRef,
            outcome: MatchOutcome,
            source: LinkSource,
            score: Option<f64>,
            _ctx: &TransactionContext,
        ) -> Result<LinkUpdate> {
            self.calls.borrow_mut().push(format!("update {} {}", outcome, source));
            if self.fail {
                return Err(MdmError::RepositoryUnavailable("down".into()));
            }
            let link = Link::new(golden, target.clone(), outcome, source, score);
            Ok(LinkUpdate::applied(link))
        }

        fn merge_golden_records(
            &self,
            survivor: GoldenId,
            loser: GoldenId,
            _ctx: &TransactionContext,
        ) -> Result<MergeOutcome> {
            self.calls.borrow_mut().push("merge".to_string());
            Ok(MergeOutcome::already(survivor, loser))
        }
    }

    fn ctx() -> TransactionContext {
        TransactionContext::generate(crate::types::ReasonCode::ReviewDecision)
    }

    #[test]
    fn test_enqueue_is_keyed_by_link() {
        let queue = ConflictQueue::new();
        let first = item(MatchOutcome::PossibleMatch);
        assert!(queue.enqueue(first.clone()));

        let mut rescored = first.clone();
        rescored.score = Some(0.7);
        assert!(!queue.enqueue(rescored));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(first.key).unwrap().score, Some(0.7));
    }

    #[test]
    fn test_dequeue_fifo_and_release() {
        let queue = ConflictQueue::new();
        let a = item(MatchOutcome::PossibleMatch);
        let b = item(MatchOutcome::PossibleMatch);
        queue.enqueue(a.clone());
        queue.enqueue(b.clone());

        assert_eq!(queue.dequeue_for_review().unwrap().key, a.key);
        assert_eq!(queue.dequeue_for_review().unwrap().key, b.key);
        assert!(queue.dequeue_for_review().is_none());
        // Still pending until resolved
        assert_eq!(queue.len(), 2);

        assert!(queue.release(a.key));
        assert_eq!(queue.dequeue_for_review().unwrap().key, a.key);
    }

    #[test]
    fn test_resolve_removes_item() {
        let queue = ConflictQueue::new();
        let updater = RecordingUpdater::default();
        let pending = item(MatchOutcome::PossibleMatch);
        queue.enqueue(pending.clone());

        let resolution = queue
            .resolve(&updater, pending.key, ReviewDecision::Match, &ctx())
            .unwrap();
        assert!(matches!(resolution, Resolution::Linked(u) if u.link.outcome == MatchOutcome::Match));
        assert!(queue.is_empty());
        assert_eq!(updater.calls.borrow().as_slice(), ["update MATCH MANUAL"]);
    }

    #[test]
    fn test_second_resolve_is_already_resolved() {
        let queue = ConflictQueue::new();
        let updater = RecordingUpdater::default();
        let pending = item(MatchOutcome::PossibleMatch);
        queue.enqueue(pending.clone());

        queue
            .resolve(&updater, pending.key, ReviewDecision::NoMatch, &ctx())
            .unwrap();
        let err = queue
            .resolve(&updater, pending.key, ReviewDecision::Match, &ctx())
            .unwrap_err();
        assert!(matches!(err, MdmError::AlreadyResolved(k) if k == pending.key));
        assert_eq!(updater.calls.borrow().len(), 1);
    }

    #[test]
    fn test_failed_resolve_requeues() {
        let queue = ConflictQueue::new();
        let updater = RecordingUpdater {
            fail: true,
            ..Default::default()
        };
        let pending = item(MatchOutcome::PossibleMatch);
        queue.enqueue(pending.clone());

        let err = queue
            .resolve(&updater, pending.key, ReviewDecision::Match, &ctx())
            .unwrap_err();
        assert!(matches!(err, MdmError::RepositoryUnavailable(_)));
        assert!(queue.contains(pending.key));
        assert_eq!(queue.dequeue_for_review().unwrap().key, pending.key);
    }

    #[test]
    fn test_duplicate_match_decision_merges() {
        let queue = ConflictQueue::new();
        let updater = RecordingUpdater::default();
        let dup = item(MatchOutcome::PossibleDuplicate);
        queue.enqueue(dup.clone());

        let resolution = queue
            .resolve(&updater, dup.key, ReviewDecision::Match, &ctx())
            .unwrap();
        assert!(matches!(resolution, Resolution::Merged(_)));
        assert_eq!(updater.calls.borrow().as_slice(), ["merge"]);
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!("match".parse::<ReviewDecision>().unwrap(), ReviewDecision::Match);
        assert_eq!("merge".parse::<ReviewDecision>().unwrap(), ReviewDecision::Match);
        assert_eq!("no-match".parse::<ReviewDecision>().unwrap(), ReviewDecision::NoMatch);
        assert_eq!(
            "not_duplicate".parse::<ReviewDecision>().unwrap(),
            ReviewDecision::NoMatch
        );
        assert!("maybe".parse::<ReviewDecision>().is_err());
    }
}
