use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::candidates::CandidateSearch;
use crate::error::{MdmError, Result};
use crate::linking::config::LinkServiceConfig;
use crate::linking::locks::EntityLocks;
use crate::linking::store::{LinkStore, UpsertResult};
use crate::matching::{MatchEngine, MatchResult};
use crate::queue::{ConflictQueue, LinkUpdater, Resolution, ReviewDecision, ReviewItem};
use crate::repository::ResourceRepository;
use crate::storage::{LinkBatch, RedbStorage, Storage, StorageStats};
use crate::types::{
    GoldenId, GoldenRecord, Link, LinkKey, LinkSource, MatchOutcome, Resource, ResourceId,
    ResourceRef, TransactionContext,
};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Attempts at locking a merge whose link set keeps changing underneath it
const MERGE_LOCK_ATTEMPTS: usize = 3;

/// Where a link request came from
enum Origin {
    /// Scoring a resource the caller handed over
    Scoring,
    /// A direct request: the target must exist, and the extra audit
    /// entries are committed with the change
    Direct(Vec<AuditEntry>),
}

/// Result of `update_link`
#[derive(Debug, Clone)]
pub struct LinkUpdate {
    /// The link as it now stands. When the request was not applied this is
    /// the link that prevailed.
    pub link: Link,
    /// False when an existing decision took precedence over the request.
    pub applied: bool,
    pub created: bool,
    pub retracted: Vec<Link>,
    pub superseded: Vec<Link>,
}

impl LinkUpdate {
    pub fn applied(link: Link) -> Self {
        Self {
            link,
            applied: true,
            created: false,
            retracted: Vec::new(),
            superseded: Vec::new(),
        }
    }

    pub fn unchanged(link: Link) -> Self {
        Self {
            applied: false,
            ..Self::applied(link)
        }
    }
}

impl From<UpsertResult> for LinkUpdate {
    fn from(result: UpsertResult) -> Self {
        Self {
            link: result.link,
            applied: true,
            created: result.created,
            retracted: result.retracted,
            superseded: result.superseded,
        }
    }
}

/// Result of `merge_golden_records`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The record now standing for both inputs
    pub survivor: GoldenId,
    pub loser: GoldenId,
    /// True if the loser had already been merged before this call
    pub already_merged: bool,
    /// Links moved onto the survivor
    pub repointed: usize,
    /// Links removed because the survivor already held a stronger decision
    pub dropped: usize,
}

impl MergeOutcome {
    pub fn already(survivor: GoldenId, loser: GoldenId) -> Self {
        Self {
            survivor,
            loser,
            already_merged: true,
            repointed: 0,
            dropped: 0,
        }
    }
}

/// Result of `process_candidate`
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub target: Option<ResourceRef>,
    /// The target's MATCH link after processing
    pub matched: Option<Link>,
    /// Set when no candidate matched and a new golden record was founded
    pub created_golden: Option<GoldenRecord>,
    pub possible_matches: Vec<Link>,
    pub possible_duplicates: Vec<Link>,
    /// An operator MATCH pinned the target; nothing was re-scored
    pub manual_retained: bool,
    pub candidates_evaluated: usize,
}

impl ProcessOutcome {
    fn for_target(target: &ResourceRef) -> Self {
        Self {
            target: Some(target.clone()),
            ..Default::default()
        }
    }

    fn retained(target: &ResourceRef, manual: Link) -> Self {
        Self {
            matched: Some(manual),
            manual_retained: true,
            ..Self::for_target(target)
        }
    }
}

/// Cooperative cancellation for long-running scoring
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Orchestrates candidate search, scoring and link mutation.
///
/// Every mutation names the golden records and targets it touches and holds
/// their entity locks for its whole read-decide-write span. Decisions made
/// by an operator (MANUAL) are never overridden by re-scoring (AUTO), and an
/// AUTO MATCH is only ever moved by a stronger MATCH, a merge, or an operator.
pub struct LinkService<S: Storage, R: ResourceRepository> {
    store: LinkStore<S>,
    candidates: CandidateSearch<S, R>,
    repository: Arc<R>,
    engine: MatchEngine,
    queue: Arc<ConflictQueue>,
    locks: EntityLocks,
    audit: Arc<AuditLog>,
    config: LinkServiceConfig,
}

impl<R: ResourceRepository> LinkService<RedbStorage, R> {
    /// Open (or create) a redb-backed service at `path`
    pub fn open(path: impl AsRef<Path>, repository: Arc<R>, config: LinkServiceConfig) -> Result<Self> {
        let storage = Arc::new(RedbStorage::open(path)?);
        let audit = Arc::new(AuditLog::new(storage.database())?);
        Self::new(storage, repository, audit, config)
    }
}

impl<S: Storage, R: ResourceRepository> LinkService<S, R> {
    pub fn new(
        storage: Arc<S>,
        repository: Arc<R>,
        audit: Arc<AuditLog>,
        config: LinkServiceConfig,
    ) -> Result<Self> {
        config.validate()?;
        let engine = MatchEngine::new(config.matching.clone())?;

        let queue = Arc::new(ConflictQueue::new());
        queue.rebuild(storage.as_ref())?;

        Ok(Self {
            store: LinkStore::new(storage.clone(), config.retraction),
            candidates: CandidateSearch::new(storage, repository.clone(), config.candidates.clone()),
            repository,
            engine,
            queue,
            locks: EntityLocks::new(config.lock_timeout()),
            audit,
            config,
        })
    }

    pub fn config(&self) -> &LinkServiceConfig {
        &self.config
    }

    pub fn engine(&self) -> &MatchEngine {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<ConflictQueue> {
        &self.queue
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn store(&self) -> &LinkStore<S> {
        &self.store
    }

    // === Queries ===

    pub fn get_golden(&self, id: GoldenId) -> Result<GoldenRecord> {
        self.store.get_golden(id)?.ok_or(MdmError::GoldenNotFound(id))
    }

    /// The record currently standing for `id`, following merges
    pub fn resolve_golden(&self, id: GoldenId) -> Result<GoldenRecord> {
        self.store
            .resolve_golden(id)?
            .ok_or(MdmError::GoldenNotFound(id))
    }

    /// Every link a golden record owns, whatever its outcome
    pub fn links_for_golden(&self, golden: GoldenId) -> Result<Vec<Link>> {
        self.get_golden(golden)?;
        self.store.links_for_golden(golden)
    }

    /// Every link that points at a target
    pub fn links_for_target(&self, target: ResourceId) -> Result<Vec<Link>> {
        self.store.links_for_target(target)
    }

    /// The golden record a target currently belongs to
    pub fn match_for_target(&self, target: ResourceId) -> Result<Option<Link>> {
        self.store.match_for_target(target)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.store.storage().stats()
    }

    // === Link mutation ===

    /// Create or change the link between a golden record and a target.
    ///
    /// An existing MANUAL decision is kept against an AUTO request, as is an
    /// existing AUTO MATCH against an AUTO downgrade; in both cases the
    /// returned update has `applied == false` and carries the prevailing link.
    pub fn update_link(
        &self,
        golden: GoldenId,
        target: &ResourceRef,
        outcome: MatchOutcome,
        source: LinkSource,
        score: Option<f64>,
        ctx: &TransactionContext,
    ) -> Result<LinkUpdate> {
        let _guard = self.locks.acquire([golden, target.id])?;
        self.update_link_locked(
            golden,
            target,
            outcome,
            source,
            score,
            ctx,
            Origin::Direct(Vec::new()),
        )
    }

    /// Remove the link between a golden record and a target
    pub fn delete_link(
        &self,
        golden: GoldenId,
        target: ResourceId,
        ctx: &TransactionContext,
    ) -> Result<Link> {
        let _guard = self.locks.acquire([golden, target])?;
        let (mut batch, removed) = self.store.prepare_delete(LinkKey::new(golden, target))?;
        batch.audit(AuditEntry::for_link(AuditAction::LinkDeleted, &removed, ctx));
        self.store.commit(&batch)?;
        self.queue.remove(removed.key());

        log::info!(
            "Deleted link {} ({}) [txn={} reason={}]",
            removed.key(),
            removed.outcome,
            ctx.transaction_id,
            ctx.reason
        );
        Ok(removed)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_link_locked(
        &self,
        golden: GoldenId,
        target: &ResourceRef,
        outcome: MatchOutcome,
        source: LinkSource,
        score: Option<f64>,
        ctx: &TransactionContext,
        origin: Origin,
    ) -> Result<LinkUpdate> {
        let golden_record = self.get_golden(golden)?;
        if let Some(survivor) = golden_record.merged_into {
            return Err(MdmError::Conflict(format!(
                "Golden record {} was merged into {}",
                golden, survivor
            )));
        }
        self.check_link_target(&golden_record, target, outcome)?;
        let notes = match origin {
            Origin::Scoring => Vec::new(),
            Origin::Direct(notes) => {
                self.check_target_exists(target)?;
                notes
            }
        };

        let key = LinkKey::new(golden, target.id);
        let existing = self.store.get_link(key)?;

        if let Some(ref current) = existing {
            if Self::keeps_precedence(current, outcome, source) {
                log::debug!(
                    "Kept {} {} on {} over {} {}",
                    current.outcome,
                    current.source,
                    key,
                    outcome,
                    source
                );
                return Ok(LinkUpdate::unchanged(current.clone()));
            }
        }

        if outcome == MatchOutcome::Match && source == LinkSource::Auto {
            let pinned = self
                .store
                .links_for_target(target.id)?
                .into_iter()
                .find(|l| l.golden != golden && l.is_match() && l.is_manual());
            if let Some(pinned) = pinned {
                log::debug!("{} is pinned to {} by an operator", target, pinned.golden);
                return Ok(LinkUpdate::unchanged(pinned));
            }
        }

        let link = match existing {
            Some(mut current) => {
                current.set_decision(outcome, source, score);
                current.target = target.clone();
                current
            }
            None => Link::new(golden, target.clone(), outcome, source, score),
        };

        let (mut batch, result) = self.store.prepare_upsert(link)?;
        Self::stage_audit(&mut batch, &result, ctx);
        for note in notes {
            batch.audit(note);
        }
        self.store.commit(&batch)?;
        self.record_upsert(&result, ctx);
        Ok(result.into())
    }

    /// Whether `current` must survive a request for `outcome` from `source`
    fn keeps_precedence(current: &Link, outcome: MatchOutcome, source: LinkSource) -> bool {
        if source == LinkSource::Manual {
            return false;
        }
        current.is_manual() || (current.is_match() && outcome != MatchOutcome::Match)
    }

    /// A target is either a golden record or a resource the repository knows
    fn check_target_exists(&self, target: &ResourceRef) -> Result<()> {
        if self.store.get_golden(target.id)?.is_some() {
            return Ok(());
        }
        self.repository.get(target).map(|_| ())
    }

    fn check_link_target(
        &self,
        golden: &GoldenRecord,
        target: &ResourceRef,
        outcome: MatchOutcome,
    ) -> Result<()> {
        if target.resource_type != golden.resource_type {
            return Err(MdmError::InvalidInput(format!(
                "Cannot link {} to {} golden record {}",
                target, golden.resource_type, golden.id
            )));
        }
        if target.id == golden.id {
            return Err(MdmError::InvalidInput(format!(
                "Golden record {} cannot link to itself",
                golden.id
            )));
        }

        // Golden-to-golden links carry duplicate suspicions or their rejection
        let target_is_golden = self.store.get_golden(target.id)?.is_some();
        let allowed = match outcome {
            MatchOutcome::PossibleDuplicate => target_is_golden,
            MatchOutcome::NoMatch => true,
            MatchOutcome::Match | MatchOutcome::PossibleMatch => !target_is_golden,
        };
        if allowed {
            Ok(())
        } else if target_is_golden {
            Err(MdmError::InvalidInput(format!(
                "Golden record {} cannot be the target of a {} link",
                target, outcome
            )))
        } else {
            Err(MdmError::InvalidInput(format!(
                "POSSIBLE_DUPLICATE target {} is not a golden record",
                target
            )))
        }
    }

    /// Audit rows for an upsert, committed in the upsert's own batch
    fn stage_audit(batch: &mut LinkBatch, result: &UpsertResult, ctx: &TransactionContext) {
        let link = &result.link;
        let action = if result.created {
            AuditAction::LinkCreated
        } else {
            AuditAction::LinkUpdated
        };
        batch.audit(AuditEntry::for_link(action, link, ctx));

        for retracted in &result.retracted {
            batch.audit(
                AuditEntry::for_link(AuditAction::LinkRetracted, retracted, ctx)
                    .with_details(format!("MATCH moved to {}", link.golden)),
            );
        }
        for superseded in &result.superseded {
            batch.audit(
                AuditEntry::for_link(AuditAction::LinkRetracted, superseded, ctx)
                    .with_details(format!("superseded by MATCH to {}", link.golden)),
            );
        }
    }

    /// Queue bookkeeping and logging for a committed upsert
    fn record_upsert(&self, result: &UpsertResult, ctx: &TransactionContext) {
        let link = &result.link;
        if link.outcome.needs_review() {
            self.queue.enqueue(ReviewItem::from_link(link));
        } else {
            self.queue.remove(link.key());
        }
        for closed in result.retracted.iter().chain(&result.superseded) {
            self.queue.remove(closed.key());
        }

        log::info!(
            "Link {} -> {} {} [txn={} reason={} retracted={}]",
            link.key(),
            link.outcome,
            link.source,
            ctx.transaction_id,
            ctx.reason,
            result.retracted.len()
        );
    }

    // === Merge ===

    /// Merge `loser` into `survivor`.
    ///
    /// Each of the loser's links is moved in its own atomic step and the loser
    /// is only marked merged at the end, so an interrupted merge is finished
    /// by calling this again. Merging an already merged record is a no-op that
    /// reports where it went.
    pub fn merge_golden_records(
        &self,
        survivor: GoldenId,
        loser: GoldenId,
        ctx: &TransactionContext,
    ) -> Result<MergeOutcome> {
        self.merge_noted(survivor, loser, ctx, Vec::new())
    }

    fn merge_noted(
        &self,
        survivor: GoldenId,
        loser: GoldenId,
        ctx: &TransactionContext,
        notes: Vec<AuditEntry>,
    ) -> Result<MergeOutcome> {
        if survivor == loser {
            return Err(MdmError::InvalidInput(format!(
                "Cannot merge golden record {} into itself",
                survivor
            )));
        }

        for attempt in 1..=MERGE_LOCK_ATTEMPTS {
            let wanted = self.merge_lock_set(survivor, loser)?;
            let guard = self.locks.acquire(wanted)?;

            // Links may have moved while we waited
            let needed = self.merge_lock_set(survivor, loser)?;
            if needed.iter().all(|id| guard.covers(*id)) {
                return self.merge_locked(survivor, loser, ctx, notes);
            }
            log::debug!(
                "Link set of {} changed while locking (attempt {})",
                loser,
                attempt
            );
        }

        Err(MdmError::Conflict(format!(
            "Links of golden record {} kept changing during merge",
            loser
        )))
    }

    fn merge_lock_set(&self, survivor: GoldenId, loser: GoldenId) -> Result<BTreeSet<Uuid>> {
        let mut ids = BTreeSet::from([survivor, loser]);
        ids.extend(self.store.links_for_golden(loser)?.iter().map(|l| l.target.id));
        ids.extend(self.store.links_for_target(loser)?.iter().map(|l| l.golden));
        Ok(ids)
    }

    fn merge_locked(
        &self,
        survivor: GoldenId,
        loser: GoldenId,
        ctx: &TransactionContext,
        notes: Vec<AuditEntry>,
    ) -> Result<MergeOutcome> {
        let mut loser_record = self.get_golden(loser)?;
        if loser_record.merged_into.is_some() {
            let current = self.resolve_golden(loser)?;
            log::info!("{} already merged into {}", loser, current.id);
            return Ok(MergeOutcome::already(current.id, loser));
        }

        let mut survivor_record = self.get_golden(survivor)?;
        if let Some(next) = survivor_record.merged_into {
            return Err(MdmError::Conflict(format!(
                "Survivor {} was itself merged into {}",
                survivor, next
            )));
        }
        if survivor_record.resource_type != loser_record.resource_type {
            return Err(MdmError::InvalidInput(format!(
                "Cannot merge {} golden record {} into {} golden record {}",
                loser_record.resource_type, loser, survivor_record.resource_type, survivor
            )));
        }

        let mut outcome = MergeOutcome {
            survivor,
            loser,
            already_merged: false,
            repointed: 0,
            dropped: 0,
        };

        // Outbound: links the loser owns
        for link in self.store.links_for_golden(loser)? {
            let mut batch = LinkBatch::new();
            batch.delete_link(link.key());

            let moved = if link.target.id == survivor {
                None
            } else {
                let mut moved = link.clone();
                moved.golden = survivor;
                moved.updated_at = Utc::now();
                match self.store.get_link(moved.key())? {
                    Some(current) if Self::merge_rank(&current) >= Self::merge_rank(&moved) => None,
                    _ => Some(moved),
                }
            };
            self.commit_merge_step(&link, moved, batch, &mut outcome, ctx)?;
        }

        // Inbound: duplicate suspicions pointing at the loser
        for link in self.store.links_for_target(loser)? {
            let mut batch = LinkBatch::new();
            batch.delete_link(link.key());

            let moved = if link.golden == survivor {
                None
            } else {
                let forward = self.store.get_link(LinkKey::new(link.golden, survivor))?;
                let reverse = self.store.get_link(LinkKey::new(survivor, link.golden))?;
                if forward.is_some() || reverse.is_some() {
                    None
                } else {
                    let mut moved = link.clone();
                    moved.target = survivor_record.as_reference();
                    moved.updated_at = Utc::now();
                    Some(moved)
                }
            };
            self.commit_merge_step(&link, moved, batch, &mut outcome, ctx)?;
        }

        let now = Utc::now();
        for (attribute, value) in &loser_record.attributes {
            survivor_record
                .attributes
                .entry(attribute.clone())
                .or_insert_with(|| value.clone());
        }
        survivor_record.version += 1;
        survivor_record.updated_at = now;
        loser_record.merged_into = Some(survivor);
        loser_record.updated_at = now;

        let mut batch = LinkBatch::new();
        batch
            .put_golden(survivor_record.clone())
            .put_golden(loser_record)
            .audit(
                AuditEntry::new(AuditAction::GoldenMerged, survivor, ctx).with_details(format!(
                    "absorbed {} (repointed={} dropped={} version={})",
                    loser, outcome.repointed, outcome.dropped, survivor_record.version
                )),
            );
        for note in notes {
            batch.audit(note);
        }
        self.store.commit(&batch)?;

        log::info!(
            "Merged {} into {} (repointed={} dropped={}) [txn={} reason={}]",
            loser,
            survivor,
            outcome.repointed,
            outcome.dropped,
            ctx.transaction_id,
            ctx.reason
        );
        Ok(outcome)
    }

    /// Rank used when both sides of a merge hold a link to the same target
    fn merge_rank(link: &Link) -> (bool, u8) {
        let outcome = match link.outcome {
            MatchOutcome::Match => 3,
            MatchOutcome::PossibleMatch => 2,
            MatchOutcome::PossibleDuplicate => 1,
            MatchOutcome::NoMatch => 0,
        };
        (link.is_manual(), outcome)
    }

    fn commit_merge_step(
        &self,
        old: &Link,
        moved: Option<Link>,
        mut batch: LinkBatch,
        outcome: &mut MergeOutcome,
        ctx: &TransactionContext,
    ) -> Result<()> {
        let entry = match moved {
            Some(ref moved) => {
                batch.put_link(moved.clone());
                AuditEntry::for_link(AuditAction::LinkRepointed, moved, ctx)
                    .with_details(format!("from {}", old.key()))
            }
            None => AuditEntry::for_link(AuditAction::LinkDeleted, old, ctx)
                .with_details(format!("dropped merging into {}", outcome.survivor)),
        };
        batch.audit(entry);
        self.store.commit(&batch)?;
        self.queue.remove(old.key());

        match moved {
            Some(moved) => {
                outcome.repointed += 1;
                if moved.outcome.needs_review() {
                    self.queue.enqueue(ReviewItem::from_link(&moved));
                } else {
                    // May have replaced a survivor link that was waiting on review
                    self.queue.remove(moved.key());
                }
            }
            None => outcome.dropped += 1,
        }
        Ok(())
    }

    // === Scoring ===

    /// Score a target against its candidates and update its links.
    pub fn process_candidate(&self, target: &Resource, ctx: &TransactionContext) -> Result<ProcessOutcome> {
        self.process_candidate_with_cancel(target, ctx, &CancelFlag::new())
    }

    /// As [`process_candidate`](Self::process_candidate), checking `cancel`
    /// between candidate evaluations. Cancellation before the write phase
    /// leaves every link as it was.
    pub fn process_candidate_with_cancel(
        &self,
        target: &Resource,
        ctx: &TransactionContext,
        cancel: &CancelFlag,
    ) -> Result<ProcessOutcome> {
        self.engine.check_comparable(target)?;

        if let Some(manual) = self.manual_match(target.id())? {
            log::debug!("{} pinned to {}, skipping scoring", target.reference, manual.golden);
            return Ok(ProcessOutcome::retained(&target.reference, manual));
        }

        let candidates = self.candidates.find(target)?;
        let mut scored: Vec<(GoldenRecord, MatchResult)> = candidates
            .par_iter()
            .map(|candidate| {
                if cancel.is_cancelled() {
                    return Err(MdmError::Cancelled(format!(
                        "Scoring of {} cancelled",
                        target.reference
                    )));
                }
                match self.store.get_golden(candidate.golden)? {
                    Some(golden) if golden.is_active() => {
                        let result = self.engine.evaluate(target, &golden)?;
                        Ok(Some((golden, result)))
                    }
                    _ => Ok(None),
                }
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        scored.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });

        if cancel.is_cancelled() {
            return Err(MdmError::Cancelled(format!(
                "Scoring of {} cancelled",
                target.reference
            )));
        }

        let existing = self.store.links_for_target(target.id())?;
        let mut lock_ids = vec![target.id()];
        lock_ids.extend(scored.iter().map(|(g, _)| g.id));
        lock_ids.extend(existing.iter().map(|l| l.golden));
        let _guard = self.locks.acquire(lock_ids)?;

        self.apply_scores_locked(target, &scored, ctx)
    }

    fn manual_match(&self, target: ResourceId) -> Result<Option<Link>> {
        Ok(self
            .store
            .links_for_target(target)?
            .into_iter()
            .find(|l| l.is_match() && l.is_manual()))
    }

    fn apply_scores_locked(
        &self,
        target: &Resource,
        scored: &[(GoldenRecord, MatchResult)],
        ctx: &TransactionContext,
    ) -> Result<ProcessOutcome> {
        // An operator may have pinned the target while we were scoring
        if let Some(manual) = self.manual_match(target.id())? {
            return Ok(ProcessOutcome::retained(&target.reference, manual));
        }

        let mut outcome = ProcessOutcome::for_target(&target.reference);
        outcome.candidates_evaluated = scored.len();

        let existing: HashMap<GoldenId, Link> = self
            .store
            .links_for_target(target.id())?
            .into_iter()
            .map(|l| (l.golden, l))
            .collect();

        // Locks are held, but a candidate can have been merged since scoring.
        // Records an operator already ruled on for this target are left out.
        let mut live = Vec::with_capacity(scored.len());
        for (golden, result) in scored {
            if existing.get(&golden.id).is_some_and(|l| l.is_manual()) {
                log::debug!("{} ruled on {} by an operator, not re-scored", golden.id, target.reference);
                continue;
            }
            if let Some(current) = self.store.get_golden(golden.id)? {
                if current.is_active() {
                    live.push((current, *result));
                }
            }
        }

        let current_match = existing.values().find(|l| l.is_match()).cloned();
        let mut handled: HashSet<GoldenId> = HashSet::new();

        let matches: Vec<&(GoldenRecord, MatchResult)> = live
            .iter()
            .filter(|(_, r)| r.outcome == MatchOutcome::Match)
            .collect();
        let possibles: Vec<&(GoldenRecord, MatchResult)> = live
            .iter()
            .filter(|(_, r)| r.outcome == MatchOutcome::PossibleMatch)
            .collect();

        if let Some((best, best_result)) = matches.first() {
            let update = self.update_link_locked(
                best.id,
                &target.reference,
                MatchOutcome::Match,
                LinkSource::Auto,
                Some(best_result.score),
                ctx,
                Origin::Scoring,
            )?;
            outcome.matched = if update.link.is_match() {
                Some(update.link)
            } else {
                self.store.match_for_target(target.id())?
            };
            handled.insert(best.id);

            for (other, result) in matches.iter().skip(1) {
                handled.insert(other.id);
                if let Some(dup) = self.flag_duplicate_locked(best, other, result.score, ctx)? {
                    outcome.possible_duplicates.push(dup);
                }
            }
            // Closed by the new MATCH
            handled.extend(possibles.iter().map(|(g, _)| g.id));
        } else if !possibles.is_empty() {
            for (golden, result) in &possibles {
                handled.insert(golden.id);
                // An existing MATCH stands; no new review work for other records
                if current_match.is_some() && !existing.contains_key(&golden.id) {
                    continue;
                }
                let update = self.update_link_locked(
                    golden.id,
                    &target.reference,
                    MatchOutcome::PossibleMatch,
                    LinkSource::Auto,
                    Some(result.score),
                    ctx,
                    Origin::Scoring,
                )?;
                if update.applied && update.link.outcome == MatchOutcome::PossibleMatch {
                    outcome.possible_matches.push(update.link);
                }
            }
            outcome.matched = self.store.match_for_target(target.id())?;
        } else if let Some(concurrent) = current_match
            .clone()
            .filter(|m| !live.iter().any(|(g, _)| g.id == m.golden))
        {
            // Another call linked the target after our candidate search
            outcome.matched = Some(concurrent);
        } else {
            let golden = GoldenRecord::from_target(target);
            let founding = Link::new(
                golden.id,
                target.reference.clone(),
                MatchOutcome::Match,
                LinkSource::Auto,
                Some(1.0),
            );
            let (mut batch, result) = self.store.prepare_golden_with_link(golden.clone(), founding)?;
            batch.audit(
                AuditEntry::new(AuditAction::GoldenCreated, golden.id, ctx)
                    .with_details(format!("founded by {}", target.reference)),
            );
            Self::stage_audit(&mut batch, &result, ctx);
            self.store.commit(&batch)?;
            self.record_upsert(&result, ctx);

            outcome.matched = Some(result.link);
            outcome.created_golden = Some(golden);
        }

        // Earlier links to candidates that now score NO_MATCH
        for (golden, result) in &live {
            if handled.contains(&golden.id) || result.outcome != MatchOutcome::NoMatch {
                continue;
            }
            let Some(current) = self.store.get_link(LinkKey::new(golden.id, target.id()))? else {
                continue;
            };
            if current.outcome != MatchOutcome::NoMatch {
                self.update_link_locked(
                    golden.id,
                    &target.reference,
                    MatchOutcome::NoMatch,
                    LinkSource::Auto,
                    Some(result.score),
                    ctx,
                    Origin::Scoring,
                )?;
            }
        }

        log::info!(
            "Processed {}: {} candidates, match={:?} possible={} duplicates={} new_golden={} [txn={}]",
            target.reference,
            outcome.candidates_evaluated,
            outcome.matched.as_ref().map(|l| l.golden),
            outcome.possible_matches.len(),
            outcome.possible_duplicates.len(),
            outcome.created_golden.is_some(),
            ctx.transaction_id
        );
        Ok(outcome)
    }

    /// Record that two golden records both MATCH the same target.
    /// The older id owns the link; an operator's earlier verdict on the pair stands.
    fn flag_duplicate_locked(
        &self,
        a: &GoldenRecord,
        b: &GoldenRecord,
        score: f64,
        ctx: &TransactionContext,
    ) -> Result<Option<Link>> {
        let (owner, other) = if a.id < b.id { (a, b) } else { (b, a) };

        for key in [LinkKey::new(owner.id, other.id), LinkKey::new(other.id, owner.id)] {
            if let Some(existing) = self.store.get_link(key)? {
                if existing.is_manual() {
                    return Ok(None);
                }
            }
        }

        let update = self.update_link_locked(
            owner.id,
            &other.as_reference(),
            MatchOutcome::PossibleDuplicate,
            LinkSource::Auto,
            Some(score),
            ctx,
            Origin::Scoring,
        )?;
        Ok(update.applied.then_some(update.link))
    }

    // === Review ===

    /// Apply an operator decision to a queued link
    pub fn resolve_review(
        &self,
        key: LinkKey,
        decision: ReviewDecision,
        ctx: &TransactionContext,
    ) -> Result<Resolution> {
        let updater = ReviewUpdater {
            service: self,
            note: AuditEntry::new(AuditAction::ReviewResolved, key.golden, ctx)
                .with_details(format!("{} -> {:?}", key, decision)),
        };
        self.queue.resolve(&updater, key, decision, ctx)
    }
}

/// Carries the review note into the batch that applies the decision
struct ReviewUpdater<'a, S: Storage, R: ResourceRepository> {
    service: &'a LinkService<S, R>,
    note: AuditEntry,
}

impl<S: Storage, R: ResourceRepository> LinkUpdater for ReviewUpdater<'_, S, R> {
    fn update_link(
        &self,
        golden: GoldenId,
        target: &ResourceRef,
        outcome: MatchOutcome,
        source: LinkSource,
        score: Option<f64>,
        ctx: &TransactionContext,
    ) -> Result<LinkUpdate> {
        let _guard = self.service.locks.acquire([golden, target.id])?;
        self.service.update_link_locked(
            golden,
            target,
            outcome,
            source,
            score,
            ctx,
            Origin::Direct(vec![self.note.clone()]),
        )
    }

    fn merge_golden_records(
        &self,
        survivor: GoldenId,
        loser: GoldenId,
        ctx: &TransactionContext,
    ) -> Result<MergeOutcome> {
        self.service
            .merge_noted(survivor, loser, ctx, vec![self.note.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{MatchConfig, MatchRule};
    use crate::repository::InMemoryRepository;
    use crate::types::{ReasonCode, ResourceType};
    use tempfile::TempDir;

    struct Fixture {
        service: LinkService<RedbStorage, InMemoryRepository>,
        repository: Arc<InMemoryRepository>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let repository = Arc::new(InMemoryRepository::new());
        let config = LinkServiceConfig::new()
            .with_matching(
                MatchConfig::new()
                    .with_thresholds(0.3, 0.9)
                    .with_rules(vec![
                        MatchRule::exact("ssn", 6.0),
                        MatchRule::case_insensitive("name", 4.0),
                    ]),
            )
            .with_candidates(crate::candidates::CandidateConfig::new().with_blocking_attributes(&["ssn"]));
        let service = LinkService::open(temp.path().join("svc.redb"), repository.clone(), config).unwrap();
        Fixture {
            service,
            repository,
            _temp: temp,
        }
    }

    fn ctx() -> TransactionContext {
        TransactionContext::generate(ReasonCode::CreateResource)
    }

    fn patient(ssn: &str, name: &str) -> Resource {
        Resource::new(ResourceType::new("patient").unwrap())
            .with_attribute("ssn", ssn)
            .with_attribute("name", name)
    }

    fn ingest(fx: &Fixture, resource: &Resource) -> ProcessOutcome {
        fx.repository.put(resource.clone()).unwrap();
        fx.service.process_candidate(resource, &ctx()).unwrap()
    }

    #[test]
    fn test_first_target_founds_golden() {
        let fx = fixture();
        let outcome = ingest(&fx, &patient("1", "Ann"));
        let golden = outcome.created_golden.unwrap();
        assert_eq!(outcome.matched.unwrap().golden, golden.id);
        assert_eq!(golden.version, 1);
    }

    #[test]
    fn test_second_identical_target_joins() {
        let fx = fixture();
        let first = ingest(&fx, &patient("1", "Ann"));
        let second = ingest(&fx, &patient("1", "ann"));
        assert!(second.created_golden.is_none());
        assert_eq!(
            second.matched.unwrap().golden,
            first.created_golden.unwrap().id
        );
    }

    #[test]
    fn test_partial_score_is_queued() {
        let fx = fixture();
        let first = ingest(&fx, &patient("1", "Ann"));
        let golden = first.created_golden.unwrap().id;

        // ssn agrees, name does not: 0.6
        let target = patient("1", "Bob");
        let outcome = ingest(&fx, &target);
        assert_eq!(outcome.possible_matches.len(), 1);
        assert!(fx
            .service
            .queue()
            .contains(LinkKey::new(golden, target.id())));
    }

    #[test]
    fn test_auto_does_not_downgrade_match() {
        let fx = fixture();
        let target = patient("1", "Ann");
        let golden = ingest(&fx, &target).created_golden.unwrap().id;

        let update = fx
            .service
            .update_link(golden, &target.reference, MatchOutcome::NoMatch, LinkSource::Auto, Some(0.1), &ctx())
            .unwrap();
        assert!(!update.applied);
        assert_eq!(update.link.outcome, MatchOutcome::Match);

        let update = fx
            .service
            .update_link(golden, &target.reference, MatchOutcome::NoMatch, LinkSource::Manual, None, &ctx())
            .unwrap();
        assert!(update.applied);
        assert_eq!(update.link.outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn test_update_link_validates_golden() {
        let fx = fixture();
        let target = patient("1", "Ann");
        let err = fx
            .service
            .update_link(Uuid::now_v7(), &target.reference, MatchOutcome::Match, LinkSource::Manual, None, &ctx())
            .unwrap_err();
        assert!(matches!(err, MdmError::GoldenNotFound(_)));
    }

    #[test]
    fn test_cancelled_before_write_changes_nothing() {
        let fx = fixture();
        ingest(&fx, &patient("1", "Ann"));

        let cancel = CancelFlag::new();
        cancel.cancel();
        let target = patient("1", "Ann");
        fx.repository.put(target.clone()).unwrap();
        let err = fx
            .service
            .process_candidate_with_cancel(&target, &ctx(), &cancel)
            .unwrap_err();
        assert!(matches!(err, MdmError::Cancelled(_)));
        assert!(fx.service.links_for_target(target.id()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_required_attribute_rejected() {
        let fx = fixture();
        let config = fx.service.config().clone().with_matching(
            MatchConfig::new().with_rules(vec![MatchRule::exact("ssn", 1.0).required()]),
        );
        let strict = LinkService::new(
            fx.service.store().storage().clone(),
            fx.repository.clone(),
            fx.service.audit().clone(),
            config,
        )
        .unwrap();

        let target = Resource::new(ResourceType::new("patient").unwrap()).with_attribute("name", "x");
        let err = strict.process_candidate(&target, &ctx()).unwrap_err();
        assert!(matches!(err, MdmError::InvalidInput(_)));
    }
}
