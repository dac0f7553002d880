use crate::error::{MdmError, Result};
use crate::linking::config::RetractionPolicy;
use crate::storage::{LinkBatch, LinkFilter, Storage};
use crate::types::{
    GoldenId, GoldenRecord, Link, LinkKey, LinkSource, MatchOutcome, ResourceId,
};
use std::sync::Arc;

/// What an upsert changed
#[derive(Debug, Clone)]
pub struct UpsertResult {
    /// The link as stored.
    pub link: Link,
    /// True if no link existed for the pair before.
    pub created: bool,
    /// Previous MATCH links of the same target, after retraction.
    /// Under [`RetractionPolicy::Delete`] these are the deleted links.
    pub retracted: Vec<Link>,
    /// AUTO POSSIBLE_MATCH links of the same target closed as NO_MATCH by a new MATCH.
    pub superseded: Vec<Link>,
}

/// The golden↔target link graph.
///
/// Every write goes through one storage batch so readers see either the
/// state before or after it. `upsert_link` is where the one-MATCH-per-target
/// rule is enforced: any other MATCH for the target is retracted in the same
/// batch the new MATCH is installed in.
pub struct LinkStore<S: Storage> {
    storage: Arc<S>,
    retraction: RetractionPolicy,
}

impl<S: Storage> LinkStore<S> {
    pub fn new(storage: Arc<S>, retraction: RetractionPolicy) -> Self {
        Self {
            storage,
            retraction,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    // === Reads ===

    pub fn get_golden(&self, id: GoldenId) -> Result<Option<GoldenRecord>> {
        self.storage.get_golden(id)
    }

    pub fn resolve_golden(&self, id: GoldenId) -> Result<Option<GoldenRecord>> {
        self.storage.resolve_golden(id)
    }

    pub fn get_link(&self, key: LinkKey) -> Result<Option<Link>> {
        self.storage.get_link(key)
    }

    pub fn links_for_golden(&self, golden: GoldenId) -> Result<Vec<Link>> {
        self.storage.links_for_golden(golden)
    }

    pub fn links_for_target(&self, target: ResourceId) -> Result<Vec<Link>> {
        self.storage.links_for_target(target)
    }

    /// The single MATCH link of a target, if it has one
    pub fn match_for_target(&self, target: ResourceId) -> Result<Option<Link>> {
        Ok(self
            .storage
            .links_for_target(target)?
            .into_iter()
            .find(|l| l.is_match()))
    }

    pub fn list_links(&self, filter: LinkFilter) -> Result<Vec<Link>> {
        self.storage.list_links(filter)
    }

    // === Writes ===

    /// Create or replace the link for `link.key()`.
    ///
    /// An existing link keeps its id and creation time. Installing a MATCH
    /// retracts the target's other MATCH links per the retraction policy and
    /// closes its AUTO POSSIBLE_MATCH links, all in one batch.
    pub fn upsert_link(&self, link: Link) -> Result<UpsertResult> {
        let (batch, result) = self.prepare_upsert(link)?;
        self.storage.apply(&batch)?;
        Ok(result)
    }

    /// Store a new golden record together with its founding link
    pub fn create_golden_with_link(&self, golden: GoldenRecord, link: Link) -> Result<UpsertResult> {
        let (batch, result) = self.prepare_golden_with_link(golden, link)?;
        self.storage.apply(&batch)?;
        Ok(result)
    }

    /// Remove a link. `LinkNotFound` if the pair has none.
    pub fn delete_link(&self, key: LinkKey) -> Result<Link> {
        let (batch, link) = self.prepare_delete(key)?;
        self.storage.apply(&batch)?;
        Ok(link)
    }

    /// The batch [`upsert_link`](Self::upsert_link) would commit, and what it changes.
    /// Callers may append to the batch (audit rows) before committing it.
    pub fn prepare_upsert(&self, link: Link) -> Result<(LinkBatch, UpsertResult)> {
        self.install(None, link)
    }

    pub fn prepare_golden_with_link(
        &self,
        golden: GoldenRecord,
        link: Link,
    ) -> Result<(LinkBatch, UpsertResult)> {
        if link.golden != golden.id {
            return Err(MdmError::InvalidInput(format!(
                "Founding link belongs to {}, not {}",
                link.golden, golden.id
            )));
        }
        self.install(Some(golden), link)
    }

    pub fn prepare_delete(&self, key: LinkKey) -> Result<(LinkBatch, Link)> {
        let link = self
            .storage
            .get_link(key)?
            .ok_or(MdmError::LinkNotFound(key))?;

        let mut batch = LinkBatch::new();
        batch.delete_link(key);
        Ok((batch, link))
    }

    fn install(&self, golden: Option<GoldenRecord>, mut link: Link) -> Result<(LinkBatch, UpsertResult)> {
        let existing = self.storage.get_link(link.key())?;
        let created = existing.is_none();
        if let Some(ref old) = existing {
            link.id = old.id;
            link.created_at = old.created_at;
        }

        let mut batch = LinkBatch::new();
        if let Some(golden) = golden {
            batch.put_golden(golden);
        }

        let mut retracted = Vec::new();
        let mut superseded = Vec::new();

        if link.is_match() {
            for mut other in self.storage.links_for_target(link.target.id)? {
                if other.golden == link.golden {
                    continue;
                }

                if other.is_match() {
                    match self.retraction {
                        RetractionPolicy::MarkNoMatch => {
                            other.set_decision(MatchOutcome::NoMatch, other.source, other.score);
                            batch.put_link(other.clone());
                        }
                        RetractionPolicy::Delete => {
                            batch.delete_link(other.key());
                        }
                    }
                    retracted.push(other);
                } else if other.outcome == MatchOutcome::PossibleMatch
                    && other.source == LinkSource::Auto
                {
                    other.set_decision(MatchOutcome::NoMatch, LinkSource::Auto, other.score);
                    batch.put_link(other.clone());
                    superseded.push(other);
                }
            }
        }

        batch.put_link(link.clone());

        let result = UpsertResult {
            link,
            created,
            retracted,
            superseded,
        };
        Ok((batch, result))
    }

    /// Commit a prepared batch
    pub fn commit(&self, batch: &LinkBatch) -> Result<()> {
        self.storage.apply(batch)
    }
}
