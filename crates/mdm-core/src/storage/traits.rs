use crate::error::{MdmError, Result};
use crate::storage::batch::LinkBatch;
use crate::storage::filters::{LinkFilter, StorageStats};
use crate::types::{GoldenId, GoldenRecord, Link, LinkKey, ResourceId};

const MAX_REDIRECTS: usize = 32;

/// Durable persistence boundary for golden records and links
pub trait Storage: Send + Sync {
    // === Golden Records ===

    /// Retrieve a golden record by ID, merged-away records included
    fn get_golden(&self, id: GoldenId) -> Result<Option<GoldenRecord>>;

    /// Follow `merged_into` pointers to the record that currently stands
    /// for `id`. Returns None if `id` is unknown.
    fn resolve_golden(&self, id: GoldenId) -> Result<Option<GoldenRecord>> {
        let mut current = match self.get_golden(id)? {
            Some(golden) => golden,
            None => return Ok(None),
        };

        // Merge chains are short; the bound only guards against a corrupt cycle
        for _ in 0..MAX_REDIRECTS {
            match current.merged_into {
                None => return Ok(Some(current)),
                Some(next) => {
                    current = self
                        .get_golden(next)?
                        .ok_or(MdmError::GoldenNotFound(next))?;
                }
            }
        }

        Err(MdmError::Conflict(format!(
            "Golden record {} exceeds {} merge redirects",
            id, MAX_REDIRECTS
        )))
    }

    /// List golden records, optionally including merged-away ones
    fn list_golden(&self, include_merged: bool) -> Result<Vec<GoldenRecord>>;

    // === Links ===

    /// Retrieve the link for a (golden, target) pair
    fn get_link(&self, key: LinkKey) -> Result<Option<Link>>;

    /// All links owned by a golden record, ordered by target id
    fn links_for_golden(&self, golden: GoldenId) -> Result<Vec<Link>>;

    /// All links pointing at a target, whichever golden record owns them
    fn links_for_target(&self, target: ResourceId) -> Result<Vec<Link>>;

    /// List links matching the filter
    fn list_links(&self, filter: LinkFilter) -> Result<Vec<Link>>;

    // === Writes ===

    /// Commit every operation in the batch atomically.
    ///
    /// Implementations must reject (and roll back) a batch that would leave
    /// any touched target with more than one MATCH link, and must reject links
    /// owned by a missing or merged-away golden record.
    fn apply(&self, batch: &LinkBatch) -> Result<()>;

    /// Store a golden record on its own
    fn put_golden(&self, golden: &GoldenRecord) -> Result<()> {
        let mut batch = LinkBatch::new();
        batch.put_golden(golden.clone());
        self.apply(&batch)
    }

    // === Metadata ===

    /// Store metadata key-value pair
    fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Retrieve metadata by key
    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>>;

    // === Maintenance ===

    /// Get database statistics
    fn stats(&self) -> Result<StorageStats>;
}
