use crate::audit::{append_entry, AUDIT_TABLE};
use crate::error::{MdmError, Result};
use crate::storage::batch::{BatchOp, LinkBatch};
use crate::storage::filters::{LinkFilter, StorageStats};
use crate::storage::traits::Storage;
use crate::types::{GoldenId, GoldenRecord, Link, LinkKey, MatchOutcome, ResourceId};
use redb::{
    Database, MultimapTable, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, Table,
    TableDefinition, WriteTransaction,
};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Table definitions
const GOLDEN: TableDefinition<&[u8; 16], &[u8]> = TableDefinition::new("golden_records");
/// Keyed by golden id ‖ target id so a golden's links are one contiguous range.
const LINKS: TableDefinition<&[u8; 32], &[u8]> = TableDefinition::new("links");

// Secondary indexes
const LINKS_BY_TARGET: MultimapTableDefinition<&[u8; 16], &[u8; 16]> =
    MultimapTableDefinition::new("links_by_target");
const LINKS_BY_OUTCOME: MultimapTableDefinition<&str, &[u8; 32]> =
    MultimapTableDefinition::new("links_by_outcome");

// Metadata table
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Open handles on every link table inside one write transaction
struct LinkTables<'txn> {
    golden: Table<'txn, &'static [u8; 16], &'static [u8]>,
    links: Table<'txn, &'static [u8; 32], &'static [u8]>,
    by_target: MultimapTable<'txn, &'static [u8; 16], &'static [u8; 16]>,
    by_outcome: MultimapTable<'txn, &'static str, &'static [u8; 32]>,
    audit: Table<'txn, u128, &'static [u8]>,
}

impl<'txn> LinkTables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            golden: txn.open_table(GOLDEN)?,
            links: txn.open_table(LINKS)?,
            by_target: txn.open_multimap_table(LINKS_BY_TARGET)?,
            by_outcome: txn.open_multimap_table(LINKS_BY_OUTCOME)?,
            audit: txn.open_table(AUDIT_TABLE)?,
        })
    }

    fn read_golden(&self, id: GoldenId) -> Result<Option<GoldenRecord>> {
        let bytes = self
            .golden
            .get(id.as_bytes())?
            .map(|guard| guard.value().to_vec());
        bytes.map(|b| RedbStorage::deserialize(&b)).transpose()
    }

    fn read_link(&self, key: &[u8; 32]) -> Result<Option<Link>> {
        let bytes = self.links.get(key)?.map(|guard| guard.value().to_vec());
        bytes.map(|b| RedbStorage::deserialize(&b)).transpose()
    }

    fn write_golden(&mut self, golden: &GoldenRecord) -> Result<()> {
        let bytes = RedbStorage::serialize(golden)?;
        self.golden.insert(golden.id.as_bytes(), bytes.as_slice())?;
        Ok(())
    }

    fn write_link(&mut self, link: &Link) -> Result<()> {
        let golden = self
            .read_golden(link.golden)?
            .ok_or(MdmError::GoldenNotFound(link.golden))?;
        if let Some(survivor) = golden.merged_into {
            return Err(MdmError::Conflict(format!(
                "Golden record {} was merged into {}; cannot link {}",
                link.golden, survivor, link.target
            )));
        }

        let key = link.key().to_bytes();
        let old = self.read_link(&key)?;

        let bytes = RedbStorage::serialize(link)?;
        self.links.insert(&key, bytes.as_slice())?;
        self.by_target
            .insert(link.target.id.as_bytes(), link.golden.as_bytes())?;

        if let Some(old) = old {
            if old.outcome != link.outcome {
                self.by_outcome.remove(old.outcome.as_str(), &key)?;
            }
        }
        self.by_outcome.insert(link.outcome.as_str(), &key)?;
        Ok(())
    }

    fn remove_link(&mut self, link_key: LinkKey) -> Result<()> {
        let key = link_key.to_bytes();
        let Some(old) = self.read_link(&key)? else {
            return Ok(());
        };

        self.links.remove(&key)?;
        self.by_target
            .remove(link_key.target.as_bytes(), link_key.golden.as_bytes())?;
        self.by_outcome.remove(old.outcome.as_str(), &key)?;
        Ok(())
    }

    fn match_count(&self, target: ResourceId) -> Result<usize> {
        let goldens: Vec<[u8; 16]> = self
            .by_target
            .get(target.as_bytes())?
            .map(|r| r.map(|g| *g.value()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut count = 0;
        for golden in goldens {
            let key = LinkKey::new(RedbStorage::bytes_to_uuid(&golden), target).to_bytes();
            if let Some(link) = self.read_link(&key)? {
                if link.is_match() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }
}

/// Redb-based storage implementation
pub struct RedbStorage {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbStorage {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MdmError::Validation(format!("Failed to create directory: {}", e))
            })?;
        }

        let is_new = !path.exists();
        let db = Database::create(&path)?;

        if !is_new {
            Self::check_schema_version(&db)?;
        }

        // Ensure tables exist
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(GOLDEN)?;
            let _ = write_txn.open_table(LINKS)?;
            let _ = write_txn.open_multimap_table(LINKS_BY_TARGET)?;
            let _ = write_txn.open_multimap_table(LINKS_BY_OUTCOME)?;
            let _ = write_txn.open_table(AUDIT_TABLE)?;
            let mut meta = write_txn.open_table(META)?;
            if is_new {
                meta.insert(
                    SCHEMA_VERSION_KEY,
                    CURRENT_SCHEMA_VERSION.to_string().as_bytes(),
                )?;
            }
        }
        write_txn.commit()?;

        log::debug!("Opened link store at {:?} (new: {})", path, is_new);

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    /// Check schema version. Returns error if the file was written by another version.
    fn check_schema_version(db: &Database) -> Result<()> {
        let read_txn = db.begin_read()?;
        let version = {
            let table = read_txn.open_table(META).ok();
            table
                .and_then(|t| {
                    t.get(SCHEMA_VERSION_KEY).ok().flatten().and_then(|v| {
                        std::str::from_utf8(v.value())
                            .ok()
                            .and_then(|s| s.parse::<u32>().ok())
                    })
                })
                .unwrap_or(CURRENT_SCHEMA_VERSION)
        };

        match version.cmp(&CURRENT_SCHEMA_VERSION) {
            std::cmp::Ordering::Equal => Ok(()),
            std::cmp::Ordering::Less => Err(MdmError::Validation(format!(
                "Database schema v{} is older than current v{}",
                version, CURRENT_SCHEMA_VERSION
            ))),
            std::cmp::Ordering::Greater => Err(MdmError::Validation(format!(
                "Database schema v{} is newer than this binary v{}",
                version, CURRENT_SCHEMA_VERSION
            ))),
        }
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle for sibling tables (the audit log lives in the same file)
    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    fn bytes_to_uuid(bytes: &[u8; 16]) -> uuid::Uuid {
        uuid::Uuid::from_bytes(*bytes)
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(MdmError::from)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(MdmError::from)
    }

    /// Run every op of the batch against an open write transaction
    fn write_batch(txn: &WriteTransaction, batch: &LinkBatch) -> Result<()> {
        let mut tables = LinkTables::open(txn)?;
        let mut touched = BTreeSet::new();

        for op in batch.ops() {
            match op {
                BatchOp::PutGolden(golden) => tables.write_golden(golden)?,
                BatchOp::PutLink(link) => {
                    tables.write_link(link)?;
                    touched.insert(link.target.id);
                }
                BatchOp::DeleteLink(key) => {
                    tables.remove_link(*key)?;
                    touched.insert(key.target);
                }
                BatchOp::Audit(entry) => append_entry(&mut tables.audit, entry)?,
            }
        }

        for target in touched {
            let matches = tables.match_count(target)?;
            if matches > 1 {
                return Err(MdmError::Conflict(format!(
                    "Target {} would have {} MATCH links",
                    target, matches
                )));
            }
        }

        Ok(())
    }

    fn collect_links<T: ReadableTable<&'static [u8; 32], &'static [u8]>>(
        links: &T,
        keys: impl IntoIterator<Item = [u8; 32]>,
    ) -> Result<Vec<Link>> {
        let mut out = Vec::new();
        for key in keys {
            if let Some(bytes) = links.get(&key)? {
                out.push(Self::deserialize(bytes.value())?);
            }
        }
        Ok(out)
    }

    fn link_matches_filter(link: &Link, filter: &LinkFilter) -> bool {
        if let Some(ref outcomes) = filter.outcomes {
            if !outcomes.contains(&link.outcome) {
                return false;
            }
        }

        if let Some(source) = filter.source {
            if link.source != source {
                return false;
            }
        }

        if let Some(golden) = filter.golden {
            if link.golden != golden {
                return false;
            }
        }

        true
    }
}

impl Storage for RedbStorage {
    fn get_golden(&self, id: GoldenId) -> Result<Option<GoldenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GOLDEN)?;

        if let Some(bytes) = table.get(id.as_bytes())? {
            Ok(Some(Self::deserialize(bytes.value())?))
        } else {
            Ok(None)
        }
    }

    fn list_golden(&self, include_merged: bool) -> Result<Vec<GoldenRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(GOLDEN)?;

        let mut out = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let golden: GoldenRecord = Self::deserialize(value.value())?;
            if include_merged || golden.is_active() {
                out.push(golden);
            }
        }
        Ok(out)
    }

    fn get_link(&self, key: LinkKey) -> Result<Option<Link>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINKS)?;

        if let Some(bytes) = table.get(&key.to_bytes())? {
            Ok(Some(Self::deserialize(bytes.value())?))
        } else {
            Ok(None)
        }
    }

    fn links_for_golden(&self, golden: GoldenId) -> Result<Vec<Link>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LINKS)?;

        let lo = LinkKey::new(golden, uuid::Uuid::nil()).to_bytes();
        let hi = LinkKey::new(golden, uuid::Uuid::from_bytes([0xff; 16])).to_bytes();

        let mut out = Vec::new();
        for item in table.range::<&[u8; 32]>(&lo..=&hi)? {
            let (_, value) = item?;
            out.push(Self::deserialize(value.value())?);
        }
        Ok(out)
    }

    fn links_for_target(&self, target: ResourceId) -> Result<Vec<Link>> {
        let read_txn = self.db.begin_read()?;
        let links = read_txn.open_table(LINKS)?;
        let by_target = read_txn.open_multimap_table(LINKS_BY_TARGET)?;

        let goldens: Vec<[u8; 16]> = by_target
            .get(target.as_bytes())?
            .map(|r| r.map(|g| *g.value()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let keys = goldens
            .iter()
            .map(|g| LinkKey::new(Self::bytes_to_uuid(g), target).to_bytes());
        Self::collect_links(&links, keys)
    }

    fn list_links(&self, filter: LinkFilter) -> Result<Vec<Link>> {
        if let Some(golden) = filter.golden {
            let mut links = self.links_for_golden(golden)?;
            links.retain(|l| Self::link_matches_filter(l, &filter));
            if let Some(limit) = filter.limit {
                links.truncate(limit);
            }
            return Ok(links);
        }

        let read_txn = self.db.begin_read()?;
        let links_table = read_txn.open_table(LINKS)?;

        let mut links = Vec::new();

        // If we have an outcome filter, use the index for efficiency
        if let Some(ref outcomes) = filter.outcomes {
            let outcome_index = read_txn.open_multimap_table(LINKS_BY_OUTCOME)?;
            for outcome in outcomes {
                let keys: Vec<[u8; 32]> = outcome_index
                    .get(outcome.as_str())?
                    .map(|r| r.map(|g| *g.value()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                links.extend(Self::collect_links(&links_table, keys)?);
            }
            links.retain(|l| Self::link_matches_filter(l, &filter));
        } else {
            // Full table scan
            for item in links_table.iter()? {
                let (_, value) = item?;
                let link: Link = Self::deserialize(value.value())?;
                if Self::link_matches_filter(&link, &filter) {
                    links.push(link);
                }
            }
        }

        links.sort_by_key(|l| l.key());
        if let Some(limit) = filter.limit {
            links.truncate(limit);
        }
        Ok(links)
    }

    fn apply(&self, batch: &LinkBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Validate everything before touching the database
        for op in batch.ops() {
            if let BatchOp::PutLink(link) = op {
                link.validate().map_err(MdmError::InvalidInput)?;
            }
        }

        let write_txn = self.db.begin_write()?;
        match Self::write_batch(&write_txn, batch) {
            Ok(()) => {
                write_txn.commit()?;
                Ok(())
            }
            Err(e) => {
                write_txn.abort()?;
                Err(e)
            }
        }
    }

    fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META)?;
            meta.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let meta = read_txn.open_table(META)?;
        Ok(meta.get(key)?.map(|v| v.value().to_vec()))
    }

    fn stats(&self) -> Result<StorageStats> {
        let read_txn = self.db.begin_read()?;

        let mut stats = StorageStats::default();

        {
            let golden = read_txn.open_table(GOLDEN)?;
            for item in golden.iter()? {
                let (_, value) = item?;
                let record: GoldenRecord = Self::deserialize(value.value())?;
                stats.golden_count += 1;
                if !record.is_active() {
                    stats.merged_golden_count += 1;
                }
            }
        }

        {
            let outcome_index = read_txn.open_multimap_table(LINKS_BY_OUTCOME)?;
            let mut by_outcome = HashMap::new();
            for outcome in MatchOutcome::all() {
                let count = outcome_index.get(outcome.as_str())?.count() as u64;
                stats.link_count += count;
                by_outcome.insert(outcome, count);
            }
            stats.link_counts_by_outcome = by_outcome;
        }

        stats.db_size_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, AuditEntry, AuditFilter, AuditLog};
    use crate::types::{LinkSource, ReasonCode, Resource, ResourceType, TransactionContext};
    use tempfile::TempDir;

    fn create_test_storage() -> (RedbStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = RedbStorage::open(temp_dir.path().join("links.redb")).unwrap();
        (storage, temp_dir)
    }

    fn patient() -> Resource {
        Resource::new(ResourceType::new("patient").unwrap()).with_attribute("family_name", "Smith")
    }

    fn seeded_golden(storage: &RedbStorage) -> GoldenRecord {
        let golden = GoldenRecord::from_target(&patient());
        storage.put_golden(&golden).unwrap();
        golden
    }

    #[test]
    fn test_golden_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("links.redb");

        let golden = {
            let storage = RedbStorage::open(&path).unwrap();
            seeded_golden(&storage)
        };

        let storage = RedbStorage::open(&path).unwrap();
        let loaded = storage.get_golden(golden.id).unwrap().unwrap();
        assert_eq!(loaded, golden);
    }

    #[test]
    fn test_link_lookup_both_sides() {
        let (storage, _temp) = create_test_storage();
        let g1 = seeded_golden(&storage);
        let g2 = seeded_golden(&storage);
        let target = patient();

        let mut batch = LinkBatch::new();
        batch
            .put_link(Link::new(g1.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.95)))
            .put_link(Link::new(g2.id, target.reference.clone(), MatchOutcome::PossibleMatch, LinkSource::Auto, Some(0.5)));
        storage.apply(&batch).unwrap();

        assert_eq!(storage.links_for_golden(g1.id).unwrap().len(), 1);
        assert_eq!(storage.links_for_golden(g2.id).unwrap().len(), 1);
        assert_eq!(storage.links_for_target(target.id()).unwrap().len(), 2);

        let possible = storage
            .list_links(LinkFilter::new().with_outcomes(vec![MatchOutcome::PossibleMatch]))
            .unwrap();
        assert_eq!(possible.len(), 1);
        assert_eq!(possible[0].golden, g2.id);
    }

    #[test]
    fn test_outcome_index_follows_updates() {
        let (storage, _temp) = create_test_storage();
        let golden = seeded_golden(&storage);
        let target = patient();

        let mut link = Link::new(golden.id, target.reference.clone(), MatchOutcome::PossibleMatch, LinkSource::Auto, Some(0.5));
        let mut batch = LinkBatch::new();
        batch.put_link(link.clone());
        storage.apply(&batch).unwrap();

        link.set_decision(MatchOutcome::Match, LinkSource::Manual, None);
        let mut batch = LinkBatch::new();
        batch.put_link(link);
        storage.apply(&batch).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.link_count, 1);
        assert_eq!(stats.link_counts_by_outcome[&MatchOutcome::Match], 1);
        assert_eq!(stats.link_counts_by_outcome[&MatchOutcome::PossibleMatch], 0);
    }

    #[test]
    fn test_batch_rejects_second_match_and_rolls_back() {
        let (storage, _temp) = create_test_storage();
        let g1 = seeded_golden(&storage);
        let g2 = seeded_golden(&storage);
        let target = patient();

        let mut batch = LinkBatch::new();
        batch.put_link(Link::new(g1.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.95)));
        storage.apply(&batch).unwrap();

        let mut batch = LinkBatch::new();
        batch.put_link(Link::new(g2.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.99)));
        let err = storage.apply(&batch).unwrap_err();
        assert!(matches!(err, MdmError::Conflict(_)));

        // Nothing from the failed batch is visible
        assert!(storage.get_link(LinkKey::new(g2.id, target.id())).unwrap().is_none());
    }

    #[test]
    fn test_audit_rows_commit_with_their_batch() {
        let (storage, _temp) = create_test_storage();
        let audit = AuditLog::new(storage.database()).unwrap();
        let g1 = seeded_golden(&storage);
        let g2 = seeded_golden(&storage);
        let target = patient();
        let ctx = TransactionContext::new("t1", ReasonCode::Batch);

        let first = Link::new(g1.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.95));
        let mut batch = LinkBatch::new();
        batch
            .put_link(first.clone())
            .audit(AuditEntry::for_link(AuditAction::LinkCreated, &first, &ctx));
        storage.apply(&batch).unwrap();

        // Rejected for a second MATCH: its audit row goes with it
        let second = Link::new(g2.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.99));
        let mut batch = LinkBatch::new();
        batch
            .put_link(second.clone())
            .audit(AuditEntry::for_link(AuditAction::LinkCreated, &second, &ctx));
        assert!(storage.apply(&batch).is_err());

        let entries = audit.query(AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].golden_id, g1.id);
        assert_eq!(entries[0].target_id, Some(target.id()));
    }

    #[test]
    fn test_retract_and_install_in_one_batch() {
        let (storage, _temp) = create_test_storage();
        let g1 = seeded_golden(&storage);
        let g2 = seeded_golden(&storage);
        let target = patient();

        let mut old = Link::new(g1.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.95));
        let mut batch = LinkBatch::new();
        batch.put_link(old.clone());
        storage.apply(&batch).unwrap();

        old.set_decision(MatchOutcome::NoMatch, LinkSource::Auto, Some(0.95));
        let mut batch = LinkBatch::new();
        batch
            .put_link(old)
            .put_link(Link::new(g2.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(0.99)));
        storage.apply(&batch).unwrap();

        let matches: Vec<_> = storage
            .links_for_target(target.id())
            .unwrap()
            .into_iter()
            .filter(|l| l.is_match())
            .collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].golden, g2.id);
    }

    #[test]
    fn test_link_requires_active_golden() {
        let (storage, _temp) = create_test_storage();
        let target = patient();

        let orphan = Link::new(uuid::Uuid::now_v7(), target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, None);
        let mut batch = LinkBatch::new();
        batch.put_link(orphan);
        assert!(matches!(storage.apply(&batch).unwrap_err(), MdmError::GoldenNotFound(_)));

        let survivor = seeded_golden(&storage);
        let mut merged = seeded_golden(&storage);
        merged.merged_into = Some(survivor.id);
        storage.put_golden(&merged).unwrap();

        let mut batch = LinkBatch::new();
        batch.put_link(Link::new(merged.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, None));
        assert!(matches!(storage.apply(&batch).unwrap_err(), MdmError::Conflict(_)));
    }

    #[test]
    fn test_delete_link_cleans_indexes() {
        let (storage, _temp) = create_test_storage();
        let golden = seeded_golden(&storage);
        let target = patient();

        let link = Link::new(golden.id, target.reference.clone(), MatchOutcome::Match, LinkSource::Auto, Some(1.0));
        let mut batch = LinkBatch::new();
        batch.put_link(link.clone());
        storage.apply(&batch).unwrap();

        let mut batch = LinkBatch::new();
        batch.delete_link(link.key());
        storage.apply(&batch).unwrap();

        assert!(storage.get_link(link.key()).unwrap().is_none());
        assert!(storage.links_for_target(target.id()).unwrap().is_empty());
        assert_eq!(storage.stats().unwrap().link_count, 0);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let (storage, _temp) = create_test_storage();
        storage.put_metadata("cursor", b"42").unwrap();
        assert_eq!(storage.get_metadata("cursor").unwrap(), Some(b"42".to_vec()));
        assert_eq!(storage.get_metadata("missing").unwrap(), None);
    }
}
