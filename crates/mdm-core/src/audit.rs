use crate::error::{MdmError, Result};
use crate::types::{GoldenId, Link, ReasonCode, ResourceId, TransactionContext};
use chrono::{DateTime, Utc};
use redb::{Database, Table, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) const AUDIT_TABLE: TableDefinition<u128, &[u8]> = TableDefinition::new("audit");

/// Disambiguates entries within the same nanosecond, across every writer in the process.
static AUDIT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Insert one entry into an open audit table. Key is timestamp_nanos ‖ sequence.
pub(crate) fn append_entry(table: &mut Table<'_, u128, &'static [u8]>, entry: &AuditEntry) -> Result<()> {
    let nanos = entry.timestamp.timestamp_nanos_opt().unwrap_or(0).max(0) as u128;
    let seq = AUDIT_SEQ.fetch_add(1, Ordering::Relaxed) as u128;
    let key = (nanos << 32) | (seq & 0xFFFF_FFFF);
    let value = serde_json::to_vec(entry)
        .map_err(|e| MdmError::Validation(format!("Audit serialise: {}", e)))?;
    table.insert(key, value.as_slice())?;
    Ok(())
}

/// A single record of a link-graph mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When this action occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub action: AuditAction,
    /// The golden record whose link set changed.
    pub golden_id: GoldenId,
    /// The target resource, when the action concerns a single link.
    pub target_id: Option<ResourceId>,
    /// Correlation id of the caller's transaction.
    pub transaction_id: String,
    pub reason: ReasonCode,
    /// Optional diff or description.
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, golden_id: GoldenId, ctx: &TransactionContext) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            golden_id,
            target_id: None,
            transaction_id: ctx.transaction_id.clone(),
            reason: ctx.reason,
            details: None,
        }
    }

    /// Entry describing the current state of a link
    pub fn for_link(action: AuditAction, link: &Link, ctx: &TransactionContext) -> Self {
        let mut entry = Self::new(action, link.golden, ctx);
        entry.target_id = Some(link.target.id);
        entry.details = Some(match link.score {
            Some(score) => format!("{} {} score={:.4}", link.outcome, link.source, score),
            None => format!("{} {}", link.outcome, link.source),
        });
        entry
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// The type of mutation that was recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditAction {
    GoldenCreated,
    GoldenMerged,
    LinkCreated,
    LinkUpdated,
    LinkRetracted,
    LinkRepointed,
    LinkDeleted,
    ReviewResolved,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::GoldenCreated => write!(f, "golden.created"),
            AuditAction::GoldenMerged => write!(f, "golden.merged"),
            AuditAction::LinkCreated => write!(f, "link.created"),
            AuditAction::LinkUpdated => write!(f, "link.updated"),
            AuditAction::LinkRetracted => write!(f, "link.retracted"),
            AuditAction::LinkRepointed => write!(f, "link.repointed"),
            AuditAction::LinkDeleted => write!(f, "link.deleted"),
            AuditAction::ReviewResolved => write!(f, "review.resolved"),
        }
    }
}

/// Query side of the audit trail.
///
/// Link mutations write their entries inside the storage batch that makes
/// the change (see [`LinkBatch::audit`](crate::storage::LinkBatch::audit)),
/// so an entry exists exactly when its mutation committed. `log` and
/// `log_all` are for entries that stand alone.
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let txn = db.begin_write()?;
        txn.open_table(AUDIT_TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Append an audit entry on its own
    pub fn log(&self, entry: AuditEntry) -> Result<()> {
        self.log_all(vec![entry])
    }

    /// Append several entries in one transaction
    pub fn log_all(&self, entries: Vec<AuditEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(AUDIT_TABLE)?;
            for entry in &entries {
                append_entry(&mut table, entry)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Query audit entries with optional filters.
    pub fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_TABLE)?;

        let since_key = filter
            .since
            .and_then(|t| t.timestamp_nanos_opt())
            .map(|n| (n.max(0) as u128) << 32)
            .unwrap_or(0);

        let mut entries = Vec::new();
        for result in table.range(since_key..)? {
            let (_, value) = result?;
            let entry = match serde_json::from_slice::<AuditEntry>(value.value()) {
                Ok(e) => e,
                Err(_) => continue, // skip corrupt entries
            };

            if let Some(golden) = filter.golden_id {
                if entry.golden_id != golden {
                    continue;
                }
            }
            if let Some(target) = filter.target_id {
                if entry.target_id != Some(target) {
                    continue;
                }
            }
            if let Some(ref txn) = filter.transaction_id {
                if entry.transaction_id != *txn {
                    continue;
                }
            }
            if let Some(action) = filter.action {
                if entry.action != action {
                    continue;
                }
            }

            entries.push(entry);
            if let Some(limit) = filter.limit {
                if entries.len() >= limit {
                    break;
                }
            }
        }

        Ok(entries)
    }
}

/// Filter criteria for querying the audit log.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    /// Only entries at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
    pub golden_id: Option<GoldenId>,
    pub target_id: Option<ResourceId>,
    pub transaction_id: Option<String>,
    pub action: Option<AuditAction>,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn make_audit_log() -> (AuditLog, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::create(dir.path().join("audit_test.redb")).unwrap());
        (AuditLog::new(db).unwrap(), dir)
    }

    fn ctx(id: &str) -> TransactionContext {
        TransactionContext::new(id, ReasonCode::Batch)
    }

    #[test]
    fn test_log_and_query_all() {
        let (log, _dir) = make_audit_log();
        log.log(AuditEntry::new(AuditAction::GoldenCreated, Uuid::now_v7(), &ctx("t1")))
            .unwrap();
        log.log(AuditEntry::new(AuditAction::LinkCreated, Uuid::now_v7(), &ctx("t1")))
            .unwrap();

        let entries = log.query(AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, AuditAction::GoldenCreated);
    }

    #[test]
    fn test_query_filter_by_transaction() {
        let (log, _dir) = make_audit_log();
        log.log_all(vec![
            AuditEntry::new(AuditAction::LinkCreated, Uuid::now_v7(), &ctx("t1")),
            AuditEntry::new(AuditAction::LinkUpdated, Uuid::now_v7(), &ctx("t2")),
            AuditEntry::new(AuditAction::LinkDeleted, Uuid::now_v7(), &ctx("t2")),
        ])
        .unwrap();

        let entries = log
            .query(AuditFilter {
                transaction_id: Some("t2".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.transaction_id == "t2"));
    }

    #[test]
    fn test_query_filter_by_golden_and_action() {
        let (log, _dir) = make_audit_log();
        let golden = Uuid::now_v7();
        log.log(AuditEntry::new(AuditAction::GoldenMerged, golden, &ctx("m")))
            .unwrap();
        log.log(AuditEntry::new(AuditAction::LinkCreated, golden, &ctx("m")))
            .unwrap();
        log.log(AuditEntry::new(AuditAction::GoldenMerged, Uuid::now_v7(), &ctx("m")))
            .unwrap();

        let entries = log
            .query(AuditFilter {
                golden_id: Some(golden),
                action: Some(AuditAction::GoldenMerged),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_query_since_and_limit() {
        let (log, _dir) = make_audit_log();
        for _ in 0..10 {
            log.log(AuditEntry::new(AuditAction::LinkUpdated, Uuid::now_v7(), &ctx("x")))
                .unwrap();
        }
        let entries = log
            .query(AuditFilter {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(entries.len(), 3);

        let future = Utc::now() + chrono::Duration::hours(1);
        let entries = log
            .query(AuditFilter {
                since: Some(future),
                ..Default::default()
            })
            .unwrap();
        assert!(entries.is_empty());
    }
}
