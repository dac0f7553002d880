use crate::audit::AuditEntry;
use crate::types::{GoldenRecord, Link, LinkKey};

/// A single write inside a [`LinkBatch`]
#[derive(Debug, Clone)]
pub enum BatchOp {
    PutGolden(GoldenRecord),
    PutLink(Link),
    DeleteLink(LinkKey),
    /// Audit row committed with the writes it describes
    Audit(AuditEntry),
}

/// Ordered set of writes committed in one storage transaction.
///
/// Readers observe either none or all of a batch. The link store builds
/// retract-then-install and merge re-pointing out of batches so that no
/// snapshot ever shows a target with zero-then-two MATCH links mid-flight.
#[derive(Debug, Clone, Default)]
pub struct LinkBatch {
    ops: Vec<BatchOp>,
}

impl LinkBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_golden(&mut self, golden: GoldenRecord) -> &mut Self {
        self.ops.push(BatchOp::PutGolden(golden));
        self
    }

    pub fn put_link(&mut self, link: Link) -> &mut Self {
        self.ops.push(BatchOp::PutLink(link));
        self
    }

    pub fn delete_link(&mut self, key: LinkKey) -> &mut Self {
        self.ops.push(BatchOp::DeleteLink(key));
        self
    }

    pub fn audit(&mut self, entry: AuditEntry) -> &mut Self {
        self.ops.push(BatchOp::Audit(entry));
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}
