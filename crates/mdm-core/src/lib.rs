pub mod types;
pub mod error;
pub mod repository;
pub mod storage;
pub mod matching;
pub mod candidates;
pub mod linking;
pub mod queue;
pub mod audit;

pub use error::{ErrorKind, MdmError, Result};
pub use types::*;
pub use repository::{InMemoryRepository, ResourceRepository, SearchCriteria};
pub use storage::{LinkBatch, LinkFilter, RedbStorage, Storage, StorageStats, CURRENT_SCHEMA_VERSION};
pub use matching::{Comparator, MatchConfig, MatchEngine, MatchResult, MatchRule};
pub use candidates::{Candidate, CandidateConfig, CandidateSearch};
pub use linking::{
    CancelFlag, EntityGuard, EntityLocks, LinkService, LinkServiceConfig, LinkStore, LinkUpdate,
    MergeOutcome, ProcessOutcome, RetractionPolicy, UpsertResult,
};
pub use queue::{ConflictQueue, LinkUpdater, Resolution, ReviewDecision, ReviewItem};
pub use audit::{AuditAction, AuditEntry, AuditFilter, AuditLog};
