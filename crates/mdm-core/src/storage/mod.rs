mod batch;
mod filters;
mod redb_storage;
mod traits;

pub use batch::{BatchOp, LinkBatch};
pub use filters::{LinkFilter, StorageStats};
pub use redb_storage::{RedbStorage, CURRENT_SCHEMA_VERSION};
pub use traits::Storage;
