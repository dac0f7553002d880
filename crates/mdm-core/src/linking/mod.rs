//! Link management: the store that keeps the golden↔target graph
//! consistent, the per-entity lock table, and the service that drives
//! matching, manual overrides and merges through them.

mod config;
mod locks;
mod service;
mod store;

pub use config::{LinkServiceConfig, RetractionPolicy};
pub use locks::{EntityGuard, EntityLocks};
pub use service::{CancelFlag, LinkService, LinkUpdate, MergeOutcome, ProcessOutcome};
pub use store::{LinkStore, UpsertResult};
