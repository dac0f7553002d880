//! Match engine: deterministic scoring of a target against a golden record.
//!
//! Each [`MatchRule`] compares one attribute and contributes
//! `weight × similarity` to a weighted average in `[0.0, 1.0]`. The score is
//! then classified against the configured thresholds.

mod config;
mod engine;

pub use config::{Comparator, MatchConfig, MatchRule};
pub use engine::{MatchEngine, MatchResult};
