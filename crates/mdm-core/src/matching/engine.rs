use crate::error::{MdmError, Result};
use crate::matching::config::{Comparator, MatchConfig, MatchRule};
use crate::types::{GoldenRecord, MatchOutcome, Resource};
use serde::{Deserialize, Serialize};

/// Outcome and score of one target/golden comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub outcome: MatchOutcome,
    pub score: f64,
}

/// Stateless scorer. Identical inputs always give identical results.
#[derive(Debug, Clone)]
pub struct MatchEngine {
    config: MatchConfig,
    total_weight: f64,
}

impl MatchEngine {
    pub fn new(config: MatchConfig) -> Result<Self> {
        config.validate()?;
        let total_weight = config.rules.iter().map(|r| r.weight).sum();
        Ok(Self {
            config,
            total_weight,
        })
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Reject targets the engine cannot score
    pub fn check_comparable(&self, target: &Resource) -> Result<()> {
        let missing: Vec<&str> = self
            .config
            .rules
            .iter()
            .filter(|r| r.required && target.attribute(&r.attribute).is_none())
            .map(|r| r.attribute.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(MdmError::InvalidInput(format!(
                "{} is missing required attributes: {}",
                target.reference,
                missing.join(", ")
            )))
        }
    }

    /// Score a target against a golden record's survivorship snapshot
    pub fn evaluate(&self, target: &Resource, golden: &GoldenRecord) -> Result<MatchResult> {
        self.evaluate_resources(target, &golden.as_resource())
    }

    /// Score two resources of the same type
    pub fn evaluate_resources(&self, target: &Resource, candidate: &Resource) -> Result<MatchResult> {
        if target.reference.resource_type != candidate.reference.resource_type {
            return Err(MdmError::InvalidInput(format!(
                "Cannot compare {} with {}",
                target.reference, candidate.reference
            )));
        }
        self.check_comparable(target)?;

        let weighted: f64 = self
            .config
            .rules
            .iter()
            .map(|rule| rule.weight * Self::similarity(rule, target, candidate))
            .sum();

        // Clamp away float noise so a perfect match is exactly 1.0
        let score = (weighted / self.total_weight).clamp(0.0, 1.0);

        Ok(MatchResult {
            outcome: self.classify(score),
            score,
        })
    }

    /// Map a score onto an outcome using the configured thresholds
    pub fn classify(&self, score: f64) -> MatchOutcome {
        if score >= self.config.match_threshold {
            MatchOutcome::Match
        } else if score < self.config.no_match_threshold {
            MatchOutcome::NoMatch
        } else {
            MatchOutcome::PossibleMatch
        }
    }

    fn similarity(rule: &MatchRule, target: &Resource, candidate: &Resource) -> f64 {
        let (Some(a), Some(b)) = (
            target.attribute(&rule.attribute),
            candidate.attribute(&rule.attribute),
        ) else {
            return 0.0;
        };

        match rule.comparator {
            Comparator::Exact => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            Comparator::CaseInsensitive => {
                if normalize(a) == normalize(b) {
                    1.0
                } else {
                    0.0
                }
            }
            Comparator::JaroWinkler { min_similarity } => {
                let sim = strsim::jaro_winkler(&normalize(a), &normalize(b));
                if sim >= min_similarity {
                    sim
                } else {
                    0.0
                }
            }
        }
    }
}

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
