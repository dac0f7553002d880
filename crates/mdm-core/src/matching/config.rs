use crate::error::{MdmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How two attribute values are compared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Comparator {
    /// Byte-for-byte equality after trimming
    Exact,
    /// Equality after lowercasing and collapsing whitespace
    CaseInsensitive,
    /// Jaro-Winkler similarity; values below `min_similarity` count as 0.
    JaroWinkler { min_similarity: f64 },
}

/// One attribute comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    pub attribute: String,
    pub comparator: Comparator,
    /// Relative weight in the overall score. Must be > 0.
    pub weight: f64,
    /// A target without this attribute cannot be scored at all.
    #[serde(default)]
    pub required: bool,
}

impl MatchRule {
    pub fn new(attribute: &str, comparator: Comparator, weight: f64) -> Self {
        Self {
            attribute: attribute.to_string(),
            comparator,
            weight,
            required: false,
        }
    }

    pub fn exact(attribute: &str, weight: f64) -> Self {
        Self::new(attribute, Comparator::Exact, weight)
    }

    pub fn case_insensitive(attribute: &str, weight: f64) -> Self {
        Self::new(attribute, Comparator::CaseInsensitive, weight)
    }

    pub fn jaro_winkler(attribute: &str, min_similarity: f64, weight: f64) -> Self {
        Self::new(attribute, Comparator::JaroWinkler { min_similarity }, weight)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Thresholds and rules for the match engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Score at or above this is a MATCH. Default: 0.9.
    pub match_threshold: f64,

    /// Score below this is a NO_MATCH. Default: 0.3.
    /// Anything in between is a POSSIBLE_MATCH.
    pub no_match_threshold: f64,

    pub rules: Vec<MatchRule>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.9,
            no_match_threshold: 0.3,
            rules: vec![
                MatchRule::jaro_winkler("family_name", 0.85, 3.0),
                MatchRule::jaro_winkler("given_name", 0.85, 2.0),
                MatchRule::exact("birth_date", 3.0),
                MatchRule::case_insensitive("gender", 1.0),
                MatchRule::case_insensitive("email", 1.0),
            ],
        }
    }
}

impl MatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(mut self, no_match_threshold: f64, match_threshold: f64) -> Self {
        self.no_match_threshold = no_match_threshold;
        self.match_threshold = match_threshold;
        self
    }

    pub fn with_rules(mut self, rules: Vec<MatchRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("no_match_threshold", self.no_match_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MdmError::Validation(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        if self.no_match_threshold > self.match_threshold {
            return Err(MdmError::Validation(
                "no_match_threshold must be <= match_threshold".into(),
            ));
        }

        if self.rules.is_empty() {
            return Err(MdmError::Validation(
                "at least one match rule is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.attribute.trim().is_empty() {
                return Err(MdmError::Validation("rule attribute must not be empty".into()));
            }
            if !seen.insert(rule.attribute.as_str()) {
                return Err(MdmError::Validation(format!(
                    "duplicate rule for attribute '{}'",
                    rule.attribute
                )));
            }
            if !(rule.weight > 0.0 && rule.weight.is_finite()) {
                return Err(MdmError::Validation(format!(
                    "weight for '{}' must be a positive number",
                    rule.attribute
                )));
            }
            if let Comparator::JaroWinkler { min_similarity } = rule.comparator {
                if !(0.0..=1.0).contains(&min_similarity) {
                    return Err(MdmError::Validation(format!(
                        "min_similarity for '{}' must be between 0.0 and 1.0",
                        rule.attribute
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        MatchConfig::default().validate().unwrap();
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        let config = MatchConfig::new().with_thresholds(0.95, 0.9);
        assert!(config.validate().is_err());

        let config = MatchConfig::new().with_thresholds(0.9, 0.9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_rules() {
        let dup = MatchConfig::new().with_rules(vec![
            MatchRule::exact("ssn", 1.0),
            MatchRule::exact("ssn", 2.0),
        ]);
        assert!(dup.validate().is_err());

        let zero = MatchConfig::new().with_rules(vec![MatchRule::exact("ssn", 0.0)]);
        assert!(zero.validate().is_err());

        let empty = MatchConfig::new().with_rules(vec![]);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml_shape() {
        let json = serde_json::json!({
            "match_threshold": 0.8,
            "no_match_threshold": 0.4,
            "rules": [
                {"attribute": "family_name", "weight": 2.0,
                 "comparator": {"type": "jaro_winkler", "min_similarity": 0.9}},
                {"attribute": "ssn", "weight": 5.0, "required": true,
                 "comparator": {"type": "exact"}}
            ]
        });
        let config: MatchConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.rules.len(), 2);
        assert!(config.rules[1].required);
        config.validate().unwrap();
    }
}
