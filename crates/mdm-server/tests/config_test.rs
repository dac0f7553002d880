use mdm_core::{Comparator, RetractionPolicy};
use mdm_link_server::MdmConfig;
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempdir().unwrap();
    let config = MdmConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, MdmConfig::default());
    assert!(config.validate().is_empty());
}

#[test]
fn test_partial_file_fills_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mdm.toml");
    fs::write(
        &path,
        r#"
data_dir = "/var/lib/mdm"

[linking]
lock_timeout_ms = 250
retraction = "delete"

[linking.matching]
match_threshold = 0.85

[[linking.matching.rules]]
attribute = "ssn"
weight = 5.0
required = true
comparator = { type = "exact" }

[[linking.matching.rules]]
attribute = "family_name"
weight = 2.0
comparator = { type = "jaro_winkler", min_similarity = 0.9 }
"#,
    )
    .unwrap();

    let config = MdmConfig::load(&path).unwrap();
    assert_eq!(config.data_dir, PathBuf::from("/var/lib/mdm"));
    assert_eq!(config.db_path(), PathBuf::from("/var/lib/mdm/links.redb"));
    assert_eq!(config.linking.lock_timeout_ms, 250);
    assert_eq!(config.linking.retraction, RetractionPolicy::Delete);
    assert_eq!(config.linking.matching.match_threshold, 0.85);
    assert_eq!(config.linking.matching.no_match_threshold, 0.3);
    assert_eq!(config.linking.matching.rules.len(), 2);
    assert_eq!(
        config.linking.matching.rules[1].comparator,
        Comparator::JaroWinkler { min_similarity: 0.9 }
    );
    assert_eq!(config.linking.candidates.max_candidates, 50);
    assert!(config.validate().is_empty());
}

#[test]
fn test_validate_reports_every_problem() {
    let mut config = MdmConfig::default();
    config.linking.matching.no_match_threshold = 0.95;
    config.linking.lock_timeout_ms = 0;
    config.linking.candidates.max_candidates = 0;
    config.ingest_reason = "because".to_string();

    let errors = config.validate();
    assert_eq!(errors.len(), 4, "{:?}", errors);
    assert!(errors.iter().any(|e| e.contains("lock_timeout_ms")));
    assert!(errors.iter().any(|e| e.contains("ingest_reason")));
}

#[test]
fn test_unparseable_file_is_an_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mdm.toml");
    fs::write(&path, "data_dir = [").unwrap();
    assert!(MdmConfig::load(&path).is_err());
    assert!(MdmConfig::load_or_default(&path).is_err());
}

#[test]
fn test_round_trips_through_toml() {
    let config = MdmConfig::default();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let parsed: MdmConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed, config);
}

#[test]
fn test_data_dir_override() {
    let config = MdmConfig::default().with_data_dir(Some(PathBuf::from("/tmp/other")));
    assert_eq!(config.resources_path(), PathBuf::from("/tmp/other/resources.redb"));
    let unchanged = MdmConfig::default().with_data_dir(None);
    assert_eq!(unchanged.data_dir, PathBuf::from("./data"));
}
