use anyhow::{Context, Result};
use mdm_core::{LinkServiceConfig, ReasonCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Contents of `mdm.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdmConfig {
    /// Directory holding the link database and the resource store
    pub data_dir: PathBuf,

    /// Default transaction reason recorded for batch ingest
    pub ingest_reason: String,

    pub linking: LinkServiceConfig,
}

impl Default for MdmConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            ingest_reason: "create_resource".to_string(),
            linking: LinkServiceConfig::default(),
        }
    }
}

impl MdmConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Defaults when the file is missing; a file that exists but does not parse is still an error
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir {
            self.data_dir = dir;
        }
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("links.redb")
    }

    pub fn resources_path(&self) -> PathBuf {
        self.data_dir.join("resources.redb")
    }

    /// Every problem found, empty when the config is usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            errors.push("data_dir must not be empty".to_string());
        }

        let matching = &self.linking.matching;
        if let Err(e) = matching.validate() {
            errors.push(format!("linking.matching: {}", e));
        }
        if let Err(e) = self.linking.candidates.validate() {
            errors.push(format!("linking.candidates: {}", e));
        }
        if self.linking.lock_timeout_ms == 0 {
            errors.push("linking.lock_timeout_ms must be > 0".to_string());
        }
        if self.linking.candidates.blocking_attributes.is_empty() {
            errors.push(
                "linking.candidates.blocking_attributes is empty; every target would found a new golden record"
                    .to_string(),
            );
        }
        if self.ingest_reason.parse::<ReasonCode>().is_err() {
            errors.push(format!("ingest_reason '{}' is not a known reason", self.ingest_reason));
        }

        errors
    }

    pub fn ingest_reason(&self) -> Result<ReasonCode> {
        self.ingest_reason
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Create the data directory if needed
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;
        }
        Ok(())
    }
}
