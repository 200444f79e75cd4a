//! JSON persistence for the model directory (`<model-home>/.model/`).
//!
//! All writes go through the same atomic publish path: serialize to a
//! `.tmp` sibling, then rename over the target, so a crash mid-write never
//! corrupts the previously committed file. Registry-style reads are
//! tolerant: a missing file is an empty collection and invalid JSON is
//! recovered as empty with a warning. The categories file is the one
//! strict input; a run that needs it aborts before any write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rule_ledger_core::{DocumentedRule, RuleRecord};
use rule_ledger_provenance::{ArtifactRecord, ExecutionRecord, RunRecord, SourceRecord};

pub const MODEL_DIR: &str = ".model";

pub const BUSINESS_RULES_FILE: &str = "business_rules.json";
pub const DOCUMENTED_RULES_FILE: &str = "documented_business_rules.json";
pub const CORRELATED_RULES_FILE: &str = "correlated_business_rules.json";
pub const RUNS_FILE: &str = "runs.json";
pub const SOURCES_FILE: &str = "sources.json";
pub const EXECUTIONS_FILE: &str = "executions.json";
pub const ARTIFACTS_FILE: &str = "artifacts.json";
pub const TEAMS_FILE: &str = "teams.json";
pub const COMPONENTS_FILE: &str = "components.json";
pub const RULE_CATEGORIES_FILE: &str = "rule_categories.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("required input file is missing: {path}")]
    MissingRequiredInput { path: PathBuf },
}

/// One selectable rule category, as listed in `rule_categories.json`.
/// A category with an empty team applies to every team.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleCategory {
    pub name: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub description: String,
}

/// The categories file: an object with a `ruleCategories` array. Unknown
/// sibling keys are dropped on rewrite, which is acceptable because this
/// tool only ever reads the file.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RuleCategories {
    #[serde(rename = "ruleCategories", default)]
    pub rule_categories: Vec<RuleCategory>,
}

impl RuleCategories {
    /// Categories applicable to a rule owned by `owner_team`: those with no
    /// team, or a case-insensitive team match.
    #[must_use]
    pub fn filtered_for_team(&self, owner_team: &str) -> Self {
        let owner = owner_team.trim().to_lowercase();
        let rule_categories = self
            .rule_categories
            .iter()
            .filter(|category| {
                let team = category.team.trim().to_lowercase();
                team.is_empty() || team == owner
            })
            .cloned()
            .collect();
        Self { rule_categories }
    }
}

/// Handle to the model directory. Construction does not touch the disk;
/// directories are created on first write.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    #[must_use]
    pub fn new(model_home: &Path) -> Self {
        Self { root: model_home.join(MODEL_DIR) }
    }

    #[must_use]
    pub fn file_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    fn load_tolerant<T: DeserializeOwned + Default>(&self, file_name: &str) -> T {
        let path = self.file_path(file_name);
        let raw = match std::fs::read(&path) {
            Ok(raw) if !raw.is_empty() => raw,
            _ => return T::default(),
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(path = %path.display(), "invalid JSON, starting fresh: {err}");
                T::default()
            }
        }
    }

    /// Atomic publish: write the serialized value to `<path>.tmp`, then
    /// rename over the target.
    ///
    /// # Errors
    ///
    /// Returns an error when serialization or any filesystem step fails.
    pub fn save<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.file_path(file_name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| StoreError::Io { path: parent.to_path_buf(), source })?;
        }
        let body = serde_json::to_vec_pretty(value)
            .map_err(|source| StoreError::Encode { path: path.clone(), source })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)
            .map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        std::fs::rename(&tmp, &path)
            .map_err(|source| StoreError::Io { path: path.clone(), source })
    }

    #[must_use]
    pub fn load_rules(&self, file_name: &str) -> Vec<RuleRecord> {
        self.load_tolerant(file_name)
    }

    #[must_use]
    pub fn load_documented_rules(&self) -> Vec<DocumentedRule> {
        self.load_tolerant(DOCUMENTED_RULES_FILE)
    }

    #[must_use]
    pub fn load_runs(&self) -> Vec<RunRecord> {
        self.load_tolerant(RUNS_FILE)
    }

    #[must_use]
    pub fn load_sources(&self) -> Vec<SourceRecord> {
        self.load_tolerant(SOURCES_FILE)
    }

    #[must_use]
    pub fn load_executions(&self) -> Vec<ExecutionRecord> {
        self.load_tolerant(EXECUTIONS_FILE)
    }

    #[must_use]
    pub fn load_artifacts(&self) -> BTreeMap<String, ArtifactRecord> {
        self.load_tolerant(ARTIFACTS_FILE)
    }

    /// Load the categories file, the one strict input.
    ///
    /// # Errors
    ///
    /// Returns `MissingRequiredInput` when the file does not exist, and an
    /// encode error when it exists but is not valid JSON.
    pub fn load_rule_categories(&self) -> Result<RuleCategories, StoreError> {
        let path = self.file_path(RULE_CATEGORIES_FILE);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingRequiredInput { path });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|source| StoreError::Encode { path, source })
    }

    /// Append a non-empty value to a JSON string-list file (teams,
    /// components) if not already present.
    ///
    /// # Errors
    ///
    /// Returns an error when the rewrite fails.
    pub fn append_unique(&self, file_name: &str, value: &str) -> Result<(), StoreError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let mut entries: Vec<String> = self.load_tolerant(file_name);
        if !entries.iter().any(|entry| entry == trimmed) {
            entries.push(trimmed.to_string());
            self.save(file_name, &entries)?;
        }
        Ok(())
    }
}
