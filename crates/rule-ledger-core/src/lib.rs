use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RuleId(pub Ulid);

impl RuleId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ExecutionId(pub Ulid);

impl ExecutionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One DMN input or output column. The type is free text and may be empty
/// when the source document omits it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct DmnField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
}

/// One business rule, from either the code-derived or the document-derived
/// pipeline. Every field except `id` and `rule_name` is default-filled on
/// deserialization so registries written by older tool versions still load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleRecord {
    pub id: RuleId,
    pub rule_name: String,
    #[serde(default)]
    pub rule_purpose: String,
    #[serde(default)]
    pub rule_spec: String,
    #[serde(default)]
    pub code_block: String,
    #[serde(default)]
    pub code_file: String,
    #[serde(default)]
    pub code_lines: Option<(u32, u32)>,
    #[serde(default)]
    pub example: String,
    #[serde(default)]
    pub dmn_hit_policy: String,
    #[serde(default)]
    pub dmn_inputs: Vec<DmnField>,
    #[serde(default)]
    pub dmn_outputs: Vec<DmnField>,
    #[serde(default)]
    pub dmn_table: String,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub rule_category: Option<String>,
    #[serde(default)]
    pub business_area: Option<String>,
    #[serde(default)]
    pub doc_rule_id: Option<String>,
    #[serde(default)]
    pub match_score: f64,
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub artifact_path: Option<String>,
}

impl RuleRecord {
    /// Create a record with a fresh id and empty extraction fields.
    #[must_use]
    pub fn named(rule_name: &str) -> Self {
        Self {
            id: RuleId::new(),
            rule_name: rule_name.to_string(),
            rule_purpose: String::new(),
            rule_spec: String::new(),
            code_block: String::new(),
            code_file: String::new(),
            code_lines: None,
            example: String::new(),
            dmn_hit_policy: String::new(),
            dmn_inputs: Vec::new(),
            dmn_outputs: Vec::new(),
            dmn_table: String::new(),
            timestamp: None,
            owner: String::new(),
            component: String::new(),
            rule_category: None,
            business_area: None,
            doc_rule_id: None,
            match_score: 0.0,
            execution_id: None,
            artifact_path: None,
        }
    }

    /// Composite text used for semantic matching: name, then purpose and
    /// specification when present.
    #[must_use]
    pub fn composite_text(&self) -> String {
        let parts = [
            self.rule_name.trim(),
            self.rule_purpose.trim(),
            self.rule_spec.trim(),
        ];
        parts.iter().filter(|part| !part.is_empty()).copied().collect::<Vec<_>>().join(" \n")
    }
}

/// One rule from the structured documented-rules format (`Rule ID: BR-NNN`
/// blocks). These carry the business metadata the correlation engine copies
/// onto matched code rules.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentedRule {
    pub rule_id: String,
    pub rule_name: String,
    #[serde(default)]
    pub rule_category: String,
    #[serde(default)]
    pub business_area: String,
    #[serde(default)]
    pub owner: String,
}

impl DocumentedRule {
    #[must_use]
    pub fn composite_text(&self) -> String {
        self.rule_name.trim().to_string()
    }
}

/// Drop sub-second precision so dedupe keys and persisted timestamps agree
/// regardless of filesystem mtime resolution.
#[must_use]
pub fn normalize_timestamp(value: OffsetDateTime) -> OffsetDateTime {
    value.replace_nanosecond(0).unwrap_or(value)
}

/// Batch-local deduplication key: trimmed rule name plus the normalized
/// batch timestamp.
#[must_use]
pub fn dedupe_key(rule_name: &str, timestamp: Option<OffsetDateTime>) -> (String, Option<OffsetDateTime>) {
    (rule_name.trim().to_string(), timestamp.map(normalize_timestamp))
}

/// Per-batch merge observability counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct MergeCounts {
    pub considered: usize,
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// What one merge did: the counts, plus the names it actually inserted or
/// updated (in batch order). Skipped records are not listed; downstream
/// attachment (run provenance) only covers rules this batch produced.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub counts: MergeCounts,
    pub changed_names: Vec<String>,
}

/// The persistent rule registry: a map keyed by `rule_name` that preserves
/// first-insertion order, serialized as a JSON array.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleRegistry {
    records: Vec<RuleRecord>,
    by_name: HashMap<String, usize>,
}

impl RuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from a persisted record list. Later duplicates
    /// of the same name replace earlier ones in place, matching the
    /// dictionary semantics of the persisted form.
    #[must_use]
    pub fn from_records(records: Vec<RuleRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            registry.insert(record);
        }
        registry
    }

    fn insert(&mut self, record: RuleRecord) {
        match self.by_name.get(&record.rule_name) {
            Some(&index) => self.records[index] = record,
            None => {
                self.by_name.insert(record.rule_name.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    #[must_use]
    pub fn get(&self, rule_name: &str) -> Option<&RuleRecord> {
        self.by_name.get(rule_name).map(|&index| &self.records[index])
    }

    pub fn get_mut(&mut self, rule_name: &str) -> Option<&mut RuleRecord> {
        self.by_name.get(rule_name).map(|&index| &mut self.records[index])
    }

    #[must_use]
    pub fn records(&self) -> &[RuleRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut RuleRecord> {
        self.records.iter_mut()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<RuleRecord> {
        self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Merge one parsed batch into the registry.
    ///
    /// Policy, per record keyed by `rule_name`:
    /// 1. skip when the (name, normalized timestamp) dedupe key was already
    ///    seen, either in the persisted registry or earlier in this batch;
    /// 2. unseen names are inserted with the id the parser assigned
    ///    (counted "new");
    /// 3. for known names the existing record wins when its timestamp is
    ///    newer than or equal to `batch_timestamp`; otherwise the new
    ///    content replaces it with the existing id carried forward
    ///    (counted "updated");
    /// 4. `force` bypasses both the dedupe skip and the timestamp
    ///    comparison, for explicit re-ingestion.
    pub fn merge(
        &mut self,
        new_records: Vec<RuleRecord>,
        batch_timestamp: OffsetDateTime,
        force: bool,
    ) -> MergeOutcome {
        let batch_timestamp = normalize_timestamp(batch_timestamp);
        let mut seen: HashSet<(String, Option<OffsetDateTime>)> = self
            .records
            .iter()
            .map(|record| dedupe_key(&record.rule_name, record.timestamp))
            .collect();

        let mut outcome = MergeOutcome::default();
        for mut record in new_records {
            outcome.counts.considered += 1;
            let key = dedupe_key(&record.rule_name, Some(batch_timestamp));
            if seen.contains(&key) && !force {
                outcome.counts.skipped += 1;
                continue;
            }

            record.timestamp = Some(batch_timestamp);
            match self.get(&record.rule_name) {
                Some(existing) => {
                    let existing_wins = existing
                        .timestamp
                        .is_some_and(|stored| stored >= batch_timestamp);
                    if existing_wins && !force {
                        outcome.counts.skipped += 1;
                        continue;
                    }
                    record.id = existing.id;
                    outcome.counts.updated += 1;
                }
                None => {
                    outcome.counts.new += 1;
                }
            }

            seen.insert(key);
            outcome.changed_names.push(record.rule_name.clone());
            self.insert(record);
        }

        outcome
    }
}
