//! Provenance linking: locating the execution run that generated an output
//! artifact among a corpus of free-text logs, and maintaining the run,
//! execution, and artifact indices.
//!
//! Logs carry structured marker lines (`[RULELOG:] key=value`) grouped into
//! header blocks, optionally paired with a captured response block. Linking
//! prefers content matching (the response contains the generated document)
//! and falls back to tolerant path matching.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

use rule_ledger_core::{ExecutionId, RuleRecord};

/// Structured marker prefix on key/value log lines.
pub const MARKER_PREFIX: &str = "[RULELOG:]";

/// Header blocks from builds before this one use an older log format and
/// are discarded.
pub const MIN_BUILD: u64 = 2_510_020_935;

const PREFILTER_BYTES: u64 = 8 * 1024;
const LOG_EXTENSIONS: [&str; 4] = ["log", "txt", "out", "md"];

#[derive(Debug, thiserror::Error)]
pub enum ProvenanceError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn builtin(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid builtin pattern `{pattern}`: {err}"),
    }
}

/// One generation run reconstructed from a log header block and its paired
/// response block. Missing header keys stay empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRecord {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub build: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub source_path: String,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub input_files: Vec<String>,
    #[serde(default)]
    pub output_file: String,
    #[serde(default)]
    pub log_file: String,
    #[serde(default)]
    pub root_dir: String,
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

impl RunRecord {
    /// Identity used to carry attached rule ids forward when the run list
    /// is rebuilt from logs.
    #[must_use]
    pub fn identity(&self) -> (String, String) {
        (self.timestamp.clone(), self.log_file.clone())
    }
}

/// Source-tree inventory derived from run headers.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceRecord {
    pub root_dir: String,
    pub source_paths: Vec<String>,
}

/// One execution, unique per absolute log path. Re-processing the same log
/// merges into the existing record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub log_path: String,
    #[serde(default)]
    pub input_artifacts: Vec<String>,
    #[serde(default)]
    pub output_artifact: String,
    #[serde(default)]
    pub rule_ids: Vec<String>,
}

/// Per-artifact sighting record, keyed by the artifact path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(default)]
    pub seen_in_executions: Vec<ExecutionId>,
}

// ---------------------------------------------------------------------------
// Log discovery

/// Gather candidate log files under the given roots: text-like extensions
/// only, pre-filtered by a cheap scan of the first 8 KiB for the marker
/// prefix and the word `HEADER`. Results are sorted and deduplicated.
#[must_use]
pub fn discover_log_files(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: BTreeSet<PathBuf> = BTreeSet::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let matches_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| LOG_EXTENSIONS.contains(&ext));
            if matches_ext && prefilter_marker(path) {
                found.insert(path.to_path_buf());
            }
        }
    }
    found.into_iter().collect()
}

/// All log-like files under the given roots, without the marker pre-filter.
/// Execution/artifact linking scans these; run headers are not required.
#[must_use]
pub fn list_all_logs(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found: BTreeSet<PathBuf> = BTreeSet::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let matches_ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "log" | "txt" | "out"));
            if matches_ext {
                found.insert(path.to_path_buf());
            }
        }
    }
    found.into_iter().collect()
}

fn prefilter_marker(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };
    let mut head = Vec::new();
    if file.take(PREFILTER_BYTES).read_to_end(&mut head).is_err() {
        return false;
    }
    let text = String::from_utf8_lossy(&head);
    text.contains(MARKER_PREFIX) && text.contains("HEADER")
}

fn read_lossy(path: &Path) -> Result<String, ProvenanceError> {
    let raw = std::fs::read(path)
        .map_err(|source| ProvenanceError::Io { path: path.to_path_buf(), source })?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

// ---------------------------------------------------------------------------
// Marker grammar

/// Coerce a header value: JSON first (arrays, numbers, strings), then
/// quote-stripping, else the raw text.
fn coerce_value(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return value;
    }
    let quoted = (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2);
    if quoted {
        return serde_json::Value::String(trimmed[1..trimmed.len() - 1].to_string());
    }
    serde_json::Value::String(trimmed.to_string())
}

fn text_value(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn list_value(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::Array(items)) => {
            items.iter().map(|item| text_value(Some(item))).collect()
        }
        _ => Vec::new(),
    }
}

fn parse_header_block(lines: &[&str]) -> HashMap<String, serde_json::Value> {
    let kv = builtin(r"^\[RULELOG:\]\s+([A-Za-z0-9_]+)=(.*)$");
    let mut header = HashMap::new();
    for line in lines {
        if let Some(captures) = kv.captures(line.trim_end()) {
            let key = captures.get(1).map_or("", |m| m.as_str()).to_string();
            let value = captures.get(2).map_or("", |m| m.as_str());
            header.insert(key, coerce_value(value));
        }
    }
    header
}

fn run_from_header(
    header: &HashMap<String, serde_json::Value>,
    response_text: String,
    log_file: &str,
) -> Option<RunRecord> {
    let build = text_value(header.get("build"));
    let build_number: Option<u64> = build.trim().parse().ok();
    match build_number {
        Some(number) if number >= MIN_BUILD => {}
        _ => return None,
    }

    let prompt = {
        let direct = text_value(header.get("prompt"));
        if direct.is_empty() { text_value(header.get("prompt_template")) } else { direct }
    };

    Some(RunRecord {
        timestamp: text_value(header.get("timestamp")),
        build,
        mode: text_value(header.get("mode")),
        provider: text_value(header.get("provider")),
        model: text_value(header.get("model")),
        prompt,
        source_path: text_value(header.get("source_path")),
        output_path: text_value(header.get("output_path")),
        input_files: list_value(header.get("input_files")),
        output_file: text_value(header.get("output_file")),
        log_file: log_file.to_string(),
        root_dir: text_value(header.get("root_dir")),
        response_text,
        rule_ids: Vec::new(),
    })
}

/// Extract every run from one log's text. Block boundaries are recognized
/// by phrase containment, tolerating decorative punctuation around the
/// phrase. `HEADER` phrases are case-sensitive; `RESPONSE` phrases are not.
#[must_use]
pub fn parse_runs(text: &str, log_file: &str) -> Vec<RunRecord> {
    let header_begin = builtin(r"HEADER\s+BEGIN");
    let header_end = builtin(r"HEADER\s+END");
    let response_begin = builtin(r"(?i)RESPONSE\s+BEGIN");
    let response_end = builtin(r"(?i)RESPONSE\s+END");

    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();
    let mut runs = Vec::new();
    let mut i = 0;
    while i < total {
        if header_begin.is_match(lines[i]) {
            i += 1;
            let mut block = Vec::new();
            while i < total && !header_end.is_match(lines[i]) {
                block.push(lines[i]);
                i += 1;
            }
            let header = parse_header_block(&block);

            // A following response block belongs to this header; another
            // header before any response means this run captured none.
            let mut response_text = String::new();
            let mut j = i;
            while j < total && !response_begin.is_match(lines[j]) {
                if header_begin.is_match(lines[j]) {
                    break;
                }
                j += 1;
            }
            if j < total && response_begin.is_match(lines[j]) {
                j += 1;
                let mut captured = Vec::new();
                while j < total && !response_end.is_match(lines[j]) {
                    captured.push(lines[j]);
                    j += 1;
                }
                response_text = captured.join("\n");
                i = j;
            }

            if let Some(run) = run_from_header(&header, response_text, log_file) {
                runs.push(run);
            }
        }
        i += 1;
    }
    runs
}

/// Rebuild the source inventory and run list from a set of log files.
/// Unreadable files are skipped.
#[must_use]
pub fn build_sources_and_runs(log_files: &[PathBuf]) -> (Vec<SourceRecord>, Vec<RunRecord>) {
    let mut sources: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut runs = Vec::new();
    for path in log_files {
        let Ok(text) = read_lossy(path) else {
            tracing::debug!(path = %path.display(), "skipping unreadable log");
            continue;
        };
        for run in parse_runs(&text, &path.to_string_lossy()) {
            if !run.root_dir.is_empty() && !run.source_path.is_empty() {
                sources
                    .entry(run.root_dir.clone())
                    .or_default()
                    .insert(run.source_path.clone());
            }
            runs.push(run);
        }
    }
    let sources = sources
        .into_iter()
        .map(|(root_dir, paths)| SourceRecord {
            root_dir,
            source_paths: paths.into_iter().collect(),
        })
        .collect();
    (sources, runs)
}

// ---------------------------------------------------------------------------
// Run matching and rule-id attachment

/// Normalize text for tolerant containment comparisons: unify line endings,
/// strip trailing whitespace per line, collapse 3+ blank lines to 2, trim.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut joined =
        unified.split('\n').map(str::trim_end).collect::<Vec<_>>().join("\n");
    while joined.contains("\n\n\n") {
        joined = joined.replace("\n\n\n", "\n\n");
    }
    joined.trim().to_string()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn lexical_absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };
    lexical_normalize(&joined)
}

/// Whether a run's recorded output file plausibly refers to `target`:
/// equality against a small set of candidate absolute paths built from the
/// run's root/output hints, or a tolerant path-boundary suffix match.
#[must_use]
pub fn matches_output_file(run: &RunRecord, target: &Path) -> bool {
    let output_file = run.output_file.trim();
    if output_file.is_empty() {
        return false;
    }
    let abs_target = lexical_absolute(target);
    let of_norm = lexical_normalize(Path::new(output_file));

    let mut candidates: BTreeSet<PathBuf> = BTreeSet::new();
    candidates.insert(of_norm.clone());
    candidates.insert(lexical_absolute(&of_norm));
    if !run.root_dir.is_empty() && !run.output_path.is_empty() {
        candidates.insert(lexical_absolute(
            &Path::new(&run.root_dir).join(&run.output_path).join(&of_norm),
        ));
    }
    if !run.root_dir.is_empty() {
        candidates.insert(lexical_absolute(&Path::new(&run.root_dir).join(&of_norm)));
    }
    if !run.output_path.is_empty() {
        candidates.insert(lexical_absolute(&Path::new(&run.output_path).join(&of_norm)));
    }

    if candidates.contains(&abs_target) {
        return true;
    }

    let separator = std::path::MAIN_SEPARATOR;
    let target_text = abs_target.to_string_lossy().into_owned();
    let target_base = abs_target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    candidates.iter().any(|candidate| {
        let candidate_text = candidate.to_string_lossy();
        target_text.ends_with(&format!("{separator}{candidate_text}"))
            || (!target_base.is_empty()
                && candidate_text.ends_with(&format!("{separator}{target_base}")))
    })
}

fn parse_run_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(parsed);
    }
    // Header timestamps often omit the offset.
    let bare = trimmed.trim_end_matches(['Z', 'z']);
    PrimitiveDateTime::parse(bare, &Iso8601::DEFAULT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Pick the run the artifact came from: content matches first, then path
/// matches; among multiple matches the most recent parseable timestamp
/// wins, and with no timestamps on either side the later-scanned run wins.
#[must_use]
pub fn select_matching_run(
    runs: &[RunRecord],
    document_text: Option<&str>,
    target: &Path,
) -> Option<usize> {
    let doc_norm = document_text.map(normalize_text).unwrap_or_default();

    let mut matched: Vec<usize> = Vec::new();
    if !doc_norm.is_empty() {
        for (index, run) in runs.iter().enumerate() {
            let response = normalize_text(&run.response_text);
            if !response.is_empty() && response.contains(&doc_norm) {
                matched.push(index);
            }
        }
    }
    if matched.is_empty() {
        for (index, run) in runs.iter().enumerate() {
            if matches_output_file(run, target) {
                matched.push(index);
            }
        }
    }

    let mut remaining = matched.into_iter();
    let mut best = remaining.next()?;
    let mut best_ts = parse_run_timestamp(&runs[best].timestamp);
    for index in remaining {
        let ts = parse_run_timestamp(&runs[index].timestamp);
        match (ts, best_ts) {
            (Some(candidate), None) => {
                best = index;
                best_ts = Some(candidate);
            }
            (Some(candidate), Some(current)) if candidate > current => {
                best = index;
                best_ts = Some(candidate);
            }
            (None, None) => {
                best = index;
            }
            _ => {}
        }
    }
    Some(best)
}

/// Copy previously attached rule ids onto a freshly rebuilt run list, by
/// (timestamp, log file) identity. Runs that already carry ids keep them.
pub fn carry_forward_rule_ids(runs: &mut [RunRecord], existing: &[RunRecord]) {
    let previous: HashMap<(String, String), &Vec<String>> =
        existing.iter().map(|run| (run.identity(), &run.rule_ids)).collect();
    for run in runs.iter_mut() {
        if run.rule_ids.is_empty() {
            if let Some(ids) = previous.get(&run.identity()) {
                run.rule_ids.clone_from(ids);
            }
        }
    }
}

/// Append ids not already present, preserving insertion order.
pub fn append_rule_ids(run: &mut RunRecord, rule_ids: &[String]) {
    for id in rule_ids {
        if !run.rule_ids.iter().any(|existing| existing == id) {
            run.rule_ids.push(id.clone());
        }
    }
}

/// Result of rebuilding sources/runs from logs for one ingest batch.
#[derive(Debug)]
pub struct RunsRebuild {
    pub sources: Vec<SourceRecord>,
    pub runs: Vec<RunRecord>,
    /// Index of the run the batch's rule ids were attached to, if any.
    pub attached_run: Option<usize>,
}

/// Rebuild sources and runs from the given logs, carry forward previously
/// attached rule ids, and attach this batch's ids to the run that produced
/// `output_document`. A missing match is non-fatal.
#[must_use]
pub fn rebuild_sources_and_runs(
    log_files: &[PathBuf],
    existing_runs: &[RunRecord],
    rule_ids: &[String],
    output_document: Option<&Path>,
) -> RunsRebuild {
    let (sources, mut runs) = build_sources_and_runs(log_files);
    carry_forward_rule_ids(&mut runs, existing_runs);

    let mut attached_run = None;
    if !rule_ids.is_empty() {
        if let Some(document) = output_document {
            let document_text = read_lossy(document).ok();
            attached_run = select_matching_run(&runs, document_text.as_deref(), document);
            match attached_run {
                Some(index) => append_rule_ids(&mut runs[index], rule_ids),
                None => tracing::debug!(
                    scanned_logs = log_files.len(),
                    document = %document.display(),
                    "no producing run found for document"
                ),
            }
        }
    }

    RunsRebuild { sources, runs, attached_run }
}

// ---------------------------------------------------------------------------
// Execution and artifact indices

fn normalize_code_block(text: &str) -> String {
    text.trim()
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Collect the artifact paths a log mentions (`File:` lines) and a map of
/// normalized fenced code blocks to the artifact they belong to.
#[must_use]
pub fn parse_artifact_mentions(text: &str) -> (Vec<String>, HashMap<String, String>) {
    let file_header = builtin(r"^\s*File:\s*(.+)$");
    let fence = builtin(r"^\s*```");

    let mut artifacts: Vec<String> = Vec::new();
    let mut code_to_artifact: HashMap<String, String> = HashMap::new();
    let mut current_artifact: Option<String> = None;
    let mut in_fence = false;
    let mut buffer: Vec<&str> = Vec::new();

    for line in text.lines() {
        if !in_fence {
            if let Some(captures) = file_header.captures(line) {
                let path = captures.get(1).map_or("", |m| m.as_str()).trim().to_string();
                if !artifacts.contains(&path) {
                    artifacts.push(path.clone());
                }
                current_artifact = Some(path);
                continue;
            }
        }
        if fence.is_match(line) {
            in_fence = !in_fence;
            if !in_fence && !buffer.is_empty() {
                if let Some(artifact) = &current_artifact {
                    let code = normalize_code_block(&buffer.join("\n"));
                    if !code.is_empty() {
                        code_to_artifact.entry(code).or_insert_with(|| artifact.clone());
                    }
                }
                buffer.clear();
            }
            continue;
        }
        if in_fence {
            buffer.push(line);
        }
    }

    (artifacts, code_to_artifact)
}

/// Find or create the execution record for a log path. Re-processing the
/// same log merges artifact and rule-id lists by set union instead of
/// creating a duplicate.
pub fn ensure_execution(
    executions: &mut Vec<ExecutionRecord>,
    log_path: &Path,
    output_artifact: &Path,
    input_artifacts: &[String],
    rule_ids: &[String],
    now: OffsetDateTime,
) -> ExecutionId {
    let log_abs = lexical_absolute(log_path).to_string_lossy().into_owned();
    let output = output_artifact.to_string_lossy().into_owned();

    for execution in executions.iter_mut() {
        let existing_abs =
            lexical_absolute(Path::new(&execution.log_path)).to_string_lossy().into_owned();
        if existing_abs == log_abs {
            if !output.is_empty() {
                execution.output_artifact.clone_from(&output);
            }
            let mut merged_artifacts: BTreeSet<String> =
                execution.input_artifacts.iter().cloned().collect();
            merged_artifacts.extend(input_artifacts.iter().cloned());
            execution.input_artifacts = merged_artifacts.into_iter().collect();

            let mut merged_ids: BTreeSet<String> = execution.rule_ids.iter().cloned().collect();
            merged_ids.extend(rule_ids.iter().cloned());
            execution.rule_ids = merged_ids.into_iter().collect();
            return execution.id;
        }
    }

    let id = ExecutionId::new();
    executions.push(ExecutionRecord {
        id,
        created_at: now,
        log_path: log_abs,
        input_artifacts: input_artifacts.to_vec(),
        output_artifact: output,
        rule_ids: rule_ids.to_vec(),
    });
    id
}

/// Record sightings of the given artifacts under one execution.
pub fn merge_artifacts(
    index: &mut BTreeMap<String, ArtifactRecord>,
    artifacts: &[String],
    execution_id: ExecutionId,
    now: OffsetDateTime,
) {
    for artifact in artifacts {
        match index.get_mut(artifact) {
            Some(entry) => {
                entry.last_seen = now;
                if !entry.seen_in_executions.contains(&execution_id) {
                    entry.seen_in_executions.push(execution_id);
                }
            }
            None => {
                index.insert(
                    artifact.clone(),
                    ArtifactRecord {
                        id: artifact.clone(),
                        first_seen: now,
                        last_seen: now,
                        seen_in_executions: vec![execution_id],
                    },
                );
            }
        }
    }
}

/// Find the log most likely to have produced `artifact`: the last log that
/// mentions its path or base name, else the newest log modified within two
/// hours of the artifact.
#[must_use]
pub fn find_log_for_artifact(log_files: &[PathBuf], artifact: &Path) -> Option<PathBuf> {
    let abs = lexical_absolute(artifact);
    let abs_lower = abs.to_string_lossy().to_lowercase();
    let base_lower = abs
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mentioned: Vec<&PathBuf> = log_files
        .iter()
        .filter(|path| {
            read_lossy(path).is_ok_and(|text| {
                let lowered = text.to_lowercase();
                lowered.contains(&abs_lower)
                    || (!base_lower.is_empty() && lowered.contains(&base_lower))
            })
        })
        .collect();
    if let Some(found) = mentioned.last() {
        return Some((*found).clone());
    }

    fallback_log_by_time(log_files, artifact)
}

fn modified_at(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn fallback_log_by_time(log_files: &[PathBuf], artifact: &Path) -> Option<PathBuf> {
    let target = modified_at(artifact)?;
    let window = std::time::Duration::from_secs(2 * 3600);
    log_files
        .iter()
        .filter_map(|path| {
            let stamp = modified_at(path)?;
            let delta = match stamp.duration_since(target) {
                Ok(delta) => delta,
                Err(err) => err.duration(),
            };
            (delta <= window).then(|| (stamp, path.clone()))
        })
        .max_by_key(|(stamp, _)| *stamp)
        .map(|(_, path)| path)
}

/// Outcome of one successful linking pass.
#[derive(Debug)]
pub struct LinkSummary {
    pub execution_id: ExecutionId,
    pub log_path: PathBuf,
    pub rules_annotated: usize,
    pub artifacts_found: usize,
}

/// Link an output artifact to its producing execution: locate the log,
/// update the execution and artifact indices in place, and annotate each
/// rule with the execution id (and an artifact path when its code block is
/// traced to one). Returns `None` when no log matches.
///
/// # Errors
///
/// Returns an error when the matched log file cannot be read.
pub fn link_execution_and_artifacts(
    log_files: &[PathBuf],
    artifact_path: &Path,
    rules: &mut [RuleRecord],
    executions: &mut Vec<ExecutionRecord>,
    artifacts: &mut BTreeMap<String, ArtifactRecord>,
    now: OffsetDateTime,
) -> Result<Option<LinkSummary>, ProvenanceError> {
    let Some(log_path) = find_log_for_artifact(log_files, artifact_path) else {
        tracing::debug!(
            scanned_logs = log_files.len(),
            artifact = %artifact_path.display(),
            "no matching log for artifact"
        );
        return Ok(None);
    };

    let text = read_lossy(&log_path)?;
    let (mentioned, code_to_artifact) = parse_artifact_mentions(&text);

    let rule_ids: Vec<String> = rules.iter().map(|rule| rule.id.to_string()).collect();
    let execution_id =
        ensure_execution(executions, &log_path, artifact_path, &mentioned, &rule_ids, now);
    merge_artifacts(artifacts, &mentioned, execution_id, now);

    let mut annotated = 0;
    for rule in rules.iter_mut() {
        rule.execution_id = Some(execution_id);
        let code = normalize_code_block(&rule.code_block);
        if let Some(artifact) = code_to_artifact.get(&code) {
            rule.artifact_path = Some(artifact.clone());
            annotated += 1;
        }
    }

    Ok(Some(LinkSummary {
        execution_id,
        log_path,
        rules_annotated: annotated,
        artifacts_found: mentioned.len(),
    }))
}
