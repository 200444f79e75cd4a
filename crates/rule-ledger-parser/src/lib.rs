//! Tolerant section-based parser for business-rule documents.
//!
//! Turns one document's raw text into an ordered sequence of candidate
//! [`RuleRecord`]s. Parsing never fails for the document as a whole: a
//! section that yields no usable rule name is logged and dropped, and
//! iteration continues with the next section.

use regex_lite::Regex;
use rule_ledger_core::{DmnField, DocumentedRule, RuleRecord};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SectionError {
    #[error("section has no recognizable rule name")]
    MissingRuleName,
}

/// Compile a built-in pattern. All patterns are static; a failure here is a
/// programmer error, not an input error.
fn builtin(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid builtin pattern `{pattern}`: {err}"),
    }
}

/// One heading-delimited slice of the normalized document.
#[derive(Debug, Clone)]
struct Section {
    heading: String,
    body: String,
}

/// A parsed document: the normalized text split into candidate rule
/// sections. `records()` is lazy and restartable; each call walks the
/// sections from the start.
#[derive(Debug, Clone)]
pub struct RuleDocument {
    sections: Vec<Section>,
}

impl RuleDocument {
    /// Normalize the heading variants for "Rule Name" markers into one
    /// canonical `## ` heading, drop `---` separators, and split the text
    /// into sections at heading boundaries.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let heading_variants = [
            builtin(r"^\s{0,3}#{2,6}\s*\d+\.\s*\*\*Rule Name:\*\*\s*"),
            builtin(r"^\s{0,3}#{2,6}\s*\*\*Rule Name:\*\*\s*"),
            builtin(r"^\s{0,3}#{2,6}\s*\d+\.\s*Rule Name:\s*"),
            builtin(r"^\s{0,3}#{2,6}\s*Rule Name:\s*"),
            builtin(r"^\s*\*\*Rule Name:\*\*\s*"),
            builtin(r"^\s*Rule Name:\s*"),
        ];
        let separator = builtin(r"^---+\s*$");
        let heading = builtin(r"^\s{0,3}#{1,6}\s+");

        let mut normalized = Vec::new();
        for line in text.lines() {
            if separator.is_match(line) {
                continue;
            }
            let mut rewritten = None;
            for variant in &heading_variants {
                if let Some(found) = variant.find(line) {
                    rewritten = Some(format!("## {}", &line[found.end()..]));
                    break;
                }
            }
            normalized.push(rewritten.unwrap_or_else(|| line.to_string()));
        }

        let mut sections = Vec::new();
        let mut current: Option<Section> = None;
        for line in normalized {
            if let Some(found) = heading.find(&line) {
                if let Some(section) = current.take() {
                    sections.push(section);
                }
                current = Some(Section {
                    heading: heading_text(&line[found.end()..]),
                    body: String::new(),
                });
                continue;
            }
            // Text before the first heading belongs to no section.
            if let Some(section) = current.as_mut() {
                section.body.push_str(&line);
                section.body.push('\n');
            }
        }
        if let Some(section) = current.take() {
            sections.push(section);
        }

        Self { sections }
    }

    #[must_use]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Lazily extract one candidate record per section, dropping sections
    /// that fail extraction.
    #[must_use]
    pub fn records(&self) -> Records<'_> {
        Records { sections: self.sections.iter() }
    }
}

pub struct Records<'a> {
    sections: std::slice::Iter<'a, Section>,
}

impl Iterator for Records<'_> {
    type Item = RuleRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let section = self.sections.next()?;
            match extract_record(section) {
                Ok(record) => return Some(record),
                Err(err) => {
                    tracing::warn!(
                        snippet = truncate(&section.body, 100),
                        heading = section.heading,
                        "dropping malformed section: {err}"
                    );
                }
            }
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= limit {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(limit).collect();
        format!("{cut}...")
    }
}

/// Clean heading text: strip trailing hashes, surrounding markers, and a
/// leading "Rule Name:" label.
fn heading_text(raw: &str) -> String {
    let trailing_hashes = builtin(r"\s*#{1,6}\s*$");
    let label = builtin(r"(?i)^Rule Name:\s*");

    let mut text = raw.trim().to_string();
    if let Some(found) = trailing_hashes.find(&text) {
        text.truncate(found.start());
    }
    let text = text.trim_matches([' ', '*', '-', '\t']).to_string();
    match label.find(&text) {
        Some(found) => text[found.end()..].trim().to_string(),
        None => text,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Purpose,
    Spec,
    CodeBlock,
    Example,
    Dmn,
}

/// Recognize a labeled-field marker at the start of a line. Returns the
/// label kind plus whatever inline content follows it on the same line.
fn classify_label(line: &str) -> Option<(Label, &str)> {
    let trimmed = line.trim_start();
    let lowered = trimmed.to_ascii_lowercase();
    let prefixes: [(&str, Label); 5] = [
        ("**rule purpose:**", Label::Purpose),
        ("**rule spec:**", Label::Spec),
        ("**specification:**", Label::Spec),
        ("**code block:**", Label::CodeBlock),
        ("**example:**", Label::Example),
    ];
    for (prefix, label) in prefixes {
        if lowered.starts_with(prefix) {
            return Some((label, trimmed[prefix.len()..].trim()));
        }
    }

    let dmn = builtin(r"(?i)^\*{0,2}\s*DMN\s*:\s*\**\s*(.*)$");
    if let Some(captures) = dmn.captures(trimmed) {
        let rest = captures.get(1).map_or("", |m| m.as_str());
        return Some((Label::Dmn, rest));
    }
    None
}

/// Extract the labeled-field spans of a section body. Each span runs from
/// its marker to the next known marker, a `File:` / `Line` reference line,
/// or the end of the section. Reference lines are extracted separately into
/// `code_file`/`code_lines` and must not leak into the prose fields.
fn labeled_spans(body: &str) -> Vec<(Label, String)> {
    let reference = builtin(r"(?i)^\s*(File\s*:|Lines?\s*:?\s*\d+)");
    let mut spans: Vec<(Label, Vec<&str>)> = Vec::new();
    let mut current: Option<usize> = None;

    for line in body.lines() {
        if let Some((label, inline)) = classify_label(line) {
            spans.push((label, if inline.is_empty() { Vec::new() } else { vec![inline] }));
            current = Some(spans.len() - 1);
            continue;
        }
        if reference.is_match(line) {
            current = None;
            continue;
        }
        if let Some(index) = current {
            spans[index].1.push(line);
        }
    }

    spans
        .into_iter()
        .map(|(label, lines)| (label, lines.join("\n").trim().to_string()))
        .collect()
}

/// First fenced code block in the section, independent of the declared
/// language tag.
fn first_fenced_block(body: &str) -> String {
    let fence = builtin(r"^\s*```");
    let mut collected: Vec<&str> = Vec::new();
    let mut in_fence = false;
    for line in body.lines() {
        if fence.is_match(line) {
            if in_fence {
                return collected.join("\n").trim().to_string();
            }
            in_fence = true;
            continue;
        }
        if in_fence {
            collected.push(line);
        }
    }
    String::new()
}

/// Optional inline source-file reference: the `**Code Block:** <path>`
/// inline form first, then a `File: <path>` line.
fn extract_code_file(body: &str, spans: &[(Label, String)]) -> String {
    for (label, content) in spans {
        if *label == Label::CodeBlock {
            if let Some(first_line) = content.lines().next() {
                let candidate = first_line.replace('`', "").trim().to_string();
                if !candidate.is_empty() && !candidate.starts_with("```") {
                    return candidate;
                }
            }
        }
    }

    let file_line = builtin(r"(?i)^\s*File:\s*`?([^`]+)`?\s*$");
    for line in body.lines() {
        if let Some(captures) = file_line.captures(line) {
            if let Some(path) = captures.get(1) {
                return path.as_str().trim().to_string();
            }
        }
    }
    String::new()
}

/// Optional line-range reference: `Line 12`, `Lines: 12-15`, tolerating
/// en and em dashes.
fn extract_code_lines(body: &str) -> Option<(u32, u32)> {
    let range = builtin(r"(?i)\bLines?\s*:?\s*(\d+)(?:\s*[-\u{2013}\u{2014}]\s*(\d+))?");
    let captures = range.captures(body)?;
    let start: u32 = captures.get(1)?.as_str().parse().ok()?;
    let end: u32 = match captures.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => start,
    };
    Some((start, end))
}

/// Parsed decision-table sub-block.
#[derive(Debug, Default, PartialEq, Eq)]
struct DmnBlock {
    hit_policy: String,
    inputs: Vec<DmnField>,
    outputs: Vec<DmnField>,
    table: String,
}

fn parse_dmn(raw: &str) -> DmnBlock {
    // Unwrap a fenced body, then drop markdown artifacts.
    let mut body = first_fenced_block(raw);
    if body.is_empty() {
        body = raw.to_string();
    }
    let body = body.replace('`', "").replace("**", "");

    let mut block = DmnBlock::default();

    let hit_policy = builtin(r"(?i)Hit\s*Policy\s*:\s*([A-Za-z_]+)");
    if let Some(captures) = hit_policy.captures(&body) {
        if let Some(token) = captures.get(1) {
            block.hit_policy = token.as_str().to_string();
        }
    }

    block.inputs = bulleted_fields(&body, "inputs");
    block.outputs = bulleted_fields(&body, "outputs");
    block.table = table_lines(&body);
    block
}

/// Bulleted `- name: type` list following a `<label>:` line. A bullet
/// without a colon yields a field with an empty type.
fn bulleted_fields(body: &str, label: &str) -> Vec<DmnField> {
    let marker = builtin(&format!(r"(?i)^\s*{label}\s*:\s*$"));
    let mut fields = Vec::new();
    let mut in_list = false;
    for line in body.lines() {
        if marker.is_match(line) {
            in_list = true;
            continue;
        }
        if !in_list {
            continue;
        }
        let trimmed = line.trim();
        let Some(bullet) = trimmed.strip_prefix(['-', '*']) else {
            break;
        };
        let entry = bullet.trim();
        match entry.split_once(':') {
            Some((name, field_type)) => fields.push(DmnField {
                name: name.trim().to_string(),
                field_type: field_type.trim().to_string(),
            }),
            None => fields.push(DmnField { name: entry.to_string(), field_type: String::new() }),
        }
    }
    fields
}

/// The decision table body: the first contiguous run of lines containing
/// table syntax (pipe, plus, or a run of dashes).
fn table_lines(body: &str) -> String {
    let mut collected: Vec<&str> = Vec::new();
    let mut in_table = false;
    for line in body.lines() {
        if line.contains('|') || line.contains('+') || line.contains("--") {
            collected.push(line.trim_end());
            in_table = true;
        } else if in_table {
            break;
        }
    }
    collected.join("\n").trim().to_string()
}

fn extract_record(section: &Section) -> Result<RuleRecord, SectionError> {
    let mut name = section.heading.clone();
    let generic = name.is_empty()
        || name.eq_ignore_ascii_case("rule name")
        || name.eq_ignore_ascii_case("rule-name");
    if generic {
        let fallback = builtin(r"\*\*Rule Name:\*\*\s*(.+)");
        name = fallback
            .captures(&section.body)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
    }
    if name.is_empty() {
        return Err(SectionError::MissingRuleName);
    }

    let spans = labeled_spans(&section.body);
    let mut record = RuleRecord::named(&name);

    for (label, content) in &spans {
        match label {
            Label::Purpose => record.rule_purpose = strip_markers(content),
            Label::Spec => record.rule_spec = strip_markers(content),
            Label::Example => record.example = strip_markers(content),
            Label::Dmn => {
                let dmn = parse_dmn(content);
                record.dmn_hit_policy = dmn.hit_policy;
                record.dmn_inputs = dmn.inputs;
                record.dmn_outputs = dmn.outputs;
                record.dmn_table = dmn.table;
            }
            Label::CodeBlock => {}
        }
    }

    record.code_block = first_fenced_block(&section.body);
    record.code_file = extract_code_file(&section.body, &spans);
    record.code_lines = extract_code_lines(&section.body);
    Ok(record)
}

/// Labeled spans keep their raw prose but a span that is only a fenced
/// block should not leak fence markers into the text fields.
fn strip_markers(content: &str) -> String {
    content.trim().to_string()
}

/// Extract documented rules from the structured `Rule ID: BR-NNN` block
/// format: a heading naming the rule followed by bulleted Category,
/// Business Area, and Owner fields.
#[must_use]
pub fn parse_documented_rules(text: &str) -> Vec<DocumentedRule> {
    let heading = builtin(r"(?i)Rule\s*ID\s*:\s*(BR-\d+)\s*[-\u{2013}\u{2014}]\s*(.+)$");
    let bullet = builtin(r"^\s*[-*]\s*\*\*(Category|Business Area|Rule Name|Owner)\*\*\s*:\s*(.*)$");

    let mut rules: Vec<DocumentedRule> = Vec::new();
    let mut current: Option<DocumentedRule> = None;

    for line in text.lines() {
        if let Some(captures) = heading.captures(line) {
            if let Some(rule) = current.take() {
                rules.push(rule);
            }
            let rule_id = captures.get(1).map_or("", |m| m.as_str()).trim().to_string();
            let rule_name = captures.get(2).map_or("", |m| m.as_str()).trim().to_string();
            current = Some(DocumentedRule {
                rule_id,
                rule_name,
                rule_category: String::new(),
                business_area: String::new(),
                owner: String::new(),
            });
            continue;
        }

        let Some(rule) = current.as_mut() else {
            continue;
        };
        if let Some(captures) = bullet.captures(line) {
            let field = captures.get(1).map_or("", |m| m.as_str());
            let value = captures.get(2).map_or("", |m| m.as_str()).trim().to_string();
            match field {
                "Category" => rule.rule_category = value,
                "Business Area" => rule.business_area = value,
                "Owner" => rule.owner = value,
                // The heading already carries the name; the repeated
                // bullet is informational.
                _ => {}
            }
        }
    }
    if let Some(rule) = current.take() {
        rules.push(rule);
    }
    rules
}
