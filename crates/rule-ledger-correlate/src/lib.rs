//! Semantic correlation between code-derived and document-derived rules.
//!
//! Document rules are embedded into fixed-length unit vectors and held in a
//! flat inner-product index. Each code rule is matched greedily against the
//! ranked candidates, consuming at most one document rule per code rule.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use rule_ledger_core::{DocumentedRule, RuleRecord};

pub const DEFAULT_THRESHOLD: f64 = 0.6;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CorrelateError {
    #[error("vector dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Text-to-vector seam. Implementations must be deterministic and return
/// unit-normalized vectors of a fixed dimension (the zero vector is allowed
/// for empty text and never matches anything).
pub trait Embedder {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic feature-hashing embedder.
///
/// Tokens are lowercased alphanumeric runs with camel-case splitting, so
/// `ClaimDeductibleCheck` and `Claim Deductible Check` produce the same
/// token set. Each token is hashed to a bucket and a sign, accumulated,
/// then unit-normalized. No model file, no external state.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut raw = [0_u8; 8];
            raw.copy_from_slice(&digest[..8]);
            let bucket = usize::try_from(u64::from_le_bytes(raw) % self.dimension as u64)
                .unwrap_or_default();
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        normalize(&mut vector);
        vector
    }
}

/// Lowercased alphanumeric tokens, splitting camel-case boundaries.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && previous_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            for lowered in ch.to_lowercase() {
                current.push(lowered);
            }
            previous_lower = ch.is_lowercase() || ch.is_numeric();
        } else {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            previous_lower = false;
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Flat inner-product index. With unit-normalized inputs the inner product
/// equals cosine similarity.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension, vectors: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// # Errors
    ///
    /// Returns `DimensionMismatch` when the vector's length differs from the
    /// index dimension.
    pub fn add(&mut self, vector: Vec<f32>) -> Result<(), CorrelateError> {
        if vector.len() != self.dimension {
            return Err(CorrelateError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.vectors.push(vector);
        Ok(())
    }

    /// All entries ranked by inner product descending. Ties are broken by
    /// ascending insertion index, so results are stable for fixed inputs.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` when the query's length differs from the
    /// index dimension.
    pub fn search(&self, query: &[f32]) -> Result<Vec<(usize, f32)>, CorrelateError> {
        if query.len() != self.dimension {
            return Err(CorrelateError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mut ranked: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(index, vector)| {
                let score: f32 = vector.iter().zip(query).map(|(a, b)| a * b).sum();
                (index, score)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(ranked)
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Greedily match code rules against document rules.
///
/// Per code rule, in input order: candidates are scanned by similarity
/// descending and the first unconsumed document rule at or above `threshold`
/// is taken, one-to-one. Matched code rules are overlaid with the document
/// rule's category, business area, owner, and id, plus the rounded score;
/// unmatched code rules keep their fields with cleared business metadata and
/// `match_score = 0.0`.
///
/// # Errors
///
/// Returns `DimensionMismatch` when the embedder produces vectors of an
/// inconsistent length.
pub fn correlate(
    code_rules: &[RuleRecord],
    doc_rules: &[DocumentedRule],
    threshold: f64,
    embedder: &dyn Embedder,
) -> Result<Vec<RuleRecord>, CorrelateError> {
    let mut index = VectorIndex::new(embedder.dimension());
    for doc in doc_rules {
        index.add(embedder.embed(&doc.composite_text()))?;
    }

    let mut consumed: HashSet<usize> = HashSet::new();
    let mut merged = Vec::with_capacity(code_rules.len());

    for rule in code_rules {
        let mut record = rule.clone();
        let query = embedder.embed(&record.composite_text());
        let ranked = index.search(&query)?;

        let accepted = ranked.into_iter().find(|(doc_index, score)| {
            f64::from(*score) >= threshold && !consumed.contains(doc_index)
        });

        match accepted {
            Some((doc_index, score)) => {
                consumed.insert(doc_index);
                let doc = &doc_rules[doc_index];
                record.rule_category = Some(doc.rule_category.clone());
                record.business_area = Some(doc.business_area.clone());
                record.owner = doc.owner.clone();
                record.doc_rule_id = Some(doc.rule_id.clone());
                record.match_score = round4(f64::from(score));
                tracing::debug!(
                    rule = record.rule_name,
                    doc_rule = doc.rule_name,
                    score = record.match_score,
                    "correlated"
                );
            }
            None => {
                record.rule_category = None;
                record.business_area = None;
                record.owner = String::new();
                record.doc_rule_id = None;
                record.match_score = 0.0;
            }
        }
        merged.push(record);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, name: &str, category: &str, area: &str, owner: &str) -> DocumentedRule {
        DocumentedRule {
            rule_id: id.to_string(),
            rule_name: name.to_string(),
            rule_category: category.to_string(),
            business_area: area.to_string(),
            owner: owner.to_string(),
        }
    }

    /// Three-dimensional embedder with hand-picked vectors, so similarity
    /// scores in the tests are exact by construction.
    struct FixtureEmbedder;

    impl Embedder for FixtureEmbedder {
        fn dimension(&self) -> usize {
            3
        }

        fn embed(&self, text: &str) -> Vec<f32> {
            if text.contains("Claim Deductible Check") {
                vec![1.0, 0.0, 0.0]
            } else if text.contains("Provider Network Validation") {
                vec![0.0, 1.0, 0.0]
            } else if text.contains("ClaimDeductibleCheck") {
                // 0.82 against the first document, 0.30 against the second.
                vec![0.82, 0.30, 0.0]
            } else {
                vec![0.0, 0.0, 1.0]
            }
        }
    }

    #[test]
    fn scenario_overlays_matched_document_metadata() {
        let docs = vec![
            doc("BR-001", "Claim Deductible Check", "Financial", "Claims", "Claims Team"),
            doc("BR-002", "Provider Network Validation", "Network", "Providers", "Network Ops"),
        ];
        let code = vec![RuleRecord::named("ClaimDeductibleCheck")];

        let merged = match correlate(&code, &docs, 0.6, &FixtureEmbedder) {
            Ok(merged) => merged,
            Err(err) => panic!("correlation should succeed: {err}"),
        };

        let record = &merged[0];
        assert_eq!(record.rule_category.as_deref(), Some("Financial"));
        assert_eq!(record.business_area.as_deref(), Some("Claims"));
        assert_eq!(record.owner, "Claims Team");
        assert_eq!(record.doc_rule_id.as_deref(), Some("BR-001"));
        assert!((record.match_score - 0.82).abs() < 1e-9);
    }

    #[test]
    fn second_document_stays_available_after_first_is_consumed() {
        let docs = vec![
            doc("BR-001", "Claim Deductible Check", "Financial", "Claims", "Claims Team"),
            doc("BR-002", "Provider Network Validation", "Network", "Providers", "Network Ops"),
        ];
        let code = vec![
            RuleRecord::named("ClaimDeductibleCheck"),
            RuleRecord::named("Provider Network Validation routine"),
        ];

        let merged = match correlate(&code, &docs, 0.6, &FixtureEmbedder) {
            Ok(merged) => merged,
            Err(err) => panic!("correlation should succeed: {err}"),
        };

        assert_eq!(merged[0].doc_rule_id.as_deref(), Some("BR-001"));
        assert_eq!(merged[1].doc_rule_id.as_deref(), Some("BR-002"));
    }

    #[test]
    fn no_two_code_rules_consume_the_same_document() {
        let docs = vec![doc("BR-001", "Claim Deductible Check", "Financial", "Claims", "Team")];
        // Both code rules rank BR-001 first.
        let code = vec![
            RuleRecord::named("Claim Deductible Check alpha"),
            RuleRecord::named("Claim Deductible Check beta"),
        ];

        let merged = match correlate(&code, &docs, 0.6, &FixtureEmbedder) {
            Ok(merged) => merged,
            Err(err) => panic!("correlation should succeed: {err}"),
        };

        assert_eq!(merged[0].doc_rule_id.as_deref(), Some("BR-001"));
        assert_eq!(merged[1].doc_rule_id, None);
        assert!((merged[1].match_score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_document_set_leaves_every_code_rule_unmatched() {
        let mut rule = RuleRecord::named("Orphan Rule");
        rule.artifact_path = Some("out/doc.md".to_string());

        let merged = match correlate(&[rule], &[], 0.6, &FixtureEmbedder) {
            Ok(merged) => merged,
            Err(err) => panic!("correlation should succeed: {err}"),
        };

        assert_eq!(merged[0].rule_category, None);
        assert!((merged[0].match_score - 0.0).abs() < f64::EPSILON);
        // Previously attached fields survive the overlay.
        assert_eq!(merged[0].artifact_path.as_deref(), Some("out/doc.md"));
    }

    #[test]
    fn correlation_is_deterministic() {
        let docs = vec![
            doc("BR-001", "Claim Deductible Check", "Financial", "Claims", "Team"),
            doc("BR-002", "Provider Network Validation", "Network", "Providers", "Team"),
        ];
        let code = vec![RuleRecord::named("ClaimDeductibleCheck")];
        let embedder = HashEmbedder::default();

        let first = match correlate(&code, &docs, 0.1, &embedder) {
            Ok(merged) => merged,
            Err(err) => panic!("correlation should succeed: {err}"),
        };
        let second = match correlate(&code, &docs, 0.1, &embedder) {
            Ok(merged) => merged,
            Err(err) => panic!("correlation should succeed: {err}"),
        };

        assert_eq!(first[0].doc_rule_id, second[0].doc_rule_id);
        assert!((first[0].match_score - second[0].match_score).abs() < f64::EPSILON);
    }

    #[test]
    fn hash_embedder_ignores_token_casing_and_separators() {
        let embedder = HashEmbedder::default();
        let camel = embedder.embed("ClaimDeductibleCheck");
        let spaced = embedder.embed("Claim Deductible Check");
        assert_eq!(camel, spaced);
    }

    #[test]
    fn hash_embedder_output_is_unit_length() {
        let embedder = HashEmbedder::default();
        let vector = embedder.embed("Provider Network Validation");
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_empty_text_is_the_zero_vector() {
        let embedder = HashEmbedder::default();
        let vector = embedder.embed("   ");
        assert!(vector.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn index_breaks_score_ties_by_insertion_order() {
        let mut index = VectorIndex::new(2);
        for _ in 0..3 {
            if let Err(err) = index.add(vec![1.0, 0.0]) {
                panic!("add should succeed: {err}");
            }
        }

        let ranked = match index.search(&[1.0, 0.0]) {
            Ok(ranked) => ranked,
            Err(err) => panic!("search should succeed: {err}"),
        };
        let order: Vec<usize> = ranked.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn index_rejects_wrong_dimension() {
        let mut index = VectorIndex::new(3);
        assert_eq!(
            index.add(vec![1.0, 0.0]),
            Err(CorrelateError::DimensionMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(
            index.search(&[1.0, 0.0]),
            Err(CorrelateError::DimensionMismatch { expected: 3, actual: 2 })
        );
    }
}
