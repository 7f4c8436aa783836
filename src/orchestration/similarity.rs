//! Text-similarity scoring of authorization requests against the cached
//! governance corpus.
//!
//! The analyzer is a heuristic filter, not a correctness-critical
//! classifier: it keeps the orchestration layer from drafting a near-copy
//! of governance that already exists. Scores combine exact tool membership
//! (weight 2), operation-kind membership (weight 2), and lexical overlap of
//! purpose text (weight 1) into a weighted mean in `[0, 1]`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{OperationKind, ToolCatalog};
use crate::governance::policy::Policy;
use crate::governance::procedure::Procedure;
use crate::governance::store::GovernanceStore;

/// Weight of exact tool-name membership.
const TOOL_WEIGHT: f64 = 2.0;
/// Weight of operation-kind membership.
const KIND_WEIGHT: f64 = 2.0;
/// Weight of lexical purpose-text similarity.
const LEXICAL_WEIGHT: f64 = 1.0;
/// Matches reported per category.
const TOP_MATCHES: usize = 5;

// ============================================================================
// Lexical Metrics
// ============================================================================

/// Interchangeable lexical similarity metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LexicalMetric {
    /// Token-set overlap over union
    Jaccard,
    /// `1 - editDistance / maxLength`
    Levenshtein,
    /// Cosine similarity over term-frequency vectors
    Cosine,
}

impl LexicalMetric {
    /// Similarity of two texts in `[0, 1]`.
    #[must_use]
    pub fn similarity(&self, a: &str, b: &str) -> f64 {
        match self {
            Self::Jaccard => jaccard(a, b),
            Self::Levenshtein => levenshtein_normalized(a, b),
            Self::Cosine => cosine(a, b),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Token-set Jaccard coefficient. Two empty texts are identical.
#[must_use]
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a).into_iter().collect();
    let set_b: HashSet<String> = tokenize(b).into_iter().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Character-level normalized Levenshtein similarity.
#[must_use]
pub fn levenshtein_normalized(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }

    // Single-row DP
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![i + 1];
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            let insertion = current[j] + 1;
            let deletion = previous[j + 1] + 1;
            current.push(substitution.min(insertion).min(deletion));
        }
        previous = current;
    }
    let distance = previous[b.len()];
    1.0 - distance as f64 / max_len as f64
}

/// Cosine similarity over term-frequency vectors.
#[must_use]
pub fn cosine(a: &str, b: &str) -> f64 {
    let tf_a = term_frequencies(a);
    let tf_b = term_frequencies(b);
    if tf_a.is_empty() && tf_b.is_empty() {
        return 1.0;
    }

    let dot: f64 = tf_a
        .iter()
        .filter_map(|(term, &count)| tf_b.get(term).map(|&other| count * other))
        .sum();
    let norm_a: f64 = tf_a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b: f64 = tf_b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
    let mut frequencies = BTreeMap::new();
    for token in tokenize(text) {
        *frequencies.entry(token).or_insert(0.0) += 1.0;
    }
    frequencies
}

// ============================================================================
// Analysis Types
// ============================================================================

/// What kind of governance artifact a match refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    Policy,
    Procedure,
}

/// One scored corpus candidate.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarRecord {
    pub id: String,
    pub name: String,
    pub kind: CandidateKind,
    pub score: f64,
    pub can_reuse: bool,
    pub can_extend: bool,
    /// For procedures: whether the expanded governed set covers the
    /// requesting tool. Reuse requires coverage, not just similarity.
    pub covers_tool: bool,
}

/// Recommendation for a governance gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Create,
    Extend,
    Reuse,
}

/// Result of analyzing one authorization request against the corpus.
#[derive(Debug, Clone, Serialize)]
pub struct GovernanceAnalysis {
    pub tool: String,
    pub operation_kind: OperationKind,
    pub similar_policies: Vec<SimilarRecord>,
    pub similar_procedures: Vec<SimilarRecord>,
    pub recommendation: Recommendation,
    pub needs_new_policy: bool,
    pub needs_new_procedure: bool,
}

impl GovernanceAnalysis {
    /// The reusable, tool-covering procedure match, if any.
    #[must_use]
    pub fn reusable_procedure(&self) -> Option<&SimilarRecord> {
        self.similar_procedures
            .iter()
            .find(|record| record.can_reuse && record.covers_tool)
    }
}

/// An authorization request distilled for analysis.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub tool: String,
    pub operation_kind: OperationKind,
    /// Purpose words derived from the request (tool name, argument keys)
    pub purpose: String,
}

impl AnalysisRequest {
    /// Derives the purpose text from a tool name and its arguments.
    #[must_use]
    pub fn from_call(tool: &str, kind: OperationKind, args: &serde_json::Value) -> Self {
        let mut purpose = tool.replace(['-', '_'], " ");
        if let Some(object) = args.as_object() {
            for key in object.keys().filter(|k| !k.starts_with("__")) {
                purpose.push(' ');
                purpose.push_str(&key.replace(['-', '_'], " "));
            }
        }
        Self {
            tool: tool.to_string(),
            operation_kind: kind,
            purpose,
        }
    }
}

// ============================================================================
// Analyzer
// ============================================================================

/// Point-in-time copy of the corpus, refreshed on a TTL.
struct CorpusSnapshot {
    policies: Vec<Arc<Policy>>,
    procedures: Vec<Arc<Procedure>>,
    taken_at: DateTime<Utc>,
}

/// Scores requests against cached policies and procedures.
pub struct SimilarityAnalyzer {
    store: Arc<GovernanceStore>,
    catalog: Arc<ToolCatalog>,
    metric: LexicalMetric,
    reuse_threshold: f64,
    extend_threshold: f64,
    cache_ttl: Duration,
    cache: Mutex<Option<CorpusSnapshot>>,
}

impl SimilarityAnalyzer {
    #[must_use]
    pub fn new(
        store: Arc<GovernanceStore>,
        catalog: Arc<ToolCatalog>,
        metric: LexicalMetric,
        reuse_threshold: f64,
        extend_threshold: f64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            metric,
            reuse_threshold,
            extend_threshold,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Analyzes a request against the corpus snapshot.
    #[must_use]
    pub fn analyze(&self, request: &AnalysisRequest) -> GovernanceAnalysis {
        let (policies, procedures) = self.snapshot();

        let mut similar_policies: Vec<SimilarRecord> = policies
            .iter()
            .map(|policy| self.score_policy(request, policy))
            .filter(|record| record.score > 0.0)
            .collect();
        let mut similar_procedures: Vec<SimilarRecord> = procedures
            .iter()
            .map(|procedure| self.score_procedure(request, procedure))
            .filter(|record| record.score > 0.0)
            .collect();

        sort_and_cap(&mut similar_policies);
        sort_and_cap(&mut similar_procedures);

        // Reuse requires similarity AND tool coverage; a high-scoring
        // procedure that does not govern the tool would defeat the hijack
        // protection if reused.
        let reusable = similar_procedures
            .iter()
            .any(|record| record.can_reuse && record.covers_tool);
        let extendable_policy = similar_policies.iter().any(|record| record.can_extend);

        let recommendation = if reusable {
            Recommendation::Reuse
        } else if extendable_policy {
            Recommendation::Extend
        } else {
            Recommendation::Create
        };

        let needs_new_policy = !similar_policies
            .iter()
            .any(|record| record.can_reuse || record.can_extend);
        let needs_new_procedure = !reusable;

        debug!(
            tool = %request.tool,
            recommendation = ?recommendation,
            policies = similar_policies.len(),
            procedures = similar_procedures.len(),
            "Similarity analysis finished"
        );

        GovernanceAnalysis {
            tool: request.tool.clone(),
            operation_kind: request.operation_kind,
            similar_policies,
            similar_procedures,
            recommendation,
            needs_new_policy,
            needs_new_procedure,
        }
    }

    fn score_policy(&self, request: &AnalysisRequest, policy: &Policy) -> SimilarRecord {
        let tool_term = f64::from(policy.tools.contains(&request.tool));
        let kind_term = f64::from(policy.operation_kinds.contains(&request.operation_kind));
        let lexical_term = self.metric.similarity(&request.purpose, &policy.purpose);
        let score = weighted_mean(tool_term, kind_term, lexical_term);
        SimilarRecord {
            id: policy.id.clone(),
            name: policy.name.clone(),
            kind: CandidateKind::Policy,
            score,
            can_reuse: score >= self.reuse_threshold,
            can_extend: score >= self.extend_threshold && score < self.reuse_threshold,
            covers_tool: policy.tools.contains(&request.tool),
        }
    }

    fn score_procedure(&self, request: &AnalysisRequest, procedure: &Procedure) -> SimilarRecord {
        let governed: BTreeSet<String> = procedure.trigger.expanded_tools(&self.catalog);
        let covers_tool = governed.contains(&request.tool);
        let tool_term = f64::from(covers_tool);
        let kind_term = f64::from(procedure.trigger.governs_kind(request.operation_kind));
        let lexical_term = self
            .metric
            .similarity(&request.purpose, &procedure.purpose_text());
        let score = weighted_mean(tool_term, kind_term, lexical_term);
        SimilarRecord {
            id: procedure.id.clone(),
            name: procedure.name.clone(),
            kind: CandidateKind::Procedure,
            score,
            can_reuse: score >= self.reuse_threshold,
            can_extend: score >= self.extend_threshold && score < self.reuse_threshold,
            covers_tool,
        }
    }

    /// Corpus snapshot, rescanned only after the cache TTL lapses.
    fn snapshot(&self) -> (Vec<Arc<Policy>>, Vec<Arc<Procedure>>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let stale = match cache.as_ref() {
            Some(snapshot) => {
                let age = Utc::now() - snapshot.taken_at;
                age.to_std().map(|age| age >= self.cache_ttl).unwrap_or(false)
            }
            None => true,
        };
        if stale {
            let (policies, procedures) = self.store.corpus();
            *cache = Some(CorpusSnapshot {
                policies,
                procedures,
                taken_at: Utc::now(),
            });
        }
        let snapshot = cache.as_ref().unwrap_or_else(|| unreachable!());
        (snapshot.policies.clone(), snapshot.procedures.clone())
    }

    /// Drops the cached snapshot so the next analysis rescans the corpus.
    /// Called after drafts are written.
    pub fn invalidate(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = None;
    }
}

fn weighted_mean(tool_term: f64, kind_term: f64, lexical_term: f64) -> f64 {
    (TOOL_WEIGHT * tool_term + KIND_WEIGHT * kind_term + LEXICAL_WEIGHT * lexical_term)
        / (TOOL_WEIGHT + KIND_WEIGHT + LEXICAL_WEIGHT)
}

fn sort_and_cap(records: &mut Vec<SimilarRecord>) {
    records.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    records.truncate(TOP_MATCHES);
}

// ============================================================================
// Tests
// ============================================================================
