//! Governance definition loading and caching.
//!
//! Definitions come from an external governance dataset through the
//! [`GovernanceSource`] trait as raw YAML/JSON documents. The store
//! validates them fail-closed, caches them with a per-entry TTL and a size
//! ceiling (oldest-accessed evicted first), and answers applicability
//! lookups. Absence of a match is meaningful: the store never synthesizes a
//! fallback procedure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{OperationKind, ToolCatalog};
use crate::governance::policy::Policy;
use crate::governance::procedure::{Procedure, ProcedureStatus, StructuralError};

// ============================================================================
// Source Boundary
// ============================================================================

/// Error from the external governance dataset.
#[derive(Debug, Error, Clone)]
pub enum SourceError {
    #[error("governance source unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("governance source rejected the write: {reason}")]
    WriteRejected { reason: String },
}

/// A draft artifact to be written back to the governance corpus.
#[derive(Debug, Clone)]
pub enum GovernanceDraft {
    Policy(Policy),
    Procedure(Procedure),
}

/// The external governance dataset.
///
/// Documents are raw YAML or JSON; parsing and validation happen in the
/// store so a misbehaving source cannot activate a malformed definition.
#[async_trait]
pub trait GovernanceSource: Send + Sync {
    /// Fetches one procedure document by id.
    async fn fetch_procedure(&self, id: &str) -> Result<Option<String>, SourceError>;

    /// Fetches every procedure document.
    async fn fetch_procedures(&self) -> Result<Vec<String>, SourceError>;

    /// Fetches every policy document.
    async fn fetch_policies(&self) -> Result<Vec<String>, SourceError>;

    /// Writes a draft artifact for external review. Drafts stay inactive
    /// until promoted outside the gate.
    async fn store_draft(&self, draft: &GovernanceDraft) -> Result<(), SourceError>;
}

// ============================================================================
// Store Errors
// ============================================================================

/// Errors from definition loading and lookup.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Structural validation failed; the definition never activates.
    #[error(transparent)]
    Invalid(#[from] StructuralError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("procedure '{id}' not found in the governance corpus")]
    NotFound { id: String },
}

// ============================================================================
// Cache
// ============================================================================

/// Cached definition with access tracking for eviction.
///
/// Access order is a monotonic sequence, not wall-clock time, so two reads
/// in the same instant still have a well-defined eviction order.
struct CacheEntry<T> {
    value: T,
    loaded_at: DateTime<Utc>,
    last_access: AtomicI64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, seq: i64) -> Self {
        Self {
            value,
            loaded_at: Utc::now(),
            last_access: AtomicI64::new(seq),
        }
    }

    fn touch(&self, seq: i64) {
        self.last_access.store(seq, Ordering::Release);
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        let age = Utc::now() - self.loaded_at;
        age.to_std().map(|age| age < ttl).unwrap_or(true)
    }
}

// ============================================================================
// Governance Store
// ============================================================================

/// Validated, cached view of the governance corpus.
pub struct GovernanceStore {
    source: Arc<dyn GovernanceSource>,
    procedures: DashMap<String, CacheEntry<Arc<Procedure>>>,
    policies: DashMap<String, CacheEntry<Arc<Policy>>>,
    cache_ttl: Duration,
    cache_capacity: usize,
    access_clock: AtomicI64,
}

impl GovernanceStore {
    #[must_use]
    pub fn new(
        source: Arc<dyn GovernanceSource>,
        cache_ttl: Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            source,
            procedures: DashMap::new(),
            policies: DashMap::new(),
            cache_ttl,
            cache_capacity: cache_capacity.max(1),
            access_clock: AtomicI64::new(0),
        }
    }

    /// Loads a procedure by id, from cache when fresh.
    pub async fn load(&self, id: &str) -> Result<Arc<Procedure>, StoreError> {
        if let Some(entry) = self.procedures.get(id)
            && entry.is_fresh(self.cache_ttl)
        {
            entry.touch(self.next_access());
            return Ok(Arc::clone(&entry.value));
        }

        let raw = self
            .source
            .fetch_procedure(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        let procedure = Arc::new(Procedure::parse_document(&raw)?);
        debug!(procedure_id = %procedure.id, "Loaded procedure definition");
        self.insert_procedure(Arc::clone(&procedure));
        Ok(procedure)
    }

    /// Loads the full corpus, skipping (and logging) invalid documents.
    ///
    /// Invalid documents are rejected individually so one bad definition
    /// cannot take down the rest of the corpus.
    pub async fn refresh(&self) -> Result<RefreshStats, StoreError> {
        let mut stats = RefreshStats::default();

        for raw in self.source.fetch_procedures().await? {
            match Procedure::parse_document(&raw) {
                Ok(procedure) => {
                    self.insert_procedure(Arc::new(procedure));
                    stats.procedures += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Rejected invalid procedure document");
                    stats.rejected += 1;
                }
            }
        }
        for raw in self.source.fetch_policies().await? {
            match Policy::parse_document(&raw) {
                Ok(policy) => {
                    self.insert_policy(Arc::new(policy));
                    stats.policies += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Rejected invalid policy document");
                    stats.rejected += 1;
                }
            }
        }

        info!(
            procedures = stats.procedures,
            policies = stats.policies,
            rejected = stats.rejected,
            "Governance corpus refreshed"
        );
        Ok(stats)
    }

    /// Procedures applicable to a `tool`/`kind` call, most specific first.
    ///
    /// Exact (or wildcard-expanded) tool matches order before kind-only
    /// matches. Read operations only match procedures explicitly flagged
    /// `enforce_on_read`. Draft procedures are never applicable. When `tags`
    /// is non-empty, a candidate must share at least one tag.
    #[must_use]
    pub fn find_applicable(
        &self,
        tool: &str,
        kind: OperationKind,
        tags: &BTreeSet<String>,
        catalog: &ToolCatalog,
    ) -> Vec<Arc<Procedure>> {
        let mut tool_matches = Vec::new();
        let mut kind_matches = Vec::new();

        for entry in self.procedures.iter() {
            let procedure = &entry.value;
            if procedure.status != ProcedureStatus::Active {
                continue;
            }
            if kind == OperationKind::Read && !procedure.trigger.enforce_on_read {
                continue;
            }
            if !tags.is_empty() && procedure.tags.intersection(tags).next().is_none() {
                continue;
            }

            if procedure.trigger.governs_tool(tool, catalog) {
                entry.touch(self.access_clock.fetch_add(1, Ordering::AcqRel));
                tool_matches.push(Arc::clone(procedure));
            } else if procedure.trigger.governs_kind(kind) {
                entry.touch(self.access_clock.fetch_add(1, Ordering::AcqRel));
                kind_matches.push(Arc::clone(procedure));
            }
        }

        // Deterministic order within each specificity band
        tool_matches.sort_by(|a, b| a.id.cmp(&b.id));
        kind_matches.sort_by(|a, b| a.id.cmp(&b.id));
        tool_matches.extend(kind_matches);
        tool_matches
    }

    /// Records a coordinator-produced draft and forwards it to the source.
    ///
    /// The status is forced to `Draft` before the artifact goes anywhere, so
    /// neither the cache nor the source can round-trip it back as active.
    /// The cached copy is what the analyzer sees on its next pass; it is
    /// never applicable until an external review promotes it.
    pub async fn insert_draft(&self, draft: GovernanceDraft) -> Result<(), StoreError> {
        let draft = match draft {
            GovernanceDraft::Policy(mut policy) => {
                policy.status = ProcedureStatus::Draft;
                policy.validate()?;
                GovernanceDraft::Policy(policy)
            }
            GovernanceDraft::Procedure(mut procedure) => {
                procedure.status = ProcedureStatus::Draft;
                procedure.validate()?;
                GovernanceDraft::Procedure(procedure)
            }
        };
        self.source.store_draft(&draft).await?;
        match draft {
            GovernanceDraft::Policy(policy) => self.insert_policy(Arc::new(policy)),
            GovernanceDraft::Procedure(procedure) => self.insert_procedure(Arc::new(procedure)),
        }
        Ok(())
    }

    /// Current cached corpus, for the similarity analyzer.
    #[must_use]
    pub fn corpus(&self) -> (Vec<Arc<Policy>>, Vec<Arc<Procedure>>) {
        let policies = self
            .policies
            .iter()
            .map(|entry| Arc::clone(&entry.value))
            .collect();
        let procedures = self
            .procedures
            .iter()
            .map(|entry| Arc::clone(&entry.value))
            .collect();
        (policies, procedures)
    }

    /// Number of cached procedures.
    #[must_use]
    pub fn procedure_count(&self) -> usize {
        self.procedures.len()
    }

    fn next_access(&self) -> i64 {
        self.access_clock.fetch_add(1, Ordering::AcqRel)
    }

    fn insert_procedure(&self, procedure: Arc<Procedure>) {
        evict_if_full(&self.procedures, self.cache_capacity, procedure.id.as_str());
        self.procedures
            .insert(procedure.id.clone(), CacheEntry::new(procedure, self.next_access()));
    }

    fn insert_policy(&self, policy: Arc<Policy>) {
        evict_if_full(&self.policies, self.cache_capacity, policy.id.as_str());
        self.policies
            .insert(policy.id.clone(), CacheEntry::new(policy, self.next_access()));
    }
}

/// Evicts the oldest-accessed entry once the ceiling is reached.
///
/// Replacing an already-cached id does not grow the map, so it never evicts.
fn evict_if_full<T>(cache: &DashMap<String, CacheEntry<T>>, capacity: usize, incoming: &str) {
    if cache.len() < capacity || cache.contains_key(incoming) {
        return;
    }
    let oldest = cache
        .iter()
        .min_by_key(|entry| entry.last_access.load(Ordering::Acquire))
        .map(|entry| entry.key().clone());
    if let Some(key) = oldest {
        cache.remove(&key);
        debug!(evicted = %key, "Evicted oldest-accessed cache entry");
    }
}

/// Counts from a corpus refresh.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefreshStats {
    pub procedures: usize,
    pub policies: usize,
    pub rejected: usize,
}

// ============================================================================
// Tests
// ============================================================================
