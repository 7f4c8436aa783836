//! Governance-gap orchestration.
//!
//! When a write operation arrives and no procedure governs it, the
//! coordinator produces the missing governance instead of failing blind: it
//! runs the similarity analyzer against the cached corpus, and either points
//! the caller at an existing artifact (reuse) or drives the agent bus
//! through a short authoring conversation that drafts a policy and a
//! procedure. Drafts are written through the store as inactive entries; the
//! coordinator never activates governance it created.
//!
//! The authoring roles are pure `(request, analysis) -> draft` functions
//! behind [`DraftAuthor`], so a real multi-agent backend can replace the
//! built-in simulation without touching the coordinator's control flow.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditEventKind, AuditLog, AuditOutcome, AuditSeverity};
use crate::catalog::OperationKind;
use crate::governance::policy::Policy;
use crate::governance::procedure::{
    Procedure, ProcedureStatus, Step, StepKind, TriggerSpec,
};
use crate::governance::store::{GovernanceDraft, GovernanceStore, StoreError};
use crate::orchestration::bus::{AgentBus, AgentMessage, BusError, MessagePriority};
use crate::orchestration::similarity::{
    AnalysisRequest, GovernanceAnalysis, SimilarityAnalyzer,
};

/// Role name the coordinator speaks as.
pub const ORCHESTRATOR_ROLE: &str = "orchestrator";
/// Role that drafts policies.
pub const POLICY_AUTHOR_ROLE: &str = "policy-author";
/// Role that drafts procedures.
pub const PROCEDURE_AUTHOR_ROLE: &str = "procedure-author";

// ============================================================================
// Errors
// ============================================================================

/// The orchestration pipeline failed. The original request stays blocked;
/// the caller surfaces the raw denial instead of a fabricated success.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("could not store draft governance for '{tool}': {source}")]
    Draft {
        tool: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Bus(#[from] BusError),
}

// ============================================================================
// Sessions
// ============================================================================

/// Lifecycle of one orchestration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// One governance-gap negotiation, from gap to drafts (or reuse).
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationSession {
    pub session_id: String,
    pub tool: String,
    pub operation_kind: OperationKind,
    pub participants: BTreeSet<String>,
    /// Messages sent during the session, in order
    pub messages: Vec<AgentMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft_procedure_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What the coordinator resolved a governance gap into.
#[derive(Debug, Clone)]
pub enum OrchestrationOutcome {
    /// An existing procedure already covers the tool; nothing was drafted.
    Reuse {
        procedure_id: String,
        procedure_name: String,
        score: f64,
    },
    /// New draft governance was written for external review.
    Drafted {
        session_id: String,
        draft_policy_id: Option<String>,
        draft_procedure_id: Option<String>,
        /// Human-readable next steps for the caller
        recommendations: Vec<String>,
    },
}

// ============================================================================
// Draft Authors
// ============================================================================

/// Produces draft governance artifacts from a request and its analysis.
///
/// Implementations must be deterministic in the request: orchestrating the
/// same gap twice yields identical drafts, which is what makes the
/// store-side deduplication work.
pub trait DraftAuthor: Send + Sync {
    /// Drafts a policy recording why the operation is governed.
    fn draft_policy(&self, request: &AnalysisRequest, analysis: &GovernanceAnalysis) -> Policy;

    /// Drafts a procedure gating the operation, optionally under a parent
    /// policy drafted in the same session.
    fn draft_procedure(
        &self,
        request: &AnalysisRequest,
        analysis: &GovernanceAnalysis,
        policy: Option<&Policy>,
    ) -> Procedure;
}

/// Built-in deterministic author used when no agent backend is registered.
#[derive(Debug, Default)]
pub struct SimulatedAuthor;

impl DraftAuthor for SimulatedAuthor {
    fn draft_policy(&self, request: &AnalysisRequest, _analysis: &GovernanceAnalysis) -> Policy {
        Policy {
            id: format!("pol-{}", request.tool),
            name: format!("{} governance policy", request.tool),
            purpose: request.purpose.clone(),
            rules: vec![format!(
                "'{}' {} operations require a completed governance procedure",
                request.tool, request.operation_kind
            )],
            tools: BTreeSet::from([request.tool.clone()]),
            operation_kinds: BTreeSet::from([request.operation_kind]),
            status: ProcedureStatus::Draft,
        }
    }

    fn draft_procedure(
        &self,
        request: &AnalysisRequest,
        _analysis: &GovernanceAnalysis,
        policy: Option<&Policy>,
    ) -> Procedure {
        let mut steps = vec![Step {
            id: "brief".to_string(),
            name: "Review the operation briefing".to_string(),
            retryable: false,
            max_retries: 0,
            skip_conditions: vec![],
            allowed_tools: None,
            on_success: None,
            on_failure: None,
            on_timeout: None,
            kind: StepKind::Information {
                content: format!(
                    "'{}' is a governed {} operation against the dataset platform.",
                    request.tool, request.operation_kind
                ),
                acknowledgment_required: true,
            },
        }];
        if request.operation_kind == OperationKind::Write {
            steps.push(Step {
                id: "sign-off".to_string(),
                name: "Owner sign-off".to_string(),
                retryable: false,
                max_retries: 0,
                skip_conditions: vec![],
                allowed_tools: None,
                on_success: None,
                on_failure: None,
                on_timeout: None,
                kind: StepKind::Approval {
                    approvers: BTreeSet::from(["governance-team".to_string()]),
                    min_approvals: 1,
                },
            });
        }
        steps.push(Step {
            id: "execute".to_string(),
            name: format!("Execute {}", request.tool),
            retryable: true,
            max_retries: 2,
            skip_conditions: vec![],
            allowed_tools: Some(BTreeSet::from([request.tool.clone()])),
            on_success: None,
            on_failure: None,
            on_timeout: None,
            kind: StepKind::Tool {
                tool_name: request.tool.clone(),
                params: serde_json::json!({}),
                validation_rules: vec![],
                compensating_action: None,
            },
        });

        Procedure {
            id: format!("proc-{}", request.tool),
            name: format!("{} governance", request.tool),
            description: request.purpose.clone(),
            trigger: TriggerSpec {
                tools: BTreeSet::from([request.tool.clone()]),
                operation_kinds: BTreeSet::from([request.operation_kind]),
                enforce_on_read: false,
            },
            steps,
            owner: policy
                .map(|p| p.id.clone())
                .unwrap_or_else(|| "governance-drafts".to_string()),
            status: ProcedureStatus::Draft,
            tags: BTreeSet::from(["drafted".to_string()]),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Resolves governance gaps into reuse decisions or reviewed drafts.
pub struct OrchestrationCoordinator {
    analyzer: Arc<SimilarityAnalyzer>,
    bus: Arc<AgentBus>,
    store: Arc<GovernanceStore>,
    audit: Arc<AuditLog>,
    author: Arc<dyn DraftAuthor>,
    sessions: DashMap<String, OrchestrationSession>,
    session_grace: Duration,
}

impl OrchestrationCoordinator {
    #[must_use]
    pub fn new(
        analyzer: Arc<SimilarityAnalyzer>,
        bus: Arc<AgentBus>,
        store: Arc<GovernanceStore>,
        audit: Arc<AuditLog>,
        author: Arc<dyn DraftAuthor>,
        session_grace: Duration,
    ) -> Self {
        Self {
            analyzer,
            bus,
            store,
            audit,
            author,
            sessions: DashMap::new(),
            session_grace,
        }
    }

    /// Runs one governance-gap negotiation for a write request.
    pub async fn orchestrate(
        &self,
        request: AnalysisRequest,
    ) -> Result<OrchestrationOutcome, OrchestrationError> {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            OrchestrationSession {
                session_id: session_id.clone(),
                tool: request.tool.clone(),
                operation_kind: request.operation_kind,
                participants: BTreeSet::from([ORCHESTRATOR_ROLE.to_string()]),
                messages: Vec::new(),
                draft_policy_id: None,
                draft_procedure_id: None,
                status: SessionStatus::Active,
                created_at: Utc::now(),
                completed_at: None,
            },
        );
        info!(
            session_id = %session_id,
            tool = %request.tool,
            "Orchestration session opened for governance gap"
        );
        self.audit.record(
            AuditEntry::new(
                AuditEventKind::OrchestrationStarted,
                AuditOutcome::Success,
                format!("no governance covers '{}'", request.tool),
            )
            .tool(request.tool.clone())
            .metadata(serde_json::json!({"session_id": session_id})),
        );

        let analysis = self.analyzer.analyze(&request);

        // Reuse requires tool coverage, not just a similarity score: pointing
        // the caller at a procedure that cannot authorize the tool would
        // defeat the hijack protection downstream.
        if let Some(matched) = analysis.reusable_procedure() {
            let outcome = OrchestrationOutcome::Reuse {
                procedure_id: matched.id.clone(),
                procedure_name: matched.name.clone(),
                score: matched.score,
            };
            self.finish(&session_id, SessionStatus::Completed, None, None);
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::OrchestrationCompleted,
                    AuditOutcome::Success,
                    format!(
                        "existing procedure '{}' already covers '{}'; nothing drafted",
                        matched.id, request.tool
                    ),
                )
                .tool(request.tool.clone())
                .procedure(matched.id.clone())
                .metadata(serde_json::json!({"session_id": session_id, "score": matched.score})),
            );
            return Ok(outcome);
        }

        match self.author_drafts(&session_id, &request, &analysis).await {
            Ok(outcome) => {
                if let OrchestrationOutcome::Drafted {
                    draft_policy_id,
                    draft_procedure_id,
                    ..
                } = &outcome
                {
                    self.finish(
                        &session_id,
                        SessionStatus::Completed,
                        draft_policy_id.clone(),
                        draft_procedure_id.clone(),
                    );
                }
                self.audit.record(
                    AuditEntry::new(
                        AuditEventKind::OrchestrationCompleted,
                        AuditOutcome::Success,
                        format!("draft governance written for '{}'", request.tool),
                    )
                    .tool(request.tool.clone())
                    .metadata(serde_json::json!({"session_id": session_id})),
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    tool = %request.tool,
                    error = %e,
                    "Orchestration session failed"
                );
                self.finish(&session_id, SessionStatus::Failed, None, None);
                self.audit.record(
                    AuditEntry::new(
                        AuditEventKind::OrchestrationCompleted,
                        AuditOutcome::Failure,
                        e.to_string(),
                    )
                    .tool(request.tool.clone())
                    .severity(AuditSeverity::Warning)
                    .metadata(serde_json::json!({"session_id": session_id})),
                );
                Err(e)
            }
        }
    }

    async fn author_drafts(
        &self,
        session_id: &str,
        request: &AnalysisRequest,
        analysis: &GovernanceAnalysis,
    ) -> Result<OrchestrationOutcome, OrchestrationError> {
        let mut recommendations = Vec::new();

        let policy = if analysis.needs_new_policy {
            self.converse(
                session_id,
                AgentMessage::new(
                    ORCHESTRATOR_ROLE,
                    POLICY_AUTHOR_ROLE,
                    "draft-policy",
                    serde_json::json!({
                        "tool": request.tool,
                        "operation_kind": request.operation_kind,
                        "purpose": request.purpose,
                    }),
                    MessagePriority::Urgent,
                    session_id,
                ),
            )
            .await?;
            let policy = self.author.draft_policy(request, analysis);
            self.store
                .insert_draft(GovernanceDraft::Policy(policy.clone()))
                .await
                .map_err(|source| OrchestrationError::Draft {
                    tool: request.tool.clone(),
                    source,
                })?;
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::DraftCreated,
                    AuditOutcome::Success,
                    format!("draft policy '{}' written for review", policy.id),
                )
                .tool(request.tool.clone())
                .metadata(serde_json::json!({"session_id": session_id, "policy_id": policy.id})),
            );
            recommendations.push(format!(
                "Review and promote draft policy '{}' covering '{}'.",
                policy.id, request.tool
            ));
            Some(policy)
        } else {
            // An existing policy is close enough to extend; say which one.
            if let Some(existing) = analysis.similar_policies.iter().find(|p| p.can_extend) {
                recommendations.push(format!(
                    "Extend existing policy '{}' to cover '{}'.",
                    existing.id, request.tool
                ));
            }
            None
        };

        self.converse(
            session_id,
            AgentMessage::new(
                ORCHESTRATOR_ROLE,
                PROCEDURE_AUTHOR_ROLE,
                "draft-procedure",
                serde_json::json!({
                    "tool": request.tool,
                    "operation_kind": request.operation_kind,
                    "parent_policy": policy.as_ref().map(|p| p.id.clone()),
                }),
                MessagePriority::Urgent,
                session_id,
            ),
        )
        .await?;
        let procedure = self
            .author
            .draft_procedure(request, analysis, policy.as_ref());
        self.store
            .insert_draft(GovernanceDraft::Procedure(procedure.clone()))
            .await
            .map_err(|source| OrchestrationError::Draft {
                tool: request.tool.clone(),
                source,
            })?;
        self.audit.record(
            AuditEntry::new(
                AuditEventKind::DraftCreated,
                AuditOutcome::Success,
                format!("draft procedure '{}' written for review", procedure.id),
            )
            .tool(request.tool.clone())
            .procedure(procedure.id.clone())
            .metadata(serde_json::json!({"session_id": session_id})),
        );
        recommendations.push(format!(
            "Once draft procedure '{}' is promoted, start a run and retry '{}'.",
            procedure.id, request.tool
        ));

        // The corpus changed; the next analysis must see the new drafts.
        self.analyzer.invalidate();

        Ok(OrchestrationOutcome::Drafted {
            session_id: session_id.to_string(),
            draft_policy_id: policy.map(|p| p.id),
            draft_procedure_id: Some(procedure.id),
            recommendations,
        })
    }

    /// Records a message on the session log and delivers it through the bus.
    async fn converse(
        &self,
        session_id: &str,
        message: AgentMessage,
    ) -> Result<serde_json::Value, OrchestrationError> {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.participants.insert(message.to.clone());
            session.messages.push(message.clone());
        }
        Ok(self.bus.dispatch(&message).await?)
    }

    fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        draft_policy_id: Option<String>,
        draft_procedure_id: Option<String>,
    ) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.status = status;
            session.completed_at = Some(Utc::now());
            session.draft_policy_id = draft_policy_id;
            session.draft_procedure_id = draft_procedure_id;
        }
    }

    /// A session by id, if it has not been garbage-collected yet.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<OrchestrationSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Number of sessions currently held.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Removes finished sessions older than the grace period.
    pub fn gc_sessions(&self) -> usize {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.session_grace).unwrap_or_default();
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter_map(|session| {
                let completed_at = session.completed_at?;
                (now - completed_at > grace).then(|| session.session_id.clone())
            })
            .collect();
        let count = stale.len();
        for session_id in stale {
            self.sessions.remove(&session_id);
        }
        if count > 0 {
            debug!(count, "Garbage-collected orchestration sessions");
        }
        count
    }

    /// Runs the periodic session GC until `shutdown` is cancelled.
    pub fn spawn_gc(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = ticker.tick() => {
                        coordinator.gc_sessions();
                    }
                }
            }
            debug!("Session GC stopped");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::catalog::ToolCatalog;
    use crate::governance::procedure::tests::minimal_procedure;
    use crate::governance::store::tests::MemorySource;
    use crate::governance::store::{GovernanceSource, SourceError};
    use crate::orchestration::similarity::LexicalMetric;
    use async_trait::async_trait;

    struct Fixture {
        store: Arc<GovernanceStore>,
        audit: Arc<AuditLog>,
        coordinator: Arc<OrchestrationCoordinator>,
    }

    fn fixture_with_source(source: Arc<dyn GovernanceSource>) -> Fixture {
        let store = Arc::new(GovernanceStore::new(source, Duration::from_secs(300), 32));
        let catalog = Arc::new(ToolCatalog::new([
            ("upload-dataset-rows".to_string(), OperationKind::Write),
            ("create-dataset".to_string(), OperationKind::Write),
            ("get-dataset-output".to_string(), OperationKind::Read),
        ]));
        let analyzer = Arc::new(SimilarityAnalyzer::new(
            Arc::clone(&store),
            catalog,
            LexicalMetric::Jaccard,
            0.75,
            0.6,
            Duration::from_secs(300),
        ));
        let audit = Arc::new(AuditLog::new(None, 128, Duration::from_millis(1)));
        let coordinator = Arc::new(OrchestrationCoordinator::new(
            analyzer,
            Arc::new(AgentBus::new(3)),
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::new(SimulatedAuthor),
            Duration::from_secs(60),
        ));
        Fixture {
            store,
            audit,
            coordinator,
        }
    }

    fn fixture(procedures: &[Procedure]) -> Fixture {
        fixture_with_source(Arc::new(MemorySource::with_procedures(procedures)))
    }

    fn request(tool: &str) -> AnalysisRequest {
        AnalysisRequest::from_call(
            tool,
            OperationKind::Write,
            &serde_json::json!({"dataset_id": "d1", "rows": []}),
        )
    }

    #[tokio::test]
    async fn empty_corpus_drafts_policy_and_procedure() {
        let fixture = fixture(&[]);
        let outcome = fixture
            .coordinator
            .orchestrate(request("upload-dataset-rows"))
            .await
            .unwrap();

        let OrchestrationOutcome::Drafted {
            session_id,
            draft_policy_id,
            draft_procedure_id,
            recommendations,
        } = outcome
        else {
            panic!("expected drafts");
        };
        assert_eq!(draft_policy_id.as_deref(), Some("pol-upload-dataset-rows"));
        assert_eq!(
            draft_procedure_id.as_deref(),
            Some("proc-upload-dataset-rows")
        );
        assert_eq!(recommendations.len(), 2);

        // Drafts landed in the corpus, inactive
        let (policies, procedures) = fixture.store.corpus();
        assert_eq!(policies.len(), 1);
        assert_eq!(procedures.len(), 1);
        assert_eq!(procedures[0].status, ProcedureStatus::Draft);

        let session = fixture.coordinator.session(&session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.messages.len(), 2);
        assert!(session.participants.contains(POLICY_AUTHOR_ROLE));
        assert!(session.participants.contains(PROCEDURE_AUTHOR_ROLE));
    }

    #[tokio::test]
    async fn covering_draft_is_reused_not_duplicated() {
        // A prior session's draft already covers the tool with near-identical
        // wording; a second gap for the same tool must not draft a copy.
        let mut existing = minimal_procedure("proc-upload-dataset-rows", "upload-dataset-rows");
        existing.name = "upload-dataset-rows governance".to_string();
        existing.description = "upload dataset rows dataset id rows".to_string();
        existing
            .trigger
            .operation_kinds
            .insert(OperationKind::Write);
        existing.status = ProcedureStatus::Draft;

        let fixture = fixture(&[existing]);
        fixture.store.refresh().await.unwrap();

        let outcome = fixture
            .coordinator
            .orchestrate(request("upload-dataset-rows"))
            .await
            .unwrap();

        let OrchestrationOutcome::Reuse {
            procedure_id,
            score,
            ..
        } = outcome
        else {
            panic!("expected reuse");
        };
        assert_eq!(procedure_id, "proc-upload-dataset-rows");
        assert!(score >= 0.75);
        // Only the seeded procedure exists; nothing new was written
        let (policies, procedures) = fixture.store.corpus();
        assert!(policies.is_empty());
        assert_eq!(procedures.len(), 1);
    }

    #[tokio::test]
    async fn extendable_policy_skips_policy_draft() {
        let source = MemorySource::new();
        source.policies.lock().unwrap().push(
            serde_json::to_string(&Policy {
                id: "pol-writes".to_string(),
                name: "Write governance".to_string(),
                purpose: "upload dataset rows dataset id".to_string(),
                rules: vec![],
                tools: BTreeSet::new(),
                operation_kinds: BTreeSet::from([OperationKind::Write]),
                status: ProcedureStatus::Active,
            })
            .unwrap(),
        );
        let fixture = fixture_with_source(Arc::new(source));
        fixture.store.refresh().await.unwrap();

        let outcome = fixture
            .coordinator
            .orchestrate(request("upload-dataset-rows"))
            .await
            .unwrap();

        let OrchestrationOutcome::Drafted {
            draft_policy_id,
            draft_procedure_id,
            recommendations,
            ..
        } = outcome
        else {
            panic!("expected drafts");
        };
        assert!(draft_policy_id.is_none(), "existing policy should be extended");
        assert!(draft_procedure_id.is_some());
        assert!(recommendations[0].contains("pol-writes"));
    }

    #[tokio::test]
    async fn rejected_draft_fails_the_session() {
        struct RejectingSource;

        #[async_trait]
        impl GovernanceSource for RejectingSource {
            async fn fetch_procedure(&self, _id: &str) -> Result<Option<String>, SourceError> {
                Ok(None)
            }
            async fn fetch_procedures(&self) -> Result<Vec<String>, SourceError> {
                Ok(Vec::new())
            }
            async fn fetch_policies(&self) -> Result<Vec<String>, SourceError> {
                Ok(Vec::new())
            }
            async fn store_draft(&self, _draft: &GovernanceDraft) -> Result<(), SourceError> {
                Err(SourceError::WriteRejected {
                    reason: "corpus is read-only".to_string(),
                })
            }
        }

        let fixture = fixture_with_source(Arc::new(RejectingSource));
        let err = fixture
            .coordinator
            .orchestrate(request("upload-dataset-rows"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Draft { .. }));

        // The failure is visible on the session and in the audit trail
        let failures = fixture.audit.recent(
            10,
            &AuditFilter {
                kind: Some(AuditEventKind::OrchestrationCompleted),
                ..Default::default()
            },
        );
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].outcome, AuditOutcome::Failure);
    }

    #[tokio::test]
    async fn gc_removes_finished_sessions_after_grace() {
        let store = Arc::new(GovernanceStore::new(
            Arc::new(MemorySource::new()),
            Duration::from_secs(300),
            32,
        ));
        let analyzer = Arc::new(SimilarityAnalyzer::new(
            Arc::clone(&store),
            Arc::new(ToolCatalog::default()),
            LexicalMetric::Jaccard,
            0.75,
            0.6,
            Duration::from_secs(300),
        ));
        let coordinator = Arc::new(OrchestrationCoordinator::new(
            analyzer,
            Arc::new(AgentBus::new(3)),
            store,
            Arc::new(AuditLog::new(None, 16, Duration::from_millis(1))),
            Arc::new(SimulatedAuthor),
            Duration::ZERO,
        ));

        coordinator
            .orchestrate(request("upload-dataset-rows"))
            .await
            .unwrap();
        assert_eq!(coordinator.session_count(), 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(coordinator.gc_sessions(), 1);
        assert_eq!(coordinator.session_count(), 0);
    }

    #[test]
    fn simulated_drafts_are_deterministic_and_valid() {
        let author = SimulatedAuthor;
        let request = request("upload-dataset-rows");
        let analysis = GovernanceAnalysis {
            tool: request.tool.clone(),
            operation_kind: request.operation_kind,
            similar_policies: vec![],
            similar_procedures: vec![],
            recommendation: crate::orchestration::similarity::Recommendation::Create,
            needs_new_policy: true,
            needs_new_procedure: true,
        };

        let first = author.draft_procedure(&request, &analysis, None);
        let second = author.draft_procedure(&request, &analysis, None);
        assert_eq!(first, second);
        assert!(first.validate().is_ok());
        assert_eq!(first.status, ProcedureStatus::Draft);
        // Writes get an approval step between briefing and execution
        assert!(matches!(first.steps[1].kind, StepKind::Approval { .. }));

        let policy = author.draft_policy(&request, &analysis);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.status, ProcedureStatus::Draft);
    }
}
