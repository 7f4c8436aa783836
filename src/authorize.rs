//! The authorization entry point and control surface.
//!
//! Every inbound tool call funnels through [`Authorizer::authorize`]. A
//! `__runId` argument takes precedence and is checked exclusively by the
//! run-token validator; without one, the engine classifies what governance
//! the call requires, and a write with no governance at all triggers
//! orchestration. The answer is always a structured [`Authorization`], never
//! an error: a caller that cannot be authorized gets a denial it can act on.
//!
//! The authorizer also owns the capability mint. Trusted bootstrap code may
//! request a [`SystemCapability`] once and use it to bypass read-gating for
//! system operations; writes are never bypassed.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::{AuditEntry, AuditEventKind, AuditLog, AuditOutcome};
use crate::capability::{CapabilityMint, SystemCapability};
use crate::catalog::{OperationDispatcher, OperationKind, ToolCatalog};
use crate::config::GateConfig;
use crate::error::GateError;
use crate::governance::engine::{ProcedureEngine, Requirement};
use crate::governance::executor::{ConditionProbe, StepExecutor};
use crate::governance::procedure::Step;
use crate::governance::registry::RunRegistry;
use crate::governance::run::{ProcedureRun, RunId};
use crate::governance::store::{GovernanceSource, GovernanceStore, RefreshStats};
use crate::governance::validator::{RunIdValidator, Violation};
use crate::orchestration::bus::AgentBus;
use crate::orchestration::coordinator::{
    OrchestrationCoordinator, OrchestrationOutcome, SimulatedAuthor,
};
use crate::orchestration::similarity::{AnalysisRequest, SimilarityAnalyzer};

/// Argument key carrying a claimed run token.
pub const RUN_ID_ARG: &str = "__runId";

// ============================================================================
// Decision
// ============================================================================

/// The answer to one authorization call.
#[derive(Debug, Clone, Serialize)]
pub struct Authorization {
    pub allowed: bool,
    /// Procedure that satisfies (or satisfied) the requirement, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_name: Option<String>,
    /// Run token relevant to the decision, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Present when the denial was a detected security violation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<Violation>,
}

impl Authorization {
    fn allowed() -> Self {
        Self {
            allowed: true,
            procedure_id: None,
            procedure_name: None,
            run_id: None,
            reason: None,
            violation: None,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            procedure_id: None,
            procedure_name: None,
            run_id: None,
            reason: Some(reason.into()),
            violation: None,
        }
    }

    fn procedure(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.procedure_id = Some(id.into());
        self.procedure_name = Some(name.into());
        self
    }

    fn run(mut self, run_id: &RunId) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }
}

// ============================================================================
// Authorizer
// ============================================================================

/// Front door of the gate: authorization plus the run control surface.
pub struct Authorizer {
    engine: Arc<ProcedureEngine>,
    validator: Arc<RunIdValidator>,
    coordinator: Arc<OrchestrationCoordinator>,
    registry: Arc<RunRegistry>,
    store: Arc<GovernanceStore>,
    bus: Arc<AgentBus>,
    catalog: Arc<ToolCatalog>,
    audit: Arc<AuditLog>,
    mint: CapabilityMint,
    config: GateConfig,
}

impl Authorizer {
    /// Wires every gate service from its collaborators and configuration.
    ///
    /// Construct once at process start; all services are plain dependencies
    /// of the returned authorizer, so tests can build isolated instances.
    /// Call [`Authorizer::spawn_background`] afterwards to start the
    /// sweeper, flusher, persister, drainer, and session GC.
    #[must_use]
    pub fn bootstrap(
        config: GateConfig,
        source: Arc<dyn GovernanceSource>,
        dispatcher: Arc<dyn OperationDispatcher>,
        probe: Arc<dyn ConditionProbe>,
        catalog: ToolCatalog,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let audit = Arc::new(AuditLog::new(
            config.audit_dir.clone(),
            config.audit_ring_capacity,
            config.audit_flush_debounce,
        ));
        let registry = Arc::new(RunRegistry::new(
            config.snapshot_path.clone(),
            config.persist_debounce,
        ));
        match registry.restore() {
            Ok(0) => {}
            Ok(count) => info!(count, "Restored procedure runs from snapshot"),
            Err(e) => tracing::warn!(error = %e, "Run snapshot restore failed; starting empty"),
        }
        let store = Arc::new(GovernanceStore::new(
            source,
            config.store_cache_ttl,
            config.store_cache_capacity,
        ));
        let executor = Arc::new(StepExecutor::new(dispatcher, probe, config.retry));
        let engine = Arc::new(ProcedureEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            executor,
            Arc::clone(&catalog),
            Arc::clone(&audit),
            config.run_ttl,
            config.run_retention,
        ));
        let validator = Arc::new(RunIdValidator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&catalog),
            Arc::clone(&audit),
        ));
        let analyzer = Arc::new(SimilarityAnalyzer::new(
            Arc::clone(&store),
            Arc::clone(&catalog),
            config.similarity_metric,
            config.reuse_threshold,
            config.extend_threshold,
            config.analysis_cache_ttl,
        ));
        let bus = Arc::new(AgentBus::new(config.bus_max_attempts));
        let coordinator = Arc::new(OrchestrationCoordinator::new(
            analyzer,
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::new(SimulatedAuthor),
            config.session_grace,
        ));

        Self {
            engine,
            validator,
            coordinator,
            registry,
            store,
            bus,
            catalog,
            audit,
            mint: CapabilityMint::new(),
            config,
        }
    }

    /// Starts the background tasks: run sweeper, snapshot persister, audit
    /// flusher, bus drainer, and session GC. All stop when `shutdown` is
    /// cancelled; the persister and flusher drain once more on the way out.
    pub fn spawn_background(
        &self,
        shutdown: &CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.engine
                .spawn_sweeper(self.config.sweep_interval, shutdown.clone()),
            self.registry.spawn_persister(shutdown.clone()),
            self.audit.spawn_flusher(shutdown.clone()),
            self.bus
                .spawn_drainer(self.config.bus_drain_interval, shutdown.clone()),
            self.coordinator
                .spawn_gc(self.config.sweep_interval, shutdown.clone()),
        ]
    }

    /// Issues the system capability. Call once from trusted bootstrap code
    /// and hand the value only to components that may bypass read-gating.
    #[must_use]
    pub fn issue_system_capability(&self) -> SystemCapability {
        self.mint.issue()
    }

    /// Loads the full governance corpus into the store cache.
    pub async fn refresh_governance(&self) -> Result<RefreshStats, GateError> {
        Ok(self.store.refresh().await?)
    }

    /// Authorizes one inbound tool call.
    pub async fn authorize(&self, tool: &str, args: &serde_json::Value) -> Authorization {
        self.decide(tool, args, None).await
    }

    /// Authorizes a system operation. A verified capability bypasses
    /// read-gating only; writes go through the full decision path.
    pub async fn authorize_system(
        &self,
        capability: &SystemCapability,
        tool: &str,
        args: &serde_json::Value,
    ) -> Authorization {
        self.decide(tool, args, Some(capability)).await
    }

    async fn decide(
        &self,
        tool: &str,
        args: &serde_json::Value,
        capability: Option<&SystemCapability>,
    ) -> Authorization {
        // Unknown tools are treated as writes: an incomplete catalog must
        // fail closed.
        let kind = self
            .catalog
            .kind_of(tool)
            .unwrap_or(OperationKind::Write);

        // A claimed token takes precedence and is checked exclusively by the
        // validator, which audits every branch itself.
        if let Some(raw) = args.get(RUN_ID_ARG).and_then(serde_json::Value::as_str) {
            let run_id = RunId::from_raw(raw);
            let validation = self.validator.validate(&run_id, tool, kind).await;
            if validation.is_valid {
                let mut decision = Authorization::allowed().run(&run_id);
                if let Some(run) = validation.run {
                    decision = decision.procedure(&run.procedure_id, &run.procedure_name);
                }
                return decision;
            }
            let mut decision = Authorization::blocked(
                validation
                    .reason
                    .unwrap_or_else(|| "run token rejected".to_string()),
            )
            .run(&run_id);
            decision.violation = validation.violation;
            if let Some(violation) = &decision.violation {
                decision.procedure_id = violation.procedure_id.clone();
            }
            return decision;
        }

        if kind == OperationKind::Read
            && capability.is_some_and(|capability| self.mint.verify(capability))
        {
            debug!(tool, "System capability bypasses read-gating");
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::AuthorizationGranted,
                    AuditOutcome::Success,
                    "system capability holder; read-gating bypassed",
                )
                .actor("system")
                .tool(tool),
            );
            return Authorization::allowed();
        }

        match self
            .engine
            .check_requirement(tool, kind, &BTreeSet::new())
        {
            Requirement::InProgress {
                run_id,
                procedure_id,
                procedure_name,
            } => {
                let reason = format!(
                    "procedure '{procedure_name}' is in progress; advance it and retry with its run token"
                );
                self.audit_denied(tool, &reason, Some(&procedure_id));
                Authorization::blocked(reason)
                    .procedure(procedure_id, procedure_name)
                    .run(&run_id)
            }
            Requirement::StartRequired {
                procedure_id,
                procedure_name,
            } => {
                let reason = format!(
                    "procedure '{procedure_name}' must be started before calling '{tool}'"
                );
                self.audit_denied(tool, &reason, Some(&procedure_id));
                Authorization::blocked(reason).procedure(procedure_id, procedure_name)
            }
            Requirement::NoGovernance => {
                if kind == OperationKind::Read {
                    self.audit.record(
                        AuditEntry::new(
                            AuditEventKind::AuthorizationGranted,
                            AuditOutcome::Success,
                            "no governance applies to this read",
                        )
                        .tool(tool),
                    );
                    return Authorization::allowed();
                }
                self.orchestrate_gap(tool, kind, args).await
            }
        }
    }

    /// A write with no governance: orchestrate, then deny with instructions.
    async fn orchestrate_gap(
        &self,
        tool: &str,
        kind: OperationKind,
        args: &serde_json::Value,
    ) -> Authorization {
        let request = AnalysisRequest::from_call(tool, kind, args);
        match self.coordinator.orchestrate(request).await {
            Ok(OrchestrationOutcome::Reuse {
                procedure_id,
                procedure_name,
                ..
            }) => {
                let reason = format!(
                    "procedure '{procedure_name}' already covers '{tool}'; start or await review of it instead of drafting new governance"
                );
                self.audit_denied(tool, &reason, Some(&procedure_id));
                Authorization::blocked(reason).procedure(procedure_id, procedure_name)
            }
            Ok(OrchestrationOutcome::Drafted {
                draft_procedure_id,
                recommendations,
                ..
            }) => {
                let reason = format!(
                    "no governance covered '{tool}'; draft governance was created and awaits review. Retry once promoted. {}",
                    recommendations.join(" ")
                );
                self.audit_denied(tool, &reason, draft_procedure_id.as_deref());
                let mut decision = Authorization::blocked(reason);
                decision.procedure_id = draft_procedure_id;
                decision
            }
            Err(e) => {
                // Surface the raw denial; never fabricate a success.
                let reason = format!(
                    "write '{tool}' is blocked: no governance applies and orchestration failed ({e})"
                );
                self.audit_denied(tool, &reason, None);
                Authorization::blocked(reason)
            }
        }
    }

    fn audit_denied(&self, tool: &str, reason: &str, procedure_id: Option<&str>) {
        let mut entry = AuditEntry::new(
            AuditEventKind::AuthorizationDenied,
            AuditOutcome::Blocked,
            reason.to_string(),
        )
        .tool(tool);
        if let Some(procedure_id) = procedure_id {
            entry = entry.procedure(procedure_id);
        }
        self.audit.record(entry);
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Starts a run of `procedure_id`, returning the run with its token.
    pub async fn start(
        &self,
        procedure_id: &str,
        context: serde_json::Value,
    ) -> Result<Arc<ProcedureRun>, GateError> {
        self.engine.start(procedure_id, context, None).await
    }

    /// The run and its current step, or `None` for a finished run.
    pub async fn resume(
        &self,
        run_id: &RunId,
    ) -> Result<(Arc<ProcedureRun>, Option<Step>), GateError> {
        self.engine.resume(run_id).await
    }

    /// Submits a response for the run's current step and advances it.
    pub async fn submit(
        &self,
        run_id: &RunId,
        response: Option<serde_json::Value>,
    ) -> Result<Arc<ProcedureRun>, GateError> {
        self.engine.execute_current(run_id, response).await
    }

    /// All live runs.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ProcedureRun>> {
        self.engine.list()
    }

    /// Cancels an active run.
    pub fn cancel(&self, run_id: &RunId, reason: &str) -> Result<(), GateError> {
        self.engine.cancel(run_id, reason)
    }

    /// The audit log, for queries and shutdown flushing.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The run registry, for shutdown persistence.
    #[must_use]
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }
}

// ============================================================================
// Tests
// ============================================================================
