//! Run-token validation and hijack detection.
//!
//! Given a claimed run token and a requested tool, the validator decides
//! whether the token authorizes the call. Violations are structured results,
//! never errors: nothing here throws past the authorization boundary, so
//! the caller can always produce a safe denial. Every branch, granted or
//! violated, is appended to the audit log with full context.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditEventKind, AuditLog, AuditOutcome};
use crate::catalog::{OperationKind, ToolCatalog};
use crate::governance::procedure::{Procedure, StepKind};
use crate::governance::registry::RunRegistry;
use crate::governance::run::{ProcedureRun, RunId};
use crate::governance::store::GovernanceStore;

// ============================================================================
// Violations
// ============================================================================

/// Classification of a detected misuse of a run token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// A token minted for one procedure was presented for a tool outside
    /// that procedure's governed set
    TokenHijack,
    /// The run cannot authorize this tool for a non-hijack reason
    UnauthorizedTool,
    /// The token resolves to no live run
    ExpiredRun,
    /// The current step's allow-list excludes the tool
    InvalidStep,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenHijack => write!(f, "token-hijack"),
            Self::UnauthorizedTool => write!(f, "unauthorized-tool"),
            Self::ExpiredRun => write!(f, "expired-run"),
            Self::InvalidStep => write!(f, "invalid-step"),
        }
    }
}

/// A detected attempt to use a run token outside its authorized scope.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub attempted_tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_id: Option<String>,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of validating a run token against a requested tool.
#[derive(Debug, Clone)]
pub struct Validation {
    pub is_valid: bool,
    pub reason: Option<String>,
    pub violation: Option<Violation>,
    /// The resolved run, when validation succeeded
    pub run: Option<Arc<ProcedureRun>>,
}

impl Validation {
    fn valid(run: Arc<ProcedureRun>) -> Self {
        Self {
            is_valid: true,
            reason: None,
            violation: None,
            run: Some(run),
        }
    }

    fn violated(violation: Violation) -> Self {
        Self {
            is_valid: false,
            reason: Some(violation.message.clone()),
            violation: Some(violation),
            run: None,
        }
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Decides whether a claimed run token authorizes a tool call.
pub struct RunIdValidator {
    registry: Arc<RunRegistry>,
    store: Arc<GovernanceStore>,
    catalog: Arc<ToolCatalog>,
    audit: Arc<AuditLog>,
}

impl RunIdValidator {
    #[must_use]
    pub fn new(
        registry: Arc<RunRegistry>,
        store: Arc<GovernanceStore>,
        catalog: Arc<ToolCatalog>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            registry,
            store,
            catalog,
            audit,
        }
    }

    /// Validates a claimed token against a requested tool call.
    ///
    /// The sequence:
    /// 1. resolve the run; absent or past expiry is an `expired-run`
    /// 2. expand the run's procedure triggers into its governed tool set
    /// 3. a tool outside the governed set is a `token-hijack`
    /// 4. a tool outside the current step's allow-list is `invalid-step`
    /// 5. writes additionally require the procedure's declared approval and
    ///    compensation requirements to be satisfiable
    pub async fn validate(
        &self,
        run_id: &RunId,
        tool: &str,
        kind: OperationKind,
    ) -> Validation {
        // 1. Resolve the run. A token for a missing, expired, or terminal
        // run authorizes nothing.
        let run = match self.registry.get(run_id) {
            Ok(run) if run.is_live() => run,
            Ok(run) => {
                return self.reject(Violation {
                    kind: ViolationKind::ExpiredRun,
                    attempted_tool: tool.to_string(),
                    run_id: Some(run_id.to_string()),
                    procedure_id: Some(run.procedure_id.clone()),
                    message: format!(
                        "run '{run_id}' is {} and authorizes nothing",
                        run.status
                    ),
                });
            }
            Err(_) => {
                return self.reject(Violation {
                    kind: ViolationKind::ExpiredRun,
                    attempted_tool: tool.to_string(),
                    run_id: Some(run_id.to_string()),
                    procedure_id: None,
                    message: format!("run '{run_id}' does not exist or has been purged"),
                });
            }
        };

        // 2. Resolve the procedure and expand the governed tool set.
        let procedure = match self.store.load(&run.procedure_id).await {
            Ok(procedure) => procedure,
            Err(e) => {
                return self.reject(Violation {
                    kind: ViolationKind::UnauthorizedTool,
                    attempted_tool: tool.to_string(),
                    run_id: Some(run_id.to_string()),
                    procedure_id: Some(run.procedure_id.clone()),
                    message: format!(
                        "procedure '{}' backing this run is unavailable: {e}",
                        run.procedure_id
                    ),
                });
            }
        };
        let governed = procedure.trigger.expanded_tools(&self.catalog);

        // 3. The hijack check. This is the primary defense against reusing
        // a token minted for one workflow to authorize an unrelated one.
        if !governed.contains(tool) {
            return self.reject(Violation {
                kind: ViolationKind::TokenHijack,
                attempted_tool: tool.to_string(),
                run_id: Some(run_id.to_string()),
                procedure_id: Some(procedure.id.clone()),
                message: format!(
                    "run '{run_id}' was minted for procedure '{}' which does not govern '{tool}'",
                    procedure.id
                ),
            });
        }

        // 4. Step-scoped allow-list.
        if let Some(step) = procedure.step_at(run.cursor)
            && let Some(allowed) = &step.allowed_tools
            && !allowed.contains(tool)
        {
            return self.reject(Violation {
                kind: ViolationKind::InvalidStep,
                attempted_tool: tool.to_string(),
                run_id: Some(run_id.to_string()),
                procedure_id: Some(procedure.id.clone()),
                message: format!(
                    "current step '{}' restricts tools and does not allow '{tool}'",
                    step.id
                ),
            });
        }

        // 5. Write operations: declared approval and compensation
        // requirements must still be satisfiable from here.
        if kind == OperationKind::Write
            && let Some(message) = self.write_requirements_gap(&procedure, &run)
        {
            return self.reject(Violation {
                kind: ViolationKind::UnauthorizedTool,
                attempted_tool: tool.to_string(),
                run_id: Some(run_id.to_string()),
                procedure_id: Some(procedure.id.clone()),
                message,
            });
        }

        info!(
            run_id = %run_id,
            tool = %tool,
            procedure_id = %procedure.id,
            "Run token validated"
        );
        self.audit.record(
            AuditEntry::new(
                AuditEventKind::AuthorizationGranted,
                AuditOutcome::Success,
                "run token covers the requested tool",
            )
            .tool(tool)
            .run(run_id.to_string())
            .procedure(procedure.id.clone()),
        );
        Validation::valid(run)
    }

    /// Returns a gap description when a write cannot be covered by this
    /// run's remaining procedure, or `None` when it can.
    fn write_requirements_gap(&self, procedure: &Procedure, run: &ProcedureRun) -> Option<String> {
        // Declared approvals must be behind us or still ahead of the cursor.
        if procedure.has_approval_step() {
            let satisfiable = procedure.steps.iter().enumerate().any(|(i, step)| {
                matches!(step.kind, StepKind::Approval { .. })
                    && (run.completed_steps.contains(&step.id) || i >= run.cursor)
            });
            if !satisfiable {
                return Some(
                    "procedure declares an approval step that was bypassed".to_string(),
                );
            }
        }
        // Declared compensating actions must name dispatchable tools.
        for step in &procedure.steps {
            if let StepKind::Tool {
                compensating_action: Some(action),
                ..
            } = &step.kind
                && !self.catalog.contains(&action.tool)
            {
                return Some(format!(
                    "compensating action names unknown tool '{}'",
                    action.tool
                ));
            }
        }
        None
    }

    fn reject(&self, violation: Violation) -> Validation {
        warn!(
            kind = %violation.kind,
            tool = %violation.attempted_tool,
            run_id = violation.run_id.as_deref().unwrap_or("-"),
            "Security violation detected"
        );
        let mut entry = AuditEntry::violation(
            violation.message.clone(),
            serde_json::to_value(&violation).unwrap_or_default(),
        )
        .tool(violation.attempted_tool.clone());
        if let Some(run_id) = &violation.run_id {
            entry = entry.run(run_id.clone());
        }
        if let Some(procedure_id) = &violation.procedure_id {
            entry = entry.procedure(procedure_id.clone());
        }
        self.audit.record(entry);
        Validation::violated(violation)
    }
}

// ============================================================================
// Tests
// ============================================================================
