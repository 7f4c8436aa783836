//! datagate - Governance gate for dataset-platform tool calls.
//!
//! Write-side operations against the remote dataset platform are authorized
//! only when a declared, multi-step governance procedure has been started
//! and advanced. The platform client itself is a thin collaborator behind
//! [`catalog::OperationDispatcher`]; the substance of this crate is the
//! governance engine around it.
//!
//! # Decision Flow
//!
//! An inbound call reaches [`authorize::Authorizer::authorize`] and takes
//! one of three paths:
//!
//! - **Token path:** a `__runId` argument is validated by
//!   [`governance::RunIdValidator`], which expands the run's procedure
//!   triggers into the governed tool set and rejects anything outside it as
//!   a token hijack.
//! - **Requirement path:** without a token, [`governance::ProcedureEngine`]
//!   classifies the call as in-progress, start-required, or ungoverned.
//! - **Orchestration path:** an ungoverned write goes to
//!   [`orchestration::OrchestrationCoordinator`], which either points at an
//!   existing similar procedure or drafts new policy and procedure
//!   artifacts for external review.
//!
//! Every decision, transition, and violation lands in [`audit::AuditLog`]
//! as an append-only, day-partitioned JSONL trail.
//!
//! # Runtime Shape
//!
//! All services are constructed once by [`authorize::Authorizer::bootstrap`]
//! and passed as explicit dependencies. Periodic work (run expiry sweep,
//! snapshot persistence, audit flushing, bus draining, session GC) runs as
//! cancellable background tasks that never block the request path.

pub mod audit;
pub mod authorize;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod error;
pub mod governance;
pub mod orchestration;

pub use audit::{AuditEntry, AuditEventKind, AuditFilter, AuditLog, AuditOutcome, AuditSeverity};
pub use authorize::{Authorization, Authorizer, RUN_ID_ARG};
pub use capability::{CapabilityMint, SystemCapability};
pub use catalog::{DispatchError, OperationDispatcher, OperationKind, ToolCatalog};
pub use config::{GateConfig, RetryConfig};
pub use error::GateError;
pub use governance::{
    ConditionProbe, ExecuteError, GovernanceDraft, GovernanceSource, Procedure, ProcedureEngine,
    ProcedureRun, ProcedureStatus, Requirement, RunId, RunIdValidator, RunRegistry, RunStatus,
    Step, StepExecutor, StepKind, StepResult, StepStatus, StructuralError, TriggerSpec,
    Validation, Violation, ViolationKind,
};
pub use orchestration::{
    AgentBus, AgentMessage, LexicalMetric, OrchestrationCoordinator, OrchestrationError,
    OrchestrationOutcome, Recommendation, SimilarityAnalyzer,
};
