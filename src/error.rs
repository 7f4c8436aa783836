//! Top-level error taxonomy for the gate.
//!
//! Module-specific errors (`StoreError`, `RunError`, `ExecuteError`,
//! `OrchestrationError`) live next to the code that raises them; this module
//! aggregates them into [`GateError`] for callers that cross component
//! boundaries.
//!
//! Security violations are deliberately *not* an error variant. They are
//! structured results ([`crate::governance::validator::Validation`]) so that
//! the validator can never accidentally leak one past the authorization
//! boundary as an unhandled error.

use thiserror::Error;

use crate::governance::executor::ExecuteError;
use crate::governance::procedure::StructuralError;
use crate::governance::run::RunError;
use crate::governance::store::StoreError;
use crate::orchestration::coordinator::OrchestrationError;

/// All error types that can cross a component boundary.
#[derive(Debug, Error)]
pub enum GateError {
    /// A procedure or step definition failed structural validation at load.
    /// The definition never activates.
    #[error(transparent)]
    Structural(#[from] StructuralError),

    /// Authorization was denied. Recoverable by starting or advancing the
    /// named procedure.
    #[error("authorization denied for '{tool}': {reason}")]
    Denied {
        /// The tool that was denied
        tool: String,
        /// Procedure that would satisfy the requirement, if known
        procedure_id: Option<String>,
        /// Human-readable procedure name, if known
        procedure_name: Option<String>,
        /// Why the operation was denied
        reason: String,
    },

    /// Governance definition loading or lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Run state machine operation failed.
    #[error(transparent)]
    Run(#[from] RunError),

    /// A step execution failed (dispatch error, wrong answer, timeout, ...).
    #[error(transparent)]
    Execution(#[from] ExecuteError),

    /// The governance-gap orchestration pipeline failed. The original
    /// request stays blocked with the raw denial reason.
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    /// Durable state could not be written.
    #[error("persistence failed at '{path}': {reason}")]
    Persistence {
        /// Path that could not be written
        path: String,
        /// Underlying IO error text
        reason: String,
    },
}
