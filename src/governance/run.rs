//! Procedure runs: the opaque run token, the run state machine, and step
//! results.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::governance::procedure::Procedure;

// ============================================================================
// Run Id
// ============================================================================

/// Prefix for gate-minted run tokens.
pub const RUN_ID_PREFIX: &str = "run_";

/// Length of the nanoid body (excluding prefix).
pub const RUN_ID_BODY_LENGTH: usize = 21;

/// Opaque, unguessable run token.
///
/// Format: `run_<nanoid>` with a 21-character body. The token is the only
/// thing a caller holds; everything it authorizes is derived server-side
/// from the run it resolves to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId(String);

impl RunId {
    /// Mints a fresh random run token.
    #[must_use]
    pub fn new() -> Self {
        let body = nanoid::nanoid!(RUN_ID_BODY_LENGTH);
        Self(format!("{RUN_ID_PREFIX}{body}"))
    }

    /// Wraps a caller-supplied token without validation. Whether it
    /// resolves to anything is the validator's problem.
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns true if the token carries the gate's mint prefix.
    #[must_use]
    pub fn is_gate_minted(&self) -> bool {
        self.0.starts_with(RUN_ID_PREFIX)
    }

    /// The raw string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self(s))
    }
}

// ============================================================================
// Run Status
// ============================================================================

/// Run lifecycle status.
///
/// State machine transitions:
/// - Active → Completed (last step advanced)
/// - Active → Failed (step failed or run cancelled)
/// - Active → Expired (TTL exceeded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    /// Terminal states are immutable.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Checks if a transition from this status to another is valid.
    #[must_use]
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Active, RunStatus::Completed)
                | (RunStatus::Active, RunStatus::Failed)
                | (RunStatus::Active, RunStatus::Expired)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

// ============================================================================
// Step Result
// ============================================================================

/// Outcome of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

/// Recorded result of executing a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl StepResult {
    #[must_use]
    pub fn success(step_id: impl Into<String>, response: Option<serde_json::Value>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Success,
            response,
            error: None,
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn failure(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failure,
            response: None,
            error: Some(error.into()),
            at: Utc::now(),
        }
    }

    #[must_use]
    pub fn skipped(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            response: None,
            error: None,
            at: Utc::now(),
        }
    }
}

// ============================================================================
// Run Errors
// ============================================================================

/// Errors from run state operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("run '{run_id}' not found")]
    NotFound { run_id: RunId },

    #[error("run '{run_id}' has expired")]
    Expired { run_id: RunId },

    #[error("run '{run_id}' is already in terminal state '{status}'")]
    AlreadyTerminal { run_id: RunId, status: RunStatus },

    #[error("invalid transition for run '{run_id}': {from} -> {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
}

// ============================================================================
// Procedure Run
// ============================================================================

/// One in-flight or completed instance of a procedure.
///
/// Exclusively owned and mutated by the engine through the registry; every
/// mutation is persisted (debounced). The snapshot form round-trips
/// losslessly across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRun {
    pub run_id: RunId,
    pub procedure_id: String,
    pub procedure_name: String,
    /// Index of the next step to execute; monotonically non-decreasing
    pub cursor: usize,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Ids of steps that have settled (success or skipped), in order
    pub completed_steps: Vec<String>,
    /// Recorded responses keyed by step id
    pub responses: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Free-form context passed at start
    pub context: serde_json::Value,
}

impl ProcedureRun {
    /// Creates a new active run against `procedure`.
    #[must_use]
    pub fn new(procedure: &Procedure, context: serde_json::Value, ttl: Duration) -> Self {
        let now = Utc::now();
        let chrono_ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self {
            run_id: RunId::new(),
            procedure_id: procedure.id.clone(),
            procedure_name: procedure.name.clone(),
            cursor: 0,
            status: RunStatus::Active,
            status_reason: None,
            completed_steps: Vec::new(),
            responses: BTreeMap::new(),
            created_at: now,
            expires_at: now + chrono_ttl,
            context,
        }
    }

    /// Returns true if the run is past its absolute expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns true if the run is active and not past expiry. This is the
    /// only definition of "active" any read path may use.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status == RunStatus::Active && !self.is_expired()
    }

    /// Transitions the run to a new status.
    pub fn transition(
        &mut self,
        new_status: RunStatus,
        reason: Option<String>,
    ) -> Result<(), RunError> {
        if self.status.is_terminal() {
            return Err(RunError::AlreadyTerminal {
                run_id: self.run_id.clone(),
                status: self.status,
            });
        }
        if !self.status.can_transition_to(new_status) {
            return Err(RunError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.status,
                to: new_status,
            });
        }
        self.status = new_status;
        self.status_reason = reason;
        Ok(())
    }

    /// Records a settled step and its response. Does not move the cursor;
    /// the engine owns cursor movement.
    pub fn record_step(&mut self, result: &StepResult) {
        self.completed_steps.push(result.step_id.clone());
        if let Some(response) = &result.response {
            self.responses
                .insert(result.step_id.clone(), response.clone());
        }
    }
}
