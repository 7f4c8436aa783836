//! Procedure definitions: triggers, steps, and structural validation.
//!
//! A procedure is an ordered governance workflow gating one or more tools or
//! operation kinds. Definitions arrive from the governance source as YAML or
//! JSON documents, are validated fail-closed at load, and are immutable once
//! a run has been started against them.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{OperationKind, ToolCatalog};
use crate::governance::condition::Condition;

/// Legal shape of a trigger tool entry: a concrete name, `prefix-*`, or `*`.
static TOOL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\*|[A-Za-z0-9][A-Za-z0-9_.-]*\*?)$").unwrap());

// ============================================================================
// Structural Validation Errors
// ============================================================================

/// A malformed procedure or step definition. Rejected at load; a definition
/// that fails validation never becomes active.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("definition could not be parsed: {reason}")]
    Parse { reason: String },

    #[error("procedure is missing required field '{field}'")]
    MissingField { field: String },

    #[error("procedure '{procedure_id}' has no steps")]
    EmptySteps { procedure_id: String },

    #[error("procedure '{procedure_id}' triggers on no tool and no operation kind")]
    NoTrigger { procedure_id: String },

    #[error("procedure '{procedure_id}' has an invalid trigger pattern '{pattern}'")]
    BadPattern {
        procedure_id: String,
        pattern: String,
    },

    #[error("procedure '{procedure_id}' declares duplicate step id '{step_id}'")]
    DuplicateStepId {
        procedure_id: String,
        step_id: String,
    },

    #[error("step '{step_id}' in procedure '{procedure_id}' is invalid: {reason}")]
    BadStep {
        procedure_id: String,
        step_id: String,
        reason: String,
    },
}

// ============================================================================
// Trigger
// ============================================================================

/// What a procedure applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Tool names, optionally with a trailing `*` wildcard
    #[serde(default)]
    pub tools: BTreeSet<String>,
    /// Operation kinds the procedure governs
    #[serde(default)]
    pub operation_kinds: BTreeSet<OperationKind>,
    /// Whether the procedure is enforced on read operations too
    #[serde(default)]
    pub enforce_on_read: bool,
}

impl TriggerSpec {
    /// Expands the trigger's tool patterns into concrete names.
    #[must_use]
    pub fn expanded_tools(&self, catalog: &ToolCatalog) -> BTreeSet<String> {
        self.tools
            .iter()
            .flat_map(|pattern| catalog.expand_pattern(pattern))
            .collect()
    }

    /// Returns true if this trigger names `tool` directly (after wildcard
    /// expansion), as opposed to matching only via operation kind.
    #[must_use]
    pub fn governs_tool(&self, tool: &str, catalog: &ToolCatalog) -> bool {
        self.expanded_tools(catalog).contains(tool)
    }

    /// Returns true if this trigger covers `kind`.
    #[must_use]
    pub fn governs_kind(&self, kind: OperationKind) -> bool {
        self.operation_kinds.contains(&kind)
    }
}

// ============================================================================
// Steps
// ============================================================================

/// What a `Wait` step waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitKind {
    /// A fixed duration elapses
    Time,
    /// An external condition evaluates true (polled)
    External,
    /// A confirmation is submitted with the step response
    Confirmation,
}

/// Where a validation rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    #[default]
    Input,
    Output,
}

/// A declarative check run before or after a `Tool` step's dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(default)]
    pub target: RuleTarget,
    /// Dotted path into the checked value
    pub field: String,
    /// Field must be present
    #[serde(default)]
    pub required: bool,
    /// Field must equal this value when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
}

/// Rollback operation dispatched when a `Tool` step fails after side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatingAction {
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Declared follow-up invoked after a step settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ContinuationHook {
    /// Emit a log line with the given message
    Log { message: String },
    /// Best-effort dispatch of a tool; failures are logged, never raised
    Dispatch {
        tool: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// The kind-specific payload of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    /// Dispatch an operation against the platform
    Tool {
        tool_name: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        validation_rules: Vec<ValidationRule>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compensating_action: Option<CompensatingAction>,
    },
    /// Knowledge check answered with the step response
    Quiz {
        question: String,
        /// Multi-answer quizzes compare as sets
        correct_answers: BTreeSet<String>,
        #[serde(default)]
        explanation: String,
    },
    /// Consume approver decisions submitted with the step response
    Approval {
        approvers: BTreeSet<String>,
        min_approvals: usize,
    },
    /// Suspend until time passes, a condition holds, or a confirmation lands
    Wait {
        kind: WaitKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
        #[serde(default = "default_poll_interval_secs")]
        poll_interval_secs: u64,
        #[serde(default = "default_wait_timeout_secs")]
        timeout_secs: u64,
        /// Name of the external condition to probe
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    /// Present content, optionally requiring acknowledgment
    Information {
        content: String,
        #[serde(default)]
        acknowledgment_required: bool,
    },
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_wait_timeout_secs() -> u64 {
    60
}

/// One unit of a procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default)]
    pub max_retries: u32,
    /// Any condition holding skips the step without side effects
    #[serde(default)]
    pub skip_conditions: Vec<Condition>,
    /// Step-scoped allow-list narrowing the procedure's governed tool set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<ContinuationHook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<ContinuationHook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_timeout: Option<ContinuationHook>,
    #[serde(flatten)]
    pub kind: StepKind,
}

// ============================================================================
// Procedure
// ============================================================================

/// Lifecycle status of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureStatus {
    /// Created but not reviewed; never applicable, never startable
    Draft,
    /// Reviewed and enforceable
    Active,
}

/// An ordered governance workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: TriggerSpec,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub owner: String,
    pub status: ProcedureStatus,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Procedure {
    /// Parses a YAML or JSON document into a validated procedure.
    pub fn parse_document(raw: &str) -> Result<Self, StructuralError> {
        let procedure: Procedure = if raw.trim_start().starts_with('{') {
            serde_json::from_str(raw).map_err(|e| StructuralError::Parse {
                reason: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(raw).map_err(|e| StructuralError::Parse {
                reason: e.to_string(),
            })?
        };
        procedure.validate()?;
        Ok(procedure)
    }

    /// Structural validation. A procedure that fails here never activates.
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.id.trim().is_empty() {
            return Err(StructuralError::MissingField {
                field: "id".to_string(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(StructuralError::MissingField {
                field: "name".to_string(),
            });
        }
        if self.steps.is_empty() {
            return Err(StructuralError::EmptySteps {
                procedure_id: self.id.clone(),
            });
        }
        if self.trigger.tools.is_empty() && self.trigger.operation_kinds.is_empty() {
            return Err(StructuralError::NoTrigger {
                procedure_id: self.id.clone(),
            });
        }
        for pattern in &self.trigger.tools {
            if !TOOL_PATTERN.is_match(pattern) {
                return Err(StructuralError::BadPattern {
                    procedure_id: self.id.clone(),
                    pattern: pattern.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(StructuralError::BadStep {
                    procedure_id: self.id.clone(),
                    step_id: step.id.clone(),
                    reason: "empty step id".to_string(),
                });
            }
            if !seen.insert(step.id.clone()) {
                return Err(StructuralError::DuplicateStepId {
                    procedure_id: self.id.clone(),
                    step_id: step.id.clone(),
                });
            }
            self.validate_step(step)?;
        }
        Ok(())
    }

    fn validate_step(&self, step: &Step) -> Result<(), StructuralError> {
        let bad = |reason: &str| StructuralError::BadStep {
            procedure_id: self.id.clone(),
            step_id: step.id.clone(),
            reason: reason.to_string(),
        };
        match &step.kind {
            StepKind::Tool { tool_name, .. } => {
                if tool_name.trim().is_empty() {
                    return Err(bad("tool step names no tool"));
                }
            }
            StepKind::Quiz {
                correct_answers, ..
            } => {
                if correct_answers.is_empty() {
                    return Err(bad("quiz has no correct answers"));
                }
            }
            StepKind::Approval {
                approvers,
                min_approvals,
            } => {
                if approvers.is_empty() {
                    return Err(bad("approval step has no approvers"));
                }
                if *min_approvals == 0 || *min_approvals > approvers.len() {
                    return Err(bad("min_approvals out of range"));
                }
            }
            StepKind::Wait {
                kind,
                duration_secs,
                timeout_secs,
                condition,
                ..
            } => {
                if *kind == WaitKind::Time && duration_secs.is_none() {
                    return Err(bad("time wait has no duration"));
                }
                if *kind == WaitKind::External && condition.is_none() {
                    return Err(bad("external wait names no condition"));
                }
                if *timeout_secs == 0 {
                    return Err(bad("wait timeout must be positive"));
                }
            }
            StepKind::Information { content, .. } => {
                if content.trim().is_empty() {
                    return Err(bad("information step has no content"));
                }
            }
        }
        Ok(())
    }

    /// The step at `index`, if any.
    #[must_use]
    pub fn step_at(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Returns true if any step is an approval.
    #[must_use]
    pub fn has_approval_step(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.kind, StepKind::Approval { .. }))
    }

    /// Text used for lexical similarity against incoming requests.
    #[must_use]
    pub fn purpose_text(&self) -> String {
        format!("{} {}", self.name, self.description)
    }
}
