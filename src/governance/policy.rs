//! Policy definitions.
//!
//! A policy is the "why" behind one or more procedures: a purpose statement
//! and a rule list scoped to tools and operation kinds. The gate does not
//! evaluate policies at call time; they exist for the similarity analyzer
//! and as parents of drafted procedures.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::catalog::OperationKind;
use crate::governance::procedure::{ProcedureStatus, StructuralError};

/// A governance policy document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    /// What the policy is for; the similarity analyzer's lexical input
    pub purpose: String,
    #[serde(default)]
    pub rules: Vec<String>,
    /// Tools the policy speaks about
    #[serde(default)]
    pub tools: BTreeSet<String>,
    #[serde(default)]
    pub operation_kinds: BTreeSet<OperationKind>,
    pub status: ProcedureStatus,
}

impl Policy {
    /// Parses a YAML or JSON policy document.
    pub fn parse_document(raw: &str) -> Result<Self, StructuralError> {
        let policy: Policy = if raw.trim_start().starts_with('{') {
            serde_json::from_str(raw).map_err(|e| StructuralError::Parse {
                reason: e.to_string(),
            })?
        } else {
            serde_yaml::from_str(raw).map_err(|e| StructuralError::Parse {
                reason: e.to_string(),
            })?
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Structural validation.
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
        Ok(())
    }
}
