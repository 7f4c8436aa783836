//! The callable-tool catalog and the operation dispatcher boundary.
//!
//! The catalog is the gate's view of the remote platform: the set of
//! concrete tool names and whether each is a read or a write. Wildcard
//! trigger patterns in procedure definitions expand against it. The
//! dispatcher trait is the narrow seam to the platform client; `Tool` steps
//! are the only callers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Operation Kind
// ============================================================================

/// Whether a tool reads from or writes to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Read-side operation
    Read,
    /// Write-side operation; always governed
    Write,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

// ============================================================================
// Tool Catalog
// ============================================================================

/// The known tool names and their operation kinds.
///
/// Populated at bootstrap from the platform's operation catalog (an external
/// collaborator). Unknown tools are treated as writes by callers, so an
/// incomplete catalog fails closed.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, OperationKind>,
}

impl ToolCatalog {
    /// Builds a catalog from `(name, kind)` pairs.
    #[must_use]
    pub fn new(tools: impl IntoIterator<Item = (String, OperationKind)>) -> Self {
        Self {
            tools: tools.into_iter().collect(),
        }
    }

    /// Returns true if `name` is a known concrete tool.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Returns the operation kind of a known tool.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<OperationKind> {
        self.tools.get(name).copied()
    }

    /// Expands a trigger pattern into the concrete tool names it matches.
    ///
    /// Only trailing-`*` patterns are wildcards: `get-*` matches every
    /// catalog entry starting with `get-`, a bare `*` matches everything,
    /// and any other string matches itself exactly (whether or not the
    /// catalog knows it; a procedure may govern a tool the platform has not
    /// registered yet).
    #[must_use]
    pub fn expand_pattern(&self, pattern: &str) -> Vec<String> {
        if pattern == "*" {
            return self.tools.keys().cloned().collect();
        }
        if let Some(prefix) = pattern.strip_suffix('*') {
            return self
                .tools
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect();
        }
        vec![pattern.to_string()]
    }

    /// Iterates over the concrete tool names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Number of catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ============================================================================
// Operation Dispatcher
// ============================================================================

/// Error from the underlying platform operation.
#[derive(Debug, Error, Clone)]
#[error("dispatch of '{tool}' failed: {reason}")]
pub struct DispatchError {
    /// Tool whose dispatch failed
    pub tool: String,
    /// Platform error text
    pub reason: String,
    /// Whether the caller may retry
    pub retriable: bool,
}

/// Executes the underlying business operation for a tool.
///
/// Implemented by the platform HTTP client (out of scope here). `Tool`-kind
/// steps are the only call sites inside the gate.
#[async_trait]
pub trait OperationDispatcher: Send + Sync {
    /// Executes `tool` with the merged parameters and returns its result.
    async fn dispatch(
        &self,
        tool: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ToolCatalog {
        ToolCatalog::new([
            ("get-dataset-output".to_string(), OperationKind::Read),
            ("get-dataset-schema".to_string(), OperationKind::Read),
            ("create-dataset".to_string(), OperationKind::Write),
            ("upload-dataset-rows".to_string(), OperationKind::Write),
        ])
    }

    #[test]
    fn exact_pattern_matches_itself() {
        let expanded = catalog().expand_pattern("create-dataset");
        assert_eq!(expanded, vec!["create-dataset".to_string()]);
    }

    #[test]
    fn trailing_wildcard_expands_against_catalog() {
        let expanded = catalog().expand_pattern("get-*");
        assert_eq!(
            expanded,
            vec![
                "get-dataset-output".to_string(),
                "get-dataset-schema".to_string()
            ]
        );
    }

    #[test]
    fn bare_wildcard_matches_everything() {
        assert_eq!(catalog().expand_pattern("*").len(), 4);
    }

    #[test]
    fn unknown_exact_name_still_matches_itself() {
        let expanded = catalog().expand_pattern("delete-dataset");
        assert_eq!(expanded, vec!["delete-dataset".to_string()]);
    }

    #[test]
    fn kind_lookup() {
        let catalog = catalog();
        assert_eq!(catalog.kind_of("create-dataset"), Some(OperationKind::Write));
        assert_eq!(
            catalog.kind_of("get-dataset-output"),
            Some(OperationKind::Read)
        );
        assert_eq!(catalog.kind_of("nope"), None);
    }
}
