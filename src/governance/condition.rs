//! Skip-condition expressions.
//!
//! Conditions are a small, well-defined expression tree (field reference,
//! literal comparison, boolean connectives) evaluated against a typed scope
//! of run context and prior step responses. Field paths are dotted and
//! rooted at `context` or `responses`, e.g. `context.environment` or
//! `responses.sign-off.approved`.
//!
//! Evaluation fails closed: a missing field or a type mismatch makes the
//! condition false, it never errors and never skips a step by accident.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One skip-condition expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Condition {
    /// Field equals the literal
    Eq {
        field: String,
        value: serde_json::Value,
    },
    /// Field differs from the literal (missing fields compare unequal)
    Ne {
        field: String,
        value: serde_json::Value,
    },
    /// Numeric field is strictly greater than the literal
    Gt { field: String, value: f64 },
    /// Numeric field is strictly less than the literal
    Lt { field: String, value: f64 },
    /// Field is present (and not null)
    Exists { field: String },
    /// Every sub-condition holds
    All { conditions: Vec<Condition> },
    /// At least one sub-condition holds
    Any { conditions: Vec<Condition> },
    /// The sub-condition does not hold
    Not { condition: Box<Condition> },
}

/// What conditions are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    /// Free-form context passed at run start
    pub context: &'a serde_json::Value,
    /// Recorded responses keyed by step id
    pub responses: &'a BTreeMap<String, serde_json::Value>,
}

impl Condition {
    /// Evaluates the condition against the scope.
    #[must_use]
    pub fn eval(&self, scope: &ConditionScope<'_>) -> bool {
        match self {
            Self::Eq { field, value } => resolve(field, scope).is_some_and(|v| v == value),
            Self::Ne { field, value } => resolve(field, scope) != Some(value),
            Self::Gt { field, value } => resolve(field, scope)
                .and_then(serde_json::Value::as_f64)
                .is_some_and(|v| v > *value),
            Self::Lt { field, value } => resolve(field, scope)
                .and_then(serde_json::Value::as_f64)
                .is_some_and(|v| v < *value),
            Self::Exists { field } => resolve(field, scope).is_some_and(|v| !v.is_null()),
            Self::All { conditions } => conditions.iter().all(|c| c.eval(scope)),
            Self::Any { conditions } => conditions.iter().any(|c| c.eval(scope)),
            Self::Not { condition } => !condition.eval(scope),
        }
    }
}

/// Resolves a dotted field path within the scope.
///
/// The first segment selects the root (`context` or `responses`); anything
/// else resolves to nothing.
fn resolve<'a>(path: &str, scope: &ConditionScope<'a>) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    let mut current: &serde_json::Value = match root {
        "context" => scope.context,
        "responses" => {
            let step_id = segments.next()?;
            scope.responses.get(step_id)?
        }
        _ => return None,
    };
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope_with(
        context: &serde_json::Value,
        responses: &BTreeMap<String, serde_json::Value>,
    ) -> ConditionScope<'static> {
        // Tests leak intentionally to build a 'static scope without clutter.
        ConditionScope {
            context: Box::leak(Box::new(context.clone())),
            responses: Box::leak(Box::new(responses.clone())),
        }
    }

    #[test]
    fn eq_on_context_field() {
        let scope = scope_with(&json!({"environment": "staging"}), &BTreeMap::new());
        let cond = Condition::Eq {
            field: "context.environment".to_string(),
            value: json!("staging"),
        };
        assert!(cond.eval(&scope));
    }

    #[test]
    fn missing_field_fails_closed() {
        let scope = scope_with(&json!({}), &BTreeMap::new());
        let cond = Condition::Eq {
            field: "context.environment".to_string(),
            value: json!("staging"),
        };
        assert!(!cond.eval(&scope));
        // but Ne treats missing as unequal
        let cond = Condition::Ne {
            field: "context.environment".to_string(),
            value: json!("staging"),
        };
        assert!(cond.eval(&scope));
    }

    #[test]
    fn response_paths_resolve_by_step_id() {
        let responses = BTreeMap::from([(
            "sign-off".to_string(),
            json!({"approved": true, "count": 2}),
        )]);
        let scope = scope_with(&json!({}), &responses);

        let approved = Condition::Eq {
            field: "responses.sign-off.approved".to_string(),
            value: json!(true),
        };
        assert!(approved.eval(&scope));

        let enough = Condition::Gt {
            field: "responses.sign-off.count".to_string(),
            value: 1.0,
        };
        assert!(enough.eval(&scope));
    }

    #[test]
    fn connectives_compose() {
        let scope = scope_with(&json!({"env": "dev", "dry_run": true}), &BTreeMap::new());
        let cond = Condition::All {
            conditions: vec![
                Condition::Eq {
                    field: "context.env".to_string(),
                    value: json!("dev"),
                },
                Condition::Not {
                    condition: Box::new(Condition::Eq {
                        field: "context.dry_run".to_string(),
                        value: json!(false),
                    }),
                },
            ],
        };
        assert!(cond.eval(&scope));
    }

    #[test]
    fn non_numeric_comparison_fails_closed() {
        let scope = scope_with(&json!({"env": "dev"}), &BTreeMap::new());
        let cond = Condition::Lt {
            field: "context.env".to_string(),
            value: 10.0,
        };
        assert!(!cond.eval(&scope));
    }

    #[test]
    fn unknown_root_resolves_to_nothing() {
        let scope = scope_with(&json!({"a": 1}), &BTreeMap::new());
        let cond = Condition::Exists {
            field: "globals.a".to_string(),
        };
        assert!(!cond.eval(&scope));
    }

    #[test]
    fn conditions_deserialize_from_yaml() {
        let yaml = r#"
op: any
conditions:
  - op: eq
    field: context.env
    value: dev
  - op: exists
    field: responses.brief
"#;
        let cond: Condition = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(cond, Condition::Any { .. }));
    }
}
