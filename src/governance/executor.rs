//! Step execution with retry and backoff.
//!
//! The executor runs one step of a procedure: it evaluates skip conditions,
//! dispatches by step kind, fires the declared continuation hook, and wraps
//! the whole thing in a retry loop for steps marked retryable. Step
//! *failures* (a wrong quiz answer, a rejected dispatch, a wait that timed
//! out) are returned as [`ExecuteError`] values; the engine converts them
//! into failure step results and run transitions.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{DispatchError, OperationDispatcher};
use crate::config::RetryConfig;
use crate::governance::condition::ConditionScope;
use crate::governance::procedure::{
    CompensatingAction, ContinuationHook, RuleTarget, Step, StepKind, ValidationRule, WaitKind,
};
use crate::governance::run::StepResult;

/// Maximum jitter added to a retry delay, as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.3;

// ============================================================================
// Execution Errors
// ============================================================================

/// Why a step did not succeed.
#[derive(Debug, Error, Clone)]
pub enum ExecuteError {
    /// A validation rule rejected the input or output.
    #[error("step '{step_id}' validation failed on '{field}': {reason}")]
    Validation {
        step_id: String,
        field: String,
        reason: String,
    },

    /// The dispatched platform operation failed.
    #[error("step '{step_id}': {source}")]
    Dispatch {
        step_id: String,
        #[source]
        source: DispatchError,
    },

    /// Submitted quiz answers did not match.
    #[error("step '{step_id}': submitted answer is incorrect")]
    WrongAnswer { step_id: String },

    /// Not enough (or invalid) approver decisions.
    #[error("step '{step_id}': {got} of {needed} required approvals")]
    InsufficientApprovals {
        step_id: String,
        needed: usize,
        got: usize,
    },

    /// An approver explicitly rejected.
    #[error("step '{step_id}': rejected by '{approver}'")]
    ApprovalRejected { step_id: String, approver: String },

    /// A wait condition never became true within budget.
    #[error("step '{step_id}': wait timed out after {waited_secs}s")]
    Timeout { step_id: String, waited_secs: u64 },

    /// Required confirmation or acknowledgment was not submitted.
    #[error("step '{step_id}': {what} not received")]
    MissingInput { step_id: String, what: String },

    /// The external condition probe itself failed.
    #[error("step '{step_id}': condition probe failed: {reason}")]
    Probe { step_id: String, reason: String },
}

impl ExecuteError {
    /// Whether a retry could plausibly change the outcome.
    ///
    /// Only transient dispatch and probe failures qualify. Wrong answers,
    /// rejections, missing input, and timeouts are deterministic for a
    /// given submission.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Dispatch { source, .. } => source.retriable,
            Self::Probe { .. } => true,
            _ => false,
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Evaluates named external conditions for `Wait` steps.
#[async_trait]
pub trait ConditionProbe: Send + Sync {
    /// Returns true once the named condition holds.
    async fn check(&self, condition: &str, context: &serde_json::Value) -> Result<bool, String>;
}

/// What a step executes against: run context, prior responses, and the
/// response submitted for this step (quiz answers, approvals, ...).
#[derive(Debug, Clone)]
pub struct StepInput {
    /// Response submitted with the advance call, if any
    pub response: Option<serde_json::Value>,
    /// Run context captured at start
    pub context: serde_json::Value,
    /// Responses of previously settled steps, keyed by step id
    pub prior_responses: std::collections::BTreeMap<String, serde_json::Value>,
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Computes capped exponential backoff delays.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Deterministic delay before retry `attempt` (1-based):
    /// `min(base * multiplier^(attempt-1), cap)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.config.multiplier.powi(exp.min(63) as i32);
        let raw = self.config.base.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.config.cap.as_secs_f64()))
    }

    /// `delay_for` plus up to 30% random jitter, so synchronized callers
    /// do not retry in lockstep.
    #[must_use]
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..JITTER_FRACTION);
        base.mul_f64(1.0 + jitter)
    }
}

// ============================================================================
// Step Executor
// ============================================================================

/// Executes steps against the platform dispatcher and condition probe.
pub struct StepExecutor {
    dispatcher: Arc<dyn OperationDispatcher>,
    probe: Arc<dyn ConditionProbe>,
    retry: RetryPolicy,
}

impl StepExecutor {
    #[must_use]
    pub fn new(
        dispatcher: Arc<dyn OperationDispatcher>,
        probe: Arc<dyn ConditionProbe>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            dispatcher,
            probe,
            retry: RetryPolicy::new(retry),
        }
    }

    /// Returns the retry policy (used by tests and the engine for audit
    /// metadata).
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Executes one step once.
    ///
    /// Skip conditions are evaluated first; a skipped step has no side
    /// effects. On success or failure the matching continuation hook fires
    /// (best-effort).
    pub async fn execute(&self, step: &Step, input: &StepInput) -> Result<StepResult, ExecuteError> {
        let scope = ConditionScope {
            context: &input.context,
            responses: &input.prior_responses,
        };
        if step.skip_conditions.iter().any(|c| c.eval(&scope)) {
            debug!(step_id = %step.id, "Skip condition held; step skipped");
            return Ok(StepResult::skipped(&step.id));
        }

        let outcome = match &step.kind {
            StepKind::Tool {
                tool_name,
                params,
                validation_rules,
                compensating_action,
            } => {
                self.execute_tool(
                    step,
                    tool_name,
                    params,
                    validation_rules,
                    compensating_action.as_ref(),
                    input,
                )
                .await
            }
            StepKind::Quiz {
                correct_answers, ..
            } => execute_quiz(step, correct_answers, input),
            StepKind::Approval {
                approvers,
                min_approvals,
            } => execute_approval(step, approvers, *min_approvals, input),
            StepKind::Wait {
                kind,
                duration_secs,
                poll_interval_secs,
                timeout_secs,
                condition,
            } => {
                self.execute_wait(
                    step,
                    *kind,
                    *duration_secs,
                    *poll_interval_secs,
                    *timeout_secs,
                    condition.as_deref(),
                    input,
                )
                .await
            }
            StepKind::Information {
                acknowledgment_required,
                ..
            } => execute_information(step, *acknowledgment_required, input),
        };

        match &outcome {
            Ok(_) => self.fire_hook(step.on_success.as_ref(), step).await,
            Err(ExecuteError::Timeout { .. }) => {
                self.fire_hook(step.on_timeout.as_ref(), step).await;
            }
            Err(_) => self.fire_hook(step.on_failure.as_ref(), step).await,
        }
        outcome
    }

    /// Executes a step, retrying transient failures of retryable steps.
    ///
    /// Delay between attempts follows capped exponential backoff plus
    /// jitter. A non-retryable failure returns immediately.
    pub async fn execute_with_retry(
        &self,
        step: &Step,
        input: &StepInput,
    ) -> Result<StepResult, ExecuteError> {
        let max_attempts = if step.retryable {
            step.max_retries.saturating_add(1)
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            match self.execute(step, input).await {
                Ok(result) => return Ok(result),
                Err(e) if step.retryable && e.is_retriable() && attempt < max_attempts => {
                    let delay = self.retry.jittered_delay_for(attempt);
                    warn!(
                        step_id = %step.id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_tool(
        &self,
        step: &Step,
        tool_name: &str,
        declared_params: &serde_json::Value,
        rules: &[ValidationRule],
        compensating: Option<&CompensatingAction>,
        input: &StepInput,
    ) -> Result<StepResult, ExecuteError> {
        let params = merge_params(declared_params, input.response.as_ref());
        apply_rules(step, rules, RuleTarget::Input, &params)?;

        let output = match self.dispatcher.dispatch(tool_name, &params).await {
            Ok(output) => output,
            Err(source) => {
                // The operation may have partially applied; run the declared
                // rollback before reporting the failure.
                if let Some(action) = compensating {
                    self.run_compensation(step, action).await;
                }
                return Err(ExecuteError::Dispatch {
                    step_id: step.id.clone(),
                    source,
                });
            }
        };

        if let Err(e) = apply_rules(step, rules, RuleTarget::Output, &output) {
            if let Some(action) = compensating {
                self.run_compensation(step, action).await;
            }
            return Err(e);
        }
        Ok(StepResult::success(&step.id, Some(output)))
    }

    async fn execute_wait(
        &self,
        step: &Step,
        kind: WaitKind,
        duration_secs: Option<u64>,
        poll_interval_secs: u64,
        timeout_secs: u64,
        condition: Option<&str>,
        input: &StepInput,
    ) -> Result<StepResult, ExecuteError> {
        match kind {
            WaitKind::Time => {
                let duration = Duration::from_secs(duration_secs.unwrap_or(0));
                tokio::time::sleep(duration).await;
                Ok(StepResult::success(&step.id, None))
            }
            WaitKind::External => {
                let condition = condition.unwrap_or_default();
                let poll_interval = Duration::from_secs(poll_interval_secs.max(1));
                let deadline =
                    tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

                loop {
                    match self.probe.check(condition, &input.context).await {
                        Ok(true) => return Ok(StepResult::success(&step.id, None)),
                        Ok(false) => {}
                        Err(reason) => {
                            return Err(ExecuteError::Probe {
                                step_id: step.id.clone(),
                                reason,
                            });
                        }
                    }
                    if tokio::time::Instant::now() + poll_interval > deadline {
                        return Err(ExecuteError::Timeout {
                            step_id: step.id.clone(),
                            waited_secs: timeout_secs,
                        });
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
            WaitKind::Confirmation => {
                let confirmed = input
                    .response
                    .as_ref()
                    .and_then(|r| r.get("confirmed"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if confirmed {
                    Ok(StepResult::success(&step.id, None))
                } else {
                    Err(ExecuteError::MissingInput {
                        step_id: step.id.clone(),
                        what: "confirmation".to_string(),
                    })
                }
            }
        }
    }

    async fn run_compensation(&self, step: &Step, action: &CompensatingAction) {
        info!(
            step_id = %step.id,
            tool = %action.tool,
            "Running compensating action"
        );
        if let Err(e) = self.dispatcher.dispatch(&action.tool, &action.params).await {
            warn!(
                step_id = %step.id,
                tool = %action.tool,
                error = %e,
                "Compensating action failed"
            );
        }
    }

    async fn fire_hook(&self, hook: Option<&ContinuationHook>, step: &Step) {
        match hook {
            None => {}
            Some(ContinuationHook::Log { message }) => {
                info!(step_id = %step.id, "{message}");
            }
            Some(ContinuationHook::Dispatch { tool, params }) => {
                if let Err(e) = self.dispatcher.dispatch(tool, params).await {
                    warn!(
                        step_id = %step.id,
                        tool = %tool,
                        error = %e,
                        "Continuation dispatch failed"
                    );
                }
            }
        }
    }
}

// ============================================================================
// Kind-specific helpers
// ============================================================================

fn execute_quiz(
    step: &Step,
    correct_answers: &BTreeSet<String>,
    input: &StepInput,
) -> Result<StepResult, ExecuteError> {
    let submitted = extract_answers(input.response.as_ref());
    let correct: BTreeSet<String> = correct_answers.iter().map(|a| normalize(a)).collect();
    // Multi-answer quizzes compare as sets
    if submitted == correct {
        Ok(StepResult::success(
            &step.id,
            Some(serde_json::json!({"correct": true})),
        ))
    } else {
        Err(ExecuteError::WrongAnswer {
            step_id: step.id.clone(),
        })
    }
}

fn execute_approval(
    step: &Step,
    approvers: &BTreeSet<String>,
    min_approvals: usize,
    input: &StepInput,
) -> Result<StepResult, ExecuteError> {
    let decisions = input
        .response
        .as_ref()
        .and_then(|r| r.get("approvals"))
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut granted: BTreeSet<String> = BTreeSet::new();
    for decision in &decisions {
        let Some(approver) = decision.get("approver").and_then(serde_json::Value::as_str)
        else {
            continue;
        };
        // Decisions from outside the declared approver set carry no weight
        if !approvers.contains(approver) {
            continue;
        }
        let approved = decision
            .get("approved")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if !approved {
            return Err(ExecuteError::ApprovalRejected {
                step_id: step.id.clone(),
                approver: approver.to_string(),
            });
        }
        granted.insert(approver.to_string());
    }

    if granted.len() >= min_approvals {
        Ok(StepResult::success(
            &step.id,
            Some(serde_json::json!({"approved_by": granted})),
        ))
    } else {
        Err(ExecuteError::InsufficientApprovals {
            step_id: step.id.clone(),
            needed: min_approvals,
            got: granted.len(),
        })
    }
}

fn execute_information(
    step: &Step,
    acknowledgment_required: bool,
    input: &StepInput,
) -> Result<StepResult, ExecuteError> {
    let acknowledged = input
        .response
        .as_ref()
        .and_then(|r| r.get("acknowledged"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if acknowledgment_required && !acknowledged {
        return Err(ExecuteError::MissingInput {
            step_id: step.id.clone(),
            what: "acknowledgment".to_string(),
        });
    }
    Ok(StepResult::success(
        &step.id,
        Some(serde_json::json!({"acknowledged": acknowledged})),
    ))
}

/// Collects submitted answers from `"answer": "B"` or `"answers": [...]`.
fn extract_answers(response: Option<&serde_json::Value>) -> BTreeSet<String> {
    let Some(response) = response else {
        return BTreeSet::new();
    };
    if let Some(answer) = response.get("answer").and_then(serde_json::Value::as_str) {
        return BTreeSet::from([normalize(answer)]);
    }
    response
        .get("answers")
        .and_then(serde_json::Value::as_array)
        .map(|answers| {
            answers
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(normalize)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize(answer: &str) -> String {
    answer.trim().to_lowercase()
}

/// Overlays the submitted response object onto the declared params.
fn merge_params(
    declared: &serde_json::Value,
    submitted: Option<&serde_json::Value>,
) -> serde_json::Value {
    match (declared, submitted) {
        (serde_json::Value::Object(base), Some(serde_json::Value::Object(overlay))) => {
            let mut merged = base.clone();
            for (k, v) in overlay {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        (_, Some(submitted)) if !declared.is_object() => submitted.clone(),
        _ => declared.clone(),
    }
}

fn apply_rules(
    step: &Step,
    rules: &[ValidationRule],
    target: RuleTarget,
    value: &serde_json::Value,
) -> Result<(), ExecuteError> {
    for rule in rules.iter().filter(|r| r.target == target) {
        let field_value = lookup(value, &rule.field);
        if rule.required && field_value.is_none() {
            return Err(ExecuteError::Validation {
                step_id: step.id.clone(),
                field: rule.field.clone(),
                reason: "required field missing".to_string(),
            });
        }
        if let (Some(expected), Some(actual)) = (&rule.equals, field_value)
            && expected != actual
        {
            return Err(ExecuteError::Validation {
                step_id: step.id.clone(),
                field: rule.field.clone(),
                reason: format!("expected {expected}, found {actual}"),
            });
        }
    }
    Ok(())
}

fn lookup<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::governance::condition::Condition;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Dispatcher recording calls; fails tools listed in `fail`.
    pub(crate) struct MockDispatcher {
        pub calls: Mutex<Vec<String>>,
        pub fail: Mutex<Option<DispatchError>>,
        pub fail_times: AtomicU32,
    }

    impl MockDispatcher {
        pub(crate) fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: Mutex::new(None),
                fail_times: AtomicU32::new(0),
            }
        }

        pub(crate) fn failing(reason: &str, retriable: bool, times: u32) -> Self {
            let dispatcher = Self::new();
            *dispatcher.fail.lock().unwrap() = Some(DispatchError {
                tool: String::new(),
                reason: reason.to_string(),
                retriable,
            });
            dispatcher.fail_times.store(times, Ordering::SeqCst);
            dispatcher
        }
    }

    #[async_trait]
    impl OperationDispatcher for MockDispatcher {
        async fn dispatch(
            &self,
            tool: &str,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value, DispatchError> {
            self.calls.lock().unwrap().push(tool.to_string());
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0
                && let Some(template) = self.fail.lock().unwrap().clone()
            {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(DispatchError {
                    tool: tool.to_string(),
                    ..template
                });
            }
            Ok(serde_json::json!({"ok": true, "tool": tool}))
        }
    }

    /// Probe returning true after N checks.
    pub(crate) struct CountdownProbe {
        remaining: AtomicU32,
    }

    impl CountdownProbe {
        pub(crate) fn ready_after(n: u32) -> Self {
            Self {
                remaining: AtomicU32::new(n),
            }
        }
    }

    #[async_trait]
    impl ConditionProbe for CountdownProbe {
        async fn check(
            &self,
            _condition: &str,
            _context: &serde_json::Value,
        ) -> Result<bool, String> {
            let remaining = self.remaining.load(Ordering::SeqCst);
            if remaining == 0 {
                Ok(true)
            } else {
                self.remaining.store(remaining - 1, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    fn executor_with(dispatcher: MockDispatcher, probe: CountdownProbe) -> StepExecutor {
        StepExecutor::new(
            Arc::new(dispatcher),
            Arc::new(probe),
            RetryConfig {
                base: Duration::from_millis(1),
                multiplier: 2.0,
                cap: Duration::from_millis(8),
            },
        )
    }

    fn step(kind: StepKind) -> Step {
        Step {
            id: "s1".to_string(),
            name: "step".to_string(),
            retryable: false,
            max_retries: 0,
            skip_conditions: vec![],
            allowed_tools: None,
            on_success: None,
            on_failure: None,
            on_timeout: None,
            kind,
        }
    }

    fn input(response: Option<serde_json::Value>) -> StepInput {
        StepInput {
            response,
            context: serde_json::json!({}),
            prior_responses: BTreeMap::new(),
        }
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let policy = RetryPolicy::new(RetryConfig {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        });
        let mut previous = Duration::ZERO;
        for attempt in 1..12 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "delay must not decrease");
            assert!(delay <= Duration::from_secs(30), "delay must respect cap");
            previous = delay;
        }
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let policy = RetryPolicy::new(RetryConfig::default());
        for attempt in 1..6 {
            let base = policy.delay_for(attempt);
            let jittered = policy.jittered_delay_for(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base.mul_f64(1.0 + JITTER_FRACTION));
        }
    }

    #[tokio::test]
    async fn quiz_wrong_answer_fails() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Quiz {
            question: "Pick one".to_string(),
            correct_answers: BTreeSet::from(["B".to_string()]),
            explanation: String::new(),
        });

        let err = executor
            .execute(&step, &input(Some(serde_json::json!({"answer": "A"}))))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::WrongAnswer { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn quiz_multi_answer_compares_as_set() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Quiz {
            question: "Pick all".to_string(),
            correct_answers: BTreeSet::from(["a".to_string(), "b".to_string()]),
            explanation: String::new(),
        });

        let result = executor
            .execute(
                &step,
                &input(Some(serde_json::json!({"answers": ["B", " a "]}))),
            )
            .await
            .unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Success);
    }

    #[tokio::test]
    async fn approval_counts_distinct_declared_approvers() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Approval {
            approvers: BTreeSet::from(["alice".to_string(), "bob".to_string()]),
            min_approvals: 2,
        });

        // Duplicate and undeclared approvals do not count
        let err = executor
            .execute(
                &step,
                &input(Some(serde_json::json!({"approvals": [
                    {"approver": "alice", "approved": true},
                    {"approver": "alice", "approved": true},
                    {"approver": "mallory", "approved": true},
                ]}))),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::InsufficientApprovals { needed: 2, got: 1, .. }
        ));

        let result = executor
            .execute(
                &step,
                &input(Some(serde_json::json!({"approvals": [
                    {"approver": "alice", "approved": true},
                    {"approver": "bob", "approved": true},
                ]}))),
            )
            .await
            .unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Success);
    }

    #[tokio::test]
    async fn approval_rejection_fails_immediately() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Approval {
            approvers: BTreeSet::from(["alice".to_string()]),
            min_approvals: 1,
        });

        let err = executor
            .execute(
                &step,
                &input(Some(serde_json::json!({"approvals": [
                    {"approver": "alice", "approved": false},
                ]}))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::ApprovalRejected { .. }));
    }

    #[tokio::test]
    async fn skip_condition_short_circuits_side_effects() {
        let dispatcher = MockDispatcher::new();
        let executor = StepExecutor::new(
            Arc::new(dispatcher),
            Arc::new(CountdownProbe::ready_after(0)),
            RetryConfig::default(),
        );
        let mut step = step(StepKind::Tool {
            tool_name: "create-dataset".to_string(),
            params: serde_json::json!({}),
            validation_rules: vec![],
            compensating_action: None,
        });
        step.skip_conditions = vec![Condition::Eq {
            field: "context.dry_run".to_string(),
            value: serde_json::json!(true),
        }];

        let result = executor
            .execute(
                &step,
                &StepInput {
                    response: None,
                    context: serde_json::json!({"dry_run": true}),
                    prior_responses: BTreeMap::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Skipped);
    }

    #[tokio::test]
    async fn tool_step_merges_params_and_validates_input() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Tool {
            tool_name: "upload-dataset-rows".to_string(),
            params: serde_json::json!({"dataset": "d1"}),
            validation_rules: vec![ValidationRule {
                target: RuleTarget::Input,
                field: "rows".to_string(),
                required: true,
                equals: None,
            }],
            compensating_action: None,
        });

        // Missing required field fails before dispatch
        let err = executor.execute(&step, &input(None)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Validation { .. }));

        // Submitted response supplies it
        let result = executor
            .execute(&step, &input(Some(serde_json::json!({"rows": [1, 2]}))))
            .await
            .unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Success);
    }

    #[tokio::test]
    async fn retryable_step_retries_transient_dispatch_failures() {
        let dispatcher = MockDispatcher::failing("429", true, 2);
        let executor = executor_with(dispatcher, CountdownProbe::ready_after(0));
        let mut step = step(StepKind::Tool {
            tool_name: "create-dataset".to_string(),
            params: serde_json::json!({}),
            validation_rules: vec![],
            compensating_action: None,
        });
        step.retryable = true;
        step.max_retries = 3;

        let result = executor.execute_with_retry(&step, &input(None)).await;
        assert!(result.is_ok(), "third attempt should succeed");
    }

    #[tokio::test]
    async fn non_retryable_step_fails_immediately() {
        let dispatcher = MockDispatcher::failing("schema mismatch", false, 10);
        let executor = executor_with(dispatcher, CountdownProbe::ready_after(0));
        let mut step = step(StepKind::Tool {
            tool_name: "create-dataset".to_string(),
            params: serde_json::json!({}),
            validation_rules: vec![],
            compensating_action: None,
        });
        step.retryable = true;
        step.max_retries = 5;

        let err = executor
            .execute_with_retry(&step, &input(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Dispatch { .. }));
    }

    #[tokio::test]
    async fn failed_tool_step_runs_compensating_action() {
        let dispatcher = Arc::new(MockDispatcher::failing("boom", false, 1));
        let executor = StepExecutor::new(
            Arc::clone(&dispatcher) as _,
            Arc::new(CountdownProbe::ready_after(0)),
            RetryConfig::default(),
        );
        let step = step(StepKind::Tool {
            tool_name: "upload-dataset-rows".to_string(),
            params: serde_json::json!({}),
            validation_rules: vec![],
            compensating_action: Some(CompensatingAction {
                tool: "delete-dataset-rows".to_string(),
                params: serde_json::json!({}),
            }),
        });

        let err = executor.execute(&step, &input(None)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Dispatch { .. }));
        let calls = dispatcher.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["upload-dataset-rows", "delete-dataset-rows"]);
    }

    #[tokio::test(start_paused = true)]
    async fn external_wait_polls_until_ready() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(2));
        let step = step(StepKind::Wait {
            kind: WaitKind::External,
            duration_secs: None,
            poll_interval_secs: 1,
            timeout_secs: 10,
            condition: Some("table-exists".to_string()),
        });

        let result = executor.execute(&step, &input(None)).await.unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn external_wait_times_out() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(u32::MAX));
        let step = step(StepKind::Wait {
            kind: WaitKind::External,
            duration_secs: None,
            poll_interval_secs: 1,
            timeout_secs: 3,
            condition: Some("never".to_string()),
        });

        let err = executor.execute(&step, &input(None)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Timeout { waited_secs: 3, .. }));
    }

    #[tokio::test]
    async fn confirmation_wait_requires_confirmed_flag() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Wait {
            kind: WaitKind::Confirmation,
            duration_secs: None,
            poll_interval_secs: 1,
            timeout_secs: 10,
            condition: None,
        });

        let err = executor.execute(&step, &input(None)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::MissingInput { .. }));

        let result = executor
            .execute(&step, &input(Some(serde_json::json!({"confirmed": true}))))
            .await
            .unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Success);
    }

    #[tokio::test]
    async fn information_enforces_acknowledgment() {
        let executor = executor_with(MockDispatcher::new(), CountdownProbe::ready_after(0));
        let step = step(StepKind::Information {
            content: "irreversible".to_string(),
            acknowledgment_required: true,
        });

        let err = executor.execute(&step, &input(None)).await.unwrap_err();
        assert!(matches!(err, ExecuteError::MissingInput { .. }));

        let result = executor
            .execute(&step, &input(Some(serde_json::json!({"acknowledged": true}))))
            .await
            .unwrap();
        assert_eq!(result.status, crate::governance::run::StepStatus::Success);
    }
}
