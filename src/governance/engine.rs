//! Procedure engine: start, advance, resume, expire.
//!
//! The engine owns every run mutation. It orchestrates the registry (run
//! state + persistence), the store (definitions), and the step executor
//! into the operations the authorization layer calls. All transitions are
//! audited here so the trail is written in exactly one place.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditEventKind, AuditLog, AuditOutcome, AuditSeverity};
use crate::catalog::{OperationKind, ToolCatalog};
use crate::error::GateError;
use crate::governance::executor::{StepExecutor, StepInput};
use crate::governance::procedure::{ProcedureStatus, Step};
use crate::governance::registry::RunRegistry;
use crate::governance::run::{ProcedureRun, RunError, RunId, RunStatus, StepResult, StepStatus};
use crate::governance::store::GovernanceStore;

/// What the engine requires for a tool call without a run token.
#[derive(Debug, Clone)]
pub enum Requirement {
    /// An applicable procedure already has a live run; reuse its token.
    InProgress {
        run_id: RunId,
        procedure_id: String,
        procedure_name: String,
    },
    /// An applicable procedure exists but no run has been started.
    StartRequired {
        procedure_id: String,
        procedure_name: String,
    },
    /// No applicable procedure; the caller decides whether to orchestrate.
    NoGovernance,
}

/// Counts from one expiry/purge sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub expired: usize,
    pub purged: usize,
}

/// Orchestrates runs through their lifecycle.
pub struct ProcedureEngine {
    registry: Arc<RunRegistry>,
    store: Arc<GovernanceStore>,
    executor: Arc<StepExecutor>,
    catalog: Arc<ToolCatalog>,
    audit: Arc<AuditLog>,
    run_ttl: Duration,
    run_retention: Duration,
}

impl ProcedureEngine {
    #[must_use]
    pub fn new(
        registry: Arc<RunRegistry>,
        store: Arc<GovernanceStore>,
        executor: Arc<StepExecutor>,
        catalog: Arc<ToolCatalog>,
        audit: Arc<AuditLog>,
        run_ttl: Duration,
        run_retention: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            executor,
            catalog,
            audit,
            run_ttl,
            run_retention,
        }
    }

    /// Starts a run of `procedure_id` and returns it with a fresh token.
    pub async fn start(
        &self,
        procedure_id: &str,
        context: serde_json::Value,
        actor: Option<&str>,
    ) -> Result<Arc<ProcedureRun>, GateError> {
        let procedure = self.store.load(procedure_id).await?;
        if procedure.status != ProcedureStatus::Active {
            return Err(GateError::Denied {
                tool: String::new(),
                procedure_id: Some(procedure.id.clone()),
                procedure_name: Some(procedure.name.clone()),
                reason: format!("procedure '{}' is a draft pending review", procedure.id),
            });
        }

        let run = ProcedureRun::new(&procedure, context, self.run_ttl);
        let run = self.registry.insert(run);

        info!(
            run_id = %run.run_id,
            procedure_id = %procedure.id,
            expires_at = %run.expires_at,
            "Procedure run started"
        );
        let mut entry = AuditEntry::new(
            AuditEventKind::RunStarted,
            AuditOutcome::Success,
            format!("run started for procedure '{}'", procedure.name),
        )
        .run(run.run_id.to_string())
        .procedure(procedure.id.clone());
        if let Some(actor) = actor {
            entry = entry.actor(actor);
        }
        self.audit.record(entry);
        Ok(run)
    }

    /// The step at the run's cursor, or `None` when the run is finished or
    /// no longer live. Expiry is also enforced here, lazily.
    pub async fn current_step(&self, run_id: &RunId) -> Result<Option<Step>, GateError> {
        let run = self.registry.get(run_id).map_err(GateError::Run)?;
        if run.status != RunStatus::Active {
            return Ok(None);
        }
        if run.is_expired() {
            self.expire_run(run_id);
            return Ok(None);
        }
        let procedure = self.store.load(&run.procedure_id).await?;
        Ok(procedure.step_at(run.cursor).cloned())
    }

    /// Records a settled step result and moves the state machine.
    ///
    /// A failure result transitions the run to `Failed`. Success or skip
    /// advances the cursor; reaching the end completes the run. The cursor
    /// never decreases and never passes `steps.len()`.
    pub async fn advance(
        &self,
        run_id: &RunId,
        result: StepResult,
    ) -> Result<Arc<ProcedureRun>, GateError> {
        let procedure_len = {
            let run = self.registry.get(run_id).map_err(GateError::Run)?;
            if run.is_expired() && run.status == RunStatus::Active {
                self.expire_run(run_id);
                return Err(GateError::Run(RunError::Expired {
                    run_id: run_id.clone(),
                }));
            }
            self.store.load(&run.procedure_id).await?.steps.len()
        };

        let failed = result.status == StepStatus::Failure;
        let step_id = result.step_id.clone();
        let error_text = result.error.clone();

        self.registry.mutate(run_id, |run| {
            if run.status != RunStatus::Active {
                return Err(RunError::AlreadyTerminal {
                    run_id: run.run_id.clone(),
                    status: run.status,
                });
            }
            run.record_step(&result);
            if failed {
                run.transition(
                    RunStatus::Failed,
                    Some(
                        error_text
                            .clone()
                            .unwrap_or_else(|| format!("step '{step_id}' failed")),
                    ),
                )?;
            } else {
                // Monotonic, bounded cursor movement
                run.cursor = (run.cursor + 1).min(procedure_len);
                if run.cursor >= procedure_len {
                    run.transition(RunStatus::Completed, None)?;
                }
            }
            Ok(())
        })?;

        let run = self.registry.get(run_id).map_err(GateError::Run)?;
        self.audit_advance(&run, &step_id, failed, error_text.as_deref());
        Ok(run)
    }

    /// Executes the current step with retry and advances with its result.
    ///
    /// This is the driver behind the control surface: the caller submits a
    /// step response, the engine runs the step and records the outcome. A
    /// step failure is reported through the returned run's status, not as
    /// an error.
    pub async fn execute_current(
        &self,
        run_id: &RunId,
        response: Option<serde_json::Value>,
    ) -> Result<Arc<ProcedureRun>, GateError> {
        let Some(step) = self.current_step(run_id).await? else {
            return self.registry.get(run_id).map_err(GateError::Run);
        };
        let run = self.registry.get(run_id).map_err(GateError::Run)?;
        let input = StepInput {
            response,
            context: run.context.clone(),
            prior_responses: run.responses.clone(),
        };

        let result = match self.executor.execute_with_retry(&step, &input).await {
            Ok(result) => result,
            Err(e) => StepResult::failure(&step.id, e.to_string()),
        };
        self.advance(run_id, result).await
    }

    /// Classifies what a tool call without a token requires.
    pub fn check_requirement(
        &self,
        tool: &str,
        kind: OperationKind,
        tags: &BTreeSet<String>,
    ) -> Requirement {
        let applicable = self
            .store
            .find_applicable(tool, kind, tags, &self.catalog);
        let Some(procedure) = applicable.first() else {
            return Requirement::NoGovernance;
        };

        if let Some(run) = self.registry.find_active_for_procedure(&procedure.id) {
            Requirement::InProgress {
                run_id: run.run_id.clone(),
                procedure_id: procedure.id.clone(),
                procedure_name: procedure.name.clone(),
            }
        } else {
            Requirement::StartRequired {
                procedure_id: procedure.id.clone(),
                procedure_name: procedure.name.clone(),
            }
        }
    }

    /// Cancels an active run.
    pub fn cancel(&self, run_id: &RunId, reason: &str) -> Result<(), GateError> {
        self.registry.mutate(run_id, |run| {
            run.transition(RunStatus::Failed, Some(reason.to_string()))
        })?;
        self.audit.record(
            AuditEntry::new(
                AuditEventKind::RunCancelled,
                AuditOutcome::Failure,
                reason.to_string(),
            )
            .run(run_id.to_string())
            .severity(AuditSeverity::Warning),
        );
        Ok(())
    }

    /// The run for `run_id` together with its current step, for the
    /// control surface's `resume`.
    pub async fn resume(
        &self,
        run_id: &RunId,
    ) -> Result<(Arc<ProcedureRun>, Option<Step>), GateError> {
        let step = self.current_step(run_id).await?;
        let run = self.registry.get(run_id).map_err(GateError::Run)?;
        Ok((run, step))
    }

    /// All live runs.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<ProcedureRun>> {
        self.registry.active_runs()
    }

    /// Expires overdue runs and purges terminal runs past retention.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        for run_id in self.registry.overdue_runs() {
            if self.expire_run(&run_id) {
                stats.expired += 1;
            }
        }
        stats.purged = self.registry.purge_terminal(self.run_retention);
        if stats.expired > 0 || stats.purged > 0 {
            debug!(
                expired = stats.expired,
                purged = stats.purged,
                "Run sweep finished"
            );
        }
        stats
    }

    /// Runs the periodic sweep until `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = ticker.tick() => {
                        engine.sweep();
                    }
                }
            }
            // Final sweep so the snapshot reflects reality at shutdown
            engine.sweep();
            debug!("Run sweeper stopped");
        })
    }

    fn expire_run(&self, run_id: &RunId) -> bool {
        let expired = self
            .registry
            .mutate(run_id, |run| {
                if run.status == RunStatus::Active && run.is_expired() {
                    run.transition(RunStatus::Expired, Some("TTL exceeded".to_string()))?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .unwrap_or(false);
        if expired {
            warn!(run_id = %run_id, "Run expired");
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::RunExpired,
                    AuditOutcome::Failure,
                    "run TTL exceeded",
                )
                .run(run_id.to_string())
                .severity(AuditSeverity::Warning),
            );
        }
        expired
    }

    fn audit_advance(&self, run: &ProcedureRun, step_id: &str, failed: bool, error: Option<&str>) {
        if failed {
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::StepFailed,
                    AuditOutcome::Failure,
                    error.unwrap_or("step failed").to_string(),
                )
                .run(run.run_id.to_string())
                .procedure(run.procedure_id.clone())
                .severity(AuditSeverity::Warning)
                .metadata(serde_json::json!({"step_id": step_id})),
            );
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::RunFailed,
                    AuditOutcome::Failure,
                    format!("run failed at step '{step_id}'"),
                )
                .run(run.run_id.to_string())
                .procedure(run.procedure_id.clone())
                .severity(AuditSeverity::Warning),
            );
            return;
        }

        self.audit.record(
            AuditEntry::new(
                AuditEventKind::StepCompleted,
                AuditOutcome::Success,
                format!("step '{step_id}' settled"),
            )
            .run(run.run_id.to_string())
            .procedure(run.procedure_id.clone())
            .metadata(serde_json::json!({"step_id": step_id, "cursor": run.cursor})),
        );
        if run.status == RunStatus::Completed {
            self.audit.record(
                AuditEntry::new(
                    AuditEventKind::RunCompleted,
                    AuditOutcome::Success,
                    format!("procedure '{}' completed", run.procedure_name),
                )
                .run(run.run_id.to_string())
                .procedure(run.procedure_id.clone()),
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::governance::executor::tests::{CountdownProbe, MockDispatcher};
    use crate::governance::procedure::tests::minimal_procedure;
    use crate::governance::procedure::{Procedure, Step, StepKind};
    use crate::governance::store::tests::MemorySource;
    use std::collections::BTreeSet;

    pub(crate) fn engine_with(procedures: &[Procedure]) -> Arc<ProcedureEngine> {
        engine_with_ttl(procedures, Duration::from_secs(60))
    }

    pub(crate) fn engine_with_ttl(
        procedures: &[Procedure],
        ttl: Duration,
    ) -> Arc<ProcedureEngine> {
        let registry = Arc::new(RunRegistry::new(None, Duration::from_millis(5)));
        let store = Arc::new(GovernanceStore::new(
            Arc::new(MemorySource::with_procedures(procedures)),
            Duration::from_secs(300),
            16,
        ));
        let executor = Arc::new(StepExecutor::new(
            Arc::new(MockDispatcher::new()),
            Arc::new(CountdownProbe::ready_after(0)),
            RetryConfig {
                base: Duration::from_millis(1),
                multiplier: 2.0,
                cap: Duration::from_millis(4),
            },
        ));
        let catalog = Arc::new(ToolCatalog::new([
            ("get-dataset-output".to_string(), OperationKind::Read),
            ("create-dataset".to_string(), OperationKind::Write),
            ("upload-dataset-rows".to_string(), OperationKind::Write),
        ]));
        let audit = Arc::new(AuditLog::new(None, 128, Duration::from_millis(1)));
        Arc::new(ProcedureEngine::new(
            registry,
            store,
            executor,
            catalog,
            audit,
            ttl,
            Duration::from_secs(3600),
        ))
    }

    fn two_step_procedure(id: &str) -> Procedure {
        let mut procedure = minimal_procedure(id, "create-dataset");
        procedure.steps = vec![
            Step {
                id: "brief".to_string(),
                name: "Briefing".to_string(),
                retryable: false,
                max_retries: 0,
                skip_conditions: vec![],
                allowed_tools: None,
                on_success: None,
                on_failure: None,
                on_timeout: None,
                kind: StepKind::Information {
                    content: "read me".to_string(),
                    acknowledgment_required: true,
                },
            },
            Step {
                id: "check".to_string(),
                name: "Check".to_string(),
                retryable: false,
                max_retries: 0,
                skip_conditions: vec![],
                allowed_tools: None,
                on_success: None,
                on_failure: None,
                on_timeout: None,
                kind: StepKind::Quiz {
                    question: "Which environment?".to_string(),
                    correct_answers: BTreeSet::from(["b".to_string()]),
                    explanation: String::new(),
                },
            },
        ];
        procedure
    }

    #[tokio::test]
    async fn start_mints_active_run_with_expiry() {
        let engine = engine_with(&[minimal_procedure("p1", "create-dataset")]);
        let run = engine
            .start("p1", serde_json::json!({}), Some("tester"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.cursor, 0);
        assert!(run.expires_at > run.created_at);
    }

    #[tokio::test]
    async fn draft_procedure_cannot_start() {
        let mut draft = minimal_procedure("p1", "create-dataset");
        draft.status = ProcedureStatus::Draft;
        let engine = engine_with(&[draft]);
        let err = engine.start("p1", serde_json::json!({}), None).await;
        assert!(matches!(err, Err(GateError::Denied { .. })));
    }

    #[tokio::test]
    async fn advance_walks_to_completion() {
        let engine = engine_with(&[two_step_procedure("p1")]);
        let run = engine.start("p1", serde_json::json!({}), None).await.unwrap();
        let run_id = run.run_id.clone();

        let run = engine
            .advance(&run_id, StepResult::success("brief", None))
            .await
            .unwrap();
        assert_eq!(run.cursor, 1);
        assert_eq!(run.status, RunStatus::Active);

        let run = engine
            .advance(&run_id, StepResult::success("check", None))
            .await
            .unwrap();
        assert_eq!(run.cursor, 2);
        assert_eq!(run.status, RunStatus::Completed);

        // Terminal runs reject further advances
        let err = engine
            .advance(&run_id, StepResult::success("check", None))
            .await;
        assert!(matches!(
            err,
            Err(GateError::Run(RunError::AlreadyTerminal { .. }))
        ));
    }

    #[tokio::test]
    async fn failure_result_fails_the_run_without_advancing() {
        let engine = engine_with(&[two_step_procedure("p1")]);
        let run = engine.start("p1", serde_json::json!({}), None).await.unwrap();
        let run_id = run.run_id.clone();

        let run = engine
            .advance(&run_id, StepResult::failure("brief", "not acknowledged"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.cursor, 0, "failure must not advance the cursor");
    }

    #[tokio::test]
    async fn execute_current_drives_quiz_steps() {
        let engine = engine_with(&[two_step_procedure("p1")]);
        let run = engine.start("p1", serde_json::json!({}), None).await.unwrap();
        let run_id = run.run_id.clone();

        let run = engine
            .execute_current(&run_id, Some(serde_json::json!({"acknowledged": true})))
            .await
            .unwrap();
        assert_eq!(run.cursor, 1);

        // Wrong quiz answer fails the run and keeps the cursor in place
        let run = engine
            .execute_current(&run_id, Some(serde_json::json!({"answer": "A"})))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.cursor, 1);
    }

    #[tokio::test]
    async fn check_requirement_classifies_three_ways() {
        let engine = engine_with(&[minimal_procedure("p1", "create-dataset")]);
        let tags = BTreeSet::new();

        match engine.check_requirement("create-dataset", OperationKind::Write, &tags) {
            Requirement::StartRequired { procedure_id, .. } => assert_eq!(procedure_id, "p1"),
            other => panic!("expected StartRequired, got {other:?}"),
        }

        let run = engine.start("p1", serde_json::json!({}), None).await.unwrap();
        match engine.check_requirement("create-dataset", OperationKind::Write, &tags) {
            Requirement::InProgress { run_id, .. } => assert_eq!(run_id, run.run_id),
            other => panic!("expected InProgress, got {other:?}"),
        }

        match engine.check_requirement("upload-dataset-rows", OperationKind::Write, &tags) {
            Requirement::NoGovernance => {}
            other => panic!("expected NoGovernance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_run_is_never_listed_or_resumed_active() {
        let engine = engine_with_ttl(
            &[minimal_procedure("p1", "create-dataset")],
            Duration::from_millis(0),
        );
        let run = engine.start("p1", serde_json::json!({}), None).await.unwrap();
        let run_id = run.run_id.clone();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(engine.list().is_empty());
        let step = engine.current_step(&run_id).await.unwrap();
        assert!(step.is_none());
        // The lazy check transitioned it
        let (run, _) = engine.resume(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_expires_and_purges() {
        let registry = Arc::new(RunRegistry::new(None, Duration::from_millis(5)));
        let store = Arc::new(GovernanceStore::new(
            Arc::new(MemorySource::with_procedures(&[minimal_procedure(
                "p1",
                "create-dataset",
            )])),
            Duration::from_secs(300),
            16,
        ));
        let executor = Arc::new(StepExecutor::new(
            Arc::new(MockDispatcher::new()),
            Arc::new(CountdownProbe::ready_after(0)),
            RetryConfig::default(),
        ));
        let catalog = Arc::new(ToolCatalog::default());
        let audit = Arc::new(AuditLog::new(None, 128, Duration::from_millis(1)));
        let engine = ProcedureEngine::new(
            Arc::clone(&registry),
            store,
            executor,
            catalog,
            Arc::clone(&audit),
            Duration::from_millis(0),
            Duration::ZERO,
        );

        engine.start("p1", serde_json::json!({}), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stats = engine.sweep();
        assert_eq!(stats.expired, 1);
        // Zero retention purges it in the same sweep
        assert_eq!(stats.purged, 1);
        assert!(registry.is_empty());
        assert_eq!(
            audit
                .recent(
                    10,
                    &crate::audit::AuditFilter {
                        kind: Some(AuditEventKind::RunExpired),
                        ..Default::default()
                    }
                )
                .len(),
            1
        );
    }
}
