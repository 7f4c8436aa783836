//! Persisted registry of procedure runs.
//!
//! Runs live in a concurrent map and survive restarts through a JSON
//! snapshot. Mutations go through [`RunRegistry::mutate`], which holds the
//! entry's shard lock for the duration of the closure: no two mutations of
//! the same run can interleave, which is the single-writer discipline the
//! rest of the gate relies on. Callers must not await inside the closure.
//!
//! Snapshot writes are debounced: every mutation marks the registry dirty
//! and wakes the persister task, which sleeps the debounce delay and writes
//! once, so a burst of mutations produces one write. A failed write leaves
//! the dirty flag set and is retried on the next wake.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::GateError;
use crate::governance::run::{ProcedureRun, RunError, RunId};

/// Internal entry with cleanup metadata.
#[derive(Debug)]
struct RunEntry {
    run: Arc<ProcedureRun>,
    /// When the run became terminal, for retention-window purging
    terminal_at: Option<DateTime<Utc>>,
}

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    runs: BTreeMap<String, ProcedureRun>,
}

/// Concurrent, snapshot-persisted run table.
pub struct RunRegistry {
    runs: DashMap<RunId, RunEntry>,
    snapshot_path: Option<PathBuf>,
    dirty: Notify,
    has_dirty: AtomicBool,
    debounce: Duration,
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRegistry")
            .field("runs", &self.runs.len())
            .field("snapshot_path", &self.snapshot_path)
            .finish()
    }
}

impl RunRegistry {
    /// Creates a registry persisting to `snapshot_path` (or in-memory only
    /// when `None`).
    #[must_use]
    pub fn new(snapshot_path: Option<PathBuf>, debounce: Duration) -> Self {
        Self {
            runs: DashMap::new(),
            snapshot_path,
            dirty: Notify::new(),
            has_dirty: AtomicBool::new(false),
            debounce,
        }
    }

    /// Restores runs from the snapshot file, if one exists.
    ///
    /// Terminal runs restored from disk get their retention clock restarted
    /// at load time; the snapshot does not carry `terminal_at`.
    pub fn restore(&self) -> Result<usize, GateError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(path).map_err(|e| GateError::Persistence {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let snapshot: RegistrySnapshot =
            serde_json::from_str(&raw).map_err(|e| GateError::Persistence {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let now = Utc::now();
        let count = snapshot.runs.len();
        for (_, run) in snapshot.runs {
            let terminal_at = run.status.is_terminal().then_some(now);
            self.runs.insert(
                run.run_id.clone(),
                RunEntry {
                    run: Arc::new(run),
                    terminal_at,
                },
            );
        }
        debug!(count, "Restored run registry from snapshot");
        Ok(count)
    }

    /// Inserts a freshly minted run and marks the registry dirty.
    pub fn insert(&self, run: ProcedureRun) -> Arc<ProcedureRun> {
        let run = Arc::new(run);
        self.runs.insert(
            run.run_id.clone(),
            RunEntry {
                run: Arc::clone(&run),
                terminal_at: None,
            },
        );
        self.mark_dirty();
        run
    }

    /// Gets a run by id.
    pub fn get(&self, run_id: &RunId) -> Result<Arc<ProcedureRun>, RunError> {
        self.runs
            .get(run_id)
            .map(|entry| Arc::clone(&entry.run))
            .ok_or_else(|| RunError::NotFound {
                run_id: run_id.clone(),
            })
    }

    /// Mutates a run under its entry lock.
    ///
    /// The closure runs with exclusive access to the run; the registry
    /// tracks the terminal transition and marks itself dirty afterwards.
    pub fn mutate<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut ProcedureRun) -> Result<T, RunError>,
    ) -> Result<T, RunError> {
        let mut entry = self.runs.get_mut(run_id).ok_or_else(|| RunError::NotFound {
            run_id: run_id.clone(),
        })?;

        let was_terminal = entry.run.status.is_terminal();
        let result = f(Arc::make_mut(&mut entry.run))?;
        if !was_terminal && entry.run.status.is_terminal() {
            entry.terminal_at = Some(Utc::now());
        }
        drop(entry);
        self.mark_dirty();
        Ok(result)
    }

    /// All runs that are active and unexpired.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Arc<ProcedureRun>> {
        self.runs
            .iter()
            .filter(|entry| entry.run.is_live())
            .map(|entry| Arc::clone(&entry.run))
            .collect()
    }

    /// The live run for `procedure_id`, if one exists.
    #[must_use]
    pub fn find_active_for_procedure(&self, procedure_id: &str) -> Option<Arc<ProcedureRun>> {
        self.runs
            .iter()
            .filter(|entry| entry.run.is_live() && entry.run.procedure_id == procedure_id)
            .map(|entry| Arc::clone(&entry.run))
            .next()
    }

    /// Ids of active runs past their expiry. The engine transitions them so
    /// the audit trail is written in one place.
    #[must_use]
    pub fn overdue_runs(&self) -> Vec<RunId> {
        let now = Utc::now();
        self.runs
            .iter()
            .filter(|entry| !entry.run.status.is_terminal() && now > entry.run.expires_at)
            .map(|entry| entry.run.run_id.clone())
            .collect()
    }

    /// Removes terminal runs older than `retention`. Returns how many were
    /// purged.
    pub fn purge_terminal(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention).unwrap_or_default();
        let to_remove: Vec<RunId> = self
            .runs
            .iter()
            .filter_map(|entry| {
                let terminal_at = entry.terminal_at?;
                (now - terminal_at > retention).then(|| entry.run.run_id.clone())
            })
            .collect();
        let count = to_remove.len();
        for run_id in to_remove {
            self.runs.remove(&run_id);
        }
        if count > 0 {
            self.mark_dirty();
        }
        count
    }

    /// Number of runs currently held (any status).
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if the registry holds no runs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn mark_dirty(&self) {
        self.has_dirty.store(true, Ordering::Release);
        self.dirty.notify_one();
    }

    /// Synchronously writes the full snapshot via a temp file and rename.
    pub fn persist_now(&self) -> Result<(), GateError> {
        let Some(path) = self.snapshot_path.as_ref() else {
            self.has_dirty.store(false, Ordering::Release);
            return Ok(());
        };
        self.has_dirty.store(false, Ordering::Release);

        let snapshot = RegistrySnapshot {
            runs: self
                .runs
                .iter()
                .map(|entry| {
                    (
                        entry.run.run_id.as_str().to_string(),
                        (*entry.run).clone(),
                    )
                })
                .collect(),
        };
        write_snapshot(path, &snapshot).map_err(|e| {
            // Stay dirty so the next debounce tick retries.
            self.has_dirty.store(true, Ordering::Release);
            GateError::Persistence {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Runs the debounced persistence loop until `shutdown` is cancelled,
    /// then writes a final snapshot.
    pub fn spawn_persister(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = registry.dirty.notified() => {
                        tokio::time::sleep(registry.debounce).await;
                        if registry.has_dirty.load(Ordering::Acquire)
                            && let Err(e) = registry.persist_now()
                        {
                            warn!(error = %e, "Run snapshot write failed; will retry");
                        }
                    }
                }
            }
            if registry.has_dirty.load(Ordering::Acquire)
                && let Err(e) = registry.persist_now()
            {
                warn!(error = %e, "Final run snapshot write failed");
            }
            debug!("Run persister stopped");
        })
    }
}

fn write_snapshot(path: &Path, snapshot: &RegistrySnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(snapshot).map_err(std::io::Error::other)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::procedure::tests::minimal_procedure;
    use crate::governance::run::{RunStatus, StepResult};

    fn registry_with_path(path: Option<PathBuf>) -> RunRegistry {
        RunRegistry::new(path, Duration::from_millis(5))
    }

    fn insert_run(registry: &RunRegistry, procedure_id: &str) -> RunId {
        let procedure = minimal_procedure(procedure_id, "create-dataset");
        let run = ProcedureRun::new(&procedure, serde_json::Value::Null, Duration::from_secs(60));
        registry.insert(run).run_id.clone()
    }

    #[test]
    fn insert_and_get() {
        let registry = registry_with_path(None);
        let run_id = insert_run(&registry, "p1");
        let run = registry.get(&run_id).unwrap();
        assert_eq!(run.procedure_id, "p1");
        assert!(registry.get(&RunId::from_raw("run_missing")).is_err());
    }

    #[test]
    fn mutate_serializes_and_tracks_terminal() {
        let registry = registry_with_path(None);
        let run_id = insert_run(&registry, "p1");

        registry
            .mutate(&run_id, |run| {
                run.record_step(&StepResult::success("ack", None));
                run.cursor += 1;
                run.transition(RunStatus::Completed, None)
            })
            .unwrap();

        let run = registry.get(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(registry.find_active_for_procedure("p1").is_none());
    }

    #[test]
    fn active_lookup_skips_terminal_runs() {
        let registry = registry_with_path(None);
        let run_id = insert_run(&registry, "p1");
        assert!(registry.find_active_for_procedure("p1").is_some());

        registry
            .mutate(&run_id, |run| {
                run.transition(RunStatus::Failed, Some("cancelled".to_string()))
            })
            .unwrap();
        assert!(registry.find_active_for_procedure("p1").is_none());
    }

    #[test]
    fn purge_respects_retention() {
        let registry = registry_with_path(None);
        let run_id = insert_run(&registry, "p1");
        registry
            .mutate(&run_id, |run| run.transition(RunStatus::Completed, None))
            .unwrap();

        // Generous retention: nothing purged yet
        assert_eq!(registry.purge_terminal(Duration::from_secs(3600)), 0);
        // Zero retention: terminal run goes
        assert_eq!(registry.purge_terminal(Duration::ZERO), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_round_trips_across_registries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");

        let registry = registry_with_path(Some(path.clone()));
        let run_id = insert_run(&registry, "p1");
        registry
            .mutate(&run_id, |run| {
                run.record_step(&StepResult::success("ack", Some(serde_json::json!(42))));
                run.cursor += 1;
                Ok(())
            })
            .unwrap();
        registry.persist_now().unwrap();

        let restored = registry_with_path(Some(path));
        assert_eq!(restored.restore().unwrap(), 1);
        let run = restored.get(&run_id).unwrap();
        assert_eq!(run.cursor, 1);
        assert_eq!(run.responses["ack"], serde_json::json!(42));
        assert_eq!(run.status, RunStatus::Active);
    }

    #[tokio::test]
    async fn persister_coalesces_burst_into_one_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let registry = Arc::new(registry_with_path(Some(path.clone())));
        let shutdown = CancellationToken::new();
        let handle = registry.spawn_persister(shutdown.clone());

        for _ in 0..5 {
            insert_run(&registry, "p1");
        }
        // Let the debounce window elapse
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(path.exists());

        shutdown.cancel();
        handle.await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let snapshot: RegistrySnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.runs.len(), 5);
    }
}
