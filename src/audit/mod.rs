//! Append-only, batched audit recorder.
//!
//! Every authorization decision, run transition, and security violation is
//! recorded here. Entries land in a bounded in-memory ring immediately and
//! are flushed in batches to day-partitioned JSONL files by a debounced
//! background task. Recording never fails the operation being logged: if the
//! durable write fails, the log degrades to memory-only and keeps serving
//! queries from the ring.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// Entry Types
// ============================================================================

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Blocked,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    AuthorizationGranted,
    AuthorizationDenied,
    SecurityViolation,
    RunStarted,
    StepCompleted,
    StepFailed,
    RunCompleted,
    RunFailed,
    RunExpired,
    RunCancelled,
    ProcedureLoaded,
    DraftCreated,
    OrchestrationStarted,
    OrchestrationCompleted,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id
    pub id: String,
    /// When the event occurred
    pub at: DateTime<Utc>,
    /// Event classification
    pub kind: AuditEventKind,
    /// Severity
    pub severity: AuditSeverity,
    /// Who triggered the event, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Tool involved, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Run involved, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Procedure involved, when any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedure_id: Option<String>,
    /// Outcome of the operation
    pub outcome: AuditOutcome,
    /// Human-readable reason
    pub reason: String,
    /// Free-form structured context
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl AuditEntry {
    /// Creates an entry with the given kind, outcome, and reason.
    ///
    /// Severity defaults to `Info`; violations should use
    /// [`AuditEntry::violation`] which records at `Critical`.
    #[must_use]
    pub fn new(kind: AuditEventKind, outcome: AuditOutcome, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            at: Utc::now(),
            kind,
            severity: AuditSeverity::Info,
            actor: None,
            tool: None,
            run_id: None,
            procedure_id: None,
            outcome,
            reason: reason.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Creates a `SecurityViolation` entry at `Critical` severity.
    #[must_use]
    pub fn violation(reason: impl Into<String>, metadata: serde_json::Value) -> Self {
        let mut entry = Self::new(
            AuditEventKind::SecurityViolation,
            AuditOutcome::Blocked,
            reason,
        );
        entry.severity = AuditSeverity::Critical;
        entry.metadata = metadata;
        entry
    }

    #[must_use]
    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    #[must_use]
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    #[must_use]
    pub fn run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    #[must_use]
    pub fn procedure(mut self, procedure_id: impl Into<String>) -> Self {
        self.procedure_id = Some(procedure_id.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for [`AuditLog::recent`].
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub kind: Option<AuditEventKind>,
    pub min_severity: Option<AuditSeverity>,
    pub tool: Option<String>,
    pub run_id: Option<String>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(kind) = self.kind
            && entry.kind != kind
        {
            return false;
        }
        if let Some(min) = self.min_severity
            && entry.severity < min
        {
            return false;
        }
        if let Some(ref tool) = self.tool
            && entry.tool.as_deref() != Some(tool.as_str())
        {
            return false;
        }
        if let Some(ref run_id) = self.run_id
            && entry.run_id.as_deref() != Some(run_id.as_str())
        {
            return false;
        }
        true
    }
}

// ============================================================================
// Audit Log
// ============================================================================

/// Bounded-memory, batch-flushing audit log.
pub struct AuditLog {
    /// Query ring, newest at the back
    ring: Mutex<VecDeque<AuditEntry>>,
    /// Entries recorded since the last successful flush
    unflushed: Mutex<Vec<AuditEntry>>,
    /// Wakes the flusher task
    dirty: Notify,
    /// Day files land here; `None` means memory-only from the start
    dir: Option<PathBuf>,
    ring_capacity: usize,
    flush_debounce: Duration,
    /// Set after the first failed write; cleared on the next success
    degraded: AtomicBool,
}

impl AuditLog {
    /// Creates a log that flushes to `dir`, or a memory-only log when `dir`
    /// is `None`.
    #[must_use]
    pub fn new(dir: Option<PathBuf>, ring_capacity: usize, flush_debounce: Duration) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            unflushed: Mutex::new(Vec::new()),
            dirty: Notify::new(),
            dir,
            ring_capacity: ring_capacity.max(1),
            flush_debounce,
            degraded: AtomicBool::new(false),
        }
    }

    /// Appends an entry. Infallible by design: audit recording must never
    /// fail the authorization it is logging.
    pub fn record(&self, entry: AuditEntry) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        if self.dir.is_some() {
            let mut unflushed = self.unflushed.lock().unwrap_or_else(|e| e.into_inner());
            // Bound the backlog too: if the disk has been failing for a
            // while, keep the most recent ring's worth and drop the oldest.
            if unflushed.len() >= self.ring_capacity {
                unflushed.remove(0);
            }
            unflushed.push(entry);
            self.dirty.notify_one();
        }
    }

    /// Returns up to `limit` of the most recent entries matching `filter`,
    /// newest first.
    #[must_use]
    pub fn recent(&self, limit: usize, filter: &AuditFilter) -> Vec<AuditEntry> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Returns up to `limit` of the most recent security violations.
    #[must_use]
    pub fn security_violations(&self, limit: usize) -> Vec<AuditEntry> {
        self.recent(
            limit,
            &AuditFilter {
                kind: Some(AuditEventKind::SecurityViolation),
                ..Default::default()
            },
        )
    }

    /// Returns true if a durable write has failed and not yet recovered.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Synchronously writes all unflushed entries, grouped by day.
    ///
    /// Uses blocking IO. Called from the flusher task and before shutdown;
    /// batch sizes are small so blocking the runtime briefly is acceptable.
    pub fn flush_now(&self) {
        let Some(dir) = self.dir.as_ref() else {
            return;
        };

        let batch: Vec<AuditEntry> = {
            let mut unflushed = self.unflushed.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *unflushed)
        };
        if batch.is_empty() {
            return;
        }

        match write_batch(dir, &batch) {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(dir = %dir.display(), "Audit storage recovered");
                }
                debug!(count = batch.len(), "Flushed audit batch");
            }
            Err(e) => {
                // Degrade to memory-only; requeue the batch at the front so
                // order is preserved for the next attempt.
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(
                        dir = %dir.display(),
                        error = %e,
                        "Audit storage unavailable; continuing memory-only"
                    );
                }
                let mut unflushed = self.unflushed.lock().unwrap_or_else(|e| e.into_inner());
                let mut restored = batch;
                restored.append(&mut unflushed);
                restored.truncate(self.ring_capacity);
                *unflushed = restored;
            }
        }
    }

    /// Runs the debounced flush loop until `shutdown` is cancelled, then
    /// performs a final flush.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    _ = log.dirty.notified() => {
                        // Debounce: let a burst of records coalesce into one
                        // write before touching the disk.
                        tokio::time::sleep(log.flush_debounce).await;
                        log.flush_now();
                    }
                }
            }
            log.flush_now();
            debug!("Audit flusher stopped");
        })
    }
}

/// Appends `batch` as one-JSON-object-per-line records to per-day files.
fn write_batch(dir: &std::path::Path, batch: &[AuditEntry]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    // Group by day so a batch spanning midnight lands in both files.
    let mut current_day = String::new();
    let mut file: Option<std::fs::File> = None;
    for entry in batch {
        let day = entry.at.format("%Y-%m-%d").to_string();
        if day != current_day || file.is_none() {
            let path = dir.join(format!("audit-{day}.jsonl"));
            file = Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            );
            current_day = day;
        }
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        if let Some(f) = file.as_mut() {
            writeln!(f, "{line}")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: AuditEventKind, tool: &str) -> AuditEntry {
        AuditEntry::new(kind, AuditOutcome::Success, "test").tool(tool)
    }

    #[test]
    fn ring_evicts_oldest_at_capacity() {
        let log = AuditLog::new(None, 3, Duration::from_millis(1));
        for i in 0..5 {
            log.record(entry(AuditEventKind::RunStarted, &format!("tool-{i}")));
        }
        let recent = log.recent(10, &AuditFilter::default());
        assert_eq!(recent.len(), 3);
        // Newest first
        assert_eq!(recent[0].tool.as_deref(), Some("tool-4"));
        assert_eq!(recent[2].tool.as_deref(), Some("tool-2"));
    }

    #[test]
    fn filter_by_kind_and_tool() {
        let log = AuditLog::new(None, 16, Duration::from_millis(1));
        log.record(entry(AuditEventKind::RunStarted, "a"));
        log.record(entry(AuditEventKind::RunCompleted, "a"));
        log.record(entry(AuditEventKind::RunStarted, "b"));

        let filter = AuditFilter {
            kind: Some(AuditEventKind::RunStarted),
            tool: Some("a".to_string()),
            ..Default::default()
        };
        let matched = log.recent(10, &filter);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].tool.as_deref(), Some("a"));
    }

    #[test]
    fn security_violations_query_reads_critical_entries() {
        let log = AuditLog::new(None, 16, Duration::from_millis(1));
        log.record(entry(AuditEventKind::RunStarted, "a"));
        log.record(AuditEntry::violation(
            "token hijack",
            serde_json::json!({"kind": "token-hijack"}),
        ));

        let violations = log.security_violations(10);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, AuditSeverity::Critical);
        assert_eq!(violations[0].outcome, AuditOutcome::Blocked);
    }

    #[test]
    fn flush_writes_day_partitioned_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(
            Some(dir.path().to_path_buf()),
            16,
            Duration::from_millis(1),
        );
        log.record(entry(AuditEventKind::RunStarted, "a"));
        log.record(entry(AuditEventKind::RunCompleted, "a"));
        log.flush_now();

        let day = Utc::now().format("%Y-%m-%d");
        let path = dir.path().join(format!("audit-{day}.jsonl"));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        // Each line is a standalone JSON object
        for line in lines {
            let parsed: AuditEntry = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.tool.as_deref(), Some("a"));
        }
    }

    #[test]
    fn unwritable_dir_degrades_without_failing() {
        let log = AuditLog::new(
            Some(PathBuf::from("/proc/datagate-cannot-write-here")),
            4,
            Duration::from_millis(1),
        );
        log.record(entry(AuditEventKind::RunStarted, "a"));
        log.flush_now();
        assert!(log.is_degraded());
        // Entries are still queryable from memory
        assert_eq!(log.recent(10, &AuditFilter::default()).len(), 1);
    }

    #[tokio::test]
    async fn flusher_drains_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(AuditLog::new(
            Some(dir.path().to_path_buf()),
            16,
            Duration::from_millis(5),
        ));
        let shutdown = CancellationToken::new();
        let handle = log.spawn_flusher(shutdown.clone());

        log.record(entry(AuditEventKind::RunStarted, "a"));
        shutdown.cancel();
        handle.await.unwrap();

        let day = Utc::now().format("%Y-%m-%d");
        let path = dir.path().join(format!("audit-{day}.jsonl"));
        assert!(path.exists());
    }
}
