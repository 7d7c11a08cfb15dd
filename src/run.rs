//! Run bookkeeping shared between a running scan/measurement and whoever polls it.
//!
//! A [`RunContext`] owns the progress counters, the recent status lines and the cancel
//! token for one run. [`RunRegistry`] enforces that at most one run is active at a time.
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, ScanError};

const LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Error,
}

/// Where the batch orchestrator currently is. Scans stay in `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Preparing,
    Connecting,
    Measuring,
    Disconnecting,
    Paused,
    Cancelled,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Scan,
    Measure,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::Scan => f.write_str("scan"),
            RunKind::Measure => f.write_str("measurement"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct Progress {
    pub done: u64,
    pub total: u64,
    pub status: RunStatus,
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Default)]
struct RunState {
    progress: Progress,
    error: Option<String>,
    log: VecDeque<String>,
}

impl RunState {
    fn push_line(&mut self, line: String) {
        if self.log.len() == LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(line);
    }
}

/// Shared handle to one run's progress and cancellation.
///
/// Cheap to clone; all clones observe the same counters. Every mutation happens under a
/// single lock, and `done` only moves forward and never passes `total`.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    state: Arc<Mutex<RunState>>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn start(&self, message: impl Into<String>) {
        let mut s = self.state.lock().await;
        s.progress = Progress {
            status: RunStatus::Running,
            message: message.into(),
            ..Progress::default()
        };
        s.error = None;
    }

    pub async fn set_total(&self, total: u64) {
        let mut s = self.state.lock().await;
        s.progress.total = total;
        s.progress.done = s.progress.done.min(total);
    }

    pub async fn set_phase(&self, phase: Phase) {
        self.state.lock().await.progress.phase = phase;
    }

    /// Count one finished unit of work and record its status line.
    /// Returns the `(done, total)` pair the line was stamped with.
    pub async fn advance(&self, line: impl AsRef<str>) -> (u64, u64) {
        let mut s = self.state.lock().await;
        let p = &mut s.progress;
        if p.done < p.total {
            p.done += 1;
        }
        let (done, total) = (p.done, p.total);
        let stamped = format!("({done}/{total}) {}", line.as_ref());
        info!("{stamped}");
        s.progress.message = stamped.clone();
        s.push_line(stamped);
        (done, total)
    }

    /// Record a status line without counting work.
    pub async fn note(&self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        let mut s = self.state.lock().await;
        s.progress.message = line.clone();
        s.push_line(line);
    }

    /// Freeze the run at a terminal status.
    pub async fn finish(&self, status: RunStatus, message: impl Into<String>) {
        let mut s = self.state.lock().await;
        s.progress.status = status;
        s.progress.message = message.into();
        if status == RunStatus::Error {
            s.error = Some(s.progress.message.clone());
        }
    }

    pub async fn progress(&self) -> Progress {
        self.state.lock().await.progress.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.lock().await.error.clone()
    }

    pub async fn recent_lines(&self) -> Vec<String> {
        self.state.lock().await.log.iter().cloned().collect()
    }
}

/// Read-only snapshot for status pollers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub active: bool,
    pub kind: Option<RunKind>,
    pub progress: Progress,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    active: AtomicBool,
    current: Mutex<Option<(RunKind, RunContext)>>,
}

/// Process-wide gate allowing at most one active run.
#[derive(Clone, Debug, Default)]
pub struct RunRegistry {
    inner: Arc<RegistryInner>,
}

/// Holds the registry slot; the slot is released when this is dropped.
#[derive(Debug)]
pub struct RunGuard {
    inner: Arc<RegistryInner>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::Release);
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the single run slot. Fails without side effects if a run is active.
    ///
    /// The new context is published under the same lock as the slot claim, so `stop` never
    /// sees an active slot paired with the previous run's context.
    pub async fn try_begin(&self, kind: RunKind) -> Result<(RunGuard, RunContext)> {
        let mut current = self.inner.current.lock().await;
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let running = current
                .as_ref()
                .map(|(k, _)| k.to_string())
                .unwrap_or_else(|| "run".to_string());
            return Err(ScanError::AlreadyRunning(running));
        }
        let guard = RunGuard {
            inner: self.inner.clone(),
        };
        let ctx = RunContext::new();
        ctx.start(format!("starting {kind}")).await;
        *current = Some((kind, ctx.clone()));
        Ok((guard, ctx))
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Signal the active run to stop at its next checkpoint.
    pub async fn stop(&self) -> Result<()> {
        if !self.is_active() {
            return Err(ScanError::NotRunning);
        }
        match self.inner.current.lock().await.as_ref() {
            Some((_, ctx)) => {
                ctx.cancel();
                Ok(())
            }
            None => Err(ScanError::NotRunning),
        }
    }

    /// Context of the active run, or of the last one to finish.
    pub async fn current(&self) -> Option<RunContext> {
        self.inner
            .current
            .lock()
            .await
            .as_ref()
            .map(|(_, ctx)| ctx.clone())
    }

    pub async fn status(&self) -> StatusSnapshot {
        let current = self.inner.current.lock().await.clone();
        match current {
            Some((kind, ctx)) => StatusSnapshot {
                active: self.is_active(),
                kind: Some(kind),
                progress: ctx.progress().await,
                error: ctx.error().await,
            },
            None => StatusSnapshot {
                active: false,
                kind: None,
                progress: Progress::default(),
                error: None,
            },
        }
    }
}
