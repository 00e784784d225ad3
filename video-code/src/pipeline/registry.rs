//! In-memory tracker of executing jobs.
//!
//! Maps a job id to its live process handle, progress percent and stage
//! label. Entries exist only while a job is executing on this node.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Stage reported for jobs without a registry entry.
pub const STAGE_PENDING: &str = "PENDING";

/// Kill switch for one child process.
///
/// The task that owns the child watches the token and performs the forced
/// kill and reap when it fires.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_token: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            kill_token: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a forced kill of the process.
    pub fn kill(&self) {
        self.kill_token.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill_token.is_cancelled()
    }

    /// Resolves once `kill` has been called.
    pub async fn killed(&self) {
        self.kill_token.cancelled().await
    }
}

#[derive(Debug)]
struct RegistryEntry {
    handle: Option<ProcessHandle>,
    progress: u8,
    stage: String,
}

impl Default for RegistryEntry {
    fn default() -> Self {
        Self {
            handle: None,
            progress: 0,
            stage: STAGE_PENDING.to_string(),
        }
    }
}

/// Tracker of live processes, progress and stage per job id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a live process with `job_id`, replacing any stale handle.
    pub fn register(&self, job_id: &str, handle: ProcessHandle) {
        debug!(job_id = %job_id, pid = ?handle.pid(), "Registering process");
        self.entries.entry(job_id.to_string()).or_default().handle = Some(handle);
    }

    /// Record progress for `job_id`.
    ///
    /// `percent` is clamped to `[0, 100]`. The stage is only replaced when a
    /// non-empty one is given.
    pub fn set_progress(&self, job_id: &str, percent: i32, stage: &str) {
        let percent = percent.clamp(0, 100) as u8;
        let mut entry = self.entries.entry(job_id.to_string()).or_default();
        entry.progress = percent;
        if !stage.is_empty() {
            entry.stage = stage.to_string();
        }
    }

    /// Last recorded progress, or 0.
    pub fn progress(&self, job_id: &str) -> u8 {
        self.entries.get(job_id).map(|e| e.progress).unwrap_or(0)
    }

    /// Last recorded stage, or `PENDING`.
    pub fn stage(&self, job_id: &str) -> String {
        self.entries
            .get(job_id)
            .map(|e| e.stage.clone())
            .unwrap_or_else(|| STAGE_PENDING.to_string())
    }

    /// Whether a live process is registered for `job_id`.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.entries
            .get(job_id)
            .is_some_and(|e| e.handle.is_some())
    }

    /// Drop all state for `job_id`.
    pub fn remove(&self, job_id: &str) {
        self.entries.remove(job_id);
    }

    /// Kill the registered process for `job_id`.
    ///
    /// Returns `false`, changing nothing, when no process is registered.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some((_, entry)) = self.entries.remove_if(job_id, |_, e| e.handle.is_some()) else {
            return false;
        };
        if let Some(handle) = entry.handle {
            info!(job_id = %job_id, pid = ?handle.pid(), "Killing encoding process");
            handle.kill();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
