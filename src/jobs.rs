//! In-memory registry of submitted import and export jobs.
//!
//! Each job owns a cancellation token. Import jobs also carry a watch
//! receiver so their progress is read live whenever the job is queried.
//! Only the most recently finished jobs are kept; running jobs are never
//! evicted.

use crate::ingest::ImportProgress;
use chrono::{DateTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Import,
    ApplyDuplicates,
    Export,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub id: String,
    pub kind: JobKind,
    pub target: String,
    pub status: JobStatus,
    pub progress: ImportProgress,
    /// Final result document once the job has finished.
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    state: JobState,
    cancellation_token: CancellationToken,
    progress: Option<watch::Receiver<ImportProgress>>,
}

impl JobEntry {
    fn snapshot(&self) -> JobState {
        let mut state = self.state.clone();
        if let Some(progress) = &self.progress {
            state.progress = progress.borrow().clone();
        }
        state
    }
}

/// Handle given to the code running a job.
pub struct JobHandle {
    pub id: Uuid,
    pub cancellation_token: CancellationToken,
    pub progress: watch::Sender<ImportProgress>,
}

/// Finished jobs kept when no retention is configured.
pub const DEFAULT_RETAINED_JOBS: usize = 100;

#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, JobEntry>>>,
    retained: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_JOBS)
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry keeping at most `retained` finished jobs.
    pub fn with_retention(retained: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            retained,
        }
    }

    /// Register a running job and hand back its token and progress sender.
    pub async fn register(&self, kind: JobKind, target: &str) -> JobHandle {
        let id = Uuid::new_v4();
        let cancellation_token = CancellationToken::new();
        let (sender, receiver) = watch::channel(ImportProgress::default());

        let entry = JobEntry {
            state: JobState {
                id: id.to_string(),
                kind,
                target: target.to_string(),
                status: JobStatus::Running,
                progress: ImportProgress::default(),
                result: None,
                error_message: None,
                started_at: Utc::now(),
                completed_at: None,
            },
            cancellation_token: cancellation_token.clone(),
            progress: Some(receiver),
        };
        self.jobs.lock().await.insert(id, entry);
        log::debug!("registered {:?} job {} for {}", kind, id, target);

        JobHandle {
            id,
            cancellation_token,
            progress: sender,
        }
    }

    pub async fn get_state(&self, id: &Uuid) -> Option<JobState> {
        self.jobs.lock().await.get(id).map(JobEntry::snapshot)
    }

    /// Every known job, newest first.
    pub async fn list(&self) -> Vec<JobState> {
        let mut jobs: Vec<JobState> = self
            .jobs
            .lock()
            .await
            .values()
            .map(JobEntry::snapshot)
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    /// Record the final outcome of a job.
    pub async fn finish(
        &self,
        id: &Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(id) {
            if let Some(progress) = entry.progress.take() {
                entry.state.progress = progress.borrow().clone();
            }
            entry.state.status = status;
            entry.state.result = result;
            entry.state.error_message = error_message;
            entry.state.completed_at = Some(Utc::now());
        }
        self.evict_finished(&mut jobs);
    }

    fn evict_finished(&self, jobs: &mut HashMap<Uuid, JobEntry>) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = jobs
            .iter()
            .filter_map(|(id, entry)| entry.state.completed_at.map(|at| (at, *id)))
            .collect();
        if finished.len() <= self.retained {
            return;
        }

        finished.sort();
        let excess = finished.len() - self.retained;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
        log::debug!("evicted {} finished jobs", excess);
    }

    /// Request cancellation. Returns the job state, or `None` for an unknown id.
    pub async fn cancel(&self, id: &Uuid) -> Option<JobState> {
        let jobs = self.jobs.lock().await;
        let entry = jobs.get(id)?;
        if entry.state.status == JobStatus::Running {
            entry.cancellation_token.cancel();
            log::info!("cancellation requested for job {}", id);
        }
        Some(entry.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_is_read_live() {
        let registry = JobRegistry::new();
        let handle = registry.register(JobKind::Import, "people").await;

        handle.progress.send_replace(ImportProgress {
            rows_read: 42,
            ..ImportProgress::default()
        });

        let state = registry.get_state(&handle.id).await.unwrap();
        assert_eq!(state.status, JobStatus::Running);
        assert_eq!(state.progress.rows_read, 42);
    }

    #[tokio::test]
    async fn test_cancel_trips_token_and_finish_records_outcome() {
        let registry = JobRegistry::new();
        let handle = registry.register(JobKind::Export, "people").await;

        assert!(registry.cancel(&handle.id).await.is_some());
        assert!(handle.cancellation_token.is_cancelled());

        registry
            .finish(&handle.id, JobStatus::Cancelled, None, Some("export cancelled".to_string()))
            .await;
        let state = registry.get_state(&handle.id).await.unwrap();
        assert_eq!(state.status, JobStatus::Cancelled);
        assert!(state.completed_at.is_some());

        assert!(registry.cancel(&Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_oldest_finished_jobs_are_evicted() {
        let registry = JobRegistry::with_retention(2);
        let running = registry.register(JobKind::Import, "running").await;

        let mut finished = Vec::new();
        for target in ["a", "b", "c"] {
            let handle = registry.register(JobKind::Import, target).await;
            registry
                .finish(&handle.id, JobStatus::Completed, Some(serde_json::json!({})), None)
                .await;
            finished.push(handle.id);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert!(registry.get_state(&finished[0]).await.is_none());
        assert!(registry.get_state(&finished[1]).await.is_some());
        assert!(registry.get_state(&finished[2]).await.is_some());
        assert_eq!(
            registry.get_state(&running.id).await.map(|s| s.status),
            Some(JobStatus::Running)
        );
        assert_eq!(registry.list().await.len(), 3);
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let registry = JobRegistry::new();
        let first = registry.register(JobKind::Import, "a").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry.register(JobKind::Import, "b").await;

        let ids: Vec<String> = registry.list().await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![second.id.to_string(), first.id.to_string()]);
    }
}
