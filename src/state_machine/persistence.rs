use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::errors::LifecycleResult;
use super::lifecycle::{JobSummary, JobUpdate, StageLifecycleEntry, StageSettings};

/// Storage seam of the lifecycle tracker
#[async_trait]
pub trait StageLifecycleStore: Send + Sync + Debug {
    /// Atomically read-increment-upsert the entry for `(job_id, stage)`,
    /// creating it with `settings` when absent
    async fn begin_attempt(
        &self,
        job_id: Uuid,
        stage: &str,
        settings: &StageSettings,
    ) -> LifecycleResult<StageLifecycleEntry>;

    async fn load_stage(&self, job_id: Uuid, stage: &str)
        -> LifecycleResult<Option<StageLifecycleEntry>>;

    async fn save_stage(&self, entry: &StageLifecycleEntry) -> LifecycleResult<()>;

    /// Upsert the job summary; returns the stored value
    async fn update_job(&self, update: &JobUpdate) -> LifecycleResult<JobSummary>;

    async fn load_job(&self, job_id: Uuid) -> LifecycleResult<Option<JobSummary>>;

    async fn list_stages(&self, job_id: Uuid) -> LifecycleResult<Vec<StageLifecycleEntry>>;
}

/// In-memory lifecycle store for tests and single-process use
#[derive(Debug, Default)]
pub struct InMemoryStageLifecycleStore {
    stages: Mutex<HashMap<(Uuid, String), StageLifecycleEntry>>,
    jobs: Mutex<HashMap<Uuid, JobSummary>>,
}

impl InMemoryStageLifecycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry as-is
    pub fn seed_stage(&self, entry: StageLifecycleEntry) {
        self.stages
            .lock()
            .insert((entry.job_id, entry.stage.clone()), entry);
    }
}

#[async_trait]
impl StageLifecycleStore for InMemoryStageLifecycleStore {
    async fn begin_attempt(
        &self,
        job_id: Uuid,
        stage: &str,
        settings: &StageSettings,
    ) -> LifecycleResult<StageLifecycleEntry> {
        let mut stages = self.stages.lock();
        let entry = stages
            .entry((job_id, stage.to_string()))
            .or_insert_with(|| StageLifecycleEntry::new(job_id, stage, settings));
        entry.begin_attempt(Utc::now());
        Ok(entry.clone())
    }

    async fn load_stage(
        &self,
        job_id: Uuid,
        stage: &str,
    ) -> LifecycleResult<Option<StageLifecycleEntry>> {
        Ok(self
            .stages
            .lock()
            .get(&(job_id, stage.to_string()))
            .cloned())
    }

    async fn save_stage(&self, entry: &StageLifecycleEntry) -> LifecycleResult<()> {
        self.stages
            .lock()
            .insert((entry.job_id, entry.stage.clone()), entry.clone());
        Ok(())
    }

    async fn update_job(&self, update: &JobUpdate) -> LifecycleResult<JobSummary> {
        let mut jobs = self.jobs.lock();
        let summary = update.apply(jobs.remove(&update.job_id), Utc::now());
        jobs.insert(update.job_id, summary.clone());
        Ok(summary)
    }

    async fn load_job(&self, job_id: Uuid) -> LifecycleResult<Option<JobSummary>> {
        Ok(self.jobs.lock().get(&job_id).cloned())
    }

    async fn list_stages(&self, job_id: Uuid) -> LifecycleResult<Vec<StageLifecycleEntry>> {
        Ok(self
            .stages
            .lock()
            .values()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect())
    }
}
