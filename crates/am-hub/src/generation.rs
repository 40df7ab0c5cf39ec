//! Background worker for task batches too large to insert inside a request.

use crate::error::HubError;
use am_core::ManagerError;
use am_storage::{
    AssignmentStore, GenerationPlan, GenerationReport, PlannedProject, StoreContext, UploadPlan,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

const QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub enum JobPlan {
    Generate(GenerationPlan),
    Upload(UploadPlan),
}

impl JobPlan {
    fn project(&self) -> &PlannedProject {
        match self {
            JobPlan::Generate(plan) => &plan.project,
            JobPlan::Upload(plan) => &plan.project,
        }
    }

    fn project_name(&self) -> &str {
        self.project().name()
    }
}

pub type JobOutcome = Result<GenerationReport, ManagerError>;

#[derive(Debug)]
pub struct GenerationJob {
    pub plan: JobPlan,
    pub user: String,
    pub done: Option<oneshot::Sender<JobOutcome>>,
}

impl GenerationJob {
    pub fn new(plan: JobPlan, user: &str) -> Self {
        Self {
            plan,
            user: user.to_string(),
            done: None,
        }
    }

    /// Attaches a completion signal; the receiver resolves once the job ran.
    pub fn with_completion(mut self) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        (self, rx)
    }
}

#[derive(Clone)]
pub struct GenerationQueue {
    sender: mpsc::Sender<GenerationJob>,
}

impl GenerationQueue {
    /// Starts the worker on the current runtime.
    pub fn spawn(database: PathBuf, ctx: StoreContext) -> Self {
        let (sender, mut receiver) = mpsc::channel::<GenerationJob>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let GenerationJob { plan, user, done } = job;
                let database = database.clone();
                let ctx = ctx.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || run_job(&database, ctx, &plan, &user)).await;
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(event = "generation_worker_panicked", error = %err);
                        Err(ManagerError::store("generation failed"))
                    }
                };
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            }
            info!(event = "generation_queue_closed");
        });
        Self { sender }
    }

    pub async fn submit(&self, job: GenerationJob) -> Result<(), HubError> {
        self.sender
            .send(job)
            .await
            .map_err(|_| HubError::Worker("generation queue is closed".to_string()))
    }
}

fn run_job(database: &Path, ctx: StoreContext, plan: &JobPlan, user: &str) -> JobOutcome {
    let mut store = AssignmentStore::open_with(database, ctx)?;
    let started = Utc::now();
    let outcome = match plan {
        JobPlan::Generate(plan) => store.run_generation(plan, user, started),
        JobPlan::Upload(plan) => store.run_upload(plan, started),
    };
    let (project_id, status) = match &outcome {
        Ok(batch) => {
            info!(
                event = "generation_complete",
                project = plan.project_name(),
                inserted = batch.report.inserted,
                ignored = batch.report.ignored,
                elapsed_ms = (Utc::now() - started).num_milliseconds()
            );
            (
                Some(batch.project.id),
                format!("complete: inserted={} ignored={}", batch.report.inserted, batch.report.ignored),
            )
        }
        Err(err) => {
            error!(event = "generation_failed", project = plan.project_name(), error = %err);
            (plan.project().id(), format!("failed: {err}"))
        }
    };
    match project_id {
        Some(project_id) => {
            if let Err(err) = store.record_generation_status(project_id, &status, Utc::now()) {
                warn!(event = "generation_status_unrecorded", project = plan.project_name(), error = %err);
            }
        }
        None => warn!(event = "generation_status_unrecorded", project = plan.project_name(), status = %status),
    }
    outcome.map(|batch| batch.report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_core::{Actor, CandidateKey, PropertyOwner, Protocol, StaticKeySource};
    use am_storage::projects::GENERATION_STATUS_PROPERTY;
    use serde_json::Map;
    use tempfile::TempDir;

    #[tokio::test]
    async fn queued_generation_reports_completion_and_status() {
        let dir = TempDir::new().expect("temp dir");
        let database = dir.path().join("queue.db");
        let mut store = AssignmentStore::open(&database).expect("open store");
        let admin = Actor::new("admin", ["admin", "cleave"]);
        let source = StaticKeySource::new(vec![CandidateKey::new("7"), CandidateKey::new("8")]);
        let mut plan = store
            .prepare_project_generation(Protocol::Cleave, "queued", &Map::new(), &source, &admin)
            .expect("plan");
        let project_id = store
            .stage_project(&mut plan.project, "admin", Utc::now())
            .expect("stage")
            .id;

        let queue = GenerationQueue::spawn(database.clone(), StoreContext::default());
        let (job, done) = GenerationJob::new(JobPlan::Generate(plan), "admin").with_completion();
        queue.submit(job).await.expect("submit");
        let report = done.await.expect("completion").expect("generation");
        assert_eq!(report.inserted, 2);

        let status = store
            .property(PropertyOwner::Project, project_id, GENERATION_STATUS_PROPERTY)
            .expect("load");
        assert_eq!(status.as_deref(), Some("complete: inserted=2 ignored=0"));
    }
}
