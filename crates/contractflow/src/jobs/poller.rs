use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::jobs::model::{Channel, JobId, JobKind, JobOutcome, JobSnapshot, LogEntry};

/// Anything that can answer "what is the state of job X right now".
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_job(&self, job_id: &JobId) -> anyhow::Result<JobSnapshot>;
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub compile_attempts: u32,
    pub deploy_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            // ~2 minutes
            compile_attempts: 120,
            // on-chain submission is slower, ~3 minutes
            deploy_attempts: 180,
        }
    }
}

impl PollConfig {
    pub fn attempts_for(&self, kind: JobKind) -> u32 {
        match kind {
            JobKind::Compile => self.compile_attempts,
            JobKind::Deploy => self.deploy_attempts,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PollError {
    #[error("{kind} job {job_id} timed out after {attempts} status checks")]
    Timeout {
        job_id: JobId,
        kind: &'static str,
        attempts: u32,
    },
}

/// Bounded status polling. Stateless between calls.
#[derive(Clone)]
pub struct JobPoller {
    source: Arc<dyn JobSource>,
    cfg: PollConfig,
}

impl JobPoller {
    pub fn new(source: Arc<dyn JobSource>, cfg: PollConfig) -> Self {
        Self { source, cfg }
    }

    pub fn config(&self) -> &PollConfig {
        &self.cfg
    }

    /// Polls until the job reaches a terminal status or the attempt budget
    /// runs out. Logs from non-terminal responses go to `on_progress`
    /// as-is; de-duplication is the caller's job.
    pub async fn poll<F>(
        &self,
        job_id: &JobId,
        kind: JobKind,
        mut on_progress: F,
    ) -> Result<JobOutcome, PollError>
    where
        F: FnMut(Vec<LogEntry>) + Send,
    {
        let max_attempts = self.cfg.attempts_for(kind);

        for attempt in 1..=max_attempts {
            match self.source.fetch_job(job_id).await {
                Ok(snapshot) if snapshot.status.is_terminal() => {
                    tracing::debug!(%job_id, attempt, status = %snapshot.status, "poll saw terminal status");
                    return Ok(outcome_from_snapshot(job_id, snapshot));
                }
                Ok(snapshot) => {
                    let logs = snapshot.logs();
                    if !logs.is_empty() {
                        on_progress(logs);
                    }
                }
                Err(e) => {
                    // transient; keep going until the budget is spent
                    tracing::warn!(%job_id, attempt, error = %e, "job status query failed");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.cfg.interval).await;
            }
        }

        Err(PollError::Timeout {
            job_id: job_id.clone(),
            kind: kind.as_str(),
            attempts: max_attempts,
        })
    }
}

fn outcome_from_snapshot(job_id: &JobId, snapshot: JobSnapshot) -> JobOutcome {
    let logs = snapshot.logs();
    let error = snapshot.error_message();
    JobOutcome::from_terminal(
        Some(job_id.clone()),
        snapshot.status,
        snapshot.result.unwrap_or(Value::Null),
        error,
        logs,
        Channel::Poll,
    )
}
