use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::jobs::log_store::{LiveLog, LogStore};
use crate::jobs::model::{
    logs_from_value, Channel, JobId, JobKind, JobOutcome, JobStatus, LogEntry,
};
use crate::jobs::poller::{JobPoller, PollError};
use crate::push::{JobEvent, JobSubscription, PushClient};

/// Single-assignment slot for a job's outcome. The first `try_resolve` wins;
/// every later attempt is rejected.
#[derive(Default)]
pub struct OutcomeCell {
    value: OnceLock<JobOutcome>,
    notify: Notify,
}

impl OutcomeCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this call set the value.
    pub fn try_resolve(&self, outcome: JobOutcome) -> bool {
        let won = self.value.set(outcome).is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    pub fn get(&self) -> Option<&JobOutcome> {
        self.value.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.value.get().is_some()
    }

    pub async fn resolved(&self) -> &JobOutcome {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self.value.get() {
                return v;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePhase {
    Submitted,
    Running,
    Resolved,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("job {0} is already being reconciled")]
    AlreadyActive(JobId),
}

/// Watches one job through both channels at once and settles on the first
/// terminal status either of them reports.
#[derive(Clone)]
pub struct JobReconciler {
    poller: JobPoller,
    push: PushClient,
    active: Arc<Mutex<HashSet<JobId>>>,
}

impl JobReconciler {
    pub fn new(poller: JobPoller, push: PushClient) -> Self {
        Self {
            poller,
            push,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn push(&self) -> &PushClient {
        &self.push
    }

    pub fn is_active(&self, job_id: &JobId) -> bool {
        self.active
            .lock()
            .map(|a| a.contains(job_id))
            .unwrap_or(false)
    }

    /// Runs until the job resolves. New log lines are mirrored into `live`
    /// as they arrive; the returned outcome carries this job's full,
    /// de-duplicated log.
    ///
    /// A polling timeout is a failed outcome, not an error. The only error
    /// is a second concurrent call for the same job id.
    pub async fn reconcile(
        &self,
        job_id: &JobId,
        kind: JobKind,
        live: &LiveLog,
    ) -> Result<JobOutcome, ReconcileError> {
        let _claim = ActiveClaim::take(&self.active, job_id)?;
        trace_phase(job_id, ReconcilePhase::Submitted);

        let mut store = LogStore::new();
        let mut record = |entries: Vec<LogEntry>| {
            let added = store.append(entries);
            live.append(added);
        };

        let cell = Arc::new(OutcomeCell::new());
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Vec<LogEntry>>();

        // Not cancelled when push wins: the loop runs out its own budget and
        // its result is rejected by the cell.
        let mut poll = {
            let poller = self.poller.clone();
            let cell = Arc::clone(&cell);
            let job_id = job_id.clone();
            tokio::spawn(async move {
                let outcome = match poller
                    .poll(&job_id, kind, move |logs| {
                        let _ = progress_tx.send(logs);
                    })
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(PollError::Timeout { attempts, .. }) => {
                        tracing::warn!(%job_id, attempts, "job status polling timed out");
                        JobOutcome::timed_out(job_id.clone(), attempts)
                    }
                };
                if !cell.try_resolve(outcome) {
                    tracing::debug!(%job_id, "poll result arrived after resolution, discarded");
                }
            })
        };
        let mut poll_done = false;

        let mut subscription = Some(self.push.subscribe_to_job(job_id));
        trace_phase(job_id, ReconcilePhase::Running);

        let outcome = loop {
            tokio::select! {
                biased;

                Some(logs) = progress_rx.recv() => record(logs),

                outcome = cell.resolved() => break outcome.clone(),

                event = next_push_event(&mut subscription) => match event {
                    Some(event) => apply_push_event(job_id, event, &cell, &mut record),
                    None => {
                        tracing::debug!(%job_id, "push subscription ended, relying on polling");
                        subscription = None;
                    }
                },

                joined = &mut poll, if !poll_done => {
                    poll_done = true;
                    if let Err(e) = joined {
                        tracing::error!(%job_id, error = %e, "status polling task stopped");
                        cell.try_resolve(JobOutcome::from_terminal(
                            Some(job_id.clone()),
                            JobStatus::Failed,
                            Value::Null,
                            Some("status polling stopped unexpectedly".to_string()),
                            Vec::new(),
                            Channel::Poll,
                        ));
                    }
                }
            }
        };

        // Lines that arrived in the same turn as the resolution still count;
        // take what is buffered, then stop further push events.
        while let Ok(logs) = progress_rx.try_recv() {
            record(logs);
        }
        if let Some(mut sub) = subscription.take() {
            while let Some(event) = sub.try_next() {
                apply_push_event(job_id, event, &cell, &mut record);
            }
            sub.close();
        }
        trace_phase(job_id, ReconcilePhase::Resolved);

        record(outcome.logs.clone());
        drop(record);

        tracing::info!(
            %job_id,
            kind = kind.as_str(),
            status = %outcome.status,
            channel = ?outcome.resolved_by,
            "job resolved"
        );

        Ok(JobOutcome {
            logs: store.snapshot(),
            ..outcome
        })
    }
}

// Terminal statuses go through the cell, so one arriving after resolution
// is dropped there.
fn apply_push_event(
    job_id: &JobId,
    event: JobEvent,
    cell: &OutcomeCell,
    record: &mut impl FnMut(Vec<LogEntry>),
) {
    match event {
        JobEvent::Log(entry) => record(vec![entry]),
        JobEvent::Logs(entries) => record(entries),
        JobEvent::Status { status, result } if status.is_terminal() => {
            if let Some(logs) = result.get("logs") {
                record(logs_from_value(logs));
            }
            if cell.try_resolve(outcome_from_push(job_id, status, result)) {
                tracing::debug!(%job_id, %status, "push channel reported terminal status first");
            }
        }
        JobEvent::Status { status, result } => {
            tracing::debug!(%job_id, %status, "push status update");
            if let Some(logs) = result.get("logs") {
                record(logs_from_value(logs));
            }
        }
    }
}

fn outcome_from_push(job_id: &JobId, status: JobStatus, result: Value) -> JobOutcome {
    let logs = result.get("logs").map(logs_from_value).unwrap_or_default();
    JobOutcome::from_terminal(
        Some(job_id.clone()),
        status,
        result,
        None,
        logs,
        Channel::Push,
    )
}

async fn next_push_event(subscription: &mut Option<JobSubscription>) -> Option<JobEvent> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

fn trace_phase(job_id: &JobId, phase: ReconcilePhase) {
    tracing::debug!(%job_id, ?phase, "reconcile phase");
}

struct ActiveClaim {
    active: Arc<Mutex<HashSet<JobId>>>,
    job_id: JobId,
}

impl ActiveClaim {
    fn take(active: &Arc<Mutex<HashSet<JobId>>>, job_id: &JobId) -> Result<Self, ReconcileError> {
        let mut set = active.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(job_id.clone()) {
            return Err(ReconcileError::AlreadyActive(job_id.clone()));
        }
        Ok(Self {
            active: Arc::clone(active),
            job_id: job_id.clone(),
        })
    }
}

impl Drop for ActiveClaim {
    fn drop(&mut self) {
        let mut set = self.active.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.job_id);
    }
}
