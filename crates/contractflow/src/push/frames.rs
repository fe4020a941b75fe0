use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jobs::model::{deserialize_log, deserialize_logs, JobId, JobStatus, LogEntry};

/// Client -> server signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "subscribe:job")]
    Subscribe(JobId),
    #[serde(rename = "unsubscribe:job")]
    Unsubscribe(JobId),
}

/// Server -> client events. The channel is process-wide, so every frame
/// carries the job id it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "job:log")]
    Log {
        #[serde(rename = "jobId")]
        job_id: JobId,
        // malformed entries are skipped, same as in `job:logs`
        #[serde(default, deserialize_with = "deserialize_log")]
        log: Option<LogEntry>,
    },
    #[serde(rename = "job:logs")]
    Logs {
        #[serde(rename = "jobId")]
        job_id: JobId,
        #[serde(default, deserialize_with = "deserialize_logs")]
        logs: Vec<LogEntry>,
    },
    #[serde(rename = "job:status")]
    Status {
        #[serde(rename = "jobId")]
        job_id: JobId,
        status: JobStatus,
        #[serde(default)]
        result: Value,
    },
}

impl ServerFrame {
    pub fn job_id(&self) -> &JobId {
        match self {
            ServerFrame::Log { job_id, .. }
            | ServerFrame::Logs { job_id, .. }
            | ServerFrame::Status { job_id, .. } => job_id,
        }
    }

    pub fn into_event(self) -> JobEvent {
        match self {
            ServerFrame::Log { log: Some(log), .. } => JobEvent::Log(log),
            ServerFrame::Log { log: None, .. } => JobEvent::Logs(Vec::new()),
            ServerFrame::Logs { logs, .. } => JobEvent::Logs(logs),
            ServerFrame::Status { status, result, .. } => JobEvent::Status { status, result },
        }
    }
}

/// What a job subscriber sees.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Log(LogEntry),
    Logs(Vec<LogEntry>),
    Status { status: JobStatus, result: Value },
}
