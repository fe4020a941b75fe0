use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque job identifier handed out by the compile/deploy service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    #[default]
    Info,
    Success,
    Error,
    Warning,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Info => "info",
            LogKind::Success => "success",
            LogKind::Error => "error",
            LogKind::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: LogKind,
    pub message: String,
    pub timestamp: String,
}

impl LogEntry {
    pub fn new(kind: LogKind, message: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Stamps the entry with the current UTC time, millisecond precision.
    pub fn now(kind: LogKind, message: impl Into<String>) -> Self {
        Self::new(
            kind,
            message,
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )
    }

    /// Identity used for de-duplication: same message at the same timestamp
    /// is the same observation, whichever channel delivered it.
    pub fn identity(&self) -> (&str, &str) {
        (&self.message, &self.timestamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

// Queue backends report extra non-terminal states (waiting, delayed, ...);
// all of them mean "keep watching".
impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "active" => JobStatus::Active,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which class of job is being watched; drives the polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Compile,
    Deploy,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Compile => "compile",
            JobKind::Deploy => "deploy",
        }
    }
}

/// Body of `GET /jobs/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobEnvelope {
    #[serde(default)]
    pub success: bool,
    pub job: JobSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn logs(&self) -> Vec<LogEntry> {
        self.result
            .as_ref()
            .and_then(|r| r.get("logs"))
            .map(logs_from_value)
            .unwrap_or_default()
    }

    /// Structured error, falling back to the one nested in the result.
    pub fn error_message(&self) -> Option<String> {
        self.error
            .clone()
            .filter(|e| !e.trim().is_empty())
            .or_else(|| self.result.as_ref().and_then(error_from_result))
    }
}

/// Where a terminal outcome came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Poll,
    /// The submission response already carried the finished result.
    Inline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum JobFailure {
    /// The service said the job failed.
    Reported { message: String, detail: Value },
    /// No terminal status was observed within the polling budget.
    Timeout { attempts: u32 },
}

impl JobFailure {
    pub const GENERIC_MESSAGE: &'static str = "job failed";

    pub fn reported(message: Option<String>, detail: Value) -> Self {
        JobFailure::Reported {
            message: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| Self::GENERIC_MESSAGE.to_string()),
            detail,
        }
    }

    pub fn message(&self) -> String {
        match self {
            JobFailure::Reported { message, .. } => message.clone(),
            JobFailure::Timeout { attempts } => {
                format!("job timed out after {attempts} status checks")
            }
        }
    }
}

/// Final, immutable result of one job. Built exactly once per job id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: Option<JobId>,
    pub status: JobStatus,
    pub payload: Value,
    pub failure: Option<JobFailure>,
    pub logs: Vec<LogEntry>,
    pub resolved_by: Channel,
}

impl JobOutcome {
    /// Builds an outcome from a terminal status plus its result payload.
    pub fn from_terminal(
        job_id: Option<JobId>,
        status: JobStatus,
        payload: Value,
        error: Option<String>,
        logs: Vec<LogEntry>,
        resolved_by: Channel,
    ) -> Self {
        let failure = match status {
            JobStatus::Completed => None,
            _ => Some(JobFailure::reported(
                error.or_else(|| error_from_result(&payload)),
                payload.clone(),
            )),
        };
        let status = if status == JobStatus::Completed {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        Self {
            job_id,
            status,
            payload,
            failure,
            logs,
            resolved_by,
        }
    }

    pub fn timed_out(job_id: JobId, attempts: u32) -> Self {
        Self {
            job_id: Some(job_id),
            status: JobStatus::Failed,
            payload: Value::Null,
            failure: Some(JobFailure::Timeout { attempts }),
            logs: Vec::new(),
            resolved_by: Channel::Poll,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn payload_str(&self, key: &str) -> Option<String> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn error_message(&self) -> Option<String> {
        self.failure.as_ref().map(JobFailure::message)
    }
}

/// Parses a `logs` value leniently: anything that is not an array is empty,
/// entries that do not look like log lines are dropped.
pub fn logs_from_value(value: &Value) -> Vec<LogEntry> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn deserialize_logs<'de, D>(deserializer: D) -> Result<Vec<LogEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(logs_from_value(&value))
}

/// Single-entry counterpart of [`deserialize_logs`]: an entry that does not
/// look like a log line becomes `None` instead of failing the whole frame.
pub(crate) fn deserialize_log<'de, D>(deserializer: D) -> Result<Option<LogEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn error_from_result(result: &Value) -> Option<String> {
    match result.get("error")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
