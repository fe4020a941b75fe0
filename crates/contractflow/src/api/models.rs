// crates/contractflow/src/api/models.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::jobs::model::{deserialize_logs, JobId, LogEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub content: String,
}

impl ProjectFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        let file_type = file_type_for(&name).to_string();
        Self {
            name,
            file_type,
            content: content.into(),
        }
    }
}

fn file_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("rs") => "rust",
        Some("toml") => "toml",
        Some("md") => "markdown",
        Some("json") => "json",
        _ => "text",
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest<'a> {
    pub project_id: &'a str,
    pub files: &'a [ProjectFile],
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest<'a> {
    pub project_id: &'a str,
    pub wasm_base64: &'a str,
    pub network: &'a str,
}

/// Response to a compile or deploy submission. Either a `jobId` to watch,
/// or the finished result inline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, deserialize_with = "deserialize_logs")]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Everything else (wasmBase64, contractAddress, network, ...).
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub files: Vec<ProjectFile>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub last_deployed: Option<String>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub deployment_history: Vec<Value>,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, files: Vec<ProjectFile>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            files,
            created_at: None,
            updated_at: None,
            last_deployed: None,
            contract_address: None,
            deployment_history: Vec::new(),
        }
    }
}
