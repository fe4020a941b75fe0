//! Compile and deploy actions as the UI sees them: submit, wait for the
//! one outcome, apply it to project state and the live log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::api::{PlaygroundService, ProjectFile, ProjectRecord, SubmitResponse};
use crate::jobs::log_store::{LiveLog, LogStore};
use crate::jobs::model::{Channel, JobId, JobKind, JobOutcome, JobStatus, LogEntry, LogKind};
use crate::jobs::reconciler::JobReconciler;

const EXPLORER_BASE: &str = "https://stellar.expert/explorer";

/// Logical place a job occupies. Starting a new job in a slot releases
/// whatever the slot was still watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobSlot {
    Compile,
    Deploy,
}

impl From<JobKind> for JobSlot {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Compile => JobSlot::Compile,
            JobKind::Deploy => JobSlot::Deploy,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompiledArtifact {
    pub wasm_base64: Option<String>,
    pub wasm_url: Option<String>,
}

impl CompiledArtifact {
    pub fn from_payload(payload: &Value) -> Self {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            wasm_base64: field("wasmBase64"),
            wasm_url: field("wasmUrl"),
        }
    }

    pub fn from_wasm_base64(wasm_base64: impl Into<String>) -> Self {
        Self {
            wasm_base64: Some(wasm_base64.into()),
            wasm_url: None,
        }
    }

    /// Decoded size estimate, three bytes per four base64 characters.
    pub fn approx_size(&self) -> Option<usize> {
        self.wasm_base64.as_ref().map(|b| b.len() * 3 / 4)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileReport {
    pub success: bool,
    pub logs: Vec<LogEntry>,
    pub artifact: Option<CompiledArtifact>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub success: bool,
    pub logs: Vec<LogEntry>,
    pub contract_address: Option<String>,
    pub network: Option<String>,
    pub wallet_address: Option<String>,
    pub error: Option<String>,
}

impl DeployReport {
    fn failed(error: String, logs: Vec<LogEntry>, network: Option<String>) -> Self {
        Self {
            success: false,
            logs,
            contract_address: None,
            network,
            wallet_address: None,
            error: Some(error),
        }
    }
}

pub struct Workflow {
    service: Arc<dyn PlaygroundService>,
    reconciler: JobReconciler,
    live: LiveLog,
    project: Mutex<Option<ProjectRecord>>,
    slots: Mutex<HashMap<JobSlot, JobId>>,
}

impl Workflow {
    pub fn new(service: Arc<dyn PlaygroundService>, reconciler: JobReconciler) -> Self {
        Self {
            service,
            reconciler,
            live: LiveLog::new(),
            project: Mutex::new(None),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The continuously updated log the UI renders.
    pub fn live_log(&self) -> LiveLog {
        self.live.clone()
    }

    pub fn clear_logs(&self) {
        self.live.clear();
    }

    pub fn project(&self) -> Option<ProjectRecord> {
        lock(&self.project).clone()
    }

    pub fn set_project(&self, project: ProjectRecord) {
        *lock(&self.project) = Some(project);
    }

    pub fn active_job(&self, slot: JobSlot) -> Option<JobId> {
        lock(&self.slots).get(&slot).cloned()
    }

    pub fn reconciler(&self) -> &JobReconciler {
        &self.reconciler
    }

    /// Releases every watched job and closes the push connection.
    pub fn shutdown(&self) {
        for (_, job_id) in lock(&self.slots).drain() {
            self.reconciler.push().unsubscribe_from_job(&job_id);
        }
        self.reconciler.push().disconnect();
    }

    pub async fn compile(&self, project_id: &str, files: &[ProjectFile]) -> CompileReport {
        self.note(LogKind::Info, "Starting compilation...");

        let outcome = match self.service.submit_compile(project_id, files).await {
            Ok(submitted) => self.settle(JobKind::Compile, submitted).await,
            Err(e) => {
                tracing::warn!(project_id, error = %e, "compile submission failed");
                let msg = format!("{e:#}");
                self.note(LogKind::Error, format!("Compilation failed: {msg}"));
                return CompileReport {
                    success: false,
                    logs: Vec::new(),
                    artifact: None,
                    error: Some(msg),
                };
            }
        };

        if !outcome.is_success() {
            let msg = failure_message(&outcome);
            self.note(LogKind::Error, format!("Compilation failed: {msg}"));
            return CompileReport {
                success: false,
                logs: outcome.logs,
                artifact: None,
                error: Some(msg),
            };
        }

        let artifact = CompiledArtifact::from_payload(&outcome.payload);
        self.note(
            LogKind::Success,
            "Compilation successful! WASM file generated.",
        );
        if let Some(size) = artifact.approx_size() {
            self.note(LogKind::Info, format!("WASM file size: ~{size} bytes"));
        }

        CompileReport {
            success: true,
            logs: outcome.logs,
            artifact: Some(artifact),
            error: None,
        }
    }

    pub async fn deploy(
        &self,
        project_id: &str,
        artifact: &CompiledArtifact,
        network: &str,
    ) -> DeployReport {
        let Some(wasm) = artifact.wasm_base64.as_deref() else {
            let msg = "no compiled WASM to deploy".to_string();
            self.note(LogKind::Error, format!("Deployment failed: {msg}"));
            return DeployReport::failed(msg, Vec::new(), Some(network.to_string()));
        };

        self.note(LogKind::Info, format!("Deploying to {network}..."));

        let outcome = match self.service.submit_deploy(project_id, wasm, network).await {
            Ok(submitted) => self.settle(JobKind::Deploy, submitted).await,
            Err(e) => {
                tracing::warn!(project_id, error = %e, "deploy submission failed");
                let msg = format!("{e:#}");
                self.note(LogKind::Error, format!("Deployment failed: {msg}"));
                return DeployReport::failed(msg, Vec::new(), Some(network.to_string()));
            }
        };

        let network_used = outcome
            .payload_str("network")
            .unwrap_or_else(|| network.to_string());

        if !outcome.is_success() {
            let msg = failure_message(&outcome);
            self.note(LogKind::Error, format!("Deployment failed: {msg}"));
            return DeployReport::failed(msg, outcome.logs, Some(network_used));
        }

        let Some(address) = outcome.payload_str("contractAddress") else {
            let msg = "deployment finished without a contract address".to_string();
            self.note(LogKind::Error, format!("Deployment failed: {msg}"));
            return DeployReport::failed(msg, outcome.logs, Some(network_used));
        };

        self.refresh_project(project_id, &address).await;

        let wallet_address = outcome.payload_str("walletAddress");
        self.note(
            LogKind::Success,
            format!("Deployment successful! Contract deployed at: {address}"),
        );
        self.note(LogKind::Info, format!("Network: {network_used}"));
        if let Some(wallet) = &wallet_address {
            self.note(LogKind::Info, format!("Deployed by: {wallet}"));
        }
        self.note(
            LogKind::Info,
            format!("View on Stellar Expert: {EXPLORER_BASE}/{network_used}/contract/{address}"),
        );

        DeployReport {
            success: true,
            logs: outcome.logs,
            contract_address: Some(address),
            network: Some(network_used),
            wallet_address,
            error: None,
        }
    }

    /// Compiles, then deploys the fresh artifact. Nothing is deployed when
    /// compilation fails or yields no WASM.
    pub async fn compile_and_deploy(
        &self,
        project_id: &str,
        files: &[ProjectFile],
        network: &str,
    ) -> DeployReport {
        let compiled = self.compile(project_id, files).await;
        if !compiled.success {
            let msg = format!(
                "compilation failed, cannot deploy: {}",
                compiled.error.as_deref().unwrap_or(crate::jobs::JobFailure::GENERIC_MESSAGE)
            );
            return DeployReport::failed(msg, compiled.logs, Some(network.to_string()));
        }

        match compiled.artifact {
            Some(artifact) if artifact.wasm_base64.is_some() => {
                self.deploy(project_id, &artifact, network).await
            }
            _ => {
                let msg = "compilation produced no WASM, cannot deploy".to_string();
                self.note(LogKind::Error, format!("Deployment failed: {msg}"));
                DeployReport::failed(msg, compiled.logs, Some(network.to_string()))
            }
        }
    }

    // Either the submission already carries the result, or there is a job
    // to watch until it resolves.
    async fn settle(&self, kind: JobKind, submitted: SubmitResponse) -> JobOutcome {
        self.live.append(submitted.logs.clone());

        let Some(job_id) = submitted.job_id.clone() else {
            tracing::debug!(kind = kind.as_str(), "submission finished inline");
            return inline_outcome(submitted);
        };

        let slot = JobSlot::from(kind);
        self.claim_slot(slot, &job_id);

        let mut outcome = match self.reconciler.reconcile(&job_id, kind, &self.live).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "could not reconcile job");
                JobOutcome::from_terminal(
                    Some(job_id.clone()),
                    JobStatus::Failed,
                    Value::Null,
                    Some(e.to_string()),
                    Vec::new(),
                    Channel::Poll,
                )
            }
        };

        self.release_slot(slot, &job_id);

        // the report starts with what the submission itself logged
        let mut logs = LogStore::new();
        logs.append(submitted.logs);
        logs.append(outcome.logs);
        outcome.logs = logs.snapshot();
        outcome
    }

    fn claim_slot(&self, slot: JobSlot, job_id: &JobId) {
        let previous = lock(&self.slots).insert(slot, job_id.clone());
        if let Some(previous) = previous.filter(|p| p != job_id) {
            tracing::info!(%previous, next = %job_id, ?slot, "releasing previous job in slot");
            self.reconciler.push().unsubscribe_from_job(&previous);
        }
    }

    fn release_slot(&self, slot: JobSlot, job_id: &JobId) {
        let mut slots = lock(&self.slots);
        if slots.get(&slot) == Some(job_id) {
            slots.remove(&slot);
        }
    }

    // Prefer the server's record; if it can't be fetched the deployment
    // still counted, so patch the local copy instead.
    async fn refresh_project(&self, project_id: &str, contract_address: &str) {
        match self.service.fetch_project(project_id).await {
            Ok(record) => self.set_project(record),
            Err(e) => {
                tracing::warn!(project_id, error = %e, "failed to refetch project, patching local copy");
                let mut project = lock(&self.project);
                if let Some(p) = project.as_mut().filter(|p| p.id == project_id) {
                    p.contract_address = Some(contract_address.to_string());
                    p.last_deployed = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
                }
            }
        }
    }

    fn note(&self, kind: LogKind, message: impl Into<String>) {
        self.live.push(LogEntry::now(kind, message));
    }
}

fn inline_outcome(submitted: SubmitResponse) -> JobOutcome {
    let status = if submitted.success {
        JobStatus::Completed
    } else {
        JobStatus::Failed
    };
    let error = submitted.error.or(submitted.message.filter(|_| !submitted.success));
    JobOutcome::from_terminal(
        None,
        status,
        Value::Object(submitted.payload),
        error,
        submitted.logs,
        Channel::Inline,
    )
}

fn failure_message(outcome: &JobOutcome) -> String {
    outcome
        .error_message()
        .unwrap_or_else(|| crate::jobs::JobFailure::GENERIC_MESSAGE.to_string())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
