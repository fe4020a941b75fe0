#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use contractflow::api::{PlaygroundService, ProjectFile, ProjectRecord, SubmitResponse};
use contractflow::jobs::{
    JobId, JobPoller, JobReconciler, JobSnapshot, JobSource, JobStatus, LogEntry, LogKind,
    PollConfig,
};
use contractflow::push::{
    ClientFrame, PushClient, PushConfig, PushConnection, PushTransport, ReconnectConfig,
    ServerFrame,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub fn log(message: &str, timestamp: &str) -> LogEntry {
    LogEntry::new(LogKind::Info, message, timestamp)
}

pub fn snapshot(status: &str, logs: &[LogEntry]) -> JobSnapshot {
    serde_json::from_value(json!({
        "status": status,
        "result": { "logs": logs },
    }))
    .expect("valid snapshot")
}

pub fn snapshot_with(status: &str, result: Value) -> JobSnapshot {
    serde_json::from_value(json!({ "status": status, "result": result })).expect("valid snapshot")
}

#[derive(Clone)]
pub enum Reply {
    Status(JobSnapshot),
    Fail,
}

/// Answers status queries from a per-job script. The last reply repeats
/// once the script runs out.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<JobId, Vec<Reply>>>,
    calls: Mutex<HashMap<JobId, usize>>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, job_id: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(JobId::from(job_id), replies);
    }

    pub fn calls(&self, job_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&JobId::from(job_id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobSource for ScriptedSource {
    async fn fetch_job(&self, job_id: &JobId) -> anyhow::Result<JobSnapshot> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(job_id.clone()).or_insert(0);
            *n += 1;
            *n - 1
        };
        let reply = {
            let scripts = self.scripts.lock().unwrap();
            let script = scripts
                .get(job_id)
                .ok_or_else(|| anyhow::anyhow!("404 unknown job {job_id}"))?;
            script
                .get(n)
                .or_else(|| script.last())
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("empty script"))?
        };
        match reply {
            Reply::Status(s) => Ok(s),
            Reply::Fail => anyhow::bail!("API error (502 Bad Gateway): upstream"),
        }
    }
}

struct ServerSide {
    to_client: mpsc::UnboundedSender<ServerFrame>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
}

/// In-memory push transport. The test plays the server.
#[derive(Default)]
pub struct FakePushServer {
    current: Mutex<Option<ServerSide>>,
    received: Mutex<Vec<ClientFrame>>,
    opens: AtomicUsize,
    failures_left: AtomicUsize,
    hang: AtomicBool,
}

impl FakePushServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next `n` connection attempts are refused.
    pub fn refuse(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Connection attempts never complete.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn emit(&self, frame: ServerFrame) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(side) => side.to_client.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn emit_log(&self, job_id: &str, entry: LogEntry) -> bool {
        self.emit(ServerFrame::Log {
            job_id: JobId::from(job_id),
            log: Some(entry),
        })
    }

    pub fn emit_status(&self, job_id: &str, status: JobStatus, result: Value) -> bool {
        self.emit(ServerFrame::Status {
            job_id: JobId::from(job_id),
            status,
            result,
        })
    }

    /// Simulates the server going away.
    pub fn drop_connection(&self) {
        self.collect();
        self.current.lock().unwrap().take();
    }

    /// Every frame the client has sent so far, across connections.
    pub fn client_frames(&self) -> Vec<ClientFrame> {
        self.collect();
        self.received.lock().unwrap().clone()
    }

    fn collect(&self) {
        let mut current = self.current.lock().unwrap();
        if let Some(side) = current.as_mut() {
            let mut received = self.received.lock().unwrap();
            while let Ok(frame) = side.from_client.try_recv() {
                received.push(frame);
            }
        }
    }
}

#[async_trait]
impl PushTransport for FakePushServer {
    async fn open(&self) -> anyhow::Result<PushConnection> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("connection refused");
        }

        self.collect();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        *self.current.lock().unwrap() = Some(ServerSide {
            to_client,
            from_client,
        });
        Ok(PushConnection { outbound, inbound })
    }
}

pub fn fast_poll(attempts: u32, interval_ms: u64) -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(interval_ms),
        compile_attempts: attempts,
        deploy_attempts: attempts,
    }
}

pub fn push_config() -> PushConfig {
    PushConfig {
        reconnect: ReconnectConfig {
            max_attempts: 5,
            base_ms: 1_000,
            max_ms: 5_000,
            jitter_pct: 0.0,
        },
        join_wait: Duration::from_secs(5),
        event_buffer: 64,
    }
}

pub struct Harness {
    pub source: Arc<ScriptedSource>,
    pub server: Arc<FakePushServer>,
    pub push: PushClient,
    pub reconciler: JobReconciler,
}

pub fn harness(poll: PollConfig) -> Harness {
    let source = ScriptedSource::new();
    let server = FakePushServer::new();
    let push = PushClient::new(server.clone(), push_config());
    let poller = JobPoller::new(source.clone(), poll);
    let reconciler = JobReconciler::new(poller, push.clone());
    Harness {
        source,
        server,
        push,
        reconciler,
    }
}

/// Lets spawned tasks run without moving virtual time much.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Scripted compile/deploy service.
#[derive(Default)]
pub struct ScriptedService {
    compile_replies: Mutex<Vec<Value>>,
    deploy_replies: Mutex<Vec<Value>>,
    project: Mutex<Option<ProjectRecord>>,
    pub compile_calls: AtomicUsize,
    pub deploy_calls: AtomicUsize,
    pub project_calls: AtomicUsize,
}

impl ScriptedService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_compile(&self, reply: Value) {
        self.compile_replies.lock().unwrap().push(reply);
    }

    pub fn on_deploy(&self, reply: Value) {
        self.deploy_replies.lock().unwrap().push(reply);
    }

    /// `None` makes project fetches fail.
    pub fn serve_project(&self, project: Option<ProjectRecord>) {
        *self.project.lock().unwrap() = project;
    }

    fn next(replies: &Mutex<Vec<Value>>) -> anyhow::Result<SubmitResponse> {
        let mut replies = replies.lock().unwrap();
        if replies.is_empty() {
            anyhow::bail!("API error (500 Internal Server Error): no reply scripted");
        }
        let reply = replies.remove(0);
        if reply.is_null() {
            anyhow::bail!("API error (503 Service Unavailable): down");
        }
        Ok(serde_json::from_value(reply)?)
    }
}

#[async_trait]
impl PlaygroundService for ScriptedService {
    async fn submit_compile(
        &self,
        _project_id: &str,
        _files: &[ProjectFile],
    ) -> anyhow::Result<SubmitResponse> {
        self.compile_calls.fetch_add(1, Ordering::SeqCst);
        Self::next(&self.compile_replies)
    }

    async fn submit_deploy(
        &self,
        _project_id: &str,
        _wasm_base64: &str,
        _network: &str,
    ) -> anyhow::Result<SubmitResponse> {
        self.deploy_calls.fetch_add(1, Ordering::SeqCst);
        Self::next(&self.deploy_replies)
    }

    async fn fetch_project(&self, project_id: &str) -> anyhow::Result<ProjectRecord> {
        self.project_calls.fetch_add(1, Ordering::SeqCst);
        self.project
            .lock()
            .unwrap()
            .clone()
            .filter(|p| p.id == project_id)
            .ok_or_else(|| anyhow::anyhow!("API error (404 Not Found): project"))
    }
}
