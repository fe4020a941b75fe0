//! Client-side reconciliation of long-running compile/deploy jobs.
//!
//! A job is watched through two channels at once: status polling over HTTP
//! and a push subscription over a WebSocket. Log lines from both are merged
//! into one de-duplicated stream, and whichever channel first reports a
//! terminal status decides the job's single outcome.

pub mod api;
pub mod config;
pub mod jobs;
pub mod push;
pub mod workflow;

pub use api::{PlaygroundService, ProjectFile, ProjectRecord, ServiceClient};
pub use config::Config;
pub use jobs::{JobId, JobKind, JobOutcome, JobReconciler, LiveLog, LogEntry};
pub use push::{PushClient, WsTransport};
pub use workflow::{CompileReport, CompiledArtifact, DeployReport, Workflow};

use std::sync::Arc;

/// Wires the HTTP client, push client and reconciler from configuration.
pub fn build_workflow(config: &Config) -> anyhow::Result<Workflow> {
    let service = Arc::new(ServiceClient::new(config)?);
    let push = PushClient::new(
        Arc::new(WsTransport::new(config.ws_url.clone())),
        config.push.clone(),
    );
    let poller = jobs::JobPoller::new(service.clone(), config.poll.clone());
    let reconciler = JobReconciler::new(poller, push);
    Ok(Workflow::new(service, reconciler))
}
