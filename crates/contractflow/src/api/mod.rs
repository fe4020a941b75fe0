//! HTTP client for the compile/deploy service.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::jobs::model::{JobEnvelope, JobId, JobSnapshot};
use crate::jobs::poller::JobSource;

pub mod models;

pub use models::{CompileRequest, DeployRequest, ProjectFile, ProjectRecord, SubmitResponse};

/// The service operations the workflow depends on.
#[async_trait]
pub trait PlaygroundService: Send + Sync {
    async fn submit_compile(
        &self,
        project_id: &str,
        files: &[ProjectFile],
    ) -> anyhow::Result<SubmitResponse>;

    async fn submit_deploy(
        &self,
        project_id: &str,
        wasm_base64: &str,
        network: &str,
    ) -> anyhow::Result<SubmitResponse>;

    async fn fetch_project(&self, project_id: &str) -> anyhow::Result<ProjectRecord>;
}

#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: Url,
}

impl ServiceClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_base_url(&config.api_url, config.http_timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid API URL {base_url}"))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("API URL {base_url} cannot carry a path");
        }

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    // Each segment is percent-encoded, so an id containing `/`, `?` or `#`
    // stays inside its own path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> anyhow::Result<T> {
        let response = req.send().await.context("Failed to send request")?;

        if response.status().is_success() {
            response.json().await.context("Failed to parse response")
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({status}): {body}")
        }
    }
}

#[async_trait]
impl PlaygroundService for ServiceClient {
    async fn submit_compile(
        &self,
        project_id: &str,
        files: &[ProjectFile],
    ) -> anyhow::Result<SubmitResponse> {
        let req = self
            .client
            .post(self.endpoint(&["compile"]))
            .json(&CompileRequest { project_id, files });
        self.send(req).await.context("compile submission failed")
    }

    async fn submit_deploy(
        &self,
        project_id: &str,
        wasm_base64: &str,
        network: &str,
    ) -> anyhow::Result<SubmitResponse> {
        let req = self.client.post(self.endpoint(&["deploy"])).json(&DeployRequest {
            project_id,
            wasm_base64,
            network,
        });
        self.send(req).await.context("deploy submission failed")
    }

    async fn fetch_project(&self, project_id: &str) -> anyhow::Result<ProjectRecord> {
        let req = self.client.get(self.endpoint(&["projects", project_id]));
        self.send(req).await.context("failed to fetch project")
    }
}

#[async_trait]
impl JobSource for ServiceClient {
    async fn fetch_job(&self, job_id: &JobId) -> anyhow::Result<JobSnapshot> {
        let req = self.client.get(self.endpoint(&["jobs", job_id.as_str()]));
        let envelope: JobEnvelope = self.send(req).await.context("failed to fetch job")?;
        Ok(envelope.job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ServiceClient {
        ServiceClient::with_base_url(base, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn ids_are_escaped_into_one_segment() {
        let c = client("http://localhost:3001/api/");
        assert_eq!(
            c.endpoint(&["jobs", "a/b?c#d"]).as_str(),
            "http://localhost:3001/api/jobs/a%2Fb%3Fc%23d"
        );
        assert_eq!(
            client("http://localhost:3001").endpoint(&["compile"]).as_str(),
            "http://localhost:3001/compile"
        );
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(ServiceClient::with_base_url("not a url", Duration::from_secs(1)).is_err());
        assert!(ServiceClient::with_base_url("mailto:ops@example.com", Duration::from_secs(1)).is_err());
    }
}
