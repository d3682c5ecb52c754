//! HTTP client for the remote collection service.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::CollectorError;
use crate::models::{ClientInfoReport, NetworkSpeedReport, PingReport, RemoteTarget, VersionInfo};

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const ARTIFACT_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of the collector-managed endpoint list.
#[async_trait]
pub trait RemoteTargets: Send + Sync {
    async fn fetch_targets(&self) -> Result<Vec<String>, CollectorError>;
}

#[derive(Clone)]
pub struct CollectorClient {
    http: reqwest::Client,
    base_url: String,
}

impl CollectorClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self { http, base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &'static str, body: &T) -> Result<(), CollectorError> {
        let resp = self
            .http
            .post(self.url(path))
            .timeout(PUSH_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|source| CollectorError::Transport { path, source })?;
        let status = resp.status();
        debug!(path, %status, "collector push");
        if status.is_success() {
            Ok(())
        } else {
            Err(CollectorError::Status { path, status })
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &'static str) -> Result<T, CollectorError> {
        let resp = self
            .http
            .get(self.url(path))
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|source| CollectorError::Transport { path, source })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CollectorError::Status { path, status });
        }
        resp.json::<T>().await.map_err(|source| CollectorError::Decode { path, source })
    }

    pub async fn push_ping(&self, report: &PingReport) -> Result<(), CollectorError> {
        self.post("/push_ping", report).await
    }

    pub async fn push_client_info(&self, report: &ClientInfoReport) -> Result<(), CollectorError> {
        self.post("/push_client_info", report).await
    }

    pub async fn push_network_speed(&self, report: &NetworkSpeedReport) -> Result<(), CollectorError> {
        self.post("/push_network_speed", report).await
    }

    pub async fn fetch_version(&self) -> Result<VersionInfo, CollectorError> {
        self.get_json("/client_version").await
    }

    /// Replacement build served for self-update.
    pub async fn fetch_artifact(&self) -> Result<Vec<u8>, CollectorError> {
        let path = "/client_script";
        let resp = self
            .http
            .get(self.url(path))
            .timeout(ARTIFACT_TIMEOUT)
            .send()
            .await
            .map_err(|source| CollectorError::Transport { path, source })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CollectorError::Status { path, status });
        }
        let bytes = resp.bytes().await.map_err(|source| CollectorError::Decode { path, source })?;
        if bytes.is_empty() {
            return Err(CollectorError::EmptyArtifact { path });
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl RemoteTargets for CollectorClient {
    async fn fetch_targets(&self) -> Result<Vec<String>, CollectorError> {
        let targets: Vec<RemoteTarget> = self.get_json("/get_targets").await?;
        Ok(targets.into_iter().map(|t| t.target).collect())
    }
}
