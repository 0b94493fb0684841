//! Pull path: one task per configured peer fetching its tree over HTTP.

use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{MergeOutcome, Node};

use crate::config::RemoteTarget;
use crate::mesh::Mesh;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { url: String, status: reqwest::StatusCode },
    #[error("cannot decode snapshot from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot from {url} rejected")]
    Rejected { url: String },
}

pub struct Poller {
    client: reqwest::Client,
    mesh: Mesh,
}

impl Poller {
    pub fn new(mesh: Mesh) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client, mesh })
    }

    fn url(target: &RemoteTarget) -> String {
        format!("http://{}:{}/", target.hostname, target.port)
    }

    async fn fetch(&self, url: &str, depth: i32) -> Result<Node, PollError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| PollError::Http { url: url.to_string(), source })?;
        if !response.status().is_success() {
            return Err(PollError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| PollError::Http { url: url.to_string(), source })?;
        Node::from_json(&body, depth).map_err(|source| PollError::Decode { url: url.to_string(), source })
    }

    /// Fetches the peer's tree (up to `check_tries` attempts) and merges it.
    pub async fn fetch_and_merge(&self, target: &RemoteTarget) -> Result<(), PollError> {
        let url = Self::url(target);
        let mut attempt = 0;
        let node = loop {
            attempt += 1;
            match self.fetch(&url, target.depth).await {
                Ok(node) => break node,
                Err(e) if attempt < target.check_tries => {
                    debug!(url = %url, attempt, error = %e, "poll attempt failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };

        match self.mesh.merge(node) {
            MergeOutcome::Merged { .. } => Ok(()),
            MergeOutcome::Rejected(_) => Err(PollError::Rejected { url }),
        }
    }

    /// Polls `target` every `check_interval` seconds until cancelled.
    pub fn spawn(self, target: RemoteTarget, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(host = %target.hostname, port = target.port, interval = target.check_interval, "polling remote node");
            let mut interval = tokio::time::interval(Duration::from_secs(target.check_interval));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.fetch_and_merge(&target).await {
                            warn!(host = %target.hostname, error = %e, "remote node poll failed");
                        }
                    }
                }
            }
        })
    }
}
