//! HTTP client for the update repository builder.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use fleetgrid_rollout::RepoBuilder;
use fleetgrid_state::RolloutId;

use crate::error::ClientResult;
use crate::transport::{self, JsonClient};

#[derive(Debug, Serialize)]
struct BuildRequest {
    update_id: RolloutId,
}

#[derive(Debug, Deserialize)]
struct BuildResponse {
    url: String,
}

/// Asks the builder service at `{base}/api/v1/repos/build` for an update repo.
#[derive(Debug, Clone)]
pub struct HttpRepoBuilder {
    endpoint: String,
    client: JsonClient,
}

impl HttpRepoBuilder {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            endpoint: transport::join(base_url, "api/v1/repos/build"),
            client: JsonClient::new(timeout)?,
        })
    }
}

#[async_trait]
impl RepoBuilder for HttpRepoBuilder {
    async fn build(&self, rollout_id: RolloutId) -> anyhow::Result<String> {
        let built: BuildResponse = self
            .client
            .post(
                &self.endpoint,
                &BuildRequest {
                    update_id: rollout_id,
                },
            )
            .await?;
        if built.url.is_empty() {
            anyhow::bail!("repo builder returned an empty url for update {rollout_id}");
        }
        info!(rollout_id, url = %built.url, "update repo built");
        Ok(built.url)
    }
}
