//! HTTP client for the remote execution dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use fleetgrid_rollout::{DispatchRequest, DispatchResponse, Dispatcher};

use crate::error::ClientResult;
use crate::transport::{self, JsonClient};

/// One run requested from the dispatcher.
#[derive(Debug, Serialize)]
struct RunInput<'a> {
    recipient: &'a str,
    url: &'a str,
    account: &'a str,
}

/// The dispatcher's answer for one requested run.
#[derive(Debug, Deserialize)]
struct RunCreated {
    code: u16,
    #[serde(default)]
    id: Option<String>,
}

/// Posts execution requests to `{base}/internal/dispatch`.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    endpoint: String,
    client: JsonClient,
}

impl HttpDispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            endpoint: transport::join(base_url, "internal/dispatch"),
            client: JsonClient::new(timeout)?,
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn execute(&self, request: &DispatchRequest) -> anyhow::Result<Vec<DispatchResponse>> {
        let runs = [RunInput {
            recipient: &request.recipient,
            url: &request.script_url,
            account: &request.account,
        }];
        debug!(recipient = %request.recipient, endpoint = %self.endpoint, "dispatching run");
        let created: Vec<RunCreated> = self.client.post(&self.endpoint, &runs).await?;
        Ok(created
            .into_iter()
            .map(|run| DispatchResponse {
                status_code: run.code,
                correlation_id: run.id.filter(|id| !id.is_empty()),
            })
            .collect())
    }
}
