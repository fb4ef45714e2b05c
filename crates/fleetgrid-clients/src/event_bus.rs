//! Webhook event bus: posts each notification as JSON.

use std::time::Duration;

use async_trait::async_trait;

use fleetgrid_rollout::{EventBus, RolloutNotification};

use crate::error::ClientResult;
use crate::transport::JsonClient;

#[derive(Debug, Clone)]
pub struct HttpEventBus {
    url: String,
    client: JsonClient,
}

impl HttpEventBus {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        Ok(Self {
            url: url.into(),
            client: JsonClient::new(timeout)?,
        })
    }
}

#[async_trait]
impl EventBus for HttpEventBus {
    async fn publish(&self, notification: &RolloutNotification) -> anyhow::Result<()> {
        self.client.post_ignore(&self.url, notification).await?;
        Ok(())
    }
}
