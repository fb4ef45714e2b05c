//! JSON-over-HTTP exchange shared by every HTTP collaborator.
//!
//! A pooled `reqwest` client with rustls, so collaborators may sit behind
//! `http://` or `https://`. Each request is bounded by the client timeout.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

const AGENT: &str = concat!("fleetgrid/", env!("CARGO_PKG_VERSION"));

/// Join a base URL and a path without doubling the separator.
pub(crate) fn join(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// A JSON client with a per-request timeout.
#[derive(Debug, Clone)]
pub(crate) struct JsonClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl JsonClient {
    pub(crate) fn new(timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, timeout })
    }

    /// POST `body` as JSON and decode a JSON answer.
    ///
    /// Any non-2xx status is an error carrying the response body.
    pub(crate) async fn post<B, R>(&self, url: &str, body: &B) -> ClientResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = self.send(url, body).await?;
        resp.json().await.map_err(|e| self.classify(url, e))
    }

    /// POST `body` as JSON, ignoring the answer's content.
    pub(crate) async fn post_ignore<B>(&self, url: &str, body: &B) -> ClientResult<()>
    where
        B: Serialize + ?Sized,
    {
        self.send(url, body).await?;
        Ok(())
    }

    async fn send<B>(&self, url: &str, body: &B) -> ClientResult<reqwest::Response>
    where
        B: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body).map_err(|e| ClientError::Encode(e.to_string()))?;
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| self.classify(url, e))?;

        let status = resp.status();
        debug!(%url, %status, "collaborator responded");
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            debug!(%url, "collaborator request timed out");
            ClientError::Timeout(self.timeout)
        } else if err.is_builder() {
            ClientError::InvalidUrl(format!("{url}: {err}"))
        } else if err.is_connect() {
            ClientError::Connect(format!("{url}: {err}"))
        } else if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Request(err.to_string())
        }
    }
}
