//! Minimal HTTP client for a running daemon's API.

use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use fleet_state::NodeRequest;
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::api::{ApiResponse, SubmitRequest};
use crate::report::StatusReport;

const TIMEOUT: Duration = Duration::from_secs(10);

pub struct ApiClient {
    /// `host:port` of the daemon's listener.
    address: String,
}

impl ApiClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }

    pub async fn submit(&self, requestor: &str, labels: Vec<String>) -> anyhow::Result<NodeRequest> {
        let body = serde_json::to_vec(&SubmitRequest {
            requestor: requestor.to_string(),
            labels,
        })?;
        self.call("POST", "/api/v1/requests", Some(body)).await
    }

    pub async fn status(&self) -> anyhow::Result<StatusReport> {
        self.call("GET", "/api/v1/status", None).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<T> {
        let uri = format!("http://{}{path}", self.address);
        tokio::time::timeout(TIMEOUT, self.send(method, &uri, body))
            .await
            .map_err(|_| anyhow!("{method} {uri} timed out"))?
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> anyhow::Result<T> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connecting to fleetd at {}", self.address))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "api connection closed with error");
            }
        });

        let request = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "fleetd/0.1")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        let envelope: ApiResponse<T> = serde_json::from_slice(&bytes)
            .with_context(|| format!("{method} {uri}: unexpected response ({status})"))?;
        match envelope.data {
            Some(data) if envelope.success => Ok(data),
            _ => Err(anyhow!(
                "{method} {uri} failed ({status}): {}",
                envelope.error.unwrap_or_else(|| "no error message".into())
            )),
        }
    }
}
