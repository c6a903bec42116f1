use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::domain::{PrintJob, RelayFacility};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("relay {relay} rejected the request with status {status}")]
    Rejected { relay: String, status: u16 },
}

/// Acknowledgement from a facility for a submitted job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportReceipt {
    /// Position reported by the facility, if it reports one.
    pub queue_position: Option<usize>,
    pub simulated: bool,
}

/// How the scheduler talks to a facility.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn submit(
        &self,
        relay: &RelayFacility,
        job: &PrintJob,
    ) -> Result<TransportReceipt, TransportError>;

    async fn heartbeat(&self, relay: &RelayFacility) -> Result<(), TransportError>;
}

/// In-process transport: every submission and health check succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRelayTransport;

#[async_trait]
impl RelayTransport for LocalRelayTransport {
    async fn submit(
        &self,
        relay: &RelayFacility,
        job: &PrintJob,
    ) -> Result<TransportReceipt, TransportError> {
        debug!(relay = %relay.id, job_id = %job.job_id, "simulated relay submission");
        Ok(TransportReceipt {
            queue_position: None,
            simulated: true,
        })
    }

    async fn heartbeat(&self, _relay: &RelayFacility) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(default, alias = "queue_position")]
    queue_position: Option<usize>,
}

/// Facility API client: `POST {base}/{relay}/submit` and
/// `GET {base}/{relay}/health`.
#[derive(Debug, Clone)]
pub struct HttpRelayTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRelayTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url, api_key))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn endpoint(&self, relay: &RelayFacility, action: &str) -> String {
        format!("{}/{}/{}", self.base_url, relay.id, action)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn submit(
        &self,
        relay: &RelayFacility,
        job: &PrintJob,
    ) -> Result<TransportReceipt, TransportError> {
        let body = json!({
            "jobId": job.job_id,
            "documentData": job.document,
            "priority": job.queue_priority,
            "metadata": {
                "applicantName": job.document.holder_name,
                "documentType": job.document.document_type,
                "tracking": job.tracking_number,
            },
        });

        let response = self
            .authorize(self.client.post(self.endpoint(relay, "submit")))
            .header("X-Relay-ID", relay.id.0.as_str())
            .header("X-Priority", job.queue_priority.as_str())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                relay: relay.id.0.clone(),
                status: status.as_u16(),
            });
        }

        let payload: SubmitResponse = response.json().await?;
        Ok(TransportReceipt {
            queue_position: payload.queue_position,
            simulated: false,
        })
    }

    async fn heartbeat(&self, relay: &RelayFacility) -> Result<(), TransportError> {
        let response = self
            .authorize(self.client.get(self.endpoint(relay, "health")))
            .header("X-Relay-ID", relay.id.0.as_str())
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                relay: relay.id.0.clone(),
                status: status.as_u16(),
            })
        }
    }
}
