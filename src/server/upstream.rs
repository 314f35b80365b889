use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use hickory_proto::op::Message;
use reqwest::{Client, header};
use tracing::debug;

use crate::config::UpstreamSection;

pub const DNS_CONTENT_TYPE: &str = "application/dns-message";

/// Next handler for queries the ledger has no data for.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    client: Client,
    endpoint: String,
}

impl UpstreamForwarder {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent("NearLink/0.1 (upstream)")
            .timeout(timeout)
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// `None` when no upstream endpoint is configured.
    pub fn from_settings(section: &UpstreamSection) -> Result<Option<Self>> {
        section
            .doh_endpoint
            .as_ref()
            .map(|endpoint| {
                Self::new(
                    endpoint.clone(),
                    Duration::from_secs(section.timeout_seconds.max(1)),
                )
            })
            .transpose()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST the query to the DoH endpoint and return the raw reply.
    pub async fn forward(&self, request: &Message) -> Result<Vec<u8>> {
        let payload = request
            .to_vec()
            .context("failed to serialise DNS message for upstream forward")?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, DNS_CONTENT_TYPE)
            .header(header::ACCEPT, DNS_CONTENT_TYPE)
            .body(payload)
            .send()
            .await
            .context("upstream DoH request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("upstream DoH error: {}", response.status()));
        }
        let bytes = response
            .bytes()
            .await
            .context("failed to read upstream DoH body")?;

        let reply = Message::from_vec(&bytes).context("upstream returned a malformed DNS message")?;
        if reply.id() != request.id() {
            return Err(anyhow!(
                "upstream reply id {} does not match query id {}",
                reply.id(),
                request.id()
            ));
        }
        debug!(endpoint = %self.endpoint, rcode = %reply.response_code(), "Upstream answered");
        Ok(bytes.to_vec())
    }
}
