//! HTTP Transport
//!
//! Delivers writes to other nodes' HTTP API.

use std::time::Duration;

use async_trait::async_trait;

use super::{Transport, REQUEST_FROM_HEADER};
use crate::error::{Error, Result};
use crate::id::NodeAddress;
use crate::replication::WriteResponse;
use crate::store::WriteRecord;

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
    /// Host used for addresses that are bare ports
    peer_host: String,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(peer_host: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            peer_host: peer_host.into(),
        })
    }

    /// `http://<host>:<port>/student/<id>/<name>`, with the name percent-encoded
    fn write_url(&self, target: &NodeAddress, record: &WriteRecord) -> Result<reqwest::Url> {
        let base = target.base_url(&self.peer_host);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| Error::Network(format!("Invalid address {}: {}", target, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Network(format!("Invalid address {}", target)))?
            .pop_if_empty()
            .extend(["student", &record.id.to_string(), &record.name]);
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_write(
        &self,
        target: &NodeAddress,
        record: &WriteRecord,
        from: &NodeAddress,
    ) -> Result<WriteResponse> {
        let url = self.write_url(target, record)?;
        tracing::debug!("Sending write {} to {}", record.id, url);

        let response = self
            .client
            .post(url)
            .header(REQUEST_FROM_HEADER, from.as_str())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "{} answered {}: {}",
                target, status, body
            )));
        }

        Ok(response.json::<WriteResponse>().await?)
    }
}
