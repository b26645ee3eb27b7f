//! HTTP Exchange Client
//!
//! REST client for the exchange. Every request authenticates with the
//! agbot's exchange id and token (basic auth) and is bounded by the
//! configured timeout; a timeout surfaces as an error and the caller's
//! event is abandoned, relying on the producer's resend.

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::{ExchangeError, Result};
use crate::types::{Device, MessageTarget, WorkloadDefinition};
use crate::ExchangeClient;

/// Exchange client over HTTP.
pub struct HttpExchangeClient {
    base_url: String,
    exchange_id: String,
    token: String,
    http_client: HttpClient,
}

#[derive(Deserialize)]
struct WorkloadsResponse {
    #[serde(default)]
    workloads: Vec<WorkloadDefinition>,
}

impl HttpExchangeClient {
    pub fn new(base_url: &str, exchange_id: &str, token: &str, timeout_s: u64) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(timeout_s))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            exchange_id: exchange_id.to_string(),
            token: token.to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(ExchangeError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn get_device(&self, device_id: &str) -> Result<Device> {
        let resp = self
            .http_client
            .get(self.url(&format!("devices/{device_id}")))
            .basic_auth(&self.exchange_id, Some(&self.token))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ExchangeError::DeviceNotFound(device_id.to_string()));
        }
        let resp = Self::check(resp).await?;
        Ok(resp.json::<Device>().await?)
    }

    async fn get_workload(
        &self,
        workload_url: &str,
        org: &str,
        version: &str,
        arch: &str,
    ) -> Result<Option<WorkloadDefinition>> {
        let resp = self
            .http_client
            .get(self.url(&format!("orgs/{org}/workloads")))
            .query(&[
                ("workloadUrl", workload_url),
                ("version", version),
                ("arch", arch),
            ])
            .basic_auth(&self.exchange_id, Some(&self.token))
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(resp).await?;
        let body = resp.json::<WorkloadsResponse>().await?;
        Ok(body.workloads.into_iter().next())
    }

    async fn send_message(&self, target: &MessageTarget, payload: &str, ttl_s: u64) -> Result<()> {
        debug!(receiver = %target.receiver_id, bytes = payload.len(), "sending protocol message");
        let body = serde_json::json!({
            "message": payload,
            "pubKey": target.receiver_public_key,
            "ttl": ttl_s,
        });
        let resp = self
            .http_client
            .post(self.url(&format!("nodes/{}/msgs", target.receiver_id)))
            .basic_auth(&self.exchange_id, Some(&self.token))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_message(&self, message_id: i64) -> Result<()> {
        let resp = self
            .http_client
            .delete(self.url(&format!("agbots/{}/msgs/{}", self.exchange_id, message_id)))
            .basic_auth(&self.exchange_id, Some(&self.token))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete_consumer_agreement(&self, agreement_id: &str) -> Result<()> {
        let resp = self
            .http_client
            .delete(self.url(&format!(
                "agbots/{}/agreements/{}",
                self.exchange_id, agreement_id
            )))
            .basic_auth(&self.exchange_id, Some(&self.token))
            .send()
            .await?;

        // Deleting an agreement the directory never saw is not an error.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(resp).await?;
        Ok(())
    }

    async fn record_consumer_agreement_state(
        &self,
        agreement_id: &str,
        policy_name: &str,
        org: &str,
        state: &str,
    ) -> Result<()> {
        let body = serde_json::json!({
            "workload": policy_name,
            "org": org,
            "state": state,
        });
        let resp = self
            .http_client
            .put(self.url(&format!(
                "agbots/{}/agreements/{}",
                self.exchange_id, agreement_id
            )))
            .basic_auth(&self.exchange_id, Some(&self.token))
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
