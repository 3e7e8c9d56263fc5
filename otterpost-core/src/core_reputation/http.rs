//! HTTP client for the reputation API
//!
//! ```text
//! GET  {base_url}/profile/{address}      -> ReputationProfile | 404
//! POST {base_url}/profiles/batch         {"addresses": [..]}
//!                                        -> {"profiles": [ReputationProfile]}
//! ```

use super::source::{ReputationError, ReputationSource};
use crate::config::ReputationConfig;
use crate::model::{Address, ReputationProfile};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    addresses: &'a [Address],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    profiles: Vec<ReputationProfile>,
}

pub struct HttpReputationClient {
    client: Client,
    base_url: String,
}

impl HttpReputationClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ReputationError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn from_config(config: &ReputationConfig) -> Result<Self, ReputationError> {
        Self::new(config.base_url.clone(), config.request_timeout)
    }

    pub fn profile_url(&self, address: &Address) -> String {
        format!("{}/profile/{}", self.base_url, address)
    }

    pub fn batch_url(&self) -> String {
        format!("{}/profiles/batch", self.base_url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ReputationError {
        if e.is_connect() {
            ReputationError::Connection(format!("Cannot connect to {}", self.base_url))
        } else {
            ReputationError::Http(e)
        }
    }
}

#[async_trait]
impl ReputationSource for HttpReputationClient {
    async fn fetch(&self, address: &Address) -> Result<Option<ReputationProfile>, ReputationError> {
        let url = self.profile_url(address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let profile: ReputationProfile = response
                    .json()
                    .await
                    .map_err(|e| ReputationError::Parse(e.to_string()))?;
                Ok(Some(profile))
            }
            status => Err(ReputationError::Status { status: status.as_u16(), url }),
        }
    }

    async fn fetch_batch(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, ReputationProfile>, ReputationError> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }
        let url = self.batch_url();
        let response = self
            .client
            .post(&url)
            .json(&BatchRequest { addresses })
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReputationError::Status { status: status.as_u16(), url });
        }
        let body: BatchResponse = response
            .json()
            .await
            .map_err(|e| ReputationError::Parse(e.to_string()))?;

        debug!(requested = addresses.len(), returned = body.profiles.len(), "Fetched reputation batch");
        Ok(body
            .profiles
            .into_iter()
            .map(|p| (Address::from_network(p.address.as_str()), p))
            .collect())
    }
}
