//! HTTP Client für die Call-Initiierung
//!
//! Löst beim Backend einen ausgehenden Anruf für ein Szenario aus. Das
//! Audio dieses Anrufs kommt anschließend über den Media-Stream.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Failed to initiate call: HTTP {status}")]
    Status { status: u16 },
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCallConfig {
    pub scenario_id: String,
    pub phone_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomCallResponse {
    pub message: String,
    pub call_sid: String,
}

#[derive(Serialize)]
struct CustomCallRequest<'a> {
    phone_number: &'a str,
}

// ============================================================================
// CALL API
// ============================================================================

#[derive(Debug, Clone)]
pub struct CallApi {
    base_url: Url,
    http: reqwest::Client,
}

impl CallApi {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { base_url, http })
    }

    /// `POST {base}/incoming-custom-call/{scenario_id}`
    pub async fn initiate_custom_call(
        &self,
        config: &CustomCallConfig,
    ) -> Result<CustomCallResponse, ApiError> {
        let url = self.endpoint(&["incoming-custom-call", &config.scenario_id])?;

        tracing::info!("Initiating call for scenario {}", config.scenario_id);

        let response = self
            .http
            .post(url)
            .json(&CustomCallRequest {
                phone_number: &config.phone_number,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            tracing::error!("Error initiating call: HTTP {}", status);
            return Err(ApiError::Status { status });
        }

        let body: CustomCallResponse = response.json().await?;
        tracing::info!("Call initiated: {}", body.call_sid);
        Ok(body)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}
