//! HTTP offer/answer exchange

use super::OfferExchange;
use crate::api::join_path;
use crate::error::SignalingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, instrument};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SdpOffer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SdpOffer {
    pub fn new(sdp: String) -> Self {
        Self {
            sdp,
            kind: "offer".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Posts offers to the session's negotiation endpoint on the interview server
pub struct HttpSignaling {
    client: reqwest::Client,
    base: Url,
}

impl HttpSignaling {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, SignalingError> {
        let base = Url::parse(base_url).map_err(|e| SignalingError::Unreachable(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SignalingError::PeerSetup(e.to_string()))?;
        Ok(Self { client, base })
    }
}

#[async_trait]
impl OfferExchange for HttpSignaling {
    #[instrument(skip(self, offer), fields(offer_len = offer.sdp.len()))]
    async fn exchange(
        &self,
        negotiation_path: &str,
        offer: SdpOffer,
    ) -> Result<SdpAnswer, SignalingError> {
        let url = join_path(&self.base, negotiation_path)
            .map_err(|e| SignalingError::Unreachable(e.to_string()))?;

        let response = self
            .client
            .post(url)
            .json(&offer)
            .send()
            .await
            .map_err(|e| {
                error!("Offer request failed: {}", e);
                SignalingError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Offer rejected: {}", body);
            return Err(SignalingError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let answer: SdpAnswer = response
            .json()
            .await
            .map_err(|e| SignalingError::InvalidAnswer(e.to_string()))?;
        debug!(answer_len = answer.sdp.len(), "Received answer");
        Ok(answer)
    }
}
