//! Cloud structuring client: turns raw transcript text (plus optional
//! visual context) into a structured note draft.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SessionEngineConfig;
use crate::notes::VisualContext;

use super::{retry_with_breaker, CircuitBreaker, ExternalCallError};

#[derive(Debug, Clone, Serialize)]
pub struct StructuringRequest {
    pub session_id: String,
    pub correlation_id: String,
    pub raw_transcript: String,
    pub visual_context: VisualContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuringResult {
    pub title: String,
    pub body: String,
    pub confidence: f32,
}

/// Trait boundary for the structuring call — grounded on the engine's
/// `SentencePolisher` trait, generalized from sentence-level text
/// normalization to full note synthesis against a cloud LLM backend.
#[async_trait]
pub trait StructuringClient: Send + Sync {
    async fn structure(
        &self,
        request: StructuringRequest,
    ) -> Result<StructuringResult, ExternalCallError>;
}

pub struct HttpStructuringClient {
    http: reqwest::Client,
    endpoint: String,
    breaker: CircuitBreaker,
    config: SessionEngineConfig,
    started_at: Instant,
}

impl HttpStructuringClient {
    pub fn new(endpoint: impl Into<String>, config: SessionEngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.structuring_timeout)
            .build()
            .expect("failed to build structuring http client");

        Self {
            http,
            endpoint: endpoint.into(),
            breaker: CircuitBreaker::new("structuring_client", &config),
            config,
            started_at: Instant::now(),
        }
    }
}

#[async_trait]
impl StructuringClient for HttpStructuringClient {
    async fn structure(
        &self,
        request: StructuringRequest,
    ) -> Result<StructuringResult, ExternalCallError> {
        retry_with_breaker(
            "structuring_client",
            &self.config,
            &self.breaker,
            self.started_at,
            || {
                let http = self.http.clone();
                let endpoint = self.endpoint.clone();
                let request = request.clone();
                async move {
                    let response = http
                        .post(&endpoint)
                        .json(&request)
                        .send()
                        .await
                        .map_err(|err| err.to_string())?;

                    if !response.status().is_success() {
                        return Err(format!("status {}", response.status()));
                    }

                    response
                        .json::<StructuringResult>()
                        .await
                        .map_err(|err| err.to_string())
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStructuringClient;

    #[async_trait]
    impl StructuringClient for FakeStructuringClient {
        async fn structure(
            &self,
            request: StructuringRequest,
        ) -> Result<StructuringResult, ExternalCallError> {
            Ok(StructuringResult {
                title: "Summary".to_string(),
                body: request.raw_transcript,
                confidence: 0.75,
            })
        }
    }

    #[tokio::test]
    async fn fake_structuring_echoes_transcript_into_body() {
        let client = FakeStructuringClient;
        let result = client
            .structure(StructuringRequest {
                session_id: "s1".to_string(),
                correlation_id: "c1".to_string(),
                raw_transcript: "plan the rollout".to_string(),
                visual_context: VisualContext::default(),
            })
            .await
            .expect("structure");

        assert_eq!(result.body, "plan the rollout");
    }
}
