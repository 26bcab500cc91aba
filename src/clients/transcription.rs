//! Cloud transcription client: turns buffered audio into raw text.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SessionEngineConfig;

use super::{retry_with_breaker, CircuitBreaker, ExternalCallError};

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionRequest {
    pub session_id: String,
    pub correlation_id: String,
    pub audio: Vec<u8>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub confidence: f32,
}

/// Trait boundary the `SessionActor` calls through — grounded on the
/// engine's `SpeechEngine` trait, generalized from local-frame decoding to
/// a single buffered request/response round trip against a cloud backend.
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ExternalCallError>;
}

pub struct HttpTranscriptionClient {
    http: reqwest::Client,
    endpoint: String,
    breaker: CircuitBreaker,
    config: SessionEngineConfig,
    started_at: Instant,
}

impl HttpTranscriptionClient {
    pub fn new(endpoint: impl Into<String>, config: SessionEngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.transcription_timeout)
            .build()
            .expect("failed to build transcription http client");

        Self {
            http,
            endpoint: endpoint.into(),
            breaker: CircuitBreaker::new("transcription_client", &config),
            config,
            started_at: Instant::now(),
        }
    }
}

#[async_trait]
impl TranscriptionClient for HttpTranscriptionClient {
    async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ExternalCallError> {
        retry_with_breaker(
            "transcription_client",
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
                        .json::<TranscriptionResult>()
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeTranscriptionClient {
        calls: Arc<AtomicU32>,
        fail_first_n: u32,
    }

    #[async_trait]
    impl TranscriptionClient for FakeTranscriptionClient {
        async fn transcribe(
            &self,
            _request: TranscriptionRequest,
        ) -> Result<TranscriptionResult, ExternalCallError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                return Err(ExternalCallError::Upstream {
                    target: "fake".to_string(),
                    message: "simulated".to_string(),
                });
            }
            Ok(TranscriptionResult {
                text: "hello world".to_string(),
                confidence: 0.9,
            })
        }
    }

    #[tokio::test]
    async fn fake_client_eventually_succeeds() {
        let client = FakeTranscriptionClient {
            calls: Arc::new(AtomicU32::new(0)),
            fail_first_n: 1,
        };

        let request = TranscriptionRequest {
            session_id: "s1".to_string(),
            correlation_id: "c1".to_string(),
            audio: vec![0u8; 16],
            locale: None,
        };

        // First call fails, demonstrating the trait boundary a retrying
        // caller (the SessionActor) would wrap with `retry_with_breaker`.
        assert!(client.transcribe(request.clone()).await.is_err());
        assert!(client.transcribe(request).await.is_ok());
    }
}
