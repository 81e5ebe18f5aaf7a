//! Content generation boundary.
//!
//! The generator is an external service; this module only speaks its
//! contract. One call covers a whole batch. The service is idempotent per
//! call, but the orchestrator never calls it twice for the same batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::config::GeneratorConfig;
use crate::error::GenerationError;
use crate::recipients::Recipient;

use super::types::{
    EnrichmentRequest, EnrichmentResponse, GeneratedMessage, GenerationRequest,
    GenerationResponse,
};

/// Produces outreach content for a batch of recipients.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Generator name for logging.
    fn name(&self) -> &str;

    /// Generate content for every recipient in the request.
    ///
    /// An `Err` fails the whole batch. Per-recipient failures are reported
    /// inside the response.
    async fn generate_batch(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError>;
}

/// Produces the auxiliary cover letter for an already generated message.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn cover_letter(
        &self,
        recipient: &Recipient,
        message: &GeneratedMessage,
        profile: Option<&str>,
    ) -> Result<String, GenerationError>;
}

/// HTTP client for a JSON generation service.
pub struct HttpGenerator {
    client: reqwest::Client,
    config: GeneratorConfig,
}

impl HttpGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GenerationError::RequestFailed {
                provider: "http".into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        info!(endpoint = %config.endpoint, "Using HTTP content generator");
        Ok(Self { client, config })
    }

    /// Whether the cover letter endpoint is configured.
    pub fn supports_enrichment(&self) -> bool {
        self.config.enrich_endpoint.is_some()
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> Result<R, GenerationError>
    where
        B: serde::Serialize + Sync,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .bearer_auth(self.config.token.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| GenerationError::RequestFailed {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(self.name(), status, retry_after, &text));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GenerationError::RequestFailed {
                provider: self.name().to_string(),
                reason: format!("Failed to read response body: {e}"),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| GenerationError::InvalidResponse {
            provider: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpGenerator {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate_batch(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        debug!(count = request.recipients.len(), "Posting generation batch");
        self.post_json(&self.config.endpoint, request).await
    }
}

#[async_trait]
impl Enricher for HttpGenerator {
    async fn cover_letter(
        &self,
        recipient: &Recipient,
        message: &GeneratedMessage,
        profile: Option<&str>,
    ) -> Result<String, GenerationError> {
        let Some(url) = self.config.enrich_endpoint.as_deref() else {
            return Err(GenerationError::RequestFailed {
                provider: self.name().to_string(),
                reason: "No enrichment endpoint configured".into(),
            });
        };

        let request = EnrichmentRequest {
            recipient: recipient.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            profile: profile.map(str::to_string),
        };
        let response: EnrichmentResponse = self.post_json(url, &request).await?;
        if response.cover_letter.trim().is_empty() {
            return Err(GenerationError::InvalidResponse {
                provider: self.name().to_string(),
                reason: "empty cover letter".into(),
            });
        }
        Ok(response.cover_letter)
    }
}

/// Map a non-success HTTP status to a generation error.
pub fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> GenerationError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GenerationError::SessionExpired {
            provider: provider.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        _ => {
            let snippet: String = body.chars().take(200).collect();
            GenerationError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("HTTP {status}: {snippet}"),
            }
        }
    }
}
