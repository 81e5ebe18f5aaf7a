//! Shared types for the generation pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recipients::{Recipient, RecipientId};

// ── Generated message ───────────────────────────────────────────────

/// Which run and batch produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStamp {
    pub run_id: Uuid,
    /// Zero-based batch index within the run.
    pub batch: usize,
}

/// Generated (or failed) outreach content for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedMessage {
    pub recipient_id: RecipientId,
    pub recipient_name: String,
    /// Address copied from the recipient at generation time.
    pub address: Option<String>,
    pub success: bool,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_letter: Option<String>,
    /// Whether the generator enriched the content with scraped data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_info: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub origin_batch: BatchStamp,
    /// Set once the user edits subject or body.
    #[serde(default)]
    pub edited: bool,
    pub generated_at: DateTime<Utc>,
}

impl GeneratedMessage {
    /// Build a message from a generator result.
    pub fn from_content(
        recipient: &Recipient,
        content: GeneratedContent,
        stamp: BatchStamp,
    ) -> Self {
        let success = content.success
            && content.error.is_none()
            && !content.body.trim().is_empty();
        let error = if success {
            None
        } else {
            Some(
                content
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Generator returned empty content".to_string()),
            )
        };

        Self {
            recipient_id: recipient.recipient_id.clone(),
            recipient_name: recipient.name.clone(),
            address: recipient.address.clone(),
            success,
            subject: content.subject,
            body: content.body,
            cover_letter: None,
            scraped_info: content.scraped_info,
            error,
            origin_batch: stamp,
            edited: false,
            generated_at: Utc::now(),
        }
    }

    /// A failed entry carrying `error`.
    pub fn failed(recipient: &Recipient, error: impl Into<String>, stamp: BatchStamp) -> Self {
        Self {
            recipient_id: recipient.recipient_id.clone(),
            recipient_name: recipient.name.clone(),
            address: recipient.address.clone(),
            success: false,
            subject: String::new(),
            body: String::new(),
            cover_letter: None,
            scraped_info: None,
            error: Some(error.into()),
            origin_batch: stamp,
            edited: false,
            generated_at: Utc::now(),
        }
    }

    /// Apply a user edit. An edit with non-empty body marks a failed message
    /// as usable.
    pub fn apply_edit(&mut self, subject: Option<String>, body: Option<String>) {
        if let Some(subject) = subject {
            self.subject = subject;
        }
        if let Some(body) = body {
            self.body = body;
        }
        self.edited = true;
        if !self.success && !self.subject.trim().is_empty() && !self.body.trim().is_empty() {
            self.success = true;
            self.error = None;
        }
    }
}

// ── Generator wire types ────────────────────────────────────────────

/// Request sent to the content generator for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Generator response for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(default)]
    pub results: Vec<GeneratedContent>,
}

/// Per-recipient content as returned by the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub recipient_id: RecipientId,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraped_info: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Request body of the cover letter enrichment call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// Response of the cover letter enrichment call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResponse {
    #[serde(default)]
    pub cover_letter: String,
}

// ── Run inputs and results ──────────────────────────────────────────

/// User-supplied inputs for a generation run.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub template: Option<String>,
    pub profile: Option<String>,
    pub options: Option<serde_json::Value>,
    /// Run the cover letter pass after generation.
    pub enrich: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every batch was attempted.
    Completed,
    /// Stopped at a cancellation point between batches.
    Cancelled,
    /// The session expired; remaining batches were not attempted.
    SessionExpired,
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Recipients in the selection.
    pub requested: usize,
    /// Newly generated successfully.
    pub generated: usize,
    /// Carried over from a prior pass.
    pub reused: usize,
    /// Newly attempted and failed.
    pub failed: usize,
}

/// The immutable result of one generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRun {
    pub run_id: Uuid,
    pub force: bool,
    /// One message per recipient, in selection order.
    pub messages: Vec<GeneratedMessage>,
    pub counters: RunCounters,
    pub outcome: RunOutcome,
    /// Human-readable reason when the run did not complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GenerationRun {
    /// Successful messages in the result set.
    pub fn succeeded(&self) -> usize {
        self.messages.iter().filter(|m| m.success).count()
    }

    /// "N of M succeeded".
    pub fn summary(&self) -> String {
        format!(
            "{} of {} succeeded",
            self.succeeded(),
            self.counters.requested
        )
    }
}
