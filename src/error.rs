//! Error types for the outreach pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised at the content generation boundary.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Generator {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Generator {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Session expired for generator {provider}")]
    SessionExpired { provider: String },
}

impl GenerationError {
    /// Whether this failure invalidates every subsequent call in the run.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }
}

/// Attachment packaging and storage errors.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("Attachment {filename} is {size} bytes, over the {limit} byte limit")]
    TooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },

    #[error("Attachment storage failed for {filename}: {reason}")]
    Storage { filename: String, reason: String },

    #[error("Attachment payload for {filename} could not be decoded: {reason}")]
    Decode { filename: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the delivery boundary.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery via {name} failed: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Session expired for delivery via {name}")]
    SessionExpired { name: String },

    #[error("Failed to persist scheduled dispatch: {0}")]
    Persist(#[from] DatabaseError),

    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),
}

impl DeliveryError {
    /// Whether this failure invalidates every subsequent send in the run.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }
}

/// Dispatch planning errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid schedule: {reason}")]
    InvalidSchedule { reason: String },

    #[error("Scheduled time {scheduled_for} is not after {now}")]
    ScheduleInPast {
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("Message for {recipient_id} was not generated successfully")]
    NotGenerated { recipient_id: String },

    #[error("Recipient {recipient_id} has no address")]
    MissingAddress { recipient_id: String },

    #[error("Message for {recipient_id} has an empty {field}")]
    MissingContent { recipient_id: String, field: String },

    #[error("No messages selected for dispatch")]
    EmptySelection,
}

impl DispatchError {
    /// Whether this is one of the schedule validation failures.
    pub fn is_invalid_schedule(&self) -> bool {
        matches!(
            self,
            Self::InvalidSchedule { .. } | Self::ScheduleInPast { .. }
        )
    }
}

/// Run lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Recipient set is empty")]
    EmptyRecipientSet,

    #[error("Run in state {state} cannot transition to {target}")]
    InvalidTransition { state: String, target: String },

    #[error("Session expired: {reason}")]
    SessionExpired { reason: String },

    #[error("Message for {recipient_id} not found")]
    MessageNotFound { recipient_id: String },

    #[error("Recipient {recipient_id} is no longer in the recipient set")]
    NotInRecipientSet { recipient_id: String },
}
