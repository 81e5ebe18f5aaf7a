//! `OutreachStore` trait: single async interface for delivery-side
//! persistence: the organization catalog, contacted addresses, and
//! scheduled dispatches.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::delivery::Envelope;
use crate::error::DatabaseError;
use crate::recipients::Recipient;

/// Status of a persisted scheduled dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    /// Waiting for its time.
    Pending,
    /// Delivered by the due-dispatch worker.
    Sent,
    /// Delivery was attempted and failed.
    Failed,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A persisted future-dispatch instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledDispatch {
    pub id: String,
    pub envelope: Envelope,
    pub scheduled_for: DateTime<Utc>,
    pub notify_on_sent: bool,
    pub status: ScheduledStatus,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Backend-agnostic store for the delivery side of the pipeline.
#[async_trait]
pub trait OutreachStore: Send + Sync {
    // ── Catalog ─────────────────────────────────────────────────────

    /// Insert or update a catalog organization.
    async fn upsert_organization(&self, recipient: &Recipient) -> Result<(), DatabaseError>;

    /// All catalog organizations, in insertion order.
    async fn list_organizations(&self) -> Result<Vec<Recipient>, DatabaseError>;

    // ── Contacted ───────────────────────────────────────────────────

    /// Remember that these addresses received a message.
    async fn record_contacted(&self, addresses: &[String]) -> Result<(), DatabaseError>;

    /// Every address that already received a message.
    async fn contacted_addresses(&self) -> Result<Vec<String>, DatabaseError>;

    // ── Scheduled dispatches ────────────────────────────────────────

    /// Persist a future dispatch. Returns its id.
    async fn insert_scheduled(
        &self,
        envelope: &Envelope,
        scheduled_for: DateTime<Utc>,
        notify_on_sent: bool,
    ) -> Result<String, DatabaseError>;

    /// Get a scheduled dispatch by id.
    async fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledDispatch>, DatabaseError>;

    /// Addresses with a pending scheduled dispatch.
    async fn scheduled_addresses(&self) -> Result<Vec<String>, DatabaseError>;

    /// Pending dispatches whose time is at or before `now`, oldest first.
    async fn due_scheduled(&self, now: DateTime<Utc>)
    -> Result<Vec<ScheduledDispatch>, DatabaseError>;

    /// Mark a dispatch delivered.
    async fn mark_scheduled_sent(&self, id: &str) -> Result<(), DatabaseError>;

    /// Mark a dispatch failed with a reason.
    async fn mark_scheduled_failed(&self, id: &str, reason: &str) -> Result<(), DatabaseError>;
}
