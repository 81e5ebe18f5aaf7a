//! Delivery boundary: immediate sends and persisted future sends.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attachments::EncodedAttachment;
use crate::error::DeliveryError;
use crate::store::OutreachStore;

/// Addressed content handed to the delivery boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<EncodedAttachment>,
}

/// Acknowledgement that a future dispatch was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleReceipt {
    pub id: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Where finalized messages go.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver now.
    async fn send_now(&self, envelope: &Envelope) -> Result<(), DeliveryError>;

    /// Persist a future dispatch. Nothing is sent synchronously.
    async fn schedule(
        &self,
        envelope: &Envelope,
        scheduled_for: DateTime<Utc>,
        notify_on_sent: bool,
    ) -> Result<ScheduleReceipt, DeliveryError>;
}

/// Transport that actually puts a message on the wire.
#[async_trait]
pub trait MailSender: Send + Sync {
    fn name(&self) -> &str;

    /// Address messages are sent from; also receives sent notifications.
    fn sender_address(&self) -> &str;

    async fn send(&self, envelope: &Envelope) -> Result<(), DeliveryError>;
}

/// Delivery backed by a [`MailSender`] for immediate sends and the store's
/// scheduled dispatch table for future sends.
pub struct OutboxDelivery {
    mailer: Arc<dyn MailSender>,
    store: Arc<dyn OutreachStore>,
}

impl OutboxDelivery {
    pub fn new(mailer: Arc<dyn MailSender>, store: Arc<dyn OutreachStore>) -> Self {
        Self { mailer, store }
    }
}

#[async_trait]
impl Delivery for OutboxDelivery {
    fn name(&self) -> &str {
        self.mailer.name()
    }

    async fn send_now(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        self.mailer.send(envelope).await?;
        // Already sent; a bookkeeping failure is only logged.
        if let Err(e) = self.store.record_contacted(&envelope.recipients).await {
            warn!(error = %e, "Sent but failed to record contacted addresses");
        }
        Ok(())
    }

    async fn schedule(
        &self,
        envelope: &Envelope,
        scheduled_for: DateTime<Utc>,
        notify_on_sent: bool,
    ) -> Result<ScheduleReceipt, DeliveryError> {
        let id = self
            .store
            .insert_scheduled(envelope, scheduled_for, notify_on_sent)
            .await?;
        info!(id = %id, scheduled_for = %scheduled_for, recipients = envelope.recipients.len(), "Dispatch scheduled");
        Ok(ScheduleReceipt { id, scheduled_for })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingMailer;
    use super::*;
    use crate::recipients::RecipientSource;
    use crate::store::LibSqlStore;

    fn envelope(to: &str) -> Envelope {
        Envelope {
            recipients: vec![to.to_string()],
            subject: "Hi".into(),
            body: "Hello".into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn send_now_records_contacted() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        let delivery = OutboxDelivery::new(mailer.clone(), store.clone());

        delivery.send_now(&envelope("a@x.com")).await.unwrap();

        assert_eq!(mailer.sent_to().await, vec!["a@x.com".to_string()]);
        let exclusions = store.exclusions().await.unwrap();
        assert!(exclusions.excludes("a@x.com"));
    }

    #[tokio::test]
    async fn failed_send_records_nothing() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mailer = Arc::new(RecordingMailer::rejecting(&["a@x.com"]));
        let delivery = OutboxDelivery::new(mailer, store.clone());

        let err = delivery.send_now(&envelope("a@x.com")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::SendFailed { .. }));
        assert!(store.contacted_addresses().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn schedule_persists_without_sending() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let mailer = Arc::new(RecordingMailer::default());
        let delivery = OutboxDelivery::new(mailer.clone(), store.clone());
        let when = Utc::now() + chrono::Duration::hours(1);

        let receipt = delivery.schedule(&envelope("b@x.com"), when, true).await.unwrap();

        assert!(mailer.sent_to().await.is_empty());
        let stored = store.get_scheduled(&receipt.id).await.unwrap().unwrap();
        assert!(stored.notify_on_sent);
        assert_eq!(store.scheduled_addresses().await.unwrap(), vec!["b@x.com".to_string()]);
    }
}
