//! Due-dispatch worker: fires persisted scheduled dispatches once their
//! time has come.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::store::{OutreachStore, ScheduledDispatch};

use super::delivery::{Envelope, MailSender};

/// Result of one due-dispatch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DueReport {
    /// Ids delivered in this pass.
    pub sent: Vec<String>,
    /// Ids that failed, with reasons.
    pub failed: Vec<(String, String)>,
}

/// Send every pending dispatch due at `now`.
///
/// Each dispatch is marked sent or failed independently; a failure never
/// stops the pass.
pub async fn fire_due(
    mailer: &dyn MailSender,
    store: &dyn OutreachStore,
    now: DateTime<Utc>,
) -> Result<DueReport, DatabaseError> {
    let due = store.due_scheduled(now).await?;
    let mut report = DueReport::default();
    if due.is_empty() {
        return Ok(report);
    }
    info!(count = due.len(), "Firing due scheduled dispatches");

    for dispatch in due {
        match mailer.send(&dispatch.envelope).await {
            Ok(()) => {
                if let Err(e) = store.mark_scheduled_sent(&dispatch.id).await {
                    // Delivered but still pending: the next pass may resend it.
                    error!(id = %dispatch.id, error = %e, "Sent but failed to mark dispatch sent");
                    report
                        .failed
                        .push((dispatch.id, format!("sent but not marked: {e}")));
                    continue;
                }
                if let Err(e) = store.record_contacted(&dispatch.envelope.recipients).await {
                    warn!(id = %dispatch.id, error = %e, "Failed to record contacted addresses");
                }
                if dispatch.notify_on_sent {
                    notify_sender(mailer, &dispatch).await;
                }
                report.sent.push(dispatch.id);
            }
            Err(e) => {
                warn!(id = %dispatch.id, error = %e, "Scheduled dispatch failed");
                let reason = e.to_string();
                if let Err(e) = store.mark_scheduled_failed(&dispatch.id, &reason).await {
                    error!(id = %dispatch.id, error = %e, "Failed to mark dispatch failed");
                }
                report.failed.push((dispatch.id, reason));
            }
        }
    }
    Ok(report)
}

async fn notify_sender(mailer: &dyn MailSender, dispatch: &ScheduledDispatch) {
    let notice = Envelope {
        recipients: vec![mailer.sender_address().to_string()],
        subject: format!("Sent: {}", dispatch.envelope.subject),
        body: format!(
            "Your scheduled message \"{}\" was sent to {} at {}.",
            dispatch.envelope.subject,
            dispatch.envelope.recipients.join(", "),
            Utc::now().format("%Y-%m-%d %H:%M UTC"),
        ),
        attachments: Vec::new(),
    };
    if let Err(e) = mailer.send(&notice).await {
        warn!(id = %dispatch.id, error = %e, "Failed to send sent-notification");
    }
}

/// Spawn the periodic due-dispatch task.
pub fn spawn_due_dispatch_task(
    mailer: Arc<dyn MailSender>,
    store: Arc<dyn OutreachStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Due-dispatch worker started");
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            match fire_due(mailer.as_ref(), store.as_ref(), Utc::now()).await {
                Ok(report) if !report.sent.is_empty() || !report.failed.is_empty() => {
                    info!(
                        sent = report.sent.len(),
                        failed = report.failed.len(),
                        "Due-dispatch pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Due-dispatch pass failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::delivery::testing::RecordingMailer;
    use crate::recipients::Recipient;
    use crate::store::{LibSqlStore, ScheduledStatus};

    fn envelope(to: &str) -> Envelope {
        Envelope {
            recipients: vec![to.to_string()],
            subject: "Intro".into(),
            body: "Hello".into(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn fires_only_due_dispatches() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mailer = RecordingMailer::default();
        let now = Utc::now();

        let due = store
            .insert_scheduled(&envelope("a@x.com"), now - chrono::Duration::minutes(5), false)
            .await
            .unwrap();
        let later = store
            .insert_scheduled(&envelope("b@x.com"), now + chrono::Duration::hours(1), false)
            .await
            .unwrap();

        let report = fire_due(&mailer, &store, now).await.unwrap();
        assert_eq!(report.sent, vec![due.clone()]);
        assert_eq!(mailer.sent_to().await, vec!["a@x.com".to_string()]);

        let stored = store.get_scheduled(&due).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledStatus::Sent);
        let pending = store.get_scheduled(&later).await.unwrap().unwrap();
        assert_eq!(pending.status, ScheduledStatus::Pending);
        assert_eq!(store.contacted_addresses().await.unwrap(), vec!["a@x.com".to_string()]);

        // A second pass finds nothing new.
        let again = fire_due(&mailer, &store, now).await.unwrap();
        assert_eq!(again, DueReport::default());
    }

    #[tokio::test]
    async fn failure_is_isolated_and_recorded() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mailer = RecordingMailer::rejecting(&["bad@x.com"]);
        let past = Utc::now() - chrono::Duration::minutes(1);

        let bad = store.insert_scheduled(&envelope("bad@x.com"), past, false).await.unwrap();
        store.insert_scheduled(&envelope("ok@x.com"), past, false).await.unwrap();

        let report = fire_due(&mailer, &store, Utc::now()).await.unwrap();
        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, bad);

        let stored = store.get_scheduled(&bad).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledStatus::Failed);
        assert!(stored.last_error.unwrap().contains("unavailable"));
    }

    /// Store whose `mark_scheduled_sent` fails for one id.
    struct StuckStore {
        inner: LibSqlStore,
        stuck: std::sync::Mutex<Option<String>>,
    }

    #[async_trait::async_trait]
    impl OutreachStore for StuckStore {
        async fn upsert_organization(&self, r: &Recipient) -> Result<(), DatabaseError> {
            self.inner.upsert_organization(r).await
        }
        async fn list_organizations(&self) -> Result<Vec<Recipient>, DatabaseError> {
            self.inner.list_organizations().await
        }
        async fn record_contacted(&self, addresses: &[String]) -> Result<(), DatabaseError> {
            self.inner.record_contacted(addresses).await
        }
        async fn contacted_addresses(&self) -> Result<Vec<String>, DatabaseError> {
            self.inner.contacted_addresses().await
        }
        async fn insert_scheduled(
            &self,
            envelope: &Envelope,
            scheduled_for: DateTime<Utc>,
            notify_on_sent: bool,
        ) -> Result<String, DatabaseError> {
            self.inner.insert_scheduled(envelope, scheduled_for, notify_on_sent).await
        }
        async fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledDispatch>, DatabaseError> {
            self.inner.get_scheduled(id).await
        }
        async fn scheduled_addresses(&self) -> Result<Vec<String>, DatabaseError> {
            self.inner.scheduled_addresses().await
        }
        async fn due_scheduled(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<ScheduledDispatch>, DatabaseError> {
            self.inner.due_scheduled(now).await
        }
        async fn mark_scheduled_sent(&self, id: &str) -> Result<(), DatabaseError> {
            if self.stuck.lock().unwrap().as_deref() == Some(id) {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.mark_scheduled_sent(id).await
        }
        async fn mark_scheduled_failed(&self, id: &str, reason: &str) -> Result<(), DatabaseError> {
            self.inner.mark_scheduled_failed(id, reason).await
        }
    }

    #[tokio::test]
    async fn bookkeeping_failure_does_not_stop_the_pass() {
        let store = StuckStore {
            inner: LibSqlStore::new_memory().await.unwrap(),
            stuck: std::sync::Mutex::new(None),
        };
        let mailer = RecordingMailer::default();
        let now = Utc::now();

        let first = store
            .insert_scheduled(&envelope("a@x.com"), now - chrono::Duration::minutes(10), false)
            .await
            .unwrap();
        let second = store
            .insert_scheduled(&envelope("b@x.com"), now - chrono::Duration::minutes(5), false)
            .await
            .unwrap();
        *store.stuck.lock().unwrap() = Some(first.clone());

        let report = fire_due(&mailer, &store, now).await.unwrap();
        assert_eq!(report.sent, vec![second.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, first);
        assert_eq!(
            mailer.sent_to().await,
            vec!["a@x.com".to_string(), "b@x.com".to_string()]
        );

        let stored = store.get_scheduled(&second).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduledStatus::Sent);
    }

    #[tokio::test]
    async fn notification_goes_to_sender() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mailer = RecordingMailer::default();
        store
            .insert_scheduled(&envelope("a@x.com"), Utc::now() - chrono::Duration::minutes(1), true)
            .await
            .unwrap();

        fire_due(&mailer, &store, Utc::now()).await.unwrap();

        assert_eq!(
            mailer.sent_to().await,
            vec!["a@x.com".to_string(), "me@outreach.test".to_string()]
        );
        let sent = mailer.sent.lock().await;
        assert_eq!(sent[1].subject, "Sent: Intro");
    }
}
