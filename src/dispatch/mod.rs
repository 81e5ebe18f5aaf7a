//! Dispatch scheduler: hands finalized messages to delivery.
//!
//! Schedule validation runs once per dispatch before anything is sent.
//! Every message is then planned (no I/O) and delivered independently:
//! one recipient's failure never stops the others. A session expiry at the
//! delivery boundary aborts the remaining sends.

pub mod delivery;
pub mod due;
pub mod plan;
pub mod smtp;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::attachments::PackagedAttachments;
use crate::config::PipelineConfig;
use crate::error::DispatchError;
use crate::generation::GeneratedMessage;
use crate::progress::{ProgressReporter, RunKind};
use crate::recipients::RecipientId;

pub use delivery::{Delivery, Envelope, MailSender, OutboxDelivery, ScheduleReceipt};
pub use due::{DueReport, fire_due, spawn_due_dispatch_task};
pub use plan::{DispatchMode, DispatchPlan, ScheduleOptions, Timing, compose_schedule, plan};
pub use smtp::SmtpMailer;

/// Per-recipient dispatch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub recipient_id: RecipientId,
    pub address: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the persisted future dispatch, for scheduled sends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}

/// Result of dispatching a message set.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub run_id: Uuid,
    pub timing: Timing,
    /// Messages submitted for dispatch.
    pub requested: usize,
    /// One entry per attempted recipient, in submission order.
    pub outcomes: Vec<DispatchOutcome>,
    /// Set when the session expired and remaining sends were skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    /// Recipients whose message was sent or persisted for later.
    pub fn dispatched_ids(&self) -> Vec<RecipientId> {
        self.outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.recipient_id.clone())
            .collect()
    }

    pub fn is_session_expired(&self) -> bool {
        self.aborted.is_some()
    }

    /// "N of M succeeded".
    pub fn summary(&self) -> String {
        format!("{} of {} succeeded", self.succeeded(), self.requested)
    }
}

/// Converts finalized messages into delivery calls.
pub struct DispatchScheduler {
    delivery: Arc<dyn Delivery>,
    reporter: Arc<ProgressReporter>,
    config: PipelineConfig,
}

impl DispatchScheduler {
    pub fn new(
        delivery: Arc<dyn Delivery>,
        reporter: Arc<ProgressReporter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            delivery,
            reporter,
            config,
        }
    }

    /// Validate the selection and schedule, then dispatch.
    ///
    /// Validation failures are returned before any delivery call.
    pub async fn dispatch(
        &self,
        messages: &[GeneratedMessage],
        mode: DispatchMode,
        schedule: Option<&ScheduleOptions>,
        attachments: &PackagedAttachments,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        if messages.is_empty() {
            return Err(DispatchError::EmptySelection);
        }
        let timing = Timing::resolve(mode, schedule, now)?;
        Ok(self.execute(messages, timing, attachments, now).await)
    }

    /// Dispatch under an already validated timing.
    pub async fn execute(
        &self,
        messages: &[GeneratedMessage],
        timing: Timing,
        attachments: &PackagedAttachments,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let run_id = self
            .reporter
            .start_run(RunKind::Dispatch, messages.len())
            .await;
        let mut report = DispatchReport {
            run_id,
            timing,
            requested: messages.len(),
            outcomes: Vec::with_capacity(messages.len()),
            aborted: None,
        };

        for rejected in &attachments.rejected {
            self.reporter
                .error(
                    None,
                    format!("Attachment {} dropped: {}", rejected.filename, rejected.reason),
                )
                .await;
        }

        match timing {
            Timing::Immediate => {
                self.reporter
                    .processing(format!("Sending {} message(s)", messages.len()))
                    .await
            }
            Timing::Scheduled { scheduled_for, .. } => {
                self.reporter
                    .processing(format!(
                        "Scheduling {} message(s) for {}",
                        messages.len(),
                        scheduled_for.format("%Y-%m-%d %H:%M UTC")
                    ))
                    .await
            }
        }

        // Plan everything first so content problems surface before any
        // network interaction.
        let plans: Vec<(&GeneratedMessage, Result<DispatchPlan, DispatchError>)> = messages
            .iter()
            .map(|m| (m, DispatchPlan::build(m, timing, &attachments.accepted, now)))
            .collect();

        let mut sent_any = false;
        for (message, planned) in plans {
            let plan = match planned {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(recipient_id = %message.recipient_id, error = %e, "Message not dispatchable");
                    self.reporter
                        .error(
                            Some(&message.recipient_id),
                            format!("Skipped {}: {e}", message.recipient_name),
                        )
                        .await;
                    report.outcomes.push(DispatchOutcome {
                        recipient_id: message.recipient_id.clone(),
                        address: message.address.clone(),
                        success: false,
                        error: Some(e.to_string()),
                        schedule_id: None,
                    });
                    continue;
                }
            };

            if sent_any && timing == Timing::Immediate && !self.config.send_pacing.is_zero() {
                tokio::time::sleep(self.config.send_pacing).await;
            }
            sent_any = true;

            let outcome = self.deliver(message, &plan).await;
            if let Err(reason) = &outcome {
                if reason.is_session_expired() {
                    error!(recipient_id = %message.recipient_id, "Session expired during dispatch");
                    self.reporter
                        .error(
                            Some(&message.recipient_id),
                            format!("Session expired, stopping dispatch: {reason}"),
                        )
                        .await;
                    report.aborted = Some(reason.to_string());
                }
            }
            report.outcomes.push(match outcome {
                Ok(schedule_id) => DispatchOutcome {
                    recipient_id: message.recipient_id.clone(),
                    address: message.address.clone(),
                    success: true,
                    error: None,
                    schedule_id,
                },
                Err(e) => DispatchOutcome {
                    recipient_id: message.recipient_id.clone(),
                    address: message.address.clone(),
                    success: false,
                    error: Some(e.to_string()),
                    schedule_id: None,
                },
            });
            if report.aborted.is_some() {
                break;
            }
        }

        self.reporter.info(report.summary()).await;
        self.reporter.finish_run().await;
        info!(
            run_id = %run_id,
            delivery = self.delivery.name(),
            succeeded = report.succeeded(),
            requested = report.requested,
            aborted = report.aborted.is_some(),
            "Dispatch complete"
        );
        report
    }

    /// Deliver one plan. Returns the schedule id for scheduled sends.
    async fn deliver(
        &self,
        message: &GeneratedMessage,
        plan: &DispatchPlan,
    ) -> Result<Option<String>, crate::error::DeliveryError> {
        let result = match plan.timing {
            Timing::Immediate => self.delivery.send_now(&plan.envelope).await.map(|()| None),
            Timing::Scheduled {
                scheduled_for,
                notify_on_sent,
            } => self
                .delivery
                .schedule(&plan.envelope, scheduled_for, notify_on_sent)
                .await
                .map(|receipt| Some(receipt.id)),
        };

        match &result {
            Ok(_) => {
                let verb = match plan.timing {
                    Timing::Immediate => "Sent",
                    Timing::Scheduled { .. } => "Scheduled",
                };
                self.reporter
                    .success(
                        &message.recipient_id,
                        format!("{verb} message to {}", message.recipient_name),
                    )
                    .await;
            }
            Err(e) if !e.is_session_expired() => {
                warn!(recipient_id = %message.recipient_id, error = %e, "Delivery failed");
                self.reporter
                    .error(
                        Some(&message.recipient_id),
                        format!("Failed to deliver to {}: {e}", message.recipient_name),
                    )
                    .await;
            }
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::attachments::RejectedAttachment;
    use crate::error::DeliveryError;
    use crate::generation::BatchStamp;
    use crate::progress::EventKind;
    use crate::recipients::Recipient;

    /// Delivery that counts calls and fails for chosen addresses.
    #[derive(Default)]
    struct CountingDelivery {
        sent: AtomicUsize,
        scheduled: AtomicUsize,
        fail_for: Option<String>,
        expire_for: Option<String>,
    }

    #[async_trait]
    impl Delivery for CountingDelivery {
        fn name(&self) -> &str {
            "counting"
        }

        async fn send_now(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
            let to = &envelope.recipients[0];
            if self.expire_for.as_ref() == Some(to) {
                return Err(DeliveryError::SessionExpired {
                    name: "counting".into(),
                });
            }
            if self.fail_for.as_ref() == Some(to) {
                return Err(DeliveryError::SendFailed {
                    name: "counting".into(),
                    reason: "bounced".into(),
                });
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn schedule(
            &self,
            _envelope: &Envelope,
            scheduled_for: DateTime<Utc>,
            _notify_on_sent: bool,
        ) -> Result<ScheduleReceipt, DeliveryError> {
            let n = self.scheduled.fetch_add(1, Ordering::SeqCst);
            Ok(ScheduleReceipt {
                id: format!("sched-{n}"),
                scheduled_for,
            })
        }
    }

    fn message(id: &str, address: Option<&str>) -> GeneratedMessage {
        let recipient = Recipient::catalog(id, format!("Org {id}"), address.map(str::to_string));
        let mut msg = GeneratedMessage::failed(
            &recipient,
            "placeholder",
            BatchStamp {
                run_id: Uuid::new_v4(),
                batch: 0,
            },
        );
        msg.apply_edit(Some(format!("Hello {id}")), Some("Body".into()));
        msg
    }

    fn scheduler(delivery: Arc<CountingDelivery>) -> (DispatchScheduler, Arc<ProgressReporter>) {
        let reporter = Arc::new(ProgressReporter::new());
        (
            DispatchScheduler::new(delivery, reporter.clone(), PipelineConfig::unpaced()),
            reporter,
        )
    }

    #[tokio::test]
    async fn empty_selection_is_rejected() {
        let delivery = Arc::new(CountingDelivery::default());
        let (scheduler, _) = scheduler(delivery);
        let err = scheduler
            .dispatch(&[], DispatchMode::Immediate, None, &PackagedAttachments::default(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::EmptySelection));
    }

    #[tokio::test]
    async fn past_schedule_never_reaches_delivery() {
        let delivery = Arc::new(CountingDelivery::default());
        let (scheduler, reporter) = scheduler(delivery.clone());
        let now = Utc::now();
        let opts = ScheduleOptions::at(now - Duration::hours(1));

        let err = scheduler
            .dispatch(
                &[message("1", Some("a@x.com"))],
                DispatchMode::Scheduled,
                Some(&opts),
                &PackagedAttachments::default(),
                now,
            )
            .await
            .unwrap_err();

        assert!(err.is_invalid_schedule());
        assert_eq!(delivery.scheduled.load(Ordering::SeqCst), 0);
        assert!(reporter.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn immediate_failures_are_isolated() {
        let delivery = Arc::new(CountingDelivery {
            fail_for: Some("b@x.com".into()),
            ..CountingDelivery::default()
        });
        let (scheduler, reporter) = scheduler(delivery.clone());

        let messages = vec![
            message("1", Some("a@x.com")),
            message("2", Some("b@x.com")),
            message("3", None),
            message("4", Some("d@x.com")),
        ];
        let report = scheduler
            .dispatch(&messages, DispatchMode::Immediate, None, &PackagedAttachments::default(), Utc::now())
            .await
            .unwrap();

        assert_eq!(report.summary(), "2 of 4 succeeded");
        assert_eq!(delivery.sent.load(Ordering::SeqCst), 2);
        assert_eq!(
            report.dispatched_ids(),
            vec![RecipientId::new("1"), RecipientId::new("4")]
        );
        assert!(report.outcomes[2].error.as_deref().unwrap().contains("no address"));

        let metrics = reporter.metrics().await.unwrap();
        assert_eq!(metrics.succeeded, 2);
        assert_eq!(metrics.failed, 2);
        assert!(metrics.finished);
    }

    #[tokio::test]
    async fn scheduled_dispatch_persists_each_message() {
        let delivery = Arc::new(CountingDelivery::default());
        let (scheduler, _) = scheduler(delivery.clone());
        let now = Utc::now();
        let opts = ScheduleOptions::at(now + Duration::days(1)).with_notification();

        let report = scheduler
            .dispatch(
                &[message("1", Some("a@x.com")), message("2", Some("b@x.com"))],
                DispatchMode::Scheduled,
                Some(&opts),
                &PackagedAttachments::default(),
                now,
            )
            .await
            .unwrap();

        assert_eq!(delivery.sent.load(Ordering::SeqCst), 0);
        assert_eq!(delivery.scheduled.load(Ordering::SeqCst), 2);
        assert_eq!(report.outcomes[1].schedule_id.as_deref(), Some("sched-1"));
        assert!(matches!(report.timing, Timing::Scheduled { notify_on_sent: true, .. }));
    }

    #[tokio::test]
    async fn session_expiry_stops_remaining_sends() {
        let delivery = Arc::new(CountingDelivery {
            expire_for: Some("b@x.com".into()),
            ..CountingDelivery::default()
        });
        let (scheduler, _) = scheduler(delivery.clone());

        let messages = vec![
            message("1", Some("a@x.com")),
            message("2", Some("b@x.com")),
            message("3", Some("c@x.com")),
        ];
        let report = scheduler
            .dispatch(&messages, DispatchMode::Immediate, None, &PackagedAttachments::default(), Utc::now())
            .await
            .unwrap();

        assert!(report.is_session_expired());
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(delivery.sent.load(Ordering::SeqCst), 1);
        assert_eq!(report.dispatched_ids(), vec![RecipientId::new("1")]);
    }

    #[tokio::test]
    async fn rejected_attachments_are_reported() {
        let delivery = Arc::new(CountingDelivery::default());
        let (scheduler, reporter) = scheduler(delivery);
        let attachments = PackagedAttachments {
            accepted: Vec::new(),
            rejected: vec![RejectedAttachment {
                filename: "huge.pdf".into(),
                reason: "too large".into(),
            }],
        };

        scheduler
            .dispatch(
                &[message("1", Some("a@x.com"))],
                DispatchMode::Immediate,
                None,
                &attachments,
                Utc::now(),
            )
            .await
            .unwrap();

        let log = reporter.snapshot().await.unwrap();
        assert!(log.events.iter().any(|e| e.kind == EventKind::Error
            && e.recipient_id.is_none()
            && e.message.contains("huge.pdf")));
    }
}
