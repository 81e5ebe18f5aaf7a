//! Dispatch planning: turns a finalized message into a validated send
//! instruction. No I/O happens here.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attachments::EncodedAttachment;
use crate::error::DispatchError;
use crate::generation::GeneratedMessage;
use crate::recipients::RecipientId;

use super::delivery::Envelope;

/// When a message should go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Immediate,
    Scheduled,
}

/// User-facing schedule input: a calendar date plus hour and minute (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    pub date: NaiveDate,
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub notify_on_sent: bool,
}

impl ScheduleOptions {
    pub fn new(date: NaiveDate, hour: u32, minute: u32) -> Self {
        Self {
            date,
            hour,
            minute,
            notify_on_sent: false,
        }
    }

    pub fn with_notification(mut self) -> Self {
        self.notify_on_sent = true;
        self
    }

    /// Schedule options for an exact instant (truncated to the minute).
    pub fn at(when: DateTime<Utc>) -> Self {
        use chrono::Timelike;
        Self::new(when.date_naive(), when.hour(), when.minute())
    }
}

/// Compose the UTC timestamp for `opts`.
pub fn compose_schedule(opts: &ScheduleOptions) -> Result<DateTime<Utc>, DispatchError> {
    if opts.hour >= 24 {
        return Err(DispatchError::InvalidSchedule {
            reason: format!("hour {} is out of range (0-23)", opts.hour),
        });
    }
    if opts.minute >= 60 {
        return Err(DispatchError::InvalidSchedule {
            reason: format!("minute {} is out of range (0-59)", opts.minute),
        });
    }
    let time = NaiveTime::from_hms_opt(opts.hour, opts.minute, 0).ok_or_else(|| {
        DispatchError::InvalidSchedule {
            reason: format!("{:02}:{:02} is not a valid time", opts.hour, opts.minute),
        }
    })?;
    Ok(opts.date.and_time(time).and_utc())
}

/// Resolved timing shared by every message of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Timing {
    Immediate,
    Scheduled {
        scheduled_for: DateTime<Utc>,
        notify_on_sent: bool,
    },
}

impl Timing {
    /// Validate mode and schedule against `now`.
    ///
    /// A scheduled dispatch needs options and a timestamp strictly after
    /// `now`; schedule options on an immediate dispatch are ignored.
    pub fn resolve(
        mode: DispatchMode,
        schedule: Option<&ScheduleOptions>,
        now: DateTime<Utc>,
    ) -> Result<Self, DispatchError> {
        match mode {
            DispatchMode::Immediate => Ok(Self::Immediate),
            DispatchMode::Scheduled => {
                let opts = schedule.ok_or_else(|| DispatchError::InvalidSchedule {
                    reason: "scheduled dispatch requires a date and time".into(),
                })?;
                let scheduled_for = compose_schedule(opts)?;
                if scheduled_for <= now {
                    return Err(DispatchError::ScheduleInPast { scheduled_for, now });
                }
                Ok(Self::Scheduled {
                    scheduled_for,
                    notify_on_sent: opts.notify_on_sent,
                })
            }
        }
    }

    pub fn mode(&self) -> DispatchMode {
        match self {
            Self::Immediate => DispatchMode::Immediate,
            Self::Scheduled { .. } => DispatchMode::Scheduled,
        }
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Immediate => None,
            Self::Scheduled { scheduled_for, .. } => Some(*scheduled_for),
        }
    }
}

/// A finalized, validated instruction for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub recipient_id: RecipientId,
    pub timing: Timing,
    pub envelope: Envelope,
    pub created_at: DateTime<Utc>,
}

impl DispatchPlan {
    pub fn mode(&self) -> DispatchMode {
        self.timing.mode()
    }

    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.timing.scheduled_for()
    }

    pub fn notify_on_sent(&self) -> bool {
        matches!(
            self.timing,
            Timing::Scheduled {
                notify_on_sent: true,
                ..
            }
        )
    }

    /// Build a plan for `message` under an already resolved timing.
    pub fn build(
        message: &GeneratedMessage,
        timing: Timing,
        attachments: &[EncodedAttachment],
        now: DateTime<Utc>,
    ) -> Result<Self, DispatchError> {
        let recipient_id = message.recipient_id.to_string();
        if !message.success {
            return Err(DispatchError::NotGenerated { recipient_id });
        }
        let address = message
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| DispatchError::MissingAddress {
                recipient_id: recipient_id.clone(),
            })?;
        for (field, value) in [("subject", &message.subject), ("body", &message.body)] {
            if value.trim().is_empty() {
                return Err(DispatchError::MissingContent {
                    recipient_id,
                    field: field.to_string(),
                });
            }
        }

        Ok(Self {
            recipient_id: message.recipient_id.clone(),
            timing,
            envelope: Envelope {
                recipients: vec![address.to_string()],
                subject: message.subject.clone(),
                body: message.body.clone(),
                attachments: attachments.to_vec(),
            },
            created_at: now,
        })
    }
}

/// Plan one message: resolve the schedule, then validate the message.
pub fn plan(
    message: &GeneratedMessage,
    mode: DispatchMode,
    schedule: Option<&ScheduleOptions>,
    attachments: &[EncodedAttachment],
    now: DateTime<Utc>,
) -> Result<DispatchPlan, DispatchError> {
    let timing = Timing::resolve(mode, schedule, now)?;
    DispatchPlan::build(message, timing, attachments, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::BatchStamp;
    use crate::recipients::Recipient;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 30).unwrap()
    }

    fn stamp() -> BatchStamp {
        BatchStamp {
            run_id: Uuid::new_v4(),
            batch: 0,
        }
    }

    fn ready_message() -> GeneratedMessage {
        let recipient = Recipient::catalog("org-1", "Acme", Some("hi@acme.com".into()));
        let mut msg = GeneratedMessage::failed(&recipient, "pending", stamp());
        msg.apply_edit(Some("Hello".into()), Some("Body".into()));
        msg
    }

    #[test]
    fn compose_rejects_out_of_range_fields() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        assert!(compose_schedule(&ScheduleOptions::new(date, 24, 0)).is_err());
        assert!(compose_schedule(&ScheduleOptions::new(date, 9, 60)).is_err());
        let at = compose_schedule(&ScheduleOptions::new(date, 9, 15)).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 11, 9, 15, 0).unwrap());
    }

    #[test]
    fn scheduled_requires_future_time() {
        let msg = ready_message();

        // Same minute as `now` composes to 12:00:00, which is before 12:00:30.
        let same_minute = ScheduleOptions::at(now());
        let err = plan(&msg, DispatchMode::Scheduled, Some(&same_minute), &[], now()).unwrap_err();
        assert!(err.is_invalid_schedule());

        let yesterday = ScheduleOptions::at(now() - Duration::days(1));
        let err = plan(&msg, DispatchMode::Scheduled, Some(&yesterday), &[], now()).unwrap_err();
        assert!(err.is_invalid_schedule());

        let err = plan(&msg, DispatchMode::Scheduled, None, &[], now()).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidSchedule { .. }));
    }

    #[test]
    fn scheduled_plan_carries_timestamp_and_notification() {
        let opts = ScheduleOptions::at(now() + Duration::hours(2)).with_notification();
        let plan = plan(&ready_message(), DispatchMode::Scheduled, Some(&opts), &[], now()).unwrap();
        assert_eq!(plan.mode(), DispatchMode::Scheduled);
        assert_eq!(
            plan.scheduled_for(),
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap())
        );
        assert!(plan.notify_on_sent());
        assert_eq!(plan.envelope.recipients, vec!["hi@acme.com".to_string()]);
    }

    #[test]
    fn immediate_ignores_schedule_options() {
        let past = ScheduleOptions::at(now() - Duration::days(3));
        let plan = plan(&ready_message(), DispatchMode::Immediate, Some(&past), &[], now()).unwrap();
        assert_eq!(plan.timing, Timing::Immediate);
        assert!(plan.scheduled_for().is_none());
    }

    #[test]
    fn failed_or_unaddressed_messages_are_rejected() {
        let recipient = Recipient::catalog("org-2", "NoMail", None);
        let failed = GeneratedMessage::failed(&recipient, "timeout", stamp());
        assert!(matches!(
            DispatchPlan::build(&failed, Timing::Immediate, &[], now()),
            Err(DispatchError::NotGenerated { .. })
        ));

        let mut unaddressed = failed.clone();
        unaddressed.apply_edit(Some("Hi".into()), Some("Body".into()));
        assert!(matches!(
            DispatchPlan::build(&unaddressed, Timing::Immediate, &[], now()),
            Err(DispatchError::MissingAddress { .. })
        ));
    }

    #[test]
    fn empty_subject_is_missing_content() {
        let mut msg = ready_message();
        msg.subject = "  ".into();
        let err = DispatchPlan::build(&msg, Timing::Immediate, &[], now()).unwrap_err();
        assert!(matches!(err, DispatchError::MissingContent { ref field, .. } if field == "subject"));
    }
}
