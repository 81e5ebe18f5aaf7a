//! Outreach session: one user's recipients, messages, and runs.
//!
//! The session owns the Recipient Set and the current message set and is the
//! only thing that mutates them. Every run moves through [`RunState`].

pub mod state;

use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::attachments::{AttachmentPackager, FileUpload};
use crate::dispatch::{DispatchMode, DispatchReport, DispatchScheduler, ScheduleOptions, Timing};
use crate::error::{DispatchError, Error, RunError};
use crate::generation::{
    BatchOrchestrator, CancelFlag, GeneratedMessage, GenerationParams, GenerationRun, RunOutcome,
    reconcile,
};
use crate::recipients::{
    Recipient, RecipientId, RecipientSet, RecipientSetChange, RecipientSource, SkipReason,
};

pub use state::{RunState, StateTransition};

/// What to dispatch and how.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Explicit selection; `None` dispatches every successful message.
    pub recipient_ids: Option<Vec<RecipientId>>,
    pub mode: DispatchMode,
    pub schedule: Option<ScheduleOptions>,
    pub files: Vec<FileUpload>,
}

impl DispatchRequest {
    pub fn immediate() -> Self {
        Self {
            recipient_ids: None,
            mode: DispatchMode::Immediate,
            schedule: None,
            files: Vec::new(),
        }
    }

    pub fn scheduled(schedule: ScheduleOptions) -> Self {
        Self {
            mode: DispatchMode::Scheduled,
            schedule: Some(schedule),
            ..Self::immediate()
        }
    }

    pub fn only(mut self, ids: Vec<RecipientId>) -> Self {
        self.recipient_ids = Some(ids);
        self
    }

    pub fn with_files(mut self, files: Vec<FileUpload>) -> Self {
        self.files = files;
        self
    }
}

/// One user's outreach session.
pub struct OutreachSession {
    state: RunState,
    transitions: Vec<StateTransition>,
    recipients: RecipientSet,
    messages: Vec<GeneratedMessage>,
    last_run: Option<GenerationRun>,
    last_dispatch: Option<DispatchReport>,
    orchestrator: BatchOrchestrator,
    scheduler: DispatchScheduler,
    packager: AttachmentPackager,
    cancel: CancelFlag,
}

impl OutreachSession {
    pub fn new(
        orchestrator: BatchOrchestrator,
        scheduler: DispatchScheduler,
        packager: AttachmentPackager,
    ) -> Self {
        Self {
            state: RunState::Idle,
            transitions: Vec::new(),
            recipients: RecipientSet::new(),
            messages: Vec::new(),
            last_run: None,
            last_dispatch: None,
            orchestrator,
            scheduler,
            packager,
            cancel: CancelFlag::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    pub fn recipients(&self) -> &RecipientSet {
        &self.recipients
    }

    /// Subscribe to Recipient Set changes.
    pub fn subscribe_recipients(&self) -> broadcast::Receiver<RecipientSetChange> {
        self.recipients.subscribe()
    }

    /// Current message set, one entry per recipient.
    pub fn messages(&self) -> &[GeneratedMessage] {
        &self.messages
    }

    pub fn message(&self, id: &RecipientId) -> Option<&GeneratedMessage> {
        self.messages.iter().find(|m| &m.recipient_id == id)
    }

    pub fn last_run(&self) -> Option<&GenerationRun> {
        self.last_run.as_ref()
    }

    pub fn last_dispatch(&self) -> Option<&DispatchReport> {
        self.last_dispatch.as_ref()
    }

    /// Handle for cancelling the generation run in flight. Clone it before
    /// starting the run.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn transition(&mut self, target: RunState, reason: Option<String>) -> Result<(), RunError> {
        if !self.state.can_transition_to(target) {
            return Err(RunError::InvalidTransition {
                state: self.state.to_string(),
                target: target.to_string(),
            });
        }
        info!(from = %self.state, to = %target, "Session state transition");
        self.transitions.push(StateTransition {
            from: self.state,
            to: target,
            timestamp: Utc::now(),
            reason,
        });
        self.state = target;
        Ok(())
    }

    /// Rebuild the Recipient Set from the catalog plus manual entries.
    ///
    /// Messages from earlier runs are kept so a later smart merge can reuse
    /// them. Returns the candidates that were left out.
    pub async fn load_recipients(
        &mut self,
        source: &dyn RecipientSource,
        manual: Vec<Recipient>,
    ) -> Result<Vec<(Recipient, SkipReason)>, Error> {
        if self.state != RunState::Idle {
            self.transition(RunState::Idle, Some("recipients reloaded".into()))?;
        }
        let catalog = source.eligible_recipients().await?;
        let exclusions = source.exclusions().await?;
        let skipped = self
            .recipients
            .replace(catalog.into_iter().chain(manual), &exclusions);
        Ok(skipped)
    }

    /// Generate messages for the whole Recipient Set.
    pub async fn generate(
        &mut self,
        params: &GenerationParams,
        force: bool,
    ) -> Result<&GenerationRun, Error> {
        let selection = self.recipients.recipients().to_vec();
        self.run_generation(selection, params, force, force).await
    }

    /// Force-regenerate a subset. Messages of other recipients are untouched.
    pub async fn regenerate(
        &mut self,
        ids: &[RecipientId],
        params: &GenerationParams,
    ) -> Result<&GenerationRun, Error> {
        let mut selection = Vec::with_capacity(ids.len());
        for id in ids {
            let recipient = self.recipients.get(id).ok_or_else(|| RunError::MessageNotFound {
                recipient_id: id.to_string(),
            })?;
            selection.push(recipient.clone());
        }
        self.run_generation(selection, params, true, false).await
    }

    async fn run_generation(
        &mut self,
        selection: Vec<Recipient>,
        params: &GenerationParams,
        force: bool,
        replace_all: bool,
    ) -> Result<&GenerationRun, Error> {
        if selection.is_empty() {
            return Err(RunError::EmptyRecipientSet.into());
        }
        self.transition(RunState::Generating, None)?;
        self.cancel.reset();

        let run = self
            .orchestrator
            .run(&selection, &self.messages, params, force, &self.cancel)
            .await;

        // An interrupted forced run must not discard messages it never
        // got to regenerate.
        let replace = replace_all && run.outcome == RunOutcome::Completed;
        self.messages = reconcile(&self.messages, &run.messages, replace);

        if run.outcome == RunOutcome::SessionExpired {
            let reason = run
                .abort_reason
                .clone()
                .unwrap_or_else(|| "session expired".to_string());
            self.last_run = Some(run);
            self.transition(RunState::Failed, Some(reason.clone()))?;
            return Err(RunError::SessionExpired { reason }.into());
        }

        self.transition(RunState::Reconciled, Some(run.summary()))?;
        Ok(self.last_run.insert(run))
    }

    /// Apply a user edit to one message.
    pub fn edit_message(
        &mut self,
        id: &RecipientId,
        subject: Option<String>,
        body: Option<String>,
    ) -> Result<&GeneratedMessage, RunError> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| &m.recipient_id == id)
            .ok_or_else(|| RunError::MessageNotFound {
                recipient_id: id.to_string(),
            })?;
        message.apply_edit(subject, body);
        Ok(message)
    }

    /// Messages eligible for dispatch. Only recipients still in the active
    /// set qualify; a reload may have excluded some since generation.
    fn select(&self, ids: Option<&[RecipientId]>) -> Result<Vec<GeneratedMessage>, RunError> {
        match ids {
            None => Ok(self
                .messages
                .iter()
                .filter(|m| m.success && self.recipients.contains(&m.recipient_id))
                .cloned()
                .collect()),
            Some(ids) => {
                let mut seen = HashSet::new();
                let mut selection = Vec::with_capacity(ids.len());
                for id in ids.iter().filter(|id| seen.insert(*id)) {
                    let message = self.message(id).ok_or_else(|| RunError::MessageNotFound {
                        recipient_id: id.to_string(),
                    })?;
                    if !self.recipients.contains(id) {
                        return Err(RunError::NotInRecipientSet {
                            recipient_id: id.to_string(),
                        });
                    }
                    selection.push(message.clone());
                }
                Ok(selection)
            }
        }
    }

    /// Dispatch messages.
    ///
    /// The selection and schedule are validated before any attachment is
    /// stored or any message sent. Dispatched recipients leave both the
    /// Recipient Set and the message set, so they cannot be sent twice.
    pub async fn dispatch(&mut self, request: DispatchRequest) -> Result<&DispatchReport, Error> {
        if !self.state.can_transition_to(RunState::Dispatching) {
            return Err(RunError::InvalidTransition {
                state: self.state.to_string(),
                target: RunState::Dispatching.to_string(),
            }
            .into());
        }
        let selection = self.select(request.recipient_ids.as_deref())?;
        if selection.is_empty() {
            return Err(DispatchError::EmptySelection.into());
        }
        let now = Utc::now();
        let timing = Timing::resolve(request.mode, request.schedule.as_ref(), now)?;

        self.transition(RunState::Dispatching, None)?;
        let attachments = self.packager.package(request.files).await;
        let report = self
            .scheduler
            .execute(&selection, timing, &attachments, now)
            .await;

        let dispatched: HashSet<RecipientId> = report.dispatched_ids().into_iter().collect();
        let ids: Vec<RecipientId> = dispatched.iter().cloned().collect();
        self.recipients.remove(&ids);
        self.messages.retain(|m| !dispatched.contains(&m.recipient_id));

        if let Some(reason) = report.aborted.clone() {
            warn!(reason = %reason, "Dispatch aborted");
            self.last_dispatch = Some(report);
            self.transition(RunState::Failed, Some(reason.clone()))?;
            return Err(RunError::SessionExpired { reason }.into());
        }

        self.transition(RunState::Done, Some(report.summary()))?;
        Ok(self.last_dispatch.insert(report))
    }
}
