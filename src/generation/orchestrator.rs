//! Batch orchestrator: drives generation for a recipient selection.
//!
//! Flow:
//! 1. Partition the selection into carried-over messages and recipients to
//!    generate (smart merge unless `force`)
//! 2. Generate in fixed-size batches, strictly sequentially, pacing between
//!    batches
//! 3. Merge carried-over and new messages into one result per recipient
//! 4. Optionally run the cover letter pass over successful messages
//!
//! One batch failing never aborts the run. An expired session does: every
//! later call would fail the same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::GenerationError;
use crate::progress::{ProgressReporter, RunKind};
use crate::recipients::{Recipient, RecipientId};

use super::adapter::{ContentGenerator, Enricher};
use super::reconcile::partition_carried;
use super::types::{
    BatchStamp, GeneratedMessage, GenerationParams, GenerationRequest, GenerationRun,
    RunCounters, RunOutcome,
};

/// Error attached to recipients the generator did not return.
pub const MISSING_RESULT_ERROR: &str = "Generator returned no result for this recipient";

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; takes effect before the next batch.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag for a new run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives generation batches against a [`ContentGenerator`].
pub struct BatchOrchestrator {
    generator: Arc<dyn ContentGenerator>,
    enricher: Option<Arc<dyn Enricher>>,
    reporter: Arc<ProgressReporter>,
    config: PipelineConfig,
}

impl BatchOrchestrator {
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        reporter: Arc<ProgressReporter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            generator,
            enricher: None,
            reporter,
            config,
        }
    }

    /// Enable the cover letter pass.
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Generate messages for `recipients`.
    ///
    /// `previous` holds the messages already present in the session. The
    /// returned run covers every recipient in the selection unless the run
    /// was cancelled or the session expired.
    pub async fn run(
        &self,
        recipients: &[Recipient],
        previous: &[GeneratedMessage],
        params: &GenerationParams,
        force: bool,
        cancel: &CancelFlag,
    ) -> GenerationRun {
        let started_at = Utc::now();
        let by_id: HashMap<&RecipientId, &Recipient> =
            recipients.iter().map(|r| (&r.recipient_id, r)).collect();

        let (to_generate_ids, carried) =
            partition_carried(recipients.iter().map(|r| &r.recipient_id), previous, force);
        let to_generate: Vec<&Recipient> = to_generate_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();

        let run_id = self
            .reporter
            .start_run(RunKind::Generation, to_generate.len())
            .await;

        info!(
            run_id = %run_id,
            requested = recipients.len(),
            to_generate = to_generate.len(),
            reused = carried.len(),
            force,
            "Starting generation run"
        );

        if !carried.is_empty() {
            self.reporter
                .info(format!(
                    "Keeping {} previously generated message(s)",
                    carried.len()
                ))
                .await;
        }

        let mut outcome = RunOutcome::Completed;
        let mut abort_reason = None;
        let mut generated: Vec<GeneratedMessage> = Vec::with_capacity(to_generate.len());

        if to_generate.is_empty() {
            self.reporter
                .info(format!(
                    "All {} recipient(s) already have messages; nothing to generate",
                    recipients.len()
                ))
                .await;
        } else {
            let batch_size = self.config.batch_size.max(1);
            let total_batches = to_generate.len().div_ceil(batch_size);

            for (index, batch) in to_generate.chunks(batch_size).enumerate() {
                if cancel.is_cancelled() {
                    info!(run_id = %run_id, batch = index, "Run cancelled between batches");
                    self.reporter
                        .info(format!(
                            "Run cancelled before batch {} of {}",
                            index + 1,
                            total_batches
                        ))
                        .await;
                    outcome = RunOutcome::Cancelled;
                    abort_reason = Some("Cancelled by user".to_string());
                    break;
                }

                if index > 0 && !self.config.batch_pacing.is_zero() {
                    tokio::time::sleep(self.config.batch_pacing).await;
                }

                let stamp = BatchStamp {
                    run_id,
                    batch: index,
                };
                match self
                    .generate_one_batch(batch, params, stamp, index, total_batches)
                    .await
                {
                    Ok(messages) => generated.extend(messages),
                    Err(e) => {
                        error!(run_id = %run_id, batch = index, error = %e, "Session expired during generation");
                        self.reporter
                            .error(None, format!("Session expired, stopping run: {e}"))
                            .await;
                        outcome = RunOutcome::SessionExpired;
                        abort_reason = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        // New messages override carried ones only for regenerated recipients.
        let mut fresh: HashMap<RecipientId, GeneratedMessage> = generated
            .into_iter()
            .map(|m| (m.recipient_id.clone(), m))
            .collect();
        let mut kept: HashMap<RecipientId, GeneratedMessage> = carried
            .into_iter()
            .map(|m| (m.recipient_id.clone(), m))
            .collect();

        let mut counters = RunCounters {
            requested: recipients.len(),
            ..RunCounters::default()
        };
        let mut messages = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if let Some(message) = fresh.remove(&recipient.recipient_id) {
                if message.success {
                    counters.generated += 1;
                } else {
                    counters.failed += 1;
                }
                messages.push(message);
            } else if let Some(message) = kept.remove(&recipient.recipient_id) {
                counters.reused += 1;
                messages.push(message);
            }
        }

        if params.enrich && outcome == RunOutcome::Completed {
            if let Some(reason) = self.enrich(&mut messages, &by_id, params).await {
                outcome = RunOutcome::SessionExpired;
                abort_reason = Some(reason);
            }
        }

        let run = GenerationRun {
            run_id,
            force,
            messages,
            counters,
            outcome,
            abort_reason,
            started_at,
            finished_at: Utc::now(),
        };

        self.reporter.info(run.summary()).await;
        self.reporter.finish_run().await;
        info!(
            run_id = %run_id,
            generated = counters.generated,
            reused = counters.reused,
            failed = counters.failed,
            outcome = ?run.outcome,
            "Generation run complete"
        );
        run
    }

    /// Generate one batch. Only a session expiry is returned as `Err`; every
    /// other failure is folded into failed messages.
    async fn generate_one_batch(
        &self,
        batch: &[&Recipient],
        params: &GenerationParams,
        stamp: BatchStamp,
        index: usize,
        total_batches: usize,
    ) -> Result<Vec<GeneratedMessage>, GenerationError> {
        self.reporter
            .processing(format!(
                "Generating batch {} of {} ({} recipient(s))",
                index + 1,
                total_batches,
                batch.len()
            ))
            .await;

        let request = GenerationRequest {
            recipients: batch.iter().map(|r| (*r).clone()).collect(),
            template: params.template.clone(),
            profile: params.profile.clone(),
            options: params.options.clone(),
        };

        let response = match self.generator.generate_batch(&request).await {
            Ok(response) => response,
            Err(e) if e.is_session_expired() => return Err(e),
            Err(e) => {
                warn!(
                    generator = self.generator.name(),
                    batch = index,
                    error = %e,
                    "Generation batch failed"
                );
                let reason = e.to_string();
                let mut failed = Vec::with_capacity(batch.len());
                for recipient in batch {
                    self.reporter
                        .error(
                            Some(&recipient.recipient_id),
                            format!("Failed to generate for {}: {reason}", recipient.name),
                        )
                        .await;
                    failed.push(GeneratedMessage::failed(recipient, reason.clone(), stamp));
                }
                return Ok(failed);
            }
        };

        let mut results: HashMap<RecipientId, _> = HashMap::new();
        for content in response.results {
            if batch.iter().any(|r| r.recipient_id == content.recipient_id) {
                results.insert(content.recipient_id.clone(), content);
            } else {
                warn!(
                    recipient_id = %content.recipient_id,
                    "Generator returned a result for a recipient outside the batch"
                );
            }
        }

        let mut messages = Vec::with_capacity(batch.len());
        for recipient in batch {
            let message = match results.remove(&recipient.recipient_id) {
                Some(content) => GeneratedMessage::from_content(recipient, content, stamp),
                None => GeneratedMessage::failed(recipient, MISSING_RESULT_ERROR, stamp),
            };

            if message.success {
                self.reporter
                    .success(
                        &recipient.recipient_id,
                        format!("Generated message for {}", recipient.name),
                    )
                    .await;
            } else {
                self.reporter
                    .error(
                        Some(&recipient.recipient_id),
                        format!(
                            "Failed to generate for {}: {}",
                            recipient.name,
                            message.error.as_deref().unwrap_or("unknown error")
                        ),
                    )
                    .await;
            }
            messages.push(message);
        }
        Ok(messages)
    }

    /// Cover letter pass. Returns the abort reason if the session expired.
    async fn enrich(
        &self,
        messages: &mut [GeneratedMessage],
        by_id: &HashMap<&RecipientId, &Recipient>,
        params: &GenerationParams,
    ) -> Option<String> {
        let Some(enricher) = &self.enricher else {
            warn!("Enrichment requested but no enricher is configured");
            return None;
        };

        let pending: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.success && m.cover_letter.is_none())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return None;
        }

        self.reporter
            .processing(format!("Writing cover letters for {} recipient(s)", pending.len()))
            .await;

        for (n, index) in pending.into_iter().enumerate() {
            if n > 0 && !self.config.enrichment_pacing.is_zero() {
                tokio::time::sleep(self.config.enrichment_pacing).await;
            }

            let message = &messages[index];
            let Some(recipient) = by_id.get(&message.recipient_id).copied() else {
                continue;
            };

            match enricher
                .cover_letter(recipient, message, params.profile.as_deref())
                .await
            {
                Ok(letter) => {
                    messages[index].cover_letter = Some(letter);
                    self.reporter
                        .info(format!("Cover letter ready for {}", recipient.name))
                        .await;
                }
                Err(e) if e.is_session_expired() => {
                    self.reporter
                        .error(None, format!("Session expired, stopping cover letters: {e}"))
                        .await;
                    return Some(e.to_string());
                }
                Err(e) => {
                    warn!(recipient_id = %recipient.recipient_id, error = %e, "Cover letter failed");
                    // The message itself succeeded; keep this out of the
                    // per-recipient outcome counts.
                    self.reporter
                        .error(None, format!("Cover letter failed for {}: {e}", recipient.name))
                        .await;
                }
            }
        }
        None
    }
}
