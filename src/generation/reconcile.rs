//! Merge reconciler: combines a prior pass with newly generated content.
//!
//! With `force` the incoming set replaces everything. Without it, prior
//! entries survive unless the same recipient was regenerated, which keeps
//! user edits on untouched entries and guarantees one message per recipient.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::recipients::RecipientId;

use super::types::GeneratedMessage;

/// Merge `incoming` into `previous`.
///
/// Surviving previous entries keep their order and come first, followed by
/// incoming entries in incoming order. Duplicate ids inside `incoming` are
/// collapsed to the last occurrence.
pub fn reconcile(
    previous: &[GeneratedMessage],
    incoming: &[GeneratedMessage],
    force: bool,
) -> Vec<GeneratedMessage> {
    let incoming = dedup_last_wins(incoming);

    if force {
        debug!(
            discarded = previous.len(),
            incoming = incoming.len(),
            "Force reconcile: replacing previous messages"
        );
        return incoming;
    }

    let incoming_ids: HashSet<&RecipientId> = incoming.iter().map(|m| &m.recipient_id).collect();
    let mut seen: HashSet<&RecipientId> = HashSet::new();
    let mut merged: Vec<GeneratedMessage> = previous
        .iter()
        .filter(|m| !incoming_ids.contains(&m.recipient_id) && seen.insert(&m.recipient_id))
        .cloned()
        .collect();

    debug!(
        kept = merged.len(),
        incoming = incoming.len(),
        "Smart merge reconcile"
    );
    merged.extend(incoming);
    merged
}

/// Split a selection into recipients that still need generation and
/// messages carried over from `previous`.
pub fn partition_carried<'a>(
    selection: impl IntoIterator<Item = &'a RecipientId>,
    previous: &[GeneratedMessage],
    force: bool,
) -> (Vec<RecipientId>, Vec<GeneratedMessage>) {
    let by_id: HashMap<&RecipientId, &GeneratedMessage> =
        previous.iter().map(|m| (&m.recipient_id, m)).collect();

    let mut to_generate = Vec::new();
    let mut carried = Vec::new();
    for id in selection {
        match by_id.get(id) {
            Some(existing) if !force => carried.push((*existing).clone()),
            _ => to_generate.push(id.clone()),
        }
    }
    (to_generate, carried)
}

fn dedup_last_wins(messages: &[GeneratedMessage]) -> Vec<GeneratedMessage> {
    let last_index: HashMap<&RecipientId, usize> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| (&m.recipient_id, i))
        .collect();
    messages
        .iter()
        .enumerate()
        .filter(|(i, m)| last_index.get(&m.recipient_id) == Some(i))
        .map(|(_, m)| m.clone())
        .collect()
}
