//! Recipient set: normalized, deduplicated outreach targets.
//!
//! The set owns its change notifications: observers call
//! [`RecipientSet::subscribe`] instead of listening on a global bus.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Namespace for synthetic manual recipient ids.
const MANUAL_NAMESPACE: Uuid = Uuid::from_u128(0x6f75_7472_6561_6368_6d61_6e75_616c_0001);

/// Capacity of the change broadcast channel.
const CHANGE_CAPACITY: usize = 64;

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid address regex"));

/// Stable recipient identifier, unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for a manually entered address.
    ///
    /// The same address (after normalization) always maps to the same id.
    pub fn for_manual_address(address: &str) -> Self {
        let normalized = normalize_address(address);
        Self(format!(
            "manual-{}",
            Uuid::new_v5(&MANUAL_NAMESPACE, normalized.as_bytes())
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Where a recipient came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientOrigin {
    /// Backed by an organization in the catalog.
    Catalog,
    /// Typed in by the user.
    Manual,
}

/// An addressable outreach target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub recipient_id: RecipientId,
    pub name: String,
    /// Resolved address, `None` until known.
    pub address: Option<String>,
    pub origin: RecipientOrigin,
}

impl Recipient {
    /// A catalog-backed recipient.
    pub fn catalog(
        id: impl Into<String>,
        name: impl Into<String>,
        address: Option<String>,
    ) -> Self {
        Self {
            recipient_id: RecipientId::new(id),
            name: name.into(),
            address: address.map(|a| normalize_address(&a)),
            origin: RecipientOrigin::Catalog,
        }
    }

    /// A manually entered recipient, keyed by its address.
    pub fn manual(address: &str) -> Self {
        let address = normalize_address(address);
        Self {
            recipient_id: RecipientId::for_manual_address(&address),
            name: address.clone(),
            address: Some(address),
            origin: RecipientOrigin::Manual,
        }
    }
}

/// Trim and lower-case an address for comparison.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Loose syntactic check for an email address.
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE.is_match(address.trim())
}

/// Parse a free-form list of manual addresses (comma, semicolon, or newline
/// separated). Returns the valid recipients and the rejected raw entries.
pub fn parse_manual_addresses(raw: &str) -> (Vec<Recipient>, Vec<String>) {
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for entry in raw
        .split([',', ';', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if is_valid_address(entry) {
            accepted.push(Recipient::manual(entry));
        } else {
            rejected.push(entry.to_string());
        }
    }
    (accepted, rejected)
}

/// Addresses that must not be targeted again.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    /// Addresses that already received a message.
    pub contacted: HashSet<String>,
    /// Addresses with a pending scheduled dispatch.
    pub scheduled: HashSet<String>,
}

impl Exclusions {
    pub fn new(
        contacted: impl IntoIterator<Item = String>,
        scheduled: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            contacted: contacted.into_iter().map(|a| normalize_address(&a)).collect(),
            scheduled: scheduled.into_iter().map(|a| normalize_address(&a)).collect(),
        }
    }

    pub fn excludes(&self, address: &str) -> bool {
        let normalized = normalize_address(address);
        self.contacted.contains(&normalized) || self.scheduled.contains(&normalized)
    }
}

/// Why a candidate was left out of the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    DuplicateId,
    DuplicateAddress,
    AlreadyContacted,
    AlreadyScheduled,
}

/// Change notification for recipient set observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientSetChange {
    /// The whole set was rebuilt.
    Replaced { count: usize },
    /// Recipients were added.
    Added { ids: Vec<RecipientId> },
    /// Recipients were removed (e.g. after dispatch).
    Removed { ids: Vec<RecipientId> },
}

/// The active, deduplicated recipient selection for a session.
pub struct RecipientSet {
    recipients: Vec<Recipient>,
    tx: broadcast::Sender<RecipientSetChange>,
}

impl Default for RecipientSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipientSet {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            recipients: Vec::new(),
            tx,
        }
    }

    /// Subscribe to set changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RecipientSetChange> {
        self.tx.subscribe()
    }

    /// Replace the set with `candidates`, dropping duplicates and excluded
    /// addresses. Returns the skipped candidates with their reasons.
    pub fn replace(
        &mut self,
        candidates: impl IntoIterator<Item = Recipient>,
        exclusions: &Exclusions,
    ) -> Vec<(Recipient, SkipReason)> {
        self.recipients.clear();
        let skipped = self.extend_inner(candidates, exclusions);
        info!(
            count = self.recipients.len(),
            skipped = skipped.len(),
            "Recipient set rebuilt"
        );
        let _ = self.tx.send(RecipientSetChange::Replaced {
            count: self.recipients.len(),
        });
        skipped
    }

    /// Add more candidates under the same rules as [`Self::replace`].
    pub fn extend(
        &mut self,
        candidates: impl IntoIterator<Item = Recipient>,
        exclusions: &Exclusions,
    ) -> Vec<(Recipient, SkipReason)> {
        let before = self.recipients.len();
        let skipped = self.extend_inner(candidates, exclusions);
        let ids: Vec<RecipientId> = self.recipients[before..]
            .iter()
            .map(|r| r.recipient_id.clone())
            .collect();
        if !ids.is_empty() {
            let _ = self.tx.send(RecipientSetChange::Added { ids });
        }
        skipped
    }

    fn extend_inner(
        &mut self,
        candidates: impl IntoIterator<Item = Recipient>,
        exclusions: &Exclusions,
    ) -> Vec<(Recipient, SkipReason)> {
        let mut ids: HashSet<RecipientId> = self
            .recipients
            .iter()
            .map(|r| r.recipient_id.clone())
            .collect();
        let mut addresses: HashSet<String> = self
            .recipients
            .iter()
            .filter_map(|r| r.address.clone())
            .collect();
        let mut skipped = Vec::new();

        for mut candidate in candidates {
            candidate.address = candidate.address.map(|a| normalize_address(&a));

            let reason = if ids.contains(&candidate.recipient_id) {
                Some(SkipReason::DuplicateId)
            } else if let Some(address) = candidate.address.as_deref() {
                if exclusions.contacted.contains(address) {
                    Some(SkipReason::AlreadyContacted)
                } else if exclusions.scheduled.contains(address) {
                    Some(SkipReason::AlreadyScheduled)
                } else if addresses.contains(address) {
                    Some(SkipReason::DuplicateAddress)
                } else {
                    None
                }
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    debug!(recipient_id = %candidate.recipient_id, ?reason, "Skipping recipient");
                    skipped.push((candidate, reason));
                }
                None => {
                    ids.insert(candidate.recipient_id.clone());
                    if let Some(address) = &candidate.address {
                        addresses.insert(address.clone());
                    }
                    self.recipients.push(candidate);
                }
            }
        }
        skipped
    }

    /// Remove recipients from the active view. Returns how many were removed.
    pub fn remove(&mut self, ids: &[RecipientId]) -> usize {
        let wanted: HashSet<&RecipientId> = ids.iter().collect();
        let mut removed = Vec::new();
        self.recipients.retain(|r| {
            if wanted.contains(&r.recipient_id) {
                removed.push(r.recipient_id.clone());
                false
            } else {
                true
            }
        });
        let count = removed.len();
        if count > 0 {
            info!(count, "Removed recipients from active set");
            let _ = self.tx.send(RecipientSetChange::Removed { ids: removed });
        }
        count
    }

    pub fn get(&self, id: &RecipientId) -> Option<&Recipient> {
        self.recipients.iter().find(|r| &r.recipient_id == id)
    }

    pub fn contains(&self, id: &RecipientId) -> bool {
        self.get(id).is_some()
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

/// Read-only source of catalog recipients and exclusion sets.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    /// Recipients with a resolved address that are neither contacted nor
    /// scheduled at query time.
    async fn eligible_recipients(&self) -> Result<Vec<Recipient>, DatabaseError>;

    /// Current contacted / scheduled address sets.
    async fn exclusions(&self) -> Result<Exclusions, DatabaseError>;
}
