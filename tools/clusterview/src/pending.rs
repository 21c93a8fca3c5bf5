use crate::errors::ClusterViewError;
use crate::model::{GuestKey, NodeKey};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PendingKey {
    Guest(GuestKey),
    Node(NodeKey),
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Guest(key) => write!(f, "guest {key}"),
            Self::Node(key) => write!(f, "node {key}"),
        }
    }
}

impl From<GuestKey> for PendingKey {
    fn from(key: GuestKey) -> Self {
        Self::Guest(key)
    }
}

impl From<NodeKey> for PendingKey {
    fn from(key: NodeKey) -> Self {
        Self::Node(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PendingPhase {
    Pending,
    Completed,
    Failed(String),
    TimedOut,
}

impl PendingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub label: String,
    pub phase: PendingPhase,
}

/// In-flight mutating operations keyed by the exact identity they were
/// dispatched against. An absent key is `Idle`. Following a guest that moved
/// since dispatch is the caller's job (see `guest_keys`).
#[derive(Debug, Clone, Default)]
pub struct PendingTracker {
    entries: BTreeMap<PendingKey, PendingEntry>,
}

impl PendingTracker {
    fn find(&self, key: &PendingKey) -> Option<(&PendingKey, &PendingEntry)> {
        self.entries.get_key_value(key)
    }

    /// Idle -> Pending. Any existing entry, terminal or not, rejects the new
    /// operation until it has been cleared.
    pub fn set_pending(
        &mut self,
        key: PendingKey,
        label: impl Into<String>,
    ) -> Result<(), ClusterViewError> {
        if let Some((held, entry)) = self.find(&key) {
            return Err(ClusterViewError::Busy {
                target: held.to_string(),
                label: entry.label.clone(),
            });
        }
        self.entries.insert(
            key,
            PendingEntry {
                label: label.into(),
                phase: PendingPhase::Pending,
            },
        );
        Ok(())
    }

    pub fn is_pending(&self, key: &PendingKey) -> (bool, Option<String>) {
        match self.find(key) {
            Some((_, entry)) => (true, Some(entry.label.clone())),
            None => (false, None),
        }
    }

    pub fn entry(&self, key: &PendingKey) -> Option<&PendingEntry> {
        self.find(key).map(|(_, entry)| entry)
    }

    /// Pending -> Completed | Failed | TimedOut. The entry stays busy until
    /// `clear_pending`.
    pub fn resolve(&mut self, key: &PendingKey, phase: PendingPhase) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.phase == PendingPhase::Pending => {
                entry.phase = phase;
                true
            }
            _ => false,
        }
    }

    /// Back to Idle. Returns the removed entry.
    pub fn clear_pending(&mut self, key: &PendingKey) -> Option<PendingEntry> {
        self.entries.remove(key)
    }

    pub fn clear_all(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn any(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Guests whose observed fields a refresh must not overwrite, excluding
    /// the operation doing the refreshing.
    pub fn frozen_guests(&self, owner: Option<&PendingKey>) -> BTreeSet<GuestKey> {
        self.entries
            .keys()
            .filter(|key| owner != Some(*key))
            .filter_map(|key| match key {
                PendingKey::Guest(guest) => Some(guest.clone()),
                PendingKey::Node(_) => None,
            })
            .collect()
    }

    pub fn guest_keys(&self) -> impl Iterator<Item = &GuestKey> + '_ {
        self.entries.keys().filter_map(|key| match key {
            PendingKey::Guest(guest) => Some(guest),
            PendingKey::Node(_) => None,
        })
    }

    pub fn labels(&self) -> Vec<(PendingKey, String)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.label.clone()))
            .collect()
    }
}
