//! Optimistic patches: speculative edits that can be undone exactly.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cache::{CacheEntry, CacheKey, EntryStatus};

/// An optimistic edit outstanding on one cache entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Patch {
  /// Nothing was applied, so there is nothing to undo.
  #[default]
  None,
  Pending {
    target: CacheKey,
    /// The whole entry as it was right before the edit.
    previous: Box<CacheEntry>,
    applied_at: DateTime<Utc>,
    mutation_id: u64,
  },
}

impl Patch {
  /// Replace `entry`'s data with `next`, remembering the entry as it was.
  pub fn apply(entry: &mut CacheEntry, next: Value, mutation_id: u64, now: DateTime<Utc>) -> Patch {
    let previous = Box::new(entry.clone());
    entry.data = Some(next);
    entry.status = EntryStatus::Success;
    entry.error = None;
    Patch::Pending {
      target: entry.key.clone(),
      previous,
      applied_at: now,
      mutation_id,
    }
  }

  /// Put `entry` back exactly as it was when the patch was applied.
  ///
  /// Whatever happened to the entry in between is overwritten.
  pub fn rollback(self, entry: &mut CacheEntry) -> bool {
    match self {
      Patch::None => false,
      Patch::Pending { previous, .. } => {
        *entry = *previous;
        true
      }
    }
  }

  pub fn is_pending(&self) -> bool {
    matches!(self, Patch::Pending { .. })
  }

  pub fn target(&self) -> Option<&CacheKey> {
    match self {
      Patch::None => None,
      Patch::Pending { target, .. } => Some(target),
    }
  }
}
