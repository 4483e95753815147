//! Cache entries and their freshness rules.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::key::CacheKey;
use crate::error::SyncError;

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
  /// Never loaded
  Idle,
  /// A loader is in flight
  Loading,
  /// Last load (or write) succeeded
  Success,
  /// Last load failed; `data` still holds the last good value, if any
  Error,
}

/// A cached result and everything needed to decide whether to refetch it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub data: Option<Value>,
  pub fetched_at: Option<DateTime<Utc>>,
  #[serde(skip)]
  pub stale_after: Duration,
  pub status: EntryStatus,
  pub error: Option<SyncError>,
  /// Set by invalidation; cleared by the next successful load or write.
  pub invalidated: bool,
}

impl CacheEntry {
  pub fn idle(key: CacheKey, stale_after: Duration) -> Self {
    Self {
      key,
      data: None,
      fetched_at: None,
      stale_after,
      status: EntryStatus::Idle,
      error: None,
      invalidated: false,
    }
  }

  /// Stale once invalidated, never fetched, or past its freshness window.
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    if self.invalidated {
      return true;
    }
    match self.fetched_at {
      Some(at) => now > at + self.stale_after,
      None => true,
    }
  }

  /// Data that can be served without a network round trip.
  pub fn fresh_data(&self, now: DateTime<Utc>) -> Option<&Value> {
    if self.is_stale(now) {
      None
    } else {
      self.data.as_ref()
    }
  }

  /// Decode the cached data into a typed value.
  pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, SyncError> {
    self
      .data
      .clone()
      .map(serde_json::from_value)
      .transpose()
      .map_err(SyncError::from)
  }

  pub(crate) fn store_success(&mut self, data: Value, now: DateTime<Utc>) {
    self.data = Some(data);
    self.fetched_at = Some(now);
    self.status = EntryStatus::Success;
    self.error = None;
    self.invalidated = false;
  }

  /// Keep whatever data we had; a transient failure must not blank it.
  pub(crate) fn store_failure(&mut self, error: SyncError) {
    self.status = EntryStatus::Error;
    self.error = Some(error);
  }
}
