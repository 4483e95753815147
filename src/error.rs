//! Error taxonomy shared by every sync component.

use serde::Serialize;

/// Errors surfaced by the sync layer.
///
/// `Clone` because a single in-flight load is shared by every caller waiting
/// on the same key, and each of them receives the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncError {
  /// Network or HTTP failure. `status` is absent when no response arrived.
  #[error("transport error{}: {message}", status_suffix(.status))]
  Transport {
    status: Option<u16>,
    message: String,
  },
  /// The operation was aborted because its consumer went away.
  #[error("operation cancelled")]
  Cancelled,
  /// Push channel connect or handshake failure.
  #[error("channel error: {0}")]
  Channel(String),
  /// The server sent a payload we could not interpret.
  #[error("invalid payload: {0}")]
  Validation(String),
}

impl SyncError {
  pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
    Self::Transport {
      status,
      message: message.into(),
    }
  }

  /// Cancellation is never a user-facing failure.
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Self::Cancelled)
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Transport { status, .. } => *status,
      _ => None,
    }
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(err: serde_json::Error) -> Self {
    Self::Validation(err.to_string())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      return Self::Validation(err.to_string());
    }
    Self::Transport {
      status: err.status().map(|s| s.as_u16()),
      message: err.to_string(),
    }
  }
}

fn status_suffix(status: &Option<u16>) -> String {
  status.map(|s| format!(" ({s})")).unwrap_or_default()
}

pub type SyncResult<T> = Result<T, SyncError>;
