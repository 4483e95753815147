//! Cooperative cancellation signal handed to every network-issuing call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::SyncError;

/// A cloneable, one-shot cancellation flag.
///
/// All clones observe the same flag. Once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
  inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
  cancelled: AtomicBool,
  notify: Notify,
}

impl CancelSignal {
  pub fn new() -> Self {
    Self::default()
  }

  /// Trigger the signal and wake everything waiting on it.
  pub fn cancel(&self) {
    if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
      self.inner.notify.notify_waiters();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.inner.cancelled.load(Ordering::SeqCst)
  }

  /// Resolves once the signal has been triggered.
  pub async fn cancelled(&self) {
    // Registered before the flag check so a concurrent cancel() can't be missed.
    let notified = self.inner.notify.notified();
    if self.is_cancelled() {
      return;
    }
    notified.await;
  }

  /// Drive `fut` to completion unless the signal fires first.
  pub async fn run<T, F>(&self, fut: F) -> Result<T, SyncError>
  where
    F: Future<Output = Result<T, SyncError>>,
  {
    tokio::select! {
      biased;
      _ = self.cancelled() => Err(SyncError::Cancelled),
      result = fut => result,
    }
  }
}
