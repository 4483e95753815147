//! Connection lifecycle states and the reconnect backoff schedule.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// The push channel's only externally observable lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Error,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Disconnected => "disconnected",
      Self::Connecting => "connecting",
      Self::Connected => "connected",
      Self::Error => "error",
    };
    f.write_str(s)
  }
}

/// Exponential reconnect schedule: `base * 2^attempt`, up to `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub base: Duration,
  pub max_attempts: u32,
}

impl Backoff {
  pub fn new(base: Duration, max_attempts: u32) -> Self {
    Self { base, max_attempts }
  }

  /// Delay before reconnect attempt `attempt` (zero-based), or `None` once
  /// the attempts are used up.
  pub fn delay(&self, attempt: u32) -> Option<Duration> {
    if attempt >= self.max_attempts {
      return None;
    }
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    Some(self.base.saturating_mul(factor))
  }
}

impl Default for Backoff {
  fn default() -> Self {
    Self::new(Duration::from_millis(1000), 5)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_delays_double_per_attempt() {
    let backoff = Backoff::new(Duration::from_millis(1000), 5);
    let delays: Vec<u128> = (0..5)
      .map(|a| backoff.delay(a).unwrap().as_millis())
      .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
  }

  #[test]
  fn test_gives_up_after_max_attempts() {
    let backoff = Backoff::new(Duration::from_millis(250), 3);
    assert!(backoff.delay(2).is_some());
    assert_eq!(backoff.delay(3), None);
  }

  #[test]
  fn test_large_attempts_saturate() {
    let backoff = Backoff::new(Duration::from_secs(1), u32::MAX);
    assert!(backoff.delay(40).is_some());
  }
}
