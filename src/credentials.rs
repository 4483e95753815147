//! Bearer token sources.

use futures::future::{BoxFuture, FutureExt};
use std::future::Future;

use crate::error::SyncError;

/// Environment variables checked for the API token, in order.
pub const TOKEN_VARS: [&str; 2] = ["CASESYNC_TOKEN", "COMPLIANCE_API_TOKEN"];

/// Supplies a bearer token on demand. May be slow, may fail.
///
/// Any `Fn() -> impl Future<Output = Result<String, SyncError>>` works.
pub trait CredentialProvider: Send + Sync {
  fn token(&self) -> BoxFuture<'static, Result<String, SyncError>>;
}

impl<F, Fut> CredentialProvider for F
where
  F: Fn() -> Fut + Send + Sync,
  Fut: Future<Output = Result<String, SyncError>> + Send + 'static,
{
  fn token(&self) -> BoxFuture<'static, Result<String, SyncError>> {
    self().boxed()
  }
}

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }
}

impl std::fmt::Debug for StaticToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("StaticToken(***)")
  }
}

impl CredentialProvider for StaticToken {
  fn token(&self) -> BoxFuture<'static, Result<String, SyncError>> {
    futures::future::ready(Ok(self.0.clone())).boxed()
  }
}

/// Reads the token from the environment on every request, so a rotated
/// token is picked up without a restart.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvToken;

impl EnvToken {
  pub fn lookup() -> Result<String, SyncError> {
    TOKEN_VARS
      .iter()
      .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
      .ok_or_else(|| {
        SyncError::transport(
          None,
          format!(
            "API token not found. Set {} or {} environment variable.",
            TOKEN_VARS[0], TOKEN_VARS[1]
          ),
        )
      })
  }
}

impl CredentialProvider for EnvToken {
  fn token(&self) -> BoxFuture<'static, Result<String, SyncError>> {
    futures::future::ready(Self::lookup()).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[tokio::test]
  async fn test_closure_provider() {
    let provider: Arc<dyn CredentialProvider> =
      Arc::new(|| async { Ok::<_, SyncError>("t0ken".to_string()) });
    assert_eq!(provider.token().await.unwrap(), "t0ken");
  }

  #[tokio::test]
  async fn test_failing_provider() {
    let provider: Arc<dyn CredentialProvider> =
      Arc::new(|| async { Err::<String, _>(SyncError::transport(Some(401), "expired")) });
    assert_eq!(provider.token().await.unwrap_err().status(), Some(401));
  }

  #[tokio::test]
  async fn test_static_token_hides_secret() {
    let token = StaticToken::new("secret");
    assert_eq!(token.token().await.unwrap(), "secret");
    assert!(!format!("{:?}", token).contains("secret"));
  }
}
