//! Pluggable auth-token refresh.
//!
//! The consumer never acquires credentials itself. When a refresher is
//! installed it is asked for a token before dialing with an empty token and
//! once more after the server answers `401 Unauthorized`.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::errors::BoxError;

/// Source of fresh bearer tokens.
///
/// ```rust,no_run
/// use firehose_consumer::auth::TokenRefresher;
/// use firehose_consumer::errors::BoxError;
/// use secrecy::SecretString;
///
/// struct StaticToken(String);
///
/// #[async_trait::async_trait]
/// impl TokenRefresher for StaticToken {
///     async fn refresh_auth_token(&self) -> Result<SecretString, BoxError> {
///         Ok(SecretString::new(self.0.clone()))
///     }
/// }
/// ```
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns a token suitable for the `Authorization` header.
    async fn refresh_auth_token(&self) -> Result<SecretString, BoxError>;
}
