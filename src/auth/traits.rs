//! Authentication strategy trait definition.

use async_trait::async_trait;

use crate::error::Result;
use crate::session::Session;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. The session's user property names the account.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate the session.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Authentication failed (credentials rejected)
    /// * `Err(error)` - Error during authentication attempt
    async fn authenticate(&self, session: &Session) -> Result<bool>;

    /// Get the name of this authentication strategy.
    ///
    /// Used for logging and debugging purposes.
    fn name(&self) -> &'static str;
}
