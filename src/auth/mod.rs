//! Authentication strategies for client sessions.
//!
//! Each strategy drives one of the session's `userauth_*` operations; an
//! [`AuthChain`] tries several in order and stops at the first success.
//!
//! # Available Strategies
//!
//! - [`PasswordAuth`]: Password-based authentication
//! - [`KeyAuth`]: Private key file authentication
//! - [`AgentAuth`]: SSH agent authentication
//!
//! # Example
//!
//! ```ignore
//! use sshplex::auth::{AuthChain, AuthStrategy};
//!
//! let chain = AuthChain::new()
//!     .with_password("secret")
//!     .with_key("/path/to/key")
//!     .with_agent();
//!
//! let authenticated = chain.authenticate(&session).await?;
//! ```

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use crate::transport::AuthStatus;

/// `Success` means authenticated; `Denied` means try something else.
pub(crate) fn accepted(status: AuthStatus) -> bool {
    matches!(status, AuthStatus::Success)
}
