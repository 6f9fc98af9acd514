//! SSH agent authentication.

use async_trait::async_trait;

use crate::error::Result;
use crate::session::Session;

use super::accepted;
use super::traits::AuthStrategy;

/// SSH agent authentication strategy.
///
/// The engine connects to the agent (via `SSH_AUTH_SOCK`) and tries each
/// identity until one succeeds.
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AgentAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(&self, session: &Session) -> Result<bool> {
        let status = session.userauth_agent().await?;
        Ok(accepted(status))
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_auth_name() {
        assert_eq!(AgentAuth::default().name(), "agent");
    }
}
