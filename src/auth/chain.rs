//! Authentication chain for trying multiple strategies.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::Session;

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// Strategies are tried in the order they were added. The first successful
/// authentication stops the chain and returns success.
///
/// # Example
///
/// ```ignore
/// let chain = AuthChain::new()
///     .with_password("secret")
///     .with_key("/path/to/key")
///     .with_agent();
///
/// let authenticated = chain.authenticate(&session).await?;
/// ```
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(key_path)));
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::new()));
        self
    }

    /// Add any strategy, including a nested chain.
    pub fn with_strategy(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Password first, then the key file; the agent only when neither is given.
    pub fn from_credentials(password: Option<&str>, key_path: Option<&PathBuf>) -> Self {
        let mut chain = AuthChain::new();
        if let Some(password) = password {
            chain = chain.with_password(password);
        }
        if let Some(key_path) = key_path {
            chain = chain.with_key(key_path.clone());
        }
        if chain.is_empty() {
            chain = chain.with_agent();
        }
        chain
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(&self, session: &Session) -> Result<bool> {
        if self.strategies.is_empty() {
            return Err(Error::InvalidArgument(
                "No authentication strategies configured".to_string(),
            ));
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(session).await {
                Ok(true) => {
                    debug!(
                        "Authentication succeeded with strategy: {}",
                        strategy.name()
                    );
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication failed with strategy: {}", strategy.name());
                    last_error = Some(Error::protocol(
                        "authenticate",
                        format!("{} authentication rejected", strategy.name()),
                    ));
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::protocol("authenticate", "All authentication methods failed")
        }))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<bool>);

    #[async_trait]
    impl AuthStrategy for Fixed {
        async fn authenticate(&self, _session: &Session) -> Result<bool> {
            self.0.clone()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    mod building {
        use super::*;

        #[test]
        fn test_auth_chain_empty() {
            let chain = AuthChain::new();
            assert!(chain.is_empty());
            assert_eq!(chain.len(), 0);
        }

        #[test]
        fn test_auth_chain_fluent_api_preserves_order() {
            let chain = AuthChain::new()
                .with_password("pass1")
                .with_key("/key1")
                .with_password("pass2")
                .with_agent()
                .with_key("/key2");

            let names: Vec<_> = chain.strategies.iter().map(|s| s.name()).collect();
            assert_eq!(names, vec!["password", "key", "password", "agent", "key"]);
        }

        #[test]
        fn test_from_credentials_uses_agent_only_without_credentials() {
            let names = |chain: AuthChain| -> Vec<&'static str> {
                chain.strategies.iter().map(|s| s.name()).collect()
            };
            let key = PathBuf::from("/home/ci/.ssh/id_ed25519");
            assert_eq!(
                names(AuthChain::from_credentials(Some("pw"), Some(&key))),
                vec!["password", "key"]
            );
            assert_eq!(names(AuthChain::from_credentials(None, None)), vec!["agent"]);
        }

        #[test]
        fn test_auth_chain_is_send_sync() {
            fn assert_send_sync<T: Send + Sync>() {}
            assert_send_sync::<AuthChain>();
        }
    }

    mod running {
        use super::*;

        #[tokio::test]
        async fn test_empty_chain_is_usage_error() {
            let session = Session::loopback();
            let err = AuthChain::new().authenticate(&session).await.unwrap_err();
            assert!(err.is_usage());
        }

        #[tokio::test]
        async fn test_stops_at_first_success() {
            let session = Session::loopback();
            let chain = AuthChain::new()
                .with_strategy(Fixed(Ok(false)))
                .with_strategy(Fixed(Ok(true)))
                .with_strategy(Fixed(Err(Error::InvalidState("unreachable".into()))));
            assert!(chain.authenticate(&session).await.unwrap());
        }

        #[tokio::test]
        async fn test_reports_last_failure() {
            let session = Session::loopback();
            let chain = AuthChain::new()
                .with_strategy(Fixed(Err(Error::InvalidState("first".into()))))
                .with_strategy(Fixed(Ok(false)));
            let err = chain.authenticate(&session).await.unwrap_err();
            assert!(err.to_string().contains("fixed authentication rejected"));
        }
    }
}
