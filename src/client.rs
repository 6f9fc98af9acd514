//! Client connection setup with retries.
//!
//! ## Connection Lifecycle
//!
//! 1. **Session Setup**: Create a session on an engine and push host, port,
//!    user, timeout, compression and verbosity from the [`ClientConfig`].
//!
//! 2. **Connection Establishment**: [`Session::connect`].
//!
//! 3. **Authentication**: An [`AuthChain`] built from the configured
//!    credentials: password, then key file, with the SSH agent as the
//!    fallback when neither is given.
//!
//! ## Retry Strategy
//!
//! Connection attempts use exponential backoff with jitter via the `backon` crate:
//!
//! - **Initial delay**: `retry_delay_ms` (default: 1000ms)
//! - **Maximum delay**: Capped at [`MAX_RETRY_DELAY`] (10 seconds)
//! - **Maximum attempts**: `max_retries` (default: 3)
//! - **Jitter**: Random jitter is added to prevent thundering herd
//!
//! Authentication failures and usage errors are never retried to avoid
//! account lockouts and pointless repetition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};

use crate::auth::{AuthChain, AuthStrategy};
use crate::config::{ClientConfig, MAX_RETRY_DELAY};
use crate::error::{Error, Result, is_retryable_error};
use crate::session::Session;
use crate::transport::Transport;
use crate::transport::ssh::RusshTransport;

/// Connect and authenticate over SSH/TCP, retrying transient failures.
///
/// Returns the session and the number of retries it took.
pub async fn connect_with_retry(config: &ClientConfig) -> Result<(Session, u32)> {
    connect_with_retry_using(config, || Arc::new(RusshTransport::new())).await
}

/// [`connect_with_retry`] on any engine; `make_transport` runs once per attempt.
pub async fn connect_with_retry_using<F>(
    config: &ClientConfig,
    make_transport: F,
) -> Result<(Session, u32)>
where
    F: Fn() -> Arc<dyn Transport>,
{
    let attempt_counter = AtomicU32::new(0);
    let address = config.address();
    let username = config.user.as_str();

    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.retry_delay())
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(config.max_retries() as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);

        if current_attempt > 0 {
            warn!(
                "SSH connection retry attempt {} to {}@{}",
                current_attempt, username, address
            );
        }

        connect_once(config, make_transport()).await
    })
    .retry(backoff)
    .when(|e: &Error| {
        let retryable = !e.is_usage() && is_retryable_error(&e.to_string());
        if !retryable {
            warn!(
                "SSH connection to {}@{} failed with non-retryable error: {}",
                username, address, e
            );
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(session) => {
            if retry_count > 0 {
                info!(
                    "SSH connection to {}@{} succeeded after {} retry attempt(s)",
                    username, address, retry_count
                );
            }
            Ok((session, retry_count))
        }
        Err(e) => {
            error!(
                "SSH connection to {}@{} failed after {} attempt(s). Last error: {}",
                username, address, total_attempts, e
            );
            Err(e)
        }
    }
}

/// One attempt: configure, connect, authenticate.
async fn connect_once(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<Session> {
    let session = Session::new(transport);
    session.set_host(&config.host)?;
    session.set_port(config.port())?;
    session.set_user(&config.user)?;
    session.set_property("timeout", config.connect_timeout().as_secs() as i64)?;
    session.set_property(
        "compression",
        if config.compression() { "yes" } else { "no" },
    )?;
    session.set_log_verbosity(config.log_verbosity)?;
    session.set_wait_timeout(config.wait_timeout())?;

    session.connect().await?;

    let chain = AuthChain::from_credentials(config.password.as_deref(), config.key_path.as_ref());
    let authenticated = match chain.authenticate(&session).await {
        Ok(authenticated) => authenticated,
        Err(e) => {
            session.close().await?;
            return Err(e);
        }
    };
    if !authenticated {
        session.close().await?;
        return Err(Error::protocol(
            "authenticate",
            "Authentication failed: no authentication methods succeeded",
        ));
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackTransport;

    fn quick(address: &str) -> ClientConfig {
        ClientConfig {
            max_retries: Some(2),
            retry_delay_ms: Some(1),
            ..ClientConfig::new(address, "ci").unwrap().with_password("secret")
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_retried() {
        let config = quick("nowhere.loopback:7");
        let attempts = AtomicU32::new(0);
        let err = connect_with_retry_using(&config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Arc::new(LoopbackTransport::client())
        })
        .await
        .unwrap_err();

        assert!(err.is_protocol());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
