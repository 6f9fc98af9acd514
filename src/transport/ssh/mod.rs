//! SSH over TCP, built on `russh`.
//!
//! # Architecture
//!
//! russh drives each connection from its own task. This engine never lets
//! those tasks call user code: protocol events are pushed into the same
//! queues the loopback engine uses and reach callbacks only when the owner
//! polls, closes, or processes events.
//!
//! - [`RusshTransport`] / [`RusshChannel`]: client side. Each opened channel
//!   is split; a pump task reads the read half into the channel's queue.
//! - [`RusshBind`]: server side. Accepted connections run a russh session
//!   whose handler forwards authentication and channel-open requests as
//!   [`Message`](crate::callbacks::Message)s and waits for the answer.
//!
//! russh primitives are async and complete on their own, so this engine
//! answers `Ok` or `Error` and only returns `Again` where it is waiting on
//! the local application (a server whose owner has not processed events).

mod client;
mod server;

use std::sync::Arc;
use std::time::Duration;

use russh::{client as russh_client, keys};

pub use client::{RusshChannel, RusshTransport};
pub use server::{RusshBind, RusshServerChannel, RusshServerTransport};

/// Client handler that accepts all host keys.
///
/// Equivalent to `StrictHostKeyChecking=no`; the `known_hosts` option is
/// recorded but not enforced.
pub struct ClientHandler;

impl russh_client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build the russh client configuration.
///
/// Sessions are long-lived, so there is no inactivity timeout; keepalives
/// every 30 seconds detect dead peers after three misses.
pub(crate) fn build_client_config(compress: bool) -> Arc<russh_client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(russh_client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Parse a `yes`/`no` style compression option.
pub(crate) fn parse_compression(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "zlib" | "1" => Some(true),
        "no" | "false" | "off" | "none" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod client_config {
        use super::*;

        #[test]
        fn test_keepalive_settings() {
            let config = build_client_config(true);
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
            assert_eq!(config.inactivity_timeout, None);
        }

        #[test]
        fn test_compression_preference() {
            let with = build_client_config(true);
            assert_eq!(with.preferred.compression.len(), 2);
            let without = build_client_config(false);
            assert_eq!(without.preferred.compression.len(), 1);
        }
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!(parse_compression("yes"), Some(true));
        assert_eq!(parse_compression(" No "), Some(false));
        assert_eq!(parse_compression("zlib"), Some(true));
        assert_eq!(parse_compression("maybe"), None);
    }
}
