#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! SSH session and channel multiplexing.
//!
//! One [`Session`] carries many [`Channel`]s. Built on top of that are
//! remote command execution ([`Process`]), local port forwarding
//! ([`Forwarder`]), a callback-driven [`Server`] and an [`EventLoop`] that
//! drives several sessions from one task.
//!
//! The protocol engine sits behind the traits in [`transport`]. Two engines
//! ship with the crate: [`transport::ssh`] speaks SSH over TCP via `russh`,
//! and [`transport::loopback`] connects clients and servers inside one
//! process, which is what the test suite runs on.
//!
//! ```no_run
//! use sshplex::{ClientConfig, Command, Process, connect_with_retry};
//!
//! # async fn demo() -> sshplex::Result<()> {
//! let config = ClientConfig::new("build.example.com:22", "ci")?.with_password("secret");
//! let (session, _retries) = connect_with_retry(&config).await?;
//! let uname = Process::run(&session, Command::new("uname -a")).await?;
//! println!("{}", uname.stdout_string());
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod callbacks;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
#[cfg(feature = "port_forward")]
pub mod forward;
pub mod lock;
pub mod logging;
pub mod process;
pub mod server;
pub mod session;
pub mod transport;
pub mod types;

pub use auth::{AgentAuth, AuthChain, AuthStrategy, KeyAuth, PasswordAuth};
pub use callbacks::{AuthAttempt, CallbackSet, ChannelOpenKind, Message, MessageCallback, message_callback};
pub use channel::{BorrowedChannel, Channel, PollOutcome};
pub use client::{connect_with_retry, connect_with_retry_using};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use event::EventLoop;
#[cfg(feature = "port_forward")]
pub use forward::Forwarder;
pub use logging::{LogVerbosity, init_tracing};
pub use process::{Command, Process};
pub use server::{Server, ServerConfig};
pub use session::Session;
pub use transport::{AuthMethods, PtyRequest, Stream};
pub use types::{ForwarderInfo, ProcessInfo, ProcessStatus, ServerInfo, SessionInfo};
