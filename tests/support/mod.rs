//! In-process SSH server for integration tests.
//!
//! Session channels understand a handful of commands:
//!
//! - `echo <text>`: `<text>\n` on stdout, exit 0
//! - `warn <text>`: `<text>\n` on stderr, exit 0
//! - `exit <code>`: no output, exit `<code>`
//! - `printenv <name>`: value of an env request, exit 0 (1 when unset)
//! - `bytes <n>`: `n` bytes of `x` on stdout, exit 0
//! - `cat`: echo stdin until EOF, then exit 0
//!
//! Anything else writes to stderr and exits 127. `direct-tcpip` channels
//! echo every byte back until the client's EOF; those opened to
//! [`HANGUP_HOST`] echo the first chunk and then send EOF themselves.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sshplex::{
    AuthAttempt, BorrowedChannel, CallbackSet, ChannelOpenKind, ClientConfig, Message, Server,
    ServerConfig, Session, Stream, message_callback,
};
use tokio::task::JoinHandle;

pub const USER: &str = "ci";
pub const PASSWORD: &str = "secret";
pub const HANGUP_HOST: &str = "hangup.internal";

const HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_ed25519_key";
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

pub struct TestServer {
    pub server: Server,
    pub port: u16,
    task: JoinHandle<sshplex::Result<()>>,
}

impl TestServer {
    pub async fn start() -> TestServer {
        let config = ServerConfig::new("localhost", 0)
            .with_host_key_path(HOST_KEY_PATH)
            .with_message_callback(message_callback(answer));
        let server = Server::loopback(config).expect("server config is valid");

        let listener = server.clone();
        let task = tokio::spawn(async move {
            listener
                .listen(
                    |session: Session| async move { session.run_until_disconnected().await },
                    POLL_TIMEOUT,
                )
                .await
        });
        server
            .wait_for_listener()
            .await
            .expect("server starts listening");
        let port = server.port().await.expect("server has a port");
        TestServer { server, port, task }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_retries: Some(0),
            retry_delay_ms: Some(1),
            compression: Some(false),
            ..ClientConfig::new(&format!("localhost:{}", self.port), USER)
                .expect("address parses")
                .with_password(PASSWORD)
        }
    }

    /// A connected, authenticated client session.
    pub async fn connect(&self) -> Session {
        let (session, retries) = sshplex::connect_with_retry_using(&self.client_config(), || {
            Arc::new(sshplex::transport::loopback::LoopbackTransport::client())
        })
        .await
        .expect("client connects");
        assert_eq!(retries, 0);
        session
    }

    /// Close the listener and wait for `listen` to return.
    pub async fn stop(self) -> sshplex::Result<()> {
        self.server.close();
        self.task.await.expect("listener task joins")
    }
}

async fn answer(message: Message) -> bool {
    match message {
        Message::Auth {
            user,
            attempt: AuthAttempt::Password(password),
        } => user == USER && password == PASSWORD,
        Message::Auth { .. } => false,
        Message::ChannelOpen {
            kind: ChannelOpenKind::Session,
            channel,
        } => channel.set_callbacks(Some(exec_callbacks(&channel))).is_ok(),
        Message::ChannelOpen {
            kind: ChannelOpenKind::DirectTcpip { host, .. },
            channel,
        } if host == HANGUP_HOST => channel.set_callbacks(Some(hangup_callbacks(&channel))).is_ok(),
        Message::ChannelOpen {
            kind: ChannelOpenKind::DirectTcpip { .. },
            channel,
        } => channel.set_callbacks(Some(echo_callbacks(&channel))).is_ok(),
    }
}

#[derive(Default)]
struct ExecState {
    env: HashMap<String, String>,
    command: Option<String>,
}

fn exec_callbacks(channel: &BorrowedChannel) -> CallbackSet {
    let state = Arc::new(Mutex::new(ExecState::default()));

    let env = state.clone();
    let exec = state.clone();
    let exec_channel = channel.clone();
    let data = state.clone();
    let data_channel = channel.clone();
    let eof = state;
    let eof_channel = channel.clone();

    CallbackSet::new()
        .on_env_request(move |name, value| {
            env.lock().env.insert(name, value);
            async { true }
        })
        .on_exec_request(move |command| {
            let env = {
                let mut state = exec.lock();
                state.command = Some(command.clone());
                state.env.clone()
            };
            let channel = exec_channel.clone();
            async move {
                if command != "cat" {
                    tokio::spawn(run_command(channel, command, env));
                }
                true
            }
        })
        .on_data(move |bytes, stream| {
            let is_cat = data.lock().command.as_deref() == Some("cat");
            let channel = data_channel.clone();
            async move {
                if is_cat {
                    let _ = channel.write(&bytes, stream).await;
                }
            }
        })
        .on_eof(move || {
            let is_cat = eof.lock().command.as_deref() == Some("cat");
            let channel = eof_channel.clone();
            async move {
                if is_cat {
                    finish(&channel, 0).await;
                }
            }
        })
}

fn echo_callbacks(channel: &BorrowedChannel) -> CallbackSet {
    let writer = channel.clone();
    let closer = channel.clone();
    CallbackSet::new()
        .on_data(move |bytes, stream| {
            let channel = writer.clone();
            async move {
                let _ = channel.write(&bytes, stream).await;
            }
        })
        .on_eof(move || {
            let channel = closer.clone();
            async move {
                let _ = channel.closewrite(true).await;
            }
        })
}

fn hangup_callbacks(channel: &BorrowedChannel) -> CallbackSet {
    let writer = channel.clone();
    CallbackSet::new().on_data(move |bytes, stream| {
        let channel = writer.clone();
        async move {
            if channel.is_writable() {
                let _ = channel.write(&bytes, stream).await;
                let _ = channel.closewrite(true).await;
            }
        }
    })
}

async fn run_command(channel: BorrowedChannel, command: String, env: HashMap<String, String>) {
    let (verb, argument) = command.split_once(' ').unwrap_or((command.as_str(), ""));
    let code = match verb {
        "echo" => {
            let _ = channel.write(format!("{argument}\n").as_bytes(), Stream::Stdout).await;
            0
        }
        "warn" => {
            let _ = channel.write(format!("{argument}\n").as_bytes(), Stream::Stderr).await;
            0
        }
        "exit" => argument.parse().unwrap_or(255),
        "printenv" => match env.get(argument) {
            Some(value) => {
                let _ = channel.write(format!("{value}\n").as_bytes(), Stream::Stdout).await;
                0
            }
            None => 1,
        },
        "bytes" => {
            let count: usize = argument.parse().unwrap_or(0);
            let _ = channel.write(&vec![b'x'; count], Stream::Stdout).await;
            0
        }
        _ => {
            let message = format!("{verb}: command not found\n");
            let _ = channel.write(message.as_bytes(), Stream::Stderr).await;
            127
        }
    };
    finish(&channel, code).await;
}

async fn finish(channel: &BorrowedChannel, code: u32) {
    let _ = channel.send_exit_status(code).await;
    let _ = channel.closewrite(true).await;
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
