//! Remote command execution.
//!
//! A [`Process`] runs one command on its own session channel from a
//! background task. Output is collected into buffers as it arrives; the exit
//! status is recorded when the remote side reports it.
//!
//! # Lifecycle
//!
//! 1. [`Process::spawn`] allocates the channel and starts the task.
//! 2. The task opens the channel, sends env requests, execs the command and
//!    polls until EOF, then half-closes and closes the channel.
//! 3. [`Process::wait`] joins the task. It fails with
//!    [`Error::ProcessFailed`] when the command exited non-zero (or without
//!    a status) unless the command was built with `ignore_status`.

use std::fmt;
use std::io::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::callbacks::CallbackSet;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::Stream;
use crate::types::{ProcessInfo, ProcessStatus};

/// A command to run remotely.
#[derive(Debug, Clone)]
pub struct Command {
    command: String,
    env: Vec<(String, String)>,
    ignore_status: bool,
    combine_outputs: bool,
    verbose: bool,
    print_output: bool,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            ignore_status: false,
            combine_outputs: false,
            verbose: false,
            print_output: false,
        }
    }

    /// Environment variable sent before exec. The server must accept it.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Do not treat a non-zero exit as a failure.
    pub fn ignore_status(mut self, ignore: bool) -> Self {
        self.ignore_status = ignore;
        self
    }

    /// Collect stderr into the stdout buffer.
    pub fn combine_outputs(mut self, combine: bool) -> Self {
        self.combine_outputs = combine;
        self
    }

    /// Log the command and its exit status at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Print captured output once [`Process::run`] finishes.
    pub fn print_output(mut self, print: bool) -> Self {
        self.print_output = print;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Output buffer for collecting command output
#[derive(Debug, Default)]
struct OutputBuffer {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// A command running (or finished) on a remote host.
pub struct Process {
    id: Uuid,
    session_id: Uuid,
    command: Command,
    output: Arc<Mutex<OutputBuffer>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    error: Arc<Mutex<Option<String>>>,
    status_rx: watch::Receiver<ProcessStatus>,
    cancel_token: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    outcome: OnceCell<Result<()>>,
    started_at: DateTime<Utc>,
}

impl Process {
    /// Start `command` without waiting for it.
    ///
    /// Fails at once if the session cannot allocate a channel.
    pub fn spawn(session: &Session, command: Command) -> Result<Process> {
        let channel = Channel::new(session)?;

        let output = Arc::new(Mutex::new(OutputBuffer::default()));
        let exit_code = Arc::new(Mutex::new(None));
        let error = Arc::new(Mutex::new(None));
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Running);
        let cancel_token = CancellationToken::new();

        let sink = output.clone();
        let combine = command.combine_outputs;
        let exit_sink = exit_code.clone();
        channel.set_callbacks(Some(
            CallbackSet::new()
                .on_data(move |data, stream| {
                    let mut buffer = sink.lock();
                    match stream {
                        Stream::Stderr if !combine => buffer.stderr.extend_from_slice(&data),
                        _ => buffer.stdout.extend_from_slice(&data),
                    }
                    async {}
                })
                .on_exit_status(move |code| {
                    *exit_sink.lock() = Some(code);
                    async {}
                }),
        ))?;

        if command.verbose {
            info!("Running `{}` on session {}", command.command, session.id());
        }

        let task = tokio::spawn(execute(
            channel,
            command.clone(),
            exit_code.clone(),
            error.clone(),
            status_tx,
            cancel_token.clone(),
        ));

        Ok(Process {
            id: Uuid::new_v4(),
            session_id: session.id(),
            command,
            output,
            exit_code,
            error,
            status_rx,
            cancel_token,
            task: tokio::sync::Mutex::new(Some(task)),
            outcome: OnceCell::new(),
            started_at: Utc::now(),
        })
    }

    /// Start `command` and wait for it to finish.
    pub async fn run(session: &Session, command: Command) -> Result<Process> {
        let process = Process::spawn(session, command)?;
        let result = process.wait().await;
        if process.command.print_output {
            process.print_output();
        }
        result.map(|()| process)
    }

    /// Join the background task. Safe to call more than once.
    pub async fn wait(&self) -> Result<()> {
        {
            let mut task = self.task.lock().await;
            if let Some(handle) = task.take() {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::from(e)),
                };
                let _ = self.outcome.set(result);
            }
        }
        match self.outcome.get() {
            Some(result) => result.clone(),
            None => Ok(()),
        }
    }

    /// Stop waiting for the command and close its channel.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.output.lock().stdout.clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.output.lock().stderr.clone()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().stderr).into_owned()
    }

    /// `None` until (and unless) the remote side reports one.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.status() != ProcessStatus::Running
    }

    /// Subscribe to status changes.
    pub fn watch_status(&self) -> watch::Receiver<ProcessStatus> {
        self.status_rx.clone()
    }

    pub fn info(&self) -> ProcessInfo {
        let output = self.output.lock();
        ProcessInfo {
            process_id: self.id.to_string(),
            session_id: self.session_id.to_string(),
            command: self.command.command.clone(),
            status: self.status(),
            exit_code: self.exit_code(),
            error: self.error.lock().clone(),
            stdout_bytes: output.stdout.len(),
            stderr_bytes: output.stderr.len(),
            started_at: self.started_at.to_rfc3339(),
        }
    }

    fn print_output(&self) {
        let output = self.output.lock();
        let _ = std::io::stdout().write_all(&output.stdout);
        let _ = std::io::stderr().write_all(&output.stderr);
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("command", &self.command.command)
            .field("status", &self.status())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

async fn execute(
    channel: Channel,
    command: Command,
    exit_code: Arc<Mutex<Option<i32>>>,
    error: Arc<Mutex<Option<String>>>,
    status_tx: watch::Sender<ProcessStatus>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let driven = tokio::select! {
        result = drive(&channel, &command) => result,
        _ = cancel_token.cancelled() => Err(Error::Task("process cancelled".to_string())),
    };
    // Always release the channel, including after a failure part-way.
    let _ = channel.close(true).await;

    let code = *exit_code.lock();
    let result = driven.and_then(|()| match code {
        Some(0) => Ok(()),
        _ if command.ignore_status => Ok(()),
        code => Err(Error::ProcessFailed {
            command: command.command.clone(),
            code,
        }),
    });

    if command.verbose {
        info!("`{}` finished with exit code {:?}", command.command, code);
    } else {
        debug!("`{}` finished with exit code {:?}", command.command, code);
    }

    match &result {
        Ok(()) => {
            let _ = status_tx.send(ProcessStatus::Completed);
        }
        Err(e) => {
            *error.lock() = Some(e.to_string());
            let _ = status_tx.send(ProcessStatus::Failed);
        }
    }
    result
}

async fn drive(channel: &Channel, command: &Command) -> Result<()> {
    channel.open_session().await?;
    for (name, value) in &command.env {
        channel.request_env(name, value).await?;
    }
    channel.request_exec(&command.command).await?;
    channel.poll_loop(true).await?;
    if channel.is_writable() {
        channel.closewrite(false).await?;
    }
    channel.close(false).await
}

#[cfg(test)]
mod tests {
    use super::*;

    mod command_builder {
        use super::*;

        #[test]
        fn test_defaults() {
            let command = Command::new("uname -a");
            assert_eq!(command.command(), "uname -a");
            assert!(command.env.is_empty());
            assert!(!command.ignore_status);
            assert!(!command.combine_outputs);
            assert!(!command.verbose);
            assert!(!command.print_output);
        }

        #[test]
        fn test_env_keeps_order() {
            let command = Command::new("env").env("A", "1").env("B", "2");
            assert_eq!(
                command.env,
                vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
            );
        }
    }

    #[tokio::test]
    async fn test_spawn_requires_authenticated_session() {
        let session = Session::loopback();
        let err = Process::spawn(&session, Command::new("true")).unwrap_err();
        assert!(err.is_usage());
    }
}
