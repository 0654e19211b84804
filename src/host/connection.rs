//! Command connections to hosts.
//!
//! A [`Connection`] wraps one bidirectional byte channel to a shell on
//! a host and turns it into a command/response stream. Commands are
//! framed with a boundary marker so the far end's output can be read
//! back without knowing when the command finishes; comment lines with
//! one quote character each are appended so a command with unbalanced
//! quoting cannot swallow the marker.
//!
//! A connection is either idle, running a command, or waiting for the
//! output of a command that was started without collecting its result.
//! The waiting state is explicit so misuse (starting a second command
//! while one is pending, collecting when nothing was started) is
//! observable instead of silently corrupting the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{AppError, AppResult, HostError};

/// Marks the end of one command's output on a connection.
pub const COMMAND_BOUNDARY: &str = "campaigner__e41c7b09d2a6f835__end_of_command_output";

/// Poll period while waiting for a busy connection.
const USE_LOCK_RETRY: Duration = Duration::from_millis(100);
/// Give up on a busy connection after this many polls.
const USE_LOCK_ATTEMPTS: u32 = 600;

/// One bidirectional text channel to a shell somewhere.
///
/// Implemented by the local subprocess channel, the per-host ssh
/// channel, the multiplexed gateway channel and the test double.
#[async_trait]
pub trait CommandChannel: Send {
    /// Write raw text to the far shell.
    async fn write_text(&mut self, text: &str) -> AppResult<()>;

    /// Read one line, without its newline. `None` means the channel
    /// has ended.
    async fn read_line(&mut self) -> AppResult<Option<String>>;

    /// Tear the channel down. Must be idempotent.
    async fn close(&mut self) -> AppResult<()>;
}

/// Which connection of a host an operation should use.
#[derive(Clone)]
pub enum Reuse {
    /// The host's default connection.
    Default,
    /// A connection created for this operation alone and closed after.
    New,
    /// A specific connection the caller owns.
    Specific(Arc<Connection>),
}

struct ChannelIo {
    link: Box<dyn CommandChannel>,
    in_async: bool,
    out_of_order: Option<String>,
}

/// A command connection to one host.
pub struct Connection {
    number: u32,
    label: String,
    closed: AtomicBool,
    io: Mutex<ChannelIo>,
}

/// Wrap `command` so its output can be recognized on the stream.
#[must_use]
pub fn frame_command(command: &str) -> String {
    format!(
        "{command}\n# `\n# '\n# \"\necho \"\n{COMMAND_BOUNDARY}\"\n"
    )
}

impl Connection {
    #[must_use]
    pub fn new(number: u32, host_name: &str, link: Box<dyn CommandChannel>) -> Arc<Self> {
        Arc::new(Self {
            number,
            label: format!("{host_name}:{number}"),
            closed: AtomicBool::new(false),
            io: Mutex::new(ChannelIo {
                link,
                in_async: false,
                out_of_order: None,
            }),
        })
    }

    #[must_use]
    pub const fn number(&self) -> u32 {
        self.number
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Acquire exclusive use of the channel, waiting a bounded time
    /// for whoever holds it now.
    async fn acquire(&self) -> AppResult<MutexGuard<'_, ChannelIo>> {
        for _ in 0..USE_LOCK_ATTEMPTS {
            if self.is_closed() {
                return Err(AppError::host(HostError::Closed {
                    name: self.label.clone(),
                }));
            }
            if let Ok(guard) = self.io.try_lock() {
                return Ok(guard);
            }
            tokio::time::sleep(USE_LOCK_RETRY).await;
        }
        Err(AppError::host(HostError::AsyncBusy {
            name: self.label.clone(),
        }))
    }

    /// Run `command` and return its output, trimmed.
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed, stays busy too long, or
    /// the channel breaks.
    pub async fn send(&self, command: &str) -> AppResult<String> {
        let mut io = self.acquire().await?;
        self.begin(&mut io, command).await?;
        self.collect(&mut io).await
    }

    /// Send `command` without waiting for its output. The connection
    /// stays reserved for the command until [`finish_send`] collects
    /// the result.
    ///
    /// [`finish_send`]: Connection::finish_send
    ///
    /// # Errors
    ///
    /// Fails when the connection is closed, stays busy too long, or
    /// the channel breaks.
    pub async fn start_send(&self, command: &str) -> AppResult<()> {
        let mut io = self.acquire().await?;
        self.begin(&mut io, command).await
    }

    /// Collect the output of a command sent with [`start_send`].
    ///
    /// [`start_send`]: Connection::start_send
    ///
    /// # Errors
    ///
    /// Fails when no command is pending and no out-of-order output was
    /// stashed, or when the channel breaks.
    pub async fn finish_send(&self) -> AppResult<String> {
        let mut io = self.acquire().await?;
        if !io.in_async {
            if let Some(stashed) = io.out_of_order.take() {
                tracing::warn!(
                    "Connection {}: collecting output of a command that was already drained",
                    self.label
                );
                return Ok(stashed);
            }
            return Err(AppError::host(HostError::NoAsyncInProgress {
                name: self.label.clone(),
            }));
        }
        self.collect(&mut io).await
    }

    /// Close the connection. Idempotent; a closed connection refuses
    /// all further commands.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut io = self.io.lock().await;
        if let Err(err) = io.link.close().await {
            tracing::debug!("Connection {}: close failed: {}", self.label, err);
        }
    }

    async fn begin(&self, io: &mut ChannelIo, command: &str) -> AppResult<()> {
        if io.in_async {
            tracing::warn!(
                "Connection {}: a new command was started while an earlier one was still pending",
                self.label
            );
            let stale = self.collect(io).await?;
            tracing::warn!(
                "Connection {}: output of the abandoned command: {}",
                self.label,
                stale
            );
            io.out_of_order = Some(stale);
        }
        tracing::trace!("{} SEND {}", self.label, command);
        io.link.write_text(&frame_command(command)).await?;
        io.in_async = true;
        Ok(())
    }

    /// Read output lines up to the boundary marker. An end of stream
    /// before the marker closes the connection and yields whatever
    /// arrived.
    async fn collect(&self, io: &mut ChannelIo) -> AppResult<String> {
        let mut result = String::new();
        loop {
            match io.link.read_line().await? {
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    break;
                }
                Some(line) if line == COMMAND_BOUNDARY => break,
                Some(line) => {
                    tracing::trace!("{} RECV {}", self.label, line);
                    result.push_str(&line);
                    result.push('\n');
                }
            }
        }
        io.in_async = false;
        Ok(result.trim().to_owned())
    }
}
