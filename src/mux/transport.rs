//! Controller side of the multiplexer.
//!
//! One [`MuxTransport`] wraps a single byte pipe to a remote
//! demultiplexer (normally an `ssh` child running `campaigner
//! mux-serve` on a gateway). Logical channels are opened over it and
//! hand out [`MuxChannel`] values that behave like any other command
//! channel. The wire is single-threaded: concurrent writers are
//! serialized by the transport write lock.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::error::{AppError, AppResult, HostError, MuxError};
use crate::host::connection::CommandChannel;
use crate::mux::frame::{
    ClientFrame, ServerFrame, encode_client_frame, read_server_frame,
};

/// How long to wait for the demultiplexer to acknowledge an open.
const OPEN_ACK_TIMEOUT: Duration = Duration::from_secs(60);
/// Keep-alive period; the remote side gives up after 60 idle seconds.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(20);
/// The command executed on the gateway to start the demultiplexer.
const REMOTE_MUX_COMMAND: &str = "campaigner mux-serve";

enum ChannelEvent {
    Payload(Vec<u8>),
    Eof,
}

type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// A multiplexed connection to one gateway.
pub struct MuxTransport {
    label: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    channels: Mutex<HashMap<u32, EventSender>>,
    pending_open: Mutex<Option<oneshot::Sender<ServerFrame>>>,
    open_serial: tokio::sync::Mutex<()>,
    next_id: AtomicU32,
    dead: AtomicBool,
    child: Mutex<Option<tokio::process::Child>>,
}

impl MuxTransport {
    /// Start a demultiplexer on `gateway` over ssh and connect to it.
    ///
    /// # Errors
    ///
    /// Fails when the ssh child cannot be spawned.
    pub fn over_ssh(gateway: &str) -> AppResult<Arc<Self>> {
        let mut child = tokio::process::Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(gateway)
            .arg(REMOTE_MUX_COMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                AppError::host(HostError::Connect {
                    name: gateway.to_owned(),
                    source,
                })
            })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AppError::host(HostError::PipeClosed {
                name: gateway.to_owned(),
            })
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AppError::host(HostError::PipeClosed {
                name: gateway.to_owned(),
            })
        })?;
        let transport = Self::from_io(gateway, Box::new(stdin), stdout);
        if let Ok(mut guard) = transport.child.lock() {
            *guard = Some(child);
        }
        Ok(transport)
    }

    /// Wrap an already-connected byte pipe. Used directly by tests.
    pub fn from_io<R>(
        label: &str,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: R,
    ) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let transport = Arc::new(Self {
            label: label.to_owned(),
            writer: tokio::sync::Mutex::new(writer),
            channels: Mutex::new(HashMap::new()),
            pending_open: Mutex::new(None),
            open_serial: tokio::sync::Mutex::new(()),
            next_id: AtomicU32::new(0),
            dead: AtomicBool::new(false),
            child: Mutex::new(None),
        });
        let reader_transport = Arc::clone(&transport);
        drop(tokio::spawn(async move {
            reader_transport.read_loop(reader).await;
        }));
        let keepalive_transport = Arc::clone(&transport);
        drop(tokio::spawn(async move {
            keepalive_transport.keepalive_loop().await;
        }));
        transport
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Open a logical channel that runs `command` on `hostname`.
    ///
    /// # Errors
    ///
    /// Fails when the transport is dead, the demultiplexer rejects the
    /// open, or no acknowledgement arrives in time.
    pub async fn open(self: &Arc<Self>, hostname: &str, command: &str) -> AppResult<MuxChannel> {
        if self.is_dead() {
            return Err(AppError::mux(MuxError::ChannelClosed));
        }
        let serial = self.open_serial.lock().await;
        let connection = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let Ok(mut pending) = self.pending_open.lock() else {
                return Err(AppError::mux(MuxError::ChannelClosed));
            };
            *pending = Some(ack_tx);
        }
        self.write_frame(&ClientFrame::Open {
            connection,
            hostname: hostname.to_owned(),
            command: command.to_owned(),
        })
        .await?;
        let verdict = tokio::time::timeout(OPEN_ACK_TIMEOUT, ack_rx)
            .await
            .map_err(|_| {
                AppError::mux(MuxError::IdleTimeout {
                    seconds: OPEN_ACK_TIMEOUT.as_secs(),
                })
            })?
            .map_err(|_| AppError::mux(MuxError::ChannelClosed))?;
        drop(serial);
        match verdict {
            ServerFrame::OpenOk => {}
            ServerFrame::OpenFail { problem } => {
                return Err(AppError::mux(MuxError::SetupRejected {
                    connection,
                    problem,
                }));
            }
            ServerFrame::Close { .. }
            | ServerFrame::Line { .. }
            | ServerFrame::Data { .. }
            | ServerFrame::Fatal { .. } => {
                return Err(AppError::mux(MuxError::ChannelClosed));
            }
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(connection, event_tx);
        }
        Ok(MuxChannel {
            connection,
            transport: Arc::clone(self),
            events: event_rx,
            pending: Vec::new(),
            saw_eof: false,
            closed: false,
        })
    }

    async fn write_frame(&self, frame: &ClientFrame) -> AppResult<()> {
        if self.is_dead() {
            return Err(AppError::mux(MuxError::ChannelClosed));
        }
        let bytes = encode_client_frame(frame);
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.write_all(&bytes).await {
            self.dead.store(true, Ordering::SeqCst);
            return Err(AppError::from(err));
        }
        writer.flush().await?;
        Ok(())
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            match read_server_frame(&mut reader).await {
                Ok(Some(ServerFrame::OpenOk)) => {
                    self.resolve_open(ServerFrame::OpenOk);
                }
                Ok(Some(ServerFrame::OpenFail { problem })) => {
                    self.resolve_open(ServerFrame::OpenFail { problem });
                }
                Ok(Some(ServerFrame::Line { connection, text })) => {
                    let mut payload = text.into_bytes();
                    payload.push(b'\n');
                    self.deliver(connection, ChannelEvent::Payload(payload));
                }
                Ok(Some(ServerFrame::Data {
                    connection,
                    payload,
                })) => {
                    self.deliver(connection, ChannelEvent::Payload(payload));
                }
                Ok(Some(ServerFrame::Close { connection })) => {
                    self.deliver(connection, ChannelEvent::Eof);
                    if let Ok(mut channels) = self.channels.lock() {
                        channels.remove(&connection);
                    }
                }
                Ok(Some(ServerFrame::Fatal { message })) => {
                    tracing::error!("Mux {}: fatal: {}", self.label, message);
                    break;
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("Mux {}: read failed: {}", self.label, err);
                    break;
                }
            }
        }
        self.dead.store(true, Ordering::SeqCst);
        if let Ok(mut channels) = self.channels.lock() {
            for (_, sender) in channels.drain() {
                drop(sender.send(ChannelEvent::Eof));
            }
        }
        self.resolve_open(ServerFrame::Fatal {
            message: "transport ended".to_owned(),
        });
    }

    fn resolve_open(&self, verdict: ServerFrame) {
        let Ok(mut pending) = self.pending_open.lock() else {
            return;
        };
        if let Some(sender) = pending.take() {
            drop(sender.send(verdict));
        }
    }

    fn deliver(&self, connection: u32, event: ChannelEvent) {
        let sender = match self.channels.lock() {
            Ok(channels) => channels.get(&connection).cloned(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => drop(sender.send(event)),
            None => {
                tracing::debug!("Mux {}: message for unknown connection {}", self.label, connection);
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.is_dead() {
                break;
            }
            if self.write_frame(&ClientFrame::Nop).await.is_err() {
                break;
            }
        }
    }
}

/// One logical command channel over a [`MuxTransport`].
pub struct MuxChannel {
    connection: u32,
    transport: Arc<MuxTransport>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    pending: Vec<u8>,
    saw_eof: bool,
    closed: bool,
}

#[async_trait]
impl CommandChannel for MuxChannel {
    async fn write_text(&mut self, text: &str) -> AppResult<()> {
        if self.closed {
            return Err(AppError::mux(MuxError::ChannelClosed));
        }
        let body = text.strip_suffix('\n').unwrap_or(text);
        let frame = if body.contains('\n') {
            ClientFrame::Data {
                connection: self.connection,
                payload: text.as_bytes().to_vec(),
            }
        } else {
            ClientFrame::Line {
                connection: self.connection,
                text: body.to_owned(),
            }
        };
        self.transport.write_frame(&frame).await
    }

    async fn read_line(&mut self) -> AppResult<Option<String>> {
        loop {
            if let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=position).collect();
                line.pop();
                let text = String::from_utf8(line)
                    .map_err(|_| AppError::mux(MuxError::InvalidUtf8 { field: "line" }))?;
                return Ok(Some(text));
            }
            if self.saw_eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let line: Vec<u8> = self.pending.drain(..).collect();
                let text = String::from_utf8(line)
                    .map_err(|_| AppError::mux(MuxError::InvalidUtf8 { field: "line" }))?;
                return Ok(Some(text));
            }
            match self.events.recv().await {
                Some(ChannelEvent::Payload(payload)) => self.pending.extend_from_slice(&payload),
                Some(ChannelEvent::Eof) | None => self.saw_eof = true,
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Ok(mut channels) = self.transport.channels.lock() {
            channels.remove(&self.connection);
        }
        if self.transport.is_dead() {
            return Ok(());
        }
        self.transport
            .write_frame(&ClientFrame::Close {
                connection: self.connection,
            })
            .await
    }
}
