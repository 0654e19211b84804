//! Remote side of the multiplexer.
//!
//! Runs on a gateway as `campaigner mux-serve` with the controller on
//! the other end of stdin/stdout. Each opened channel becomes an
//! `ssh <hostname> <command>` child; its output is framed back to the
//! controller, interleaved with output from the other channels.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult, MuxError};
use crate::mux::frame::{ClientFrame, ServerFrame, encode_server_frame, read_client_frame};

/// The controller keeps the stream alive with periodic no-ops; a
/// longer silence means it is gone and the sessions must not outlive
/// it.
const IDLE_LIMIT: Duration = Duration::from_secs(60);
/// Read child output in chunks of this size.
const OUTPUT_CHUNK: usize = 65_536;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

struct Session {
    stdin: ChildStdin,
    child: Child,
}

/// Run the demultiplexer over this process's stdin and stdout.
///
/// # Errors
///
/// Fails when the controller goes silent or the pipe breaks.
pub async fn run() -> AppResult<()> {
    let stdin = tokio::io::stdin();
    let stdout: SharedWriter = Arc::new(Mutex::new(Box::new(tokio::io::stdout())));
    serve(stdin, stdout).await
}

async fn serve<R>(mut reader: R, writer: SharedWriter) -> AppResult<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut sessions: HashMap<u32, Session> = HashMap::new();
    let outcome = loop {
        let frame = match tokio::time::timeout(IDLE_LIMIT, read_client_frame(&mut reader)).await {
            Err(_) => {
                let fatal = ServerFrame::Fatal {
                    message: format!(
                        "No traffic from the controller for {} seconds",
                        IDLE_LIMIT.as_secs()
                    ),
                };
                write_frame(&writer, &fatal).await;
                break Err(AppError::mux(MuxError::IdleTimeout {
                    seconds: IDLE_LIMIT.as_secs(),
                }));
            }
            Ok(read) => match read? {
                Some(frame) => frame,
                None => break Ok(()),
            },
        };
        match frame {
            ClientFrame::Open {
                connection,
                hostname,
                command,
            } => {
                open_session(&mut sessions, &writer, connection, &hostname, &command).await;
            }
            ClientFrame::Close { connection } => {
                if let Some(mut session) = sessions.remove(&connection) {
                    drop(session.child.start_kill());
                }
            }
            ClientFrame::Line { connection, text } => {
                let mut payload = text.into_bytes();
                payload.push(b'\n');
                feed_session(&mut sessions, connection, &payload).await;
            }
            ClientFrame::Data {
                connection,
                payload,
            } => {
                feed_session(&mut sessions, connection, &payload).await;
            }
            ClientFrame::Nop => {}
        }
    };
    for (_, mut session) in sessions.drain() {
        drop(session.child.start_kill());
    }
    outcome
}

async fn open_session(
    sessions: &mut HashMap<u32, Session>,
    writer: &SharedWriter,
    connection: u32,
    hostname: &str,
    command: &str,
) {
    let spawned = tokio::process::Command::new("ssh")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(hostname)
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            let frame = ServerFrame::OpenFail {
                problem: format!("Failed to reach {}: {}", hostname, err),
            };
            write_frame(writer, &frame).await;
            return;
        }
    };
    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            drop(child.start_kill());
            let frame = ServerFrame::OpenFail {
                problem: format!("No pipes for {}", hostname),
            };
            write_frame(writer, &frame).await;
            return;
        }
    };
    write_frame(writer, &ServerFrame::OpenOk).await;
    sessions.insert(connection, Session { stdin, child });
    let pump_writer = Arc::clone(writer);
    drop(tokio::spawn(async move {
        pump_output(connection, stdout, pump_writer).await;
    }));
}

async fn feed_session(sessions: &mut HashMap<u32, Session>, connection: u32, payload: &[u8]) {
    let Some(session) = sessions.get_mut(&connection) else {
        tracing::debug!("Input for unknown connection {}", connection);
        return;
    };
    if session.stdin.write_all(payload).await.is_err() {
        tracing::debug!("Connection {}: session no longer accepts input", connection);
        return;
    }
    drop(session.stdin.flush().await);
}

/// Copy one session's output to the controller until it ends, then
/// report the channel dead. A chunk that is exactly one full line goes
/// out as a line frame, anything else as raw data.
async fn pump_output<R>(connection: u32, mut output: R, writer: SharedWriter)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buffer = vec![0_u8; OUTPUT_CHUNK];
    loop {
        let count = match output.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(count) => count,
        };
        let Some(chunk) = buffer.get(..count) else {
            break;
        };
        let frame = frame_for_chunk(connection, chunk);
        write_frame(&writer, &frame).await;
    }
    write_frame(&writer, &ServerFrame::Close { connection }).await;
}

fn frame_for_chunk(connection: u32, chunk: &[u8]) -> ServerFrame {
    if let Some(body) = chunk.strip_suffix(b"\n") {
        if !body.contains(&b'\n') {
            if let Ok(text) = std::str::from_utf8(body) {
                return ServerFrame::Line {
                    connection,
                    text: text.to_owned(),
                };
            }
        }
    }
    ServerFrame::Data {
        connection,
        payload: chunk.to_vec(),
    }
}

async fn write_frame(writer: &SharedWriter, frame: &ServerFrame) {
    let bytes = encode_server_frame(frame);
    let mut guard = writer.lock().await;
    if guard.write_all(&bytes).await.is_err() {
        return;
    }
    drop(guard.flush().await);
}
