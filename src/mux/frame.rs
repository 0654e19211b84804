//! Mux wire framing.
//!
//! Both directions share the byte-oriented opcode format; the two ends
//! just speak different vocabularies. All lengths and connection
//! identifiers are 4-byte big-endian integers.
//!
//! Controller to demultiplexer:
//! `+ connID hostnameLen cmdLen hostname cmd` opens a channel,
//! `- connID` closes one, `0 connID line\n` and `1 connID len payload`
//! carry channel input, a bare `\n` is a keep-alive.
//!
//! Demultiplexer to controller: `++` acknowledges an open, `+- len
//! problem` rejects one, `- connID` reports a dead channel, `0`/`1`
//! carry channel output and `X len payload` is a fatal report.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{AppError, AppResult, MuxError};

/// Upper bound for any framed payload, hostname or command.
pub const MAX_PAYLOAD: u32 = 1 << 20;

/// Frames sent by the controller side.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Open {
        connection: u32,
        hostname: String,
        command: String,
    },
    Close {
        connection: u32,
    },
    Line {
        connection: u32,
        text: String,
    },
    Data {
        connection: u32,
        payload: Vec<u8>,
    },
    Nop,
}

/// Frames sent by the demultiplexer side.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerFrame {
    OpenOk,
    OpenFail { problem: String },
    Close { connection: u32 },
    Line { connection: u32, text: String },
    Data { connection: u32, payload: Vec<u8> },
    Fatal { message: String },
}

#[must_use]
pub fn encode_client_frame(frame: &ClientFrame) -> Vec<u8> {
    let mut out = Vec::new();
    match frame {
        ClientFrame::Open {
            connection,
            hostname,
            command,
        } => {
            out.push(b'+');
            out.extend_from_slice(&connection.to_be_bytes());
            out.extend_from_slice(&len_field(hostname.len()));
            out.extend_from_slice(&len_field(command.len()));
            out.extend_from_slice(hostname.as_bytes());
            out.extend_from_slice(command.as_bytes());
        }
        ClientFrame::Close { connection } => {
            out.push(b'-');
            out.extend_from_slice(&connection.to_be_bytes());
        }
        ClientFrame::Line { connection, text } => {
            out.push(b'0');
            out.extend_from_slice(&connection.to_be_bytes());
            out.extend_from_slice(text.as_bytes());
            out.push(b'\n');
        }
        ClientFrame::Data {
            connection,
            payload,
        } => {
            out.push(b'1');
            out.extend_from_slice(&connection.to_be_bytes());
            out.extend_from_slice(&len_field(payload.len()));
            out.extend_from_slice(payload);
        }
        ClientFrame::Nop => out.push(b'\n'),
    }
    out
}

#[must_use]
pub fn encode_server_frame(frame: &ServerFrame) -> Vec<u8> {
    let mut out = Vec::new();
    match frame {
        ServerFrame::OpenOk => out.extend_from_slice(b"++"),
        ServerFrame::OpenFail { problem } => {
            out.extend_from_slice(b"+-");
            out.extend_from_slice(&len_field(problem.len()));
            out.extend_from_slice(problem.as_bytes());
        }
        ServerFrame::Close { connection } => {
            out.push(b'-');
            out.extend_from_slice(&connection.to_be_bytes());
        }
        ServerFrame::Line { connection, text } => {
            out.push(b'0');
            out.extend_from_slice(&connection.to_be_bytes());
            out.extend_from_slice(text.as_bytes());
            out.push(b'\n');
        }
        ServerFrame::Data {
            connection,
            payload,
        } => {
            out.push(b'1');
            out.extend_from_slice(&connection.to_be_bytes());
            out.extend_from_slice(&len_field(payload.len()));
            out.extend_from_slice(payload);
        }
        ServerFrame::Fatal { message } => {
            out.push(b'X');
            out.extend_from_slice(&len_field(message.len()));
            out.extend_from_slice(message.as_bytes());
        }
    }
    out
}

fn len_field(length: usize) -> [u8; 4] {
    u32::try_from(length).unwrap_or(u32::MAX).to_be_bytes()
}

/// Read the next controller-side frame. `Ok(None)` is a clean end of
/// stream at a frame boundary.
///
/// # Errors
///
/// Returns [`MuxError`] variants for truncation, oversized length
/// fields, unknown opcodes and invalid UTF-8.
pub async fn read_client_frame<R>(reader: &mut R) -> AppResult<Option<ClientFrame>>
where
    R: AsyncRead + Unpin,
{
    let Some(opcode) = read_opcode(reader).await? else {
        return Ok(None);
    };
    match opcode {
        b'+' => {
            let connection = read_u32(reader, "open connection id").await?;
            let hostname_len = read_length(reader, "open hostname length").await?;
            let command_len = read_length(reader, "open command length").await?;
            let hostname = read_text(reader, hostname_len, "open hostname").await?;
            let command = read_text(reader, command_len, "open command").await?;
            Ok(Some(ClientFrame::Open {
                connection,
                hostname,
                command,
            }))
        }
        b'-' => {
            let connection = read_u32(reader, "close connection id").await?;
            Ok(Some(ClientFrame::Close { connection }))
        }
        b'0' => {
            let connection = read_u32(reader, "line connection id").await?;
            let text = read_line(reader).await?;
            Ok(Some(ClientFrame::Line { connection, text }))
        }
        b'1' => {
            let connection = read_u32(reader, "data connection id").await?;
            let length = read_length(reader, "data length").await?;
            let payload = read_bytes(reader, length, "data payload").await?;
            Ok(Some(ClientFrame::Data {
                connection,
                payload,
            }))
        }
        b'\n' => Ok(Some(ClientFrame::Nop)),
        opcode => Err(AppError::mux(MuxError::UnknownCommand { opcode })),
    }
}

/// Read the next demultiplexer-side frame. `Ok(None)` is a clean end of
/// stream at a frame boundary.
///
/// # Errors
///
/// Returns [`MuxError`] variants for truncation, oversized length
/// fields, unknown opcodes and invalid UTF-8.
pub async fn read_server_frame<R>(reader: &mut R) -> AppResult<Option<ServerFrame>>
where
    R: AsyncRead + Unpin,
{
    let Some(opcode) = read_opcode(reader).await? else {
        return Ok(None);
    };
    match opcode {
        b'+' => {
            let verdict = read_byte(reader, "open verdict").await?;
            match verdict {
                b'+' => Ok(Some(ServerFrame::OpenOk)),
                b'-' => {
                    let length = read_length(reader, "open problem length").await?;
                    let problem = read_text(reader, length, "open problem").await?;
                    Ok(Some(ServerFrame::OpenFail { problem }))
                }
                opcode => Err(AppError::mux(MuxError::UnknownCommand { opcode })),
            }
        }
        b'-' => {
            let connection = read_u32(reader, "close connection id").await?;
            Ok(Some(ServerFrame::Close { connection }))
        }
        b'0' => {
            let connection = read_u32(reader, "line connection id").await?;
            let text = read_line(reader).await?;
            Ok(Some(ServerFrame::Line { connection, text }))
        }
        b'1' => {
            let connection = read_u32(reader, "data connection id").await?;
            let length = read_length(reader, "data length").await?;
            let payload = read_bytes(reader, length, "data payload").await?;
            Ok(Some(ServerFrame::Data {
                connection,
                payload,
            }))
        }
        b'X' => {
            let length = read_length(reader, "fatal message length").await?;
            let message = read_text(reader, length, "fatal message").await?;
            Ok(Some(ServerFrame::Fatal { message }))
        }
        opcode => Err(AppError::mux(MuxError::UnknownCommand { opcode })),
    }
}

async fn read_opcode<R>(reader: &mut R) -> AppResult<Option<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0_u8; 1];
    match reader.read_exact(&mut buffer).await {
        Ok(_) => Ok(Some(buffer[0])),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(AppError::from(err)),
    }
}

async fn read_byte<R>(reader: &mut R, context: &'static str) -> AppResult<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0_u8; 1];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|err| truncation(err, context))?;
    Ok(buffer[0])
}

async fn read_u32<R>(reader: &mut R, context: &'static str) -> AppResult<u32>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0_u8; 4];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|err| truncation(err, context))?;
    Ok(u32::from_be_bytes(buffer))
}

async fn read_length<R>(reader: &mut R, context: &'static str) -> AppResult<u32>
where
    R: AsyncRead + Unpin,
{
    let length = read_u32(reader, context).await?;
    if length > MAX_PAYLOAD {
        return Err(AppError::mux(MuxError::LengthOverflow {
            length,
            limit: MAX_PAYLOAD,
        }));
    }
    Ok(length)
}

async fn read_bytes<R>(reader: &mut R, length: u32, context: &'static str) -> AppResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0_u8; length as usize];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|err| truncation(err, context))?;
    Ok(buffer)
}

async fn read_text<R>(reader: &mut R, length: u32, field: &'static str) -> AppResult<String>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_bytes(reader, length, field).await?;
    String::from_utf8(bytes).map_err(|_| AppError::mux(MuxError::InvalidUtf8 { field }))
}

async fn read_line<R>(reader: &mut R) -> AppResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let byte = read_byte(reader, "line body").await?;
        if byte == b'\n' {
            break;
        }
        bytes.push(byte);
        if bytes.len() > MAX_PAYLOAD as usize {
            return Err(AppError::mux(MuxError::LengthOverflow {
                length: u32::MAX,
                limit: MAX_PAYLOAD,
            }));
        }
    }
    String::from_utf8(bytes).map_err(|_| AppError::mux(MuxError::InvalidUtf8 { field: "line" }))
}

fn truncation(err: std::io::Error, context: &'static str) -> AppError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        AppError::mux(MuxError::Truncated { context })
    } else {
        AppError::from(err)
    }
}
