use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Mux stream ended while reading {context}.")]
    Truncated { context: &'static str },
    #[error("Mux length field {length} exceeds the {limit} byte limit.")]
    LengthOverflow { length: u32, limit: u32 },
    #[error("Unknown mux command byte 0x{opcode:02x}.")]
    UnknownCommand { opcode: u8 },
    #[error("Mux {field} is not valid UTF-8.")]
    InvalidUtf8 { field: &'static str },
    #[error("Mux refused connection {connection}: {problem}")]
    SetupRejected { connection: u32, problem: String },
    #[error("Mux reported a fatal problem: {message}")]
    Fatal { message: String },
    #[error("Mux message for unknown connection {connection}.")]
    UnknownConnection { connection: u32 },
    #[error("Mux saw no traffic for {seconds} seconds.")]
    IdleTimeout { seconds: u64 },
    #[error("Mux channel closed.")]
    ChannelClosed,
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
