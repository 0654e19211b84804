use thiserror::Error;

#[derive(Debug, Error)]
pub enum TcError {
    #[error(
        "Refusing to enable traffic control on local host '{host}'. Traffic control is only \
         usable when commanding remote hosts that do not include the commanding host."
    )]
    Loopback { host: String },
    #[error("Traffic control was enabled for host '{host}', but no shaping parameters were given.")]
    NoDirection { host: String },
    #[error("A maximum {direction} burst was provided for host '{host}', but no maximum {direction} speed.")]
    BurstWithoutRate { host: String, direction: &'static str },
    #[error("Traffic control parameters were set for host '{host}', but 'tc' itself was not set.")]
    RestrictionsWithoutTc { host: String },
    #[error("Host '{host}' was given a jitter ({jitter} ms) larger than its delay ({delay} ms).")]
    JitterExceedsDelay {
        host: String,
        jitter: u32,
        delay: u32,
    },
    #[error("Invalid speed '{value}'. Use a number with an optional kbit/mbit/gbit suffix.")]
    InvalidSpeed { value: String },
    #[error("Invalid chance '{value}'. Use a percentage between 0 and 100.")]
    InvalidChance { value: String },
    #[error("Installing traffic control on host '{host}' failed: {output}")]
    InstallFailed { host: String, output: String },
    #[error(
        "Host '{host}' could not initiate restricted or unrestricted traffic control, but \
         traffic control was requested."
    )]
    CheckFailed { host: String },
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
