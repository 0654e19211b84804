use super::{
    ClientError, ConfigError, HostError, MetaError, MuxError, PipelineError, ScenarioError,
    StageError, TcError, ValidationError, WorkloadError,
};

impl From<&'static str> for ValidationError {
    fn from(message: &'static str) -> Self {
        ValidationError::TestExpectation { message }
    }
}

impl From<String> for ValidationError {
    fn from(value: String) -> Self {
        ValidationError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ConfigError {
    fn from(message: &'static str) -> Self {
        ConfigError::TestExpectation { message }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        ConfigError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for MuxError {
    fn from(message: &'static str) -> Self {
        MuxError::TestExpectation { message }
    }
}

impl From<String> for MuxError {
    fn from(value: String) -> Self {
        MuxError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for HostError {
    fn from(message: &'static str) -> Self {
        HostError::TestExpectation { message }
    }
}

impl From<String> for HostError {
    fn from(value: String) -> Self {
        HostError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ClientError {
    fn from(message: &'static str) -> Self {
        ClientError::TestExpectation { message }
    }
}

impl From<String> for ClientError {
    fn from(value: String) -> Self {
        ClientError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for StageError {
    fn from(message: &'static str) -> Self {
        StageError::TestExpectation { message }
    }
}

impl From<String> for StageError {
    fn from(value: String) -> Self {
        StageError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for TcError {
    fn from(message: &'static str) -> Self {
        TcError::TestExpectation { message }
    }
}

impl From<String> for TcError {
    fn from(value: String) -> Self {
        TcError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for WorkloadError {
    fn from(message: &'static str) -> Self {
        WorkloadError::TestExpectation { message }
    }
}

impl From<String> for WorkloadError {
    fn from(value: String) -> Self {
        WorkloadError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for ScenarioError {
    fn from(message: &'static str) -> Self {
        ScenarioError::TestExpectation { message }
    }
}

impl From<String> for ScenarioError {
    fn from(value: String) -> Self {
        ScenarioError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for PipelineError {
    fn from(message: &'static str) -> Self {
        PipelineError::TestExpectation { message }
    }
}

impl From<String> for PipelineError {
    fn from(value: String) -> Self {
        PipelineError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}

impl From<&'static str> for MetaError {
    fn from(message: &'static str) -> Self {
        MetaError::TestExpectation { message }
    }
}

impl From<String> for MetaError {
    fn from(value: String) -> Self {
        MetaError::TestExpectationValue {
            message: "Test expectation failed",
            value,
        }
    }
}
