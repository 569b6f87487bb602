use std::fmt;
use std::time::Duration;

use super::types::HostIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectFailure {
    /// TCP/TLS could not be established or timed out.
    Unreachable,
    /// The host answered but refused the credentials.
    Rejected,
    /// SSH host key unknown or mismatched.
    Untrusted,
    /// The peer spoke something other than what we expected.
    Protocol,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectFailure::Unreachable => "unreachable",
            ConnectFailure::Rejected => "credentials rejected",
            ConnectFailure::Untrusted => "host key not trusted",
            ConnectFailure::Protocol => "protocol error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to connect to {host} ({kind}): {message}")]
pub struct ConnectionError {
    pub host: HostIdentity,
    pub kind: ConnectFailure,
    pub message: String,
}

impl ConnectionError {
    pub fn new(host: HostIdentity, kind: ConnectFailure, message: impl Into<String>) -> Self {
        Self {
            host,
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(host: HostIdentity, message: impl Into<String>) -> Self {
        Self::new(host, ConnectFailure::Unreachable, message)
    }

    pub fn rejected(host: HostIdentity, message: impl Into<String>) -> Self {
        Self::new(host, ConnectFailure::Rejected, message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client for {host} is already disposed")]
    Closed { host: HostIdentity },
    #[error("command failed on {host}: {message}")]
    Command { host: HostIdentity, message: String },
    #[error("file transfer failed on {host}: {message}")]
    Transfer { host: HostIdentity, message: String },
    #[error("{host}: {message}")]
    Protocol { host: HostIdentity, message: String },
    #[error("operation on {host} was cancelled")]
    Cancelled { host: HostIdentity },
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCause {
    Failed(String),
    Timeout(Duration),
    Cancelled,
}

impl fmt::Display for StepCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepCause::Failed(message) => f.write_str(message),
            StepCause::Timeout(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            StepCause::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step '{step}' failed: {cause}")]
pub struct StepError {
    pub step: String,
    pub cause: StepCause,
}

impl StepError {
    pub fn failed(step: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            step: step.into(),
            cause: StepCause::Failed(cause.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, StepCause::Timeout(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to release session for {host}: {message}")]
pub struct DisposeError {
    pub host: HostIdentity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineDefinitionError {
    #[error("pipeline has no steps")]
    Empty,
    #[error("step '{step}' target {target} exceeds 100")]
    OutOfRange { step: String, target: u8 },
    #[error("step '{step}' target {target} is below the previous target {previous}")]
    Decreasing {
        step: String,
        target: u8,
        previous: u8,
    },
    #[error("final step '{step}' must target 100, found {target}")]
    Incomplete { step: String, target: u8 },
}
