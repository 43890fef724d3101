use std::io;
use std::time::Duration;

use thiserror::Error;

/// Transport-level failures raised by a [`CommandChannel`](crate::CommandChannel).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("channel disconnected: {0}")]
    Disconnected(String),
    #[error("operation not supported on this transport: {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
    #[error("malformed response to {command}: {response:?}")]
    MalformedResponse { command: String, response: String },
    #[error("buffer decode error: {0}")]
    BufferDecode(String),
    #[error("service request not raised within {0:?}")]
    Timeout(Duration),
    #[error("acquisition timed out after {0:?}")]
    AcquisitionTimedOut(Duration),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("incomplete run: expected {expected} samples, received {received}")]
    IncompleteRun { expected: usize, received: usize },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("acquisition cancelled")]
    Cancelled,
}

impl DriverError {
    pub(crate) fn malformed(command: &str, response: &str) -> Self {
        DriverError::MalformedResponse {
            command: command.to_string(),
            response: response.to_string(),
        }
    }

    /// Parse and decode failures spoil one drain cycle but not the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DriverError::MalformedResponse { .. } | DriverError::BufferDecode(_)
        )
    }
}

/// A run that ended in error, with the number of samples already handed to the sink.
///
/// Finite runs deliver all or nothing, so for them `delivered` is always 0.
#[derive(Debug, Error)]
#[error("acquisition failed after {delivered} samples: {source}")]
pub struct ContinuousError {
    pub delivered: usize,
    #[source]
    pub source: DriverError,
}

pub type Result<T> = std::result::Result<T, DriverError>;
