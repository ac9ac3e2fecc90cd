use std::time::Duration;
use thiserror::Error;

/// Framing-level failures. Any of these ends the session because the
/// byte stream can no longer be trusted to be in sync.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("incomplete file transfer: expected {expected} bytes, got {received}")]
    IncompletePayload { expected: u64, received: u64 },

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

/// Failure of an external capability (capture device, process table, launcher).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{0}")]
    Unavailable(String),

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Failed(String),
}

impl CapabilityError {
    pub fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        CapabilityError::Io {
            what: what.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("could not open {kind} source: {source}")]
    Open {
        kind: &'static str,
        #[source]
        source: CapabilityError,
    },

    #[error("could not package recording: {0}")]
    Package(String),
}

/// Everything the dispatcher turns into an error response.
/// None of these end the session.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("authentication failed")]
    Auth,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("internal error: {0}")]
    Internal(String),
}
