//! Connection-level protocol errors.
//!
//! A `ProtocolError` is always fatal to the worker connection it happened on:
//! the client stops reading, kills the child, and fails every pending request
//! with a clone of the error.

use crate::wire::{EXIT_MALFORMED_INPUT, EXIT_UNKNOWN_TYPE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A line that is not a JSON object with a string `type` field.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A well-formed frame whose `type` is not part of the protocol.
    #[error("unknown message type {0:?}")]
    UnknownType(String),

    /// A known frame that the receiving side never expects, e.g. a worker
    /// sending a `load` request back to the supervisor.
    #[error("unexpected {0} frame")]
    UnexpectedFrame(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The worker announced a fatal condition with an id-less `error` frame.
    #[error("worker aborted: {0}")]
    WorkerAborted(String),

    /// Worker exited with the documented malformed-input code.
    #[error("worker rejected malformed input (exit code {EXIT_MALFORMED_INPUT})")]
    WorkerRejectedInput,

    /// Worker exited with the documented unknown-type code.
    #[error("worker rejected unknown message type (exit code {EXIT_UNKNOWN_TYPE})")]
    WorkerRejectedType,

    /// Worker exited (or was signalled) while the connection was live.
    #[error("worker exited unexpectedly (code {code:?})")]
    UnexpectedExit { code: Option<i32> },

    /// Output stream ended and no exit status could be observed.
    #[error("worker stream closed")]
    StreamClosed,

    /// Connection torn down by `kill()` while the request was outstanding.
    #[error("worker terminated with request outstanding")]
    Terminated,

    #[error("i/o error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Map an observed worker exit code to the matching error.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_MALFORMED_INPUT) => Self::WorkerRejectedInput,
            Some(EXIT_UNKNOWN_TYPE) => Self::WorkerRejectedType,
            code => Self::UnexpectedExit { code },
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
