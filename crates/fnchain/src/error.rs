//! Call-level error taxonomy.
//!
//! Every concurrent role of a call (process, hop, shovel) reports a `CallError`.
//! The first one wins and becomes the call's terminal error; `kind()` lets the
//! dispatch loop tell "it failed" from "it was stopped".

use std::io;

use crate::framer::FrameError;

/// Coarse classification of a [`CallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Chain/options count mismatch, unparsable identifier, empty chain.
    MalformedExpression,
    /// Unknown transport scheme, missing credentials, bad runner setup.
    Configuration,
    /// Dial failure, stream error, peer-reported failure.
    Transport,
    /// Spawn failure, non-zero exit, framing failure on process output.
    Process,
    /// A warm process died underneath the call.
    ProcessDied,
    Cancelled,
    TimedOut,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("malformed chain expression: {0}")]
    Malformed(String),

    #[error("chain has no hops")]
    EmptyChain,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error ({endpoint}): {message}")]
    Transport { endpoint: String, message: String },

    #[error("{endpoint} reported failure: {message}")]
    Remote { endpoint: String, message: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },

    #[error("process died during call")]
    ProcessDied,

    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out")]
    TimedOut,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Malformed(_) | Self::EmptyChain => ErrorKind::MalformedExpression,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Transport { .. } | Self::Remote { .. } => ErrorKind::Transport,
            Self::Spawn { .. } | Self::ProcessFailed { .. } | Self::Framing(_) | Self::Io(_) => {
                ErrorKind::Process
            }
            Self::ProcessDied => ErrorKind::ProcessDied,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TimedOut => ErrorKind::TimedOut,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for cancellation and timeout: the call was stopped, it did not fail.
    pub fn is_interrupted(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled | ErrorKind::TimedOut)
    }

    pub(crate) fn transport(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }
}
