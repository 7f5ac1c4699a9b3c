//! Message framing over never-closed byte streams.
//!
//! A warm process's stdout is not call-scoped, so a [`Framer`] decides where one
//! call's output ends. Each strategy reads exactly one message from `src`,
//! writes it to `dest` and leaves both streams open.
//!
//! - **line**: up to and including the next `\n`
//! - **json**: one JSON document, re-serialized compactly
//! - **http**: one HTTP/1.x message delimited by its own headers

mod http;
mod json;
mod line;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite};

pub use http::HttpFramer;
pub use json::JsonFramer;
pub use line::LineFramer;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Source closed before a complete message was read.
    #[error("stream closed before a complete message")]
    Eof,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Eof
        } else {
            Self::Io(e)
        }
    }
}

#[async_trait]
pub trait Framer: Send + Sync + fmt::Debug {
    /// Copy exactly one message from `src` to `dest`.
    async fn copy(
        &self,
        dest: &mut (dyn AsyncWrite + Send + Unpin),
        src: &mut (dyn AsyncBufRead + Send + Unpin),
    ) -> Result<(), FrameError>;
}

/// Framer selection by name, as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerKind {
    Line,
    Json,
    Http,
}

impl FramerKind {
    pub fn build(self) -> Arc<dyn Framer> {
        match self {
            Self::Line => Arc::new(LineFramer),
            Self::Json => Arc::new(JsonFramer::default()),
            Self::Http => Arc::new(HttpFramer::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Json => "json",
            Self::Http => "http",
        }
    }
}

impl FromStr for FramerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "line" => Ok(Self::Line),
            "json" => Ok(Self::Json),
            "http" => Ok(Self::Http),
            other => Err(format!("unknown framer {other:?} (expected line, json or http)")),
        }
    }
}

impl fmt::Display for FramerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_kind_parses_names() {
        assert_eq!("line".parse::<FramerKind>().unwrap(), FramerKind::Line);
        assert_eq!("JSON".parse::<FramerKind>().unwrap(), FramerKind::Json);
        assert_eq!("http".parse::<FramerKind>().unwrap(), FramerKind::Http);
        assert!("xml".parse::<FramerKind>().is_err());
    }

    #[test]
    fn unexpected_eof_maps_to_eof() {
        let err = FrameError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, FrameError::Eof));
        let err = FrameError::from(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(err, FrameError::Io(_)));
    }
}
