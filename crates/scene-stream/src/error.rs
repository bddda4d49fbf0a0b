//! Stream error types.

use thiserror::Error;

/// Stream error type.
#[derive(Debug, Error)]
pub enum StreamError {
    /// IO error from the underlying reader or writer.
    #[error("io error: {0}")]
    Io(std::io::Error),

    /// Malformed or truncated stream.
    #[error("corrupt stream: {0}")]
    Corrupt(String),

    /// Section written by a newer format.
    #[error("unsupported {section} version {version}")]
    UnsupportedVersion {
        section: &'static str,
        version: u16,
    },

    /// The world rejected the scene.
    #[error("world error: {0}")]
    World(#[from] scene_core::Error),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Corrupt("unexpected end of stream".into())
        } else {
            Self::Io(err)
        }
    }
}

/// Result type for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
