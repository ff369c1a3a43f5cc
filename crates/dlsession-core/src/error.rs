//! Error types for dlsession core

use dlsession_types::{FailureKind, TransportFailure};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the destination writer
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("File already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("Permission denied for {}: {source}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to save the file {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error writing to {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Writer for {} is already closed", path.display())]
    Closed { path: PathBuf },
}

impl WriterError {
    /// Map an error raised while creating the artifact
    pub(crate) fn on_open(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::AlreadyExists => WriterError::AlreadyExists { path },
            std::io::ErrorKind::PermissionDenied => WriterError::PermissionDenied { path, source },
            _ => WriterError::Unavailable { path, source },
        }
    }

    /// True for errors that happen before any byte could be written
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self,
            WriterError::AlreadyExists { .. }
                | WriterError::PermissionDenied { .. }
                | WriterError::Unavailable { .. }
        )
    }
}

/// Errors that can occur in a download session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Overwrite of {} was declined", .0.display())]
    OverwriteDeclined(PathBuf),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("Transport error: {0}")]
    Transport(TransportFailure),

    #[error("Integrity check failed: expected {expected} bytes, got {actual}")]
    Integrity { expected: u64, actual: u64 },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid setting: {0}")]
    Config(String),
}

impl SessionError {
    /// Classify this error for a failed outcome
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SessionError::OverwriteDeclined(_) => FailureKind::OverwriteDeclined,
            SessionError::Writer(e) if e.is_open_failure() => FailureKind::DestinationUnavailable,
            SessionError::Writer(_) | SessionError::Io(_) => FailureKind::Io,
            SessionError::Integrity { .. } => FailureKind::Integrity,
            SessionError::Transport(_)
            | SessionError::Network(_)
            | SessionError::InvalidUrl(_)
            | SessionError::InvalidOperation(_)
            | SessionError::Serialization(_)
            | SessionError::Config(_) => FailureKind::Transport,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(error: serde_json::Error) -> Self {
        SessionError::Serialization(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsession_types::TransportErrorCode;

    #[test]
    fn test_open_failures_map_to_destination_unavailable() {
        let denied = WriterError::on_open(
            PathBuf::from("/root/file.bin"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(denied, WriterError::PermissionDenied { .. }));
        assert_eq!(
            SessionError::from(denied).failure_kind(),
            FailureKind::DestinationUnavailable
        );
    }

    #[test]
    fn test_write_failure_maps_to_io() {
        let err = SessionError::from(WriterError::Io {
            path: PathBuf::from("file.bin"),
            source: std::io::Error::other("disk full"),
        });
        assert_eq!(err.failure_kind(), FailureKind::Io);
    }

    #[test]
    fn test_transport_error_message() {
        let err = SessionError::Transport(TransportFailure::new(
            TransportErrorCode::HttpStatus(404),
            "Not Found",
        ));
        assert_eq!(err.to_string(), "Transport error: HTTP 404: Not Found");
        assert_eq!(err.failure_kind(), FailureKind::Transport);
    }
}
