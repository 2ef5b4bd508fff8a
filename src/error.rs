use thiserror::Error;

pub type Result<T> = std::result::Result<T, DStoreError>;

#[derive(Error, Debug)]
pub enum DStoreError {
    /// Socket or stream failure. Fatal to the connection.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or unexpected reply tag, usually version skew. Fatal.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed error reply from the remote side. The connection stays up.
    #[error("Remote execution failed: {0}")]
    RemoteExecution(String),

    #[error("Stale element: {0}")]
    StaleElement(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DStoreError {
    /// Transport and protocol failures tear the connection down; everything
    /// else is reported to the caller and the connection stays usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DStoreError::Transport(_) | DStoreError::Protocol(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DStoreError::Cancelled(_))
    }

    /// Classification tag sent across the wire for failed downloads.
    pub fn download_class(&self) -> &'static str {
        use crate::protocol::constants::*;
        match self {
            DStoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                DOWNLOAD_RESULT_FILE_NOT_FOUND_EXCEPTION
            }
            DStoreError::Io(_) | DStoreError::Transport(_) => DOWNLOAD_RESULT_IO_EXCEPTION,
            DStoreError::InvalidArgument(_) => DOWNLOAD_RESULT_UNSUPPORTED_ENCODING_EXCEPTION,
            DStoreError::Cancelled(_) | DStoreError::Timeout(_) => DOWNLOAD_RESULT_EXCEPTION,
            _ => DOWNLOAD_RESULT_UNEXPECTED_ERROR,
        }
    }

    /// Maps an I/O failure on a live stream to a transport error.
    pub fn transport(err: std::io::Error) -> Self {
        DStoreError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(DStoreError::Transport("socket closed".into()).is_fatal());
        assert!(DStoreError::Protocol("tag 9".into()).is_fatal());
        assert!(!DStoreError::RemoteExecution("no such file".into()).is_fatal());
        assert!(!DStoreError::StaleElement("e.1".into()).is_fatal());
    }

    #[test]
    fn download_classes() {
        let missing = DStoreError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(missing.download_class(), "FileNotFoundException");
        let denied = DStoreError::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(denied.download_class(), "IOException");
        assert_eq!(DStoreError::InvalidArgument("ebcdic".into()).download_class(), "UnsupportedEncodingException");
    }
}
