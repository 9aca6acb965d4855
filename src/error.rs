use crate::remote::{InvalidCredentialsError, RequestError};
use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("backup {0} does not exist")]
    NotFound(String),

    #[error("invalid archive, is directory: {0}")]
    InvalidArchive(String),

    #[error("failed to read {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write archive {}: {source}", path.display())]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("invalid ignore pattern {pattern:?}: {source}")]
    IgnorePattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("unexpected response from panel (HTTP/{status})")]
    Remote { status: u16 },

    #[error(transparent)]
    InvalidCredentials(#[from] InvalidCredentialsError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Callback(Box<dyn StdError + Send + Sync>),
}

/// Discriminant of [`Error`], used for branching on error semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArchive,
    Filesystem,
    ArchiveWrite,
    CorruptArchive,
    IgnorePattern,
    Request,
    Remote,
    InvalidCredentials,
    Storage,
    Cancelled,
    Config,
    Task,
    Callback,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArchive(_) => ErrorKind::InvalidArchive,
            Error::Filesystem { .. } => ErrorKind::Filesystem,
            Error::ArchiveWrite { .. } => ErrorKind::ArchiveWrite,
            Error::CorruptArchive(_) => ErrorKind::CorruptArchive,
            Error::IgnorePattern { .. } => ErrorKind::IgnorePattern,
            Error::Request(_) => ErrorKind::Request,
            Error::Remote { .. } => ErrorKind::Remote,
            Error::InvalidCredentials(_) => ErrorKind::InvalidCredentials,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Config(_) => ErrorKind::Config,
            Error::Task(_) => ErrorKind::Task,
            Error::Callback(_) => ErrorKind::Callback,
        }
    }

    /// Wrap an arbitrary caller error, e.g. from inside a restore callback
    pub fn callback(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Error::Callback(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_request_error(&self) -> bool {
        self.kind() == ErrorKind::Request
    }

    pub fn is_invalid_credentials(&self) -> bool {
        self.kind() == ErrorKind::InvalidCredentials
    }

    /// Message that is safe to show to an end user.
    ///
    /// Only structured panel errors are passed through; everything else
    /// should be logged and reported generically.
    pub fn user_message(&self) -> String {
        match self {
            Error::Request(e) => e.to_string(),
            _ => "an unexpected error was encountered while processing this request".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns true if `err` is a structured error returned by the panel.
pub fn is_request_error(err: &(dyn StdError + 'static)) -> bool {
    if err.downcast_ref::<RequestError>().is_some() {
        return true;
    }
    err.downcast_ref::<Error>()
        .map(Error::is_request_error)
        .unwrap_or(false)
}

/// Returns true if `err` signals that SFTP credentials were rejected.
pub fn is_invalid_credentials_error(err: &(dyn StdError + 'static)) -> bool {
    if err.downcast_ref::<InvalidCredentialsError>().is_some() {
        return true;
    }
    err.downcast_ref::<Error>()
        .map(Error::is_invalid_credentials)
        .unwrap_or(false)
}

/// Returns true if `err` means the backup has no stored archive.
pub fn is_not_found_error(err: &(dyn StdError + 'static)) -> bool {
    err.downcast_ref::<Error>()
        .map(Error::is_not_found)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RequestErrors;

    fn request_error() -> RequestError {
        RequestErrors::from_response(
            Some(403),
            br#"{"errors":[{"code":"Forbidden","status":"403","detail":"access denied"}]}"#,
        )
        .unwrap()
        .errors
        .remove(0)
    }

    #[test]
    fn test_request_error_predicate() {
        let err = request_error();
        assert!(is_request_error(&err));
        assert!(is_request_error(&Error::from(err)));

        let io = std::io::Error::new(std::io::ErrorKind::Other, "Forbidden: access denied");
        assert!(!is_request_error(&io));
        assert!(!is_request_error(&Error::Storage("Forbidden".into())));
    }

    #[test]
    fn test_invalid_credentials_predicate() {
        assert!(is_invalid_credentials_error(&InvalidCredentialsError));
        assert!(is_invalid_credentials_error(&Error::from(
            InvalidCredentialsError
        )));

        // An unrelated error with no source chain
        let plain: Box<dyn StdError + Send + Sync> = "connection reset".into();
        assert!(plain.source().is_none());
        assert!(!is_invalid_credentials_error(&*plain));
        assert!(!is_request_error(&*plain));
        assert!(!is_not_found_error(&*plain));
        assert!(!is_invalid_credentials_error(&request_error()));
        assert!(!is_invalid_credentials_error(&Error::NotFound("x".into())));

        // Same message, different kind
        let io = std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            InvalidCredentialsError.to_string(),
        );
        assert!(!is_invalid_credentials_error(&io));
    }

    #[test]
    fn test_not_found_predicate() {
        assert!(is_not_found_error(&Error::NotFound("abc".into())));
        assert!(!is_not_found_error(&Error::InvalidArchive("abc".into())));
    }

    #[test]
    fn test_user_message() {
        let err = Error::from(request_error());
        assert!(err.user_message().contains("access denied"));

        let err = Error::Storage("bucket credentials leaked here".into());
        assert!(!err.user_message().contains("bucket"));
    }

    #[test]
    fn test_callback_error_kind() {
        let err = Error::callback("stop");
        assert_eq!(err.kind(), ErrorKind::Callback);
        assert_eq!(err.to_string(), "stop");
    }
}
