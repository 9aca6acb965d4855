//! Errors produced by the remote control panel.
//!
//! The HTTP client is not part of this crate. It hands the status code and
//! raw body of every failed exchange to [`parse_error_response`], which is the
//! only place panel payloads are decoded.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Status code the panel uses to reject SFTP credentials.
const CREDENTIALS_REJECTED: u16 = 403;

/// Multi-error payload returned by the panel: `{"errors": [...]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestErrors {
    #[serde(default)]
    pub errors: Vec<RequestError>,
}

impl RequestErrors {
    /// Decode a failed response body.
    ///
    /// `status` is the HTTP status of the originating exchange, if there was
    /// one. It is copied onto every entry for display and not kept otherwise.
    pub fn from_response(status: Option<u16>, body: &[u8]) -> serde_json::Result<Self> {
        let mut parsed: RequestErrors = serde_json::from_slice(body)?;
        for e in parsed.errors.iter_mut() {
            e.http_status = status;
        }
        Ok(parsed)
    }

    pub fn into_first(self) -> Option<RequestError> {
        self.errors.into_iter().next()
    }
}

/// One structured error entry from the panel.
///
/// The rendered form only contains the structured fields, so it is safe to
/// show to an end user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub detail: String,
    #[serde(skip)]
    http_status: Option<u16>,
}

impl RequestError {
    pub fn new(
        code: impl Into<String>,
        status: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            status: status.into(),
            detail: detail.into(),
            http_status: None,
        }
    }

    /// HTTP status of the exchange this error came from, 0 if unknown
    pub fn http_status(&self) -> u16 {
        self.http_status.unwrap_or(0)
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (HTTP/{})", self.code, self.detail, self.http_status())
    }
}

impl std::error::Error for RequestError {}

// The originating exchange is diagnostic only and never part of identity.
impl PartialEq for RequestError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.status == other.status && self.detail == other.detail
    }
}

impl Eq for RequestError {}

/// Credentials supplied to the SFTP server were rejected by the panel
#[derive(Debug, Clone, Copy, Default, thiserror::Error)]
#[error("the credentials provided were invalid")]
pub struct InvalidCredentialsError;

/// Turn a failed panel response into an error.
///
/// The first structured entry wins. Bodies that are not a panel error
/// payload produce [`Error::Remote`] carrying just the status.
pub fn parse_error_response(status: u16, body: &[u8]) -> Error {
    match RequestErrors::from_response(Some(status), body) {
        Ok(errors) => match errors.into_first() {
            Some(e) => Error::Request(e),
            None => Error::Remote { status },
        },
        Err(err) => {
            debug!(status, error = %err, "Panel error body is not a structured payload");
            Error::Remote { status }
        }
    }
}

/// Classify a failed SFTP credential validation exchange.
pub fn sftp_credentials_error(status: u16, body: &[u8]) -> Error {
    if status == CREDENTIALS_REJECTED {
        return Error::InvalidCredentials(InvalidCredentialsError);
    }
    parse_error_response(status, body)
}
