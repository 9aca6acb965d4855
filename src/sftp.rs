//! Credential checks for the SFTP server.
//!
//! The panel decides whether a username and password are valid. The SFTP
//! server only needs to know whether to answer "permission denied" or treat
//! the attempt as a failure on our side.

use crate::error::{is_invalid_credentials_error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Login attempt forwarded to the panel
#[derive(Clone, Serialize)]
pub struct SftpAuthRequest {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(rename = "username")]
    pub user: String,
    #[serde(rename = "password")]
    pub pass: String,
    pub ip: String,
    pub session_id: String,
    pub client_version: String,
}

impl SftpAuthRequest {
    pub fn password(
        user: impl Into<String>,
        pass: impl Into<String>,
        ip: impl Into<String>,
    ) -> Self {
        Self {
            auth_type: "password".to_string(),
            user: user.into(),
            pass: pass.into(),
            ip: ip.into(),
            session_id: String::new(),
            client_version: String::new(),
        }
    }
}

// Never print the password.
impl fmt::Debug for SftpAuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpAuthRequest")
            .field("auth_type", &self.auth_type)
            .field("user", &self.user)
            .field("ip", &self.ip)
            .field("session_id", &self.session_id)
            .field("client_version", &self.client_version)
            .finish_non_exhaustive()
    }
}

/// Panel answer for an accepted login
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SftpAuthResponse {
    pub server: String,
    pub user: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Something that can ask the panel about SFTP credentials.
///
/// Implementations return [`crate::remote::InvalidCredentialsError`] (for
/// example via [`crate::remote::sftp_credentials_error`]) when the panel
/// rejects the credentials.
#[async_trait]
pub trait CredentialsValidator: Send + Sync {
    async fn validate_sftp_credentials(&self, request: &SftpAuthRequest)
        -> Result<SftpAuthResponse>;
}

/// What the SFTP server should do with a login attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted(SftpAuthResponse),
    /// The panel rejected the credentials
    PermissionDenied,
    /// Validation could not be completed
    Failed,
}

pub async fn authenticate<V>(validator: &V, request: &SftpAuthRequest) -> AuthOutcome
where
    V: CredentialsValidator + ?Sized,
{
    debug!(user = %request.user, ip = %request.ip, "SFTP authentication attempt");

    match validator.validate_sftp_credentials(request).await {
        Ok(response) => {
            info!(
                user = %request.user,
                server = %response.server,
                "SFTP authentication successful"
            );
            AuthOutcome::Accepted(response)
        }
        Err(err) if is_invalid_credentials_error(&err) => {
            warn!(
                user = %request.user,
                ip = %request.ip,
                "Failed to validate user credentials (invalid username or password)"
            );
            AuthOutcome::PermissionDenied
        }
        Err(err) => {
            error!(
                user = %request.user,
                error = %err,
                "Encountered an error while trying to validate user credentials"
            );
            AuthOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::remote::{parse_error_response, sftp_credentials_error};

    /// Replays a canned panel response
    struct Panel {
        status: u16,
        body: &'static [u8],
    }

    #[async_trait]
    impl CredentialsValidator for Panel {
        async fn validate_sftp_credentials(
            &self,
            _request: &SftpAuthRequest,
        ) -> Result<SftpAuthResponse> {
            if self.status == 200 {
                return serde_json::from_slice(self.body)
                    .map_err(|e| Error::callback(e));
            }
            Err(sftp_credentials_error(self.status, self.body))
        }
    }

    fn request() -> SftpAuthRequest {
        SftpAuthRequest::password("alice.8d5c0bb6", "hunter2", "10.0.0.4")
    }

    #[tokio::test]
    async fn test_accepted() {
        let panel = Panel {
            status: 200,
            body: br#"{"server":"8d5c0bb6","user":"u-1","permissions":["file.read"]}"#,
        };
        match authenticate(&panel, &request()).await {
            AuthOutcome::Accepted(resp) => {
                assert_eq!(resp.server, "8d5c0bb6");
                assert_eq!(resp.permissions, vec!["file.read"]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_permission_denied() {
        let panel = Panel {
            status: 403,
            body: br#"{"errors":[{"code":"Forbidden","status":"403","detail":"nope"}]}"#,
        };
        assert_eq!(
            authenticate(&panel, &request()).await,
            AuthOutcome::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_other_faults_fail() {
        let panel = Panel {
            status: 500,
            body: br#"{"errors":[{"code":"InternalError","status":"500","detail":"boom"}]}"#,
        };
        assert_eq!(authenticate(&panel, &request()).await, AuthOutcome::Failed);

        // A request error mentioning credentials is still just a request error
        let err = parse_error_response(
            400,
            concat!(
                r#"{"errors":[{"code":"BadRequest","status":"400","#,
                r#""detail":"the credentials provided were invalid"}]}"#
            )
            .as_bytes(),
        );
        assert!(!is_invalid_credentials_error(&err));
    }

    #[test]
    fn test_debug_hides_password() {
        let rendered = format!("{:?}", request());
        assert!(rendered.contains("alice.8d5c0bb6"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_request_payload() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["type"], "password");
        assert_eq!(json["username"], "alice.8d5c0bb6");
        assert_eq!(json["password"], "hunter2");
    }
}
