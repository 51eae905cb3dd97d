// Error handling module
// Defines the session error taxonomy shared by every component

use thiserror::Error;

/// Maximum length for response bodies embedded in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Errors that can occur while managing the session or sending requests.
///
/// Cloneable so that one renewal outcome can be delivered to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Access token could not be decoded into subject + expiry
    #[error("Malformed access token: {0}")]
    MalformedToken(String),

    /// A renewal was required but no refresh token is stored
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// Renewal endpoint rejected the refresh token or could not be reached
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Login endpoint rejected the username/password
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Authorization failure that survived the single retry
    #[error("Unauthorized - token rejected after refresh")]
    Unauthorized,

    /// Non-success response from the remote API
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Credential store could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Request could not be prepared or replayed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SessionError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}... (truncated, {} total bytes)",
            &body[..end],
            body.len()
        )
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 => SessionError::Unauthorized,
            code => SessionError::Api {
                status: code,
                message: Self::truncate_body(body),
            },
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "request_error"
        };
        SessionError::Network(format!("{} (kind: {})", err, kind))
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        SessionError::Storage(err.to_string())
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;
