// Authentication types

use serde::{Deserialize, Serialize};

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Opaque user identifier
    pub sub: String,
    /// Expiry as epoch seconds
    pub exp: i64,
}

/// Token pair returned by the login and renewal endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Whatever the credential store currently holds (either may be absent)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Login endpoint request
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Renewal endpoint request
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Read-only view of the session handed to the UI layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub subject: Option<String>,
    pub seconds_remaining: u64,
    pub is_authenticated: bool,
}

/// Timing policy applied by the session clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Seconds before expiry at which renewal or forced logout happens
    pub refresh_margin: u64,
    /// Renew silently at the margin instead of logging out
    pub auto_renewal: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            refresh_margin: 60,
            auto_renewal: true,
        }
    }
}
