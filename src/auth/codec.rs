// Access token codec
// Reads subject and expiry out of a JWT-shaped token without verifying it

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use super::types::Claims;
use crate::error::{Result, SessionError};

/// Header used for locally issued (mock) tokens
const UNSIGNED_HEADER: &str = r#"{"alg":"none","typ":"JWT"}"#;

/// Decode the subject and expiry claims of an access token.
///
/// The token must have exactly three dot-separated segments and the middle
/// one must be a base64 JSON object with a string `sub` and a numeric `exp`.
/// The signature is not checked.
pub fn decode(access_token: &str) -> Result<Claims> {
    let segments: Vec<&str> = access_token.split('.').collect();
    if segments.len() != 3 {
        return Err(SessionError::MalformedToken(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let payload = decode_segment(segments[1])?;
    let json: Value = serde_json::from_slice(&payload)
        .map_err(|e| SessionError::MalformedToken(format!("payload is not JSON: {}", e)))?;

    let sub = json
        .get("sub")
        .and_then(Value::as_str)
        .ok_or_else(|| SessionError::MalformedToken("missing `sub` claim".to_string()))?;

    // Some issuers emit fractional expiry; truncate to whole seconds
    let exp = json
        .get("exp")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or_else(|| SessionError::MalformedToken("missing `exp` claim".to_string()))?;

    Ok(Claims {
        sub: sub.to_string(),
        exp,
    })
}

/// Encode claims into an unsigned token (`alg: none`, empty signature).
pub fn encode_unsigned(claims: &Claims) -> String {
    let payload = serde_json::json!({ "sub": claims.sub, "exp": claims.exp });
    format!(
        "{}.{}.",
        URL_SAFE_NO_PAD.encode(UNSIGNED_HEADER),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

/// Accept both base64url and padded standard base64 segments
fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    let normalized: String = segment
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| SessionError::MalformedToken(format!("payload is not base64: {}", e)))
}
