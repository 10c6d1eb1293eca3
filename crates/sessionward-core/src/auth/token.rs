//! Access token inspection.
//!
//! Tokens are three dot-separated segments with a base64url JSON claim set in
//! the middle. Only the `exp` claim is read; signatures are the server's
//! business. Anything that cannot be decoded counts as expired.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token does not have three segments")]
    Malformed,

    #[error("Token payload is not base64url")]
    Encoding,

    #[error("Token payload is not a JSON claim set")]
    Claims,

    #[error("Token has no exp claim")]
    MissingExpiry,

    #[error("Token exp is outside the representable time range")]
    ExpiryOutOfRange,
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Read the `exp` claim of `token`.
pub fn expiry(token: &str) -> Result<DateTime<Utc>, TokenError> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(TokenError::Malformed);
    };

    // Some issuers pad; the URL-safe engine here does not accept padding
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| TokenError::Encoding)?;
    let claims: Claims = serde_json::from_slice(&bytes).map_err(|_| TokenError::Claims)?;
    let exp = claims.exp.ok_or(TokenError::MissingExpiry)?;

    // The float cast saturates, so an absurd exp lands here rather than wrapping
    Utc.timestamp_millis_opt((exp * 1000.0) as i64)
        .single()
        .ok_or(TokenError::ExpiryOutOfRange)
}

/// True unless `token` carries an `exp` strictly later than `now`.
pub fn is_expired_at(token: &str, now: DateTime<Utc>) -> bool {
    match expiry(token) {
        Ok(exp) => exp <= now,
        Err(_) => true,
    }
}

pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, Utc::now())
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
