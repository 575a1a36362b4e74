//! Request authentication for the authorization endpoints.
//!
//! Tenants that enable HMAC protection must send a digest alongside every
//! `start` call. The digest is HMAC-SHA256 over the UTF-8 bytes of
//! `provider_config_key` concatenated with `connection_id` (empty string if
//! absent), keyed with the tenant's shared secret and hex-encoded.

use crate::error::AuthError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Computes the expected digest for `(provider_config_key, connection_id)`.
pub fn compute_digest(secret: &str, provider_config_key: &str, connection_id: Option<&str>) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(provider_config_key.as_bytes());
    mac.update(connection_id.unwrap_or("").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a caller-supplied digest.
///
/// The comparison is constant-time with respect to the digest bytes. No
/// other state is touched on failure.
pub fn verify_digest(
    secret: &str,
    supplied: Option<&str>,
    provider_config_key: &str,
    connection_id: Option<&str>,
) -> Result<(), AuthError> {
    let supplied = supplied.ok_or(AuthError::MissingHmac)?;
    let expected = compute_digest(secret, provider_config_key, connection_id);

    if expected.as_bytes().ct_eq(supplied.as_bytes()).into() {
        Ok(())
    } else {
        Err(AuthError::InvalidHmac)
    }
}
