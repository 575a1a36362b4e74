//! Credential sealing.
//!
//! The whole tagged credential document goes into the database as one
//! AES-256-GCM blob, paired with the nonce that sealed it. Sealing the
//! full JSON document (rather than individual fields) keeps the schema
//! stable across auth modes: an API key row and an OAuth2 row occupy the
//! same two columns. The master key arrives base64-encoded from
//! `JUNCTION_ENCRYPTION_KEY` and never touches disk.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Decodes the base64 master key, rejecting anything that is not exactly
/// 32 bytes once decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key = BASE64
        .decode(key_base64)
        .context("Master key is not valid base64")?;
    if key.len() != KEY_LEN {
        bail!(
            "Master key decodes to {} bytes, need exactly {}",
            key.len(),
            KEY_LEN
        );
    }
    Ok(key)
}

/// Cipher construction shared by both directions. Length is re-checked
/// here so `seal`/`open` are safe to call with a key that skipped
/// [`validate_key`].
fn cipher_for(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_LEN {
        bail!("Master key must be {KEY_LEN} bytes");
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Cipher init rejected the master key: {e}"))
}

/// Seals a credential document under a fresh random nonce.
///
/// Returns the `(blob, nonce)` pair, both base64, which the store
/// persists side by side. GCM authenticates the blob, so a tampered row
/// fails to open rather than producing garbage credentials.
pub fn seal(document: &Value, key: &[u8]) -> Result<(String, String)> {
    let cipher = cipher_for(key)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let serialized =
        serde_json::to_vec(document).context("Credential document failed to serialize")?;
    let blob = cipher
        .encrypt(&nonce, serialized.as_slice())
        .map_err(|e| anyhow!("Sealing credentials failed: {e}"))?;

    Ok((BASE64.encode(blob), BASE64.encode(nonce)))
}

/// Opens a sealed blob back into its credential document. Fails on a key
/// mismatch, a mangled nonce, or any modification of the stored blob.
pub fn open(blob: &str, nonce: &str, key: &[u8]) -> Result<Value> {
    let cipher = cipher_for(key)?;

    let blob = BASE64.decode(blob).context("Sealed blob is not valid base64")?;
    let nonce = BASE64.decode(nonce).context("Stored nonce is not valid base64")?;
    if nonce.len() != NONCE_LEN {
        bail!("Stored nonce is {} bytes, expected {}", nonce.len(), NONCE_LEN);
    }

    let serialized = cipher
        .decrypt(Nonce::from_slice(&nonce), blob.as_slice())
        .map_err(|_| anyhow!("Could not open sealed credentials (key mismatch or tampered row)"))?;
    serde_json::from_slice(&serialized).context("Opened credentials are not a JSON document")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_key_length_and_encoding() {
        assert!(validate_key(&BASE64.encode([0u8; 32])).is_ok());
        assert!(validate_key(&BASE64.encode([0u8; 16])).is_err());
        assert!(validate_key(&BASE64.encode([0u8; 64])).is_err());
        assert!(validate_key("%%% not base64 %%%").is_err());
    }

    #[test]
    fn test_sealed_document_opens_to_itself() {
        let key = [7u8; 32];
        let document = json!({"type": "API_KEY", "api_key": "sk-test-123"});

        let (blob, nonce) = seal(&document, &key).unwrap();
        assert!(!blob.contains("sk-test-123"));
        assert_eq!(open(&blob, &nonce, &key).unwrap(), document);
    }

    #[test]
    fn test_every_seal_uses_a_fresh_nonce() {
        let key = [7u8; 32];
        let document = json!({"a": 1});
        let (blob_one, nonce_one) = seal(&document, &key).unwrap();
        let (blob_two, nonce_two) = seal(&document, &key).unwrap();
        assert_ne!(nonce_one, nonce_two);
        assert_ne!(blob_one, blob_two);
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let (blob, nonce) = seal(&json!({"a": 1}), &[1u8; 32]).unwrap();
        assert!(open(&blob, &nonce, &[2u8; 32]).is_err());
    }

    #[test]
    fn test_swapped_nonce_cannot_open() {
        let key = [7u8; 32];
        let (blob, _) = seal(&json!({"a": 1}), &key).unwrap();
        let (_, other_nonce) = seal(&json!({"b": 2}), &key).unwrap();
        assert!(open(&blob, &other_nonce, &key).is_err());
    }

    #[test]
    fn test_modified_blob_is_rejected() {
        let key = [7u8; 32];
        let (mut blob, nonce) = seal(&json!({"a": 1}), &key).unwrap();
        blob.push('A');
        assert!(open(&blob, &nonce, &key).is_err());
    }

    #[test]
    fn test_short_key_rejected_by_both_directions() {
        assert!(seal(&json!({}), &[0u8; 8]).is_err());
        assert!(open("eA==", "eA==", &[0u8; 8]).is_err());
    }
}
