//! Encryption for the campaign state-identifier query parameter (C10).
//!
//! Resolves the open question in spec.md §9: AES-256-GCM, keyed by
//! SHA-256 of the campaign UUID's 16 raw bytes (already 32 bytes, used
//! directly with no truncation), a fresh random 12-byte nonce prepended to
//! the ciphertext, the whole thing base64url-encoded without padding so it
//! is safe to embed as a query-parameter value.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ProxyError, ProxyResult};

/// Derives the 32-byte AES-256 key from a campaign id: `SHA-256(uuid bytes)`.
fn derive_key(campaign_id: Uuid) -> Key<Aes256Gcm> {
    let mut hasher = Sha256::new();
    hasher.update(campaign_id.as_bytes());
    let digest = hasher.finalize();
    *Key::<Aes256Gcm>::from_slice(&digest)
}

/// Encrypts `plaintext` (a page-type name, e.g. `"before"`) under a key
/// derived from `campaign_id`, returning a base64url-no-padding string
/// suitable for use as the `state-identifier` query value.
pub fn encrypt(plaintext: &str, campaign_id: Uuid) -> ProxyResult<String> {
    let key = derive_key(campaign_id);
    let cipher = Aes256Gcm::new(&key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| ProxyError::Internal(format!("state-identifier encrypt failed: {e}")))?;

    let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(out))
}

/// Inverse of [`encrypt`]. Returns `Err` on a malformed value, wrong key
/// (campaign mismatch), or truncated tag — the caller (C10) treats any
/// decrypt failure as "no recognizable state", not a hard error.
pub fn decrypt(encoded: &str, campaign_id: Uuid) -> ProxyResult<String> {
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| ProxyError::Validation(format!("bad state-identifier encoding: {e}")))?;

    if raw.len() < 12 {
        return Err(ProxyError::Validation(
            "state-identifier shorter than nonce".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(12);

    let key = derive_key(campaign_id);
    let cipher = Aes256Gcm::new(&key);
    let nonce = aes_gcm::Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| ProxyError::Validation("state-identifier decrypt failed".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|e| ProxyError::Validation(format!("state-identifier not utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let campaign_id = Uuid::new_v4();
        let encoded = encrypt("before", campaign_id).unwrap();
        let decoded = decrypt(&encoded, campaign_id).unwrap();
        assert_eq!(decoded, "before");
    }

    #[test]
    fn wrong_campaign_fails_to_decrypt() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let encoded = encrypt("done", a).unwrap();
        assert!(decrypt(&encoded, b).is_err());
    }

    #[test]
    fn nonce_varies_per_call() {
        let campaign_id = Uuid::new_v4();
        let first = encrypt("landing", campaign_id).unwrap();
        let second = encrypt("landing", campaign_id).unwrap();
        assert_ne!(first, second, "random nonce must vary the ciphertext");
    }
}
