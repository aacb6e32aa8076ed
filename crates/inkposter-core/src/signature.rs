//! # Request Signatures
//!
//! HMAC-SHA256 helpers shared by the cloud login request and the local
//! command framer.
//!
//! ```text
//! signature = hex( HMAC-SHA256(key = client_secret, msg = client_id ‖ "1718000000000") )
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CoreError, CoreResult};

type HmacSha256 = Hmac<Sha256>;

/// Raw HMAC-SHA256 digest of the concatenated `parts`.
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> CoreResult<[u8; 32]> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| CoreError::MacKey(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Ok(digest)
}

/// Signature for the unauthenticated login endpoint.
///
/// Deterministic: the same `(client_id, timestamp_millis, secret)` always
/// yields the same lowercase hex string.
pub fn compute_auth_signature(
    client_id: &str,
    timestamp_millis: i64,
    secret: &str,
) -> CoreResult<String> {
    let timestamp = timestamp_millis.to_string();
    let digest = hmac_sha256(
        secret.as_bytes(),
        &[client_id.as_bytes(), timestamp.as_bytes()],
    )?;
    Ok(hex::encode(digest))
}

/// Query parameters carried by a signed request: `timestamp` and `signature`.
pub fn signed_query(
    client_id: &str,
    timestamp_millis: i64,
    secret: &str,
) -> CoreResult<[(&'static str, String); 2]> {
    Ok([
        ("timestamp", timestamp_millis.to_string()),
        (
            "signature",
            compute_auth_signature(client_id, timestamp_millis, secret)?,
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let a = compute_auth_signature("android", 1_718_000_000_000, "secret").unwrap();
        let b = compute_auth_signature("android", 1_718_000_000_000, "secret").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_signature_covers_timestamp_and_client() {
        let sign = |client: &str, ts: i64, secret: &str| {
            compute_auth_signature(client, ts, secret).unwrap()
        };
        let base = sign("android", 1_000, "secret");
        assert_ne!(base, sign("android", 1_001, "secret"));
        assert_ne!(base, sign("ios", 1_000, "secret"));
        assert_ne!(base, sign("android", 1_000, "other"));
    }

    #[test]
    fn test_signature_matches_concatenated_message() {
        let expected = hex::encode(hmac_sha256(b"secret", &[b"android1000"]).unwrap());
        assert_eq!(compute_auth_signature("android", 1000, "secret").unwrap(), expected);
    }

    #[test]
    fn test_hmac_accepts_empty_and_oversized_keys() {
        assert!(hmac_sha256(b"", &[b"msg"]).is_ok());
        assert!(hmac_sha256(&[0xAB; 200], &[b"msg"]).is_ok());
    }

    #[test]
    fn test_signed_query_names() {
        let params = signed_query("android", 42, "secret").unwrap();
        assert_eq!(params[0], ("timestamp", "42".to_string()));
        assert_eq!(params[1].0, "signature");
    }
}
