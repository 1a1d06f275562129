//! HMAC payload signing for webhook deliveries.
//!
//! Signature scheme: `hex(hmac_sha256(secret, timestamp "." body))`.
//! Receivers recompute over the exact raw body plus the
//! `X-Amila-Timestamp` header value.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign `timestamp "." body` with the subscription secret.
#[must_use]
pub fn sign_payload(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
#[must_use]
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let signature = sign_payload("secret", "1700000000", b"{\"a\":1}");
        assert!(verify_signature("secret", "1700000000", b"{\"a\":1}", &signature));
    }

    #[test]
    fn tampered_body_fails() {
        let signature = sign_payload("secret", "1700000000", b"{\"a\":1}");
        assert!(!verify_signature("secret", "1700000000", b"{\"a\":2}", &signature));
    }

    #[test]
    fn tampered_timestamp_fails() {
        let signature = sign_payload("secret", "1700000000", b"{}");
        assert!(!verify_signature("secret", "1700000001", b"{}", &signature));
    }

    #[test]
    fn malformed_signature_fails_closed() {
        assert!(!verify_signature("secret", "t", b"{}", "not-hex"));
    }
}
