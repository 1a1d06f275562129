//! Authentication and request-integrity primitives for the HTTP surface.
//!
//! Three independent mechanisms:
//! - bearer tokens, checked through the [`TokenVerifier`] seam (token
//!   issuance is an external collaborator);
//! - CSRF double-submit: an HMAC-signed token set as a cookie and echoed
//!   in a header, compared in constant time;
//! - request signatures for unsafe methods:
//!   `hex(hmac_sha256(secret, METHOD||PATH||TIMESTAMP||BODY))` with a
//!   ±5-minute timestamp window.
//!
//! SSE clients cannot attach headers, so streams authenticate with a
//! short-lived signed token passed as a query parameter.

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sha2::Sha256;
use subtle_eq::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

/// CSRF cookie and header names.
pub const CSRF_COOKIE_NAME: &str = "csrf_token";
pub const CSRF_HEADER_NAME: &str = "X-CSRF-Token";

/// Request signature headers.
pub const SIGNATURE_HEADER: &str = "X-Amila-Signature";
pub const SIGNATURE_TIMESTAMP_HEADER: &str = "X-Amila-Timestamp";

/// Accepted request-timestamp skew, seconds.
pub const SIGNATURE_WINDOW_SECS: i64 = 300;

mod subtle_eq {
    /// Constant-time byte comparison (length leaks, contents do not).
    #[must_use]
    pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

/// Authenticated principal attached to a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
    pub role: String,
}

/// Seam to the identity system: maps bearer tokens to principals.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// Token table used by single-node deployments and tests. Real
/// deployments plug a JWT verifier into the same seam.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: RwLock<FxHashMap<String, AuthUser>>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, user: AuthUser) {
        self.tokens.write().insert(token.to_string(), user);
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<AuthUser> {
        self.tokens.read().get(token).cloned()
    }
}

fn hmac_hex(secret: &str, parts: &[&[u8]]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    hex::encode(mac.finalize().into_bytes())
}

/// Generate a fresh CSRF token (random, URL-safe).
#[must_use]
pub fn generate_csrf_token() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Sign a CSRF token: `token:hex(hmac_sha256(secret, token))`.
#[must_use]
pub fn sign_csrf_token(token: &str, secret: &str) -> String {
    format!("{token}:{}", hmac_hex(secret, &[token.as_bytes()]))
}

/// Verify a signed CSRF token's integrity.
#[must_use]
pub fn verify_csrf_token(signed: &str, secret: &str) -> bool {
    let Some((token, signature)) = signed.rsplit_once(':') else {
        return false;
    };
    constant_time_eq(
        hmac_hex(secret, &[token.as_bytes()]).as_bytes(),
        signature.as_bytes(),
    )
}

/// Double-submit check: both copies valid and carrying the same token.
#[must_use]
pub fn validate_csrf_pair(cookie: &str, header: &str, secret: &str) -> bool {
    if !verify_csrf_token(cookie, secret) || !verify_csrf_token(header, secret) {
        return false;
    }
    let cookie_token = cookie.split(':').next().unwrap_or_default();
    let header_token = header.split(':').next().unwrap_or_default();
    constant_time_eq(cookie_token.as_bytes(), header_token.as_bytes())
}

/// Compute the unsafe-method request signature.
#[must_use]
pub fn compute_request_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
) -> String {
    hmac_hex(
        secret,
        &[method.as_bytes(), path.as_bytes(), timestamp.as_bytes(), body],
    )
}

/// Verify an unsafe-method request signature within the timestamp window.
#[must_use]
pub fn verify_request_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now_unix: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_unix - ts).abs() > SIGNATURE_WINDOW_SECS {
        return false;
    }
    let expected = compute_request_signature(secret, method, path, timestamp, body);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

/// Issue a short-lived stream token: `{query_id}.{expiry}.{sig}`.
#[must_use]
pub fn issue_stream_token(secret: &str, query_id: &str, expiry_unix: i64) -> String {
    let sig = hmac_hex(
        secret,
        &[query_id.as_bytes(), b".", expiry_unix.to_string().as_bytes()],
    );
    format!("{query_id}.{expiry_unix}.{sig}")
}

/// Verify a stream token against its query id and the clock.
#[must_use]
pub fn verify_stream_token(secret: &str, query_id: &str, token: &str, now_unix: i64) -> bool {
    let mut parts = token.rsplitn(2, '.');
    let Some(sig) = parts.next() else {
        return false;
    };
    let Some(prefix) = parts.next() else {
        return false;
    };
    let Some((token_query_id, expiry_raw)) = prefix.rsplit_once('.') else {
        return false;
    };
    if token_query_id != query_id {
        return false;
    }
    let Ok(expiry) = expiry_raw.parse::<i64>() else {
        return false;
    };
    if now_unix > expiry {
        return false;
    }
    let expected = hmac_hex(
        secret,
        &[query_id.as_bytes(), b".", expiry_raw.as_bytes()],
    );
    constant_time_eq(expected.as_bytes(), sig.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn csrf_roundtrip() {
        let token = generate_csrf_token();
        let signed = sign_csrf_token(&token, SECRET);
        assert!(verify_csrf_token(&signed, SECRET));
        assert!(validate_csrf_pair(&signed, &signed, SECRET));
    }

    #[test]
    fn csrf_mismatched_pair_fails() {
        let a = sign_csrf_token(&generate_csrf_token(), SECRET);
        let b = sign_csrf_token(&generate_csrf_token(), SECRET);
        assert!(!validate_csrf_pair(&a, &b, SECRET));
    }

    #[test]
    fn csrf_forged_signature_fails() {
        let signed = sign_csrf_token("token", SECRET);
        let forged = signed.replace(':', ":0");
        assert!(!verify_csrf_token(&forged, SECRET));
    }

    #[test]
    fn request_signature_window() {
        let now = 1_700_000_000i64;
        let ts = now.to_string();
        let sig = compute_request_signature(SECRET, "POST", "/queries/process", &ts, b"{}");
        assert!(verify_request_signature(
            SECRET, "POST", "/queries/process", &ts, b"{}", &sig, now
        ));
        // Outside the ±5-minute window.
        assert!(!verify_request_signature(
            SECRET,
            "POST",
            "/queries/process",
            &ts,
            b"{}",
            &sig,
            now + SIGNATURE_WINDOW_SECS + 1
        ));
        // Tampered body.
        assert!(!verify_request_signature(
            SECRET, "POST", "/queries/process", &ts, b"{1}", &sig, now
        ));
    }

    #[test]
    fn stream_token_roundtrip() {
        let now = 1_700_000_000i64;
        let token = issue_stream_token(SECRET, "q-1", now + 60);
        assert!(verify_stream_token(SECRET, "q-1", &token, now));
        assert!(!verify_stream_token(SECRET, "q-2", &token, now));
        assert!(!verify_stream_token(SECRET, "q-1", &token, now + 120));
    }
}
