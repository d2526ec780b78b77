//! Proof-of-origin verification for inbound webhooks.
//!
//! Two strategies, picked by platform: GitLab presents the shared secret
//! directly in `X-Gitlab-Token`; GitHub presents an HMAC-SHA256 signature
//! over the raw body in `X-Hub-Signature-256`. Both comparisons are
//! constant-time.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::envelope::Platform;

type HmacSha256 = Hmac<Sha256>;

pub const GITLAB_TOKEN_HEADER: &str = "X-Gitlab-Token";
pub const GITHUB_SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Verify the request against the stored webhook secret.
pub fn authenticate(
    platform: Platform,
    headers: &HeaderMap,
    body: &[u8],
    stored_secret: &str,
) -> bool {
    match platform {
        Platform::GitLab => {
            let presented = headers
                .get(GITLAB_TOKEN_HEADER)
                .and_then(|v| v.to_str().ok());
            token_matches(presented, Some(stored_secret))
        }
        Platform::GitHub => {
            let Some(signature) = headers
                .get(GITHUB_SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
            else {
                return false;
            };
            if stored_secret.is_empty() {
                return false;
            }
            verify_signature(stored_secret, body, signature)
        }
    }
}

/// Constant-time equality between a presented token and the stored secret.
///
/// Both sides are hashed first so the comparison length never depends on
/// either input. A missing or empty token on either side fails outright:
/// "secret not configured" is a failure, not an empty-matches-empty success.
pub fn token_matches(presented: Option<&str>, stored: Option<&str>) -> bool {
    let (Some(presented), Some(stored)) = (presented, stored) else {
        return false;
    };
    if presented.is_empty() || stored.is_empty() {
        return false;
    }

    let presented_digest = Sha256::digest(presented.as_bytes());
    let stored_digest = Sha256::digest(stored.as_bytes());
    presented_digest
        .as_slice()
        .ct_eq(stored_digest.as_slice())
        .into()
}

/// Verify an HMAC-SHA256 body signature, `sha256=<hex>` format.
pub fn verify_signature(secret: &str, payload: &[u8], signature_header: &str) -> bool {
    let Some(signature_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    // verify_slice is constant-time
    mac.verify_slice(&signature_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn matching_token_authenticates() {
        assert!(token_matches(Some("s3cret"), Some("s3cret")));
    }

    #[test]
    fn mismatched_token_fails() {
        assert!(!token_matches(Some("s3cret"), Some("other")));
        // A prefix of the secret must not pass either.
        assert!(!token_matches(Some("s3c"), Some("s3cret")));
    }

    #[test]
    fn missing_or_empty_tokens_never_match() {
        assert!(!token_matches(None, Some("s3cret")));
        assert!(!token_matches(Some("s3cret"), None));
        assert!(!token_matches(None, None));
        assert!(!token_matches(Some(""), Some("")));
        assert!(!token_matches(Some(""), Some("s3cret")));
        assert!(!token_matches(Some("s3cret"), Some("")));
    }

    #[test]
    fn valid_signature_authenticates() {
        let payload = br#"{"object_kind":"issue"}"#;
        let signature = sign("hook-secret", payload);
        assert!(verify_signature("hook-secret", payload, &signature));
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let signature = sign("hook-secret", b"original");
        assert!(!verify_signature("hook-secret", b"tampered", &signature));
    }

    #[test]
    fn malformed_signature_header_fails() {
        assert!(!verify_signature("hook-secret", b"payload", "sha1=abcd"));
        assert!(!verify_signature("hook-secret", b"payload", "sha256=nothex"));
        assert!(!verify_signature("hook-secret", b"payload", ""));
    }

    #[test]
    fn gitlab_strategy_reads_the_token_header() {
        let mut headers = HeaderMap::new();
        headers.insert(GITLAB_TOKEN_HEADER, HeaderValue::from_static("s3cret"));
        assert!(authenticate(Platform::GitLab, &headers, b"{}", "s3cret"));
        assert!(!authenticate(Platform::GitLab, &headers, b"{}", "other"));
        assert!(!authenticate(Platform::GitLab, &HeaderMap::new(), b"{}", "s3cret"));
    }

    #[test]
    fn github_strategy_reads_the_signature_header() {
        let payload = br#"{"action":"opened"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            GITHUB_SIGNATURE_HEADER,
            HeaderValue::from_str(&sign("hook-secret", payload)).unwrap(),
        );
        assert!(authenticate(Platform::GitHub, &headers, payload, "hook-secret"));
        assert!(!authenticate(Platform::GitHub, &headers, payload, "wrong"));
        assert!(!authenticate(
            Platform::GitHub,
            &HeaderMap::new(),
            payload,
            "hook-secret"
        ));
    }
}
