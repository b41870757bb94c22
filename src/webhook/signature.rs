//! Webhook body signing
//!
//! Every outbound POST carries `X-Notif-Signature`, the lowercase hex
//! HMAC-SHA256 of the raw body under the webhook's secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex signature for a body
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a received signature
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic_hex() {
        let sig = sign("whsec_test", br#"{"amt":1}"#);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, sign("whsec_test", br#"{"amt":1}"#));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let sig = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_verify() {
        let body = br#"{"amt":1}"#;
        let sig = sign("whsec_test", body);
        assert!(verify("whsec_test", body, &sig));
        assert!(!verify("whsec_other", body, &sig));
        assert!(!verify("whsec_test", br#"{"amt":2}"#, &sig));
        assert!(!verify("whsec_test", body, "zz-not-hex"));
    }
}
