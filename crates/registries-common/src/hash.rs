//! Certificate fingerprinting
//!
//! The fingerprint is SHA-224 rendered as lowercase hex. At 56 characters it
//! fits a Kubernetes label value, which is how jobs are looked up by hash.

use std::fmt::Write;

use aws_lc_rs::digest::{digest, SHA224};

/// Fingerprint of "no certificate configured".
///
/// Never produced for real content: every real fingerprint is 56 hex chars.
pub const EMPTY_HASH: &str = "";

/// Compute the fingerprint of a certificate payload.
///
/// Deterministic; `None` yields [`EMPTY_HASH`].
pub fn hash(payload: Option<&[u8]>) -> String {
    let Some(bytes) = payload else {
        return EMPTY_HASH.to_string();
    };
    let digest = digest(&SHA224, bytes);
    digest
        .as_ref()
        .iter()
        .fold(String::with_capacity(56), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_empty_sentinel() {
        assert_eq!(hash(None), EMPTY_HASH);
    }

    #[test]
    fn stable_for_identical_bytes() {
        let pem = b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";
        assert_eq!(hash(Some(pem)), hash(Some(pem)));
    }

    #[test]
    fn differs_for_distinct_payloads() {
        assert_ne!(hash(Some(b"cert-a")), hash(Some(b"cert-b")));
    }

    #[test]
    fn empty_payload_is_not_the_sentinel() {
        let h = hash(Some(b""));
        assert_ne!(h, EMPTY_HASH);
        // SHA-224 of the empty string
        assert_eq!(h, "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f");
    }

    #[test]
    fn usable_as_label_value() {
        let h = hash(Some(b"some certificate"));
        assert_eq!(h.len(), 56);
        assert!(h.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
