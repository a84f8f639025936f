//! Server-issued derivation prefixes.
//!
//! A prefix is `base64(random16 || tag16)` where `tag16` is the truncated
//! HMAC of the random part and the peer it was issued to. The server keeps
//! no per-prefix state; it only accepts prefixes carrying its own tag for
//! the paying peer.

use authpay::hmac::{hmac_sha256, verify_hmac_truncated};
use authpay::security::random_bytes;
use base64::Engine;

const RANDOM_LEN: usize = 16;
const TAG_LEN: usize = 16;

pub struct PrefixIssuer {
    secret: Vec<u8>,
}

fn tagged_material(random: &[u8], peer: &str) -> Vec<u8> {
    let mut material = Vec::with_capacity(random.len() + peer.len());
    material.extend_from_slice(random);
    material.extend_from_slice(peer.as_bytes());
    material
}

impl PrefixIssuer {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Issue a prefix bound to `peer` (empty for anonymous requests).
    pub fn issue(&self, peer: &str) -> String {
        let random: [u8; RANDOM_LEN] = random_bytes();
        let tag = hmac_sha256(&self.secret, &tagged_material(&random, peer));
        let mut raw = random.to_vec();
        raw.extend_from_slice(&tag[..TAG_LEN]);
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    pub fn verify(&self, prefix: &str, peer: &str) -> bool {
        let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(prefix) else {
            return false;
        };
        if raw.len() != RANDOM_LEN + TAG_LEN {
            return false;
        }
        let (random, tag) = raw.split_at(RANDOM_LEN);
        verify_hmac_truncated(&self.secret, &tagged_material(random, peer), tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_prefix_verifies_for_its_peer() {
        let issuer = PrefixIssuer::new(b"secret".to_vec());
        let prefix = issuer.issue("02aa");
        assert!(issuer.verify(&prefix, "02aa"));
        assert!(!issuer.verify(&prefix, "02bb"));
    }

    #[test]
    fn prefixes_are_unique() {
        let issuer = PrefixIssuer::new(b"secret".to_vec());
        assert_ne!(issuer.issue(""), issuer.issue(""));
    }

    #[test]
    fn foreign_or_garbled_prefix_rejected() {
        let ours = PrefixIssuer::new(b"secret".to_vec());
        let theirs = PrefixIssuer::new(b"other".to_vec());
        assert!(!ours.verify(&theirs.issue(""), ""));
        assert!(!ours.verify("not base64!", ""));
        assert!(!ours.verify("c2hvcnQ=", ""));
    }
}
