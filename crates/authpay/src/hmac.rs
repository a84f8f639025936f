use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Raw HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Verify a raw HMAC-SHA256 tag (possibly truncated to `tag.len()` bytes)
/// in constant time.
pub fn verify_hmac_truncated(secret: &[u8], body: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    !tag.is_empty() && mac.verify_truncated_left(tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_case_2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_truncated_tag() {
        let full = hmac_sha256(b"k", b"msg");
        assert!(verify_hmac_truncated(b"k", b"msg", &full));
        assert!(verify_hmac_truncated(b"k", b"msg", &full[..16]));
        assert!(!verify_hmac_truncated(b"k", b"other", &full[..16]));
        assert!(!verify_hmac_truncated(b"other-key", b"msg", &full[..16]));
        assert!(!verify_hmac_truncated(b"k", b"msg", &[]));
    }
}
