//! secp256k1 identity keys, signatures, ECDH and payment key derivation.
//!
//! Identity keys travel as compressed public keys in hex. Signatures are
//! DER-encoded ECDSA over the SHA-256 of the signed bytes, also hex.

use secp256k1::ecdh::SharedSecret;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Scalar, SecretKey, SECP256K1};

use crate::error::WalletError;
use crate::hmac::hmac_sha256;
use crate::security::{random_bytes, sha256};

/// Parse a compressed (or uncompressed) public key from hex.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey, WalletError> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| WalletError::KeyError(format!("invalid public key hex: {e}")))?;
    PublicKey::from_slice(&bytes)
        .map_err(|e| WalletError::KeyError(format!("invalid public key: {e}")))
}

/// Parse a 32-byte secret key from hex.
pub fn parse_secret_key(hex_key: &str) -> Result<SecretKey, WalletError> {
    let bytes = hex::decode(hex_key.trim_start_matches("0x"))
        .map_err(|e| WalletError::KeyError(format!("invalid secret key hex: {e}")))?;
    SecretKey::from_slice(&bytes)
        .map_err(|e| WalletError::KeyError(format!("invalid secret key: {e}")))
}

/// Generate a fresh random secret key.
pub fn random_secret_key() -> SecretKey {
    loop {
        let bytes: [u8; 32] = random_bytes();
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            return key;
        }
    }
}

/// Hex identity key for a secret key.
pub fn identity_key_hex(secret: &SecretKey) -> String {
    public_key_hex(&PublicKey::from_secret_key(SECP256K1, secret))
}

pub fn public_key_hex(key: &PublicKey) -> String {
    hex::encode(key.serialize())
}

/// Sign `data` (hashed with SHA-256) and return the DER signature in hex.
pub fn sign(secret: &SecretKey, data: &[u8]) -> String {
    let msg = Message::from_digest(sha256(data));
    let sig = SECP256K1.sign_ecdsa(&msg, secret);
    hex::encode(&sig.serialize_der()[..])
}

/// Verify a hex DER signature over `data` by the hex identity key `signer`.
///
/// Malformed keys or signatures verify as `false`.
pub fn verify(signer: &str, data: &[u8], signature_hex: &str) -> bool {
    let Ok(key) = parse_public_key(signer) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut sig) = Signature::from_der(&sig_bytes) else {
        return false;
    };
    sig.normalize_s();
    let msg = Message::from_digest(sha256(data));
    SECP256K1.verify_ecdsa(&msg, &sig, &key).is_ok()
}

/// ECDH shared secret between our secret key and a counterparty public key.
/// Symmetric: both sides derive the same 32 bytes.
pub fn shared_secret(secret: &SecretKey, counterparty: &PublicKey) -> [u8; 32] {
    SharedSecret::new(counterparty, secret).secret_bytes()
}

/// Invoice number binding a derived key to a protocol and key id.
fn invoice_number(protocol_id: &str, key_id: &str) -> String {
    format!("2-{protocol_id}-{key_id}")
}

fn derivation_tweak(shared: &[u8; 32], protocol_id: &str, key_id: &str) -> Result<Scalar, WalletError> {
    let tweak = hmac_sha256(shared, invoice_number(protocol_id, key_id).as_bytes());
    Scalar::from_be_bytes(tweak).map_err(|_| WalletError::KeyError("derivation tweak out of range".into()))
}

/// Public key the counterparty will own for `(protocol_id, key_id)`.
///
/// The sender computes this; the counterparty can derive the matching
/// private key with [`derive_own_secret_key`].
pub fn derive_counterparty_public_key(
    own: &SecretKey,
    counterparty: &PublicKey,
    protocol_id: &str,
    key_id: &str,
) -> Result<PublicKey, WalletError> {
    let tweak = derivation_tweak(&shared_secret(own, counterparty), protocol_id, key_id)?;
    counterparty
        .add_exp_tweak(SECP256K1, &tweak)
        .map_err(|e| WalletError::KeyError(format!("key derivation failed: {e}")))
}

/// Our own private key for `(protocol_id, key_id)` with `counterparty`.
pub fn derive_own_secret_key(
    own: &SecretKey,
    counterparty: &PublicKey,
    protocol_id: &str,
    key_id: &str,
) -> Result<SecretKey, WalletError> {
    let tweak = derivation_tweak(&shared_secret(own, counterparty), protocol_id, key_id)?;
    own.add_tweak(&tweak)
        .map_err(|e| WalletError::KeyError(format!("key derivation failed: {e}")))
}

/// Pay-to-public-key locking script (`<push33> <pubkey> OP_CHECKSIG`) in hex.
pub fn p2pk_locking_script(key: &PublicKey) -> String {
    format!("21{}ac", public_key_hex(key))
}
