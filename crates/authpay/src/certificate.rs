//! Identity certificates with selectively revealable fields.
//!
//! A certificate binds a subject's identity key to a set of fields and is
//! signed by its certifier over a canonical encoding. Field values are
//! encrypted, each under its own symmetric key. The holder keeps those keys
//! in a master keyring and reveals a subset of fields to one verifier at a
//! time by re-wrapping the chosen keys under a secret only that verifier
//! shares with the subject ([`create_keyring_for_verifier`]).

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::error::{AuthPayError, WalletError};
use crate::hmac::hmac_sha256;
use crate::identity;
use crate::security::{random_bytes, write_len_prefixed};

/// Field name → encrypted value.
pub type CertificateFields = BTreeMap<String, String>;

/// Field name → encrypted field key. A master keyring wraps nothing; a
/// verifier keyring wraps each key for exactly one verifier.
pub type Keyring = BTreeMap<String, String>;

const AES_NONCE_LEN: usize = 12;
const KEYRING_CONTEXT: &[u8] = b"authpay-keyring";

/// A signed certificate as issued by a certifier. Never mutated after issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    #[serde(rename = "type")]
    pub cert_type: String,
    pub subject: String,
    pub serial_number: String,
    pub certifier: String,
    pub revocation_outpoint: String,
    pub signature: String,
    pub fields: CertificateFields,
}

impl Certificate {
    /// Canonical byte encoding of everything the certifier signs.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_len_prefixed(&mut buf, self.cert_type.as_bytes());
        write_len_prefixed(&mut buf, self.serial_number.as_bytes());
        write_len_prefixed(&mut buf, self.subject.as_bytes());
        write_len_prefixed(&mut buf, self.certifier.as_bytes());
        write_len_prefixed(&mut buf, self.revocation_outpoint.as_bytes());
        buf.extend_from_slice(&(self.fields.len() as u64).to_be_bytes());
        for (name, value) in &self.fields {
            write_len_prefixed(&mut buf, name.as_bytes());
            write_len_prefixed(&mut buf, value.as_bytes());
        }
        buf
    }

    /// Check the certifier's signature over the canonical encoding.
    pub fn verify_signature(&self) -> bool {
        identity::verify(&self.certifier, &self.canonical_bytes(), &self.signature)
    }
}

/// A certificate presented to a verifier together with its keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiableCertificate {
    #[serde(flatten)]
    pub certificate: Certificate,
    pub keyring: Keyring,
}

/// A certificate that passed verification, with its revealed plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCertificate {
    pub certificate: Certificate,
    pub revealed: BTreeMap<String, String>,
}

/// A certificate as held by its subject, with the master keyring.
#[derive(Debug, Clone)]
pub struct MasterCertificate {
    pub certificate: Certificate,
    pub master_keyring: Keyring,
}

impl MasterCertificate {
    /// Issue a certificate: encrypt every field under a fresh key and sign.
    ///
    /// Issuance authority is outside the protocol; this exists for
    /// certifier tooling, demos and tests.
    pub fn issue(
        certifier: &SecretKey,
        subject: &str,
        cert_type: &str,
        serial_number: &str,
        revocation_outpoint: &str,
        plaintext: &BTreeMap<String, String>,
    ) -> Result<Self, WalletError> {
        identity::parse_public_key(subject)?;

        let mut fields = CertificateFields::new();
        let mut master_keyring = Keyring::new();
        for (name, value) in plaintext {
            let field_key: [u8; 32] = random_bytes();
            fields.insert(name.clone(), encrypt(&field_key, value.as_bytes())?);
            master_keyring.insert(name.clone(), b64(&field_key));
        }

        let mut certificate = Certificate {
            cert_type: cert_type.to_string(),
            subject: subject.to_string(),
            serial_number: serial_number.to_string(),
            certifier: identity::identity_key_hex(certifier),
            revocation_outpoint: revocation_outpoint.to_string(),
            signature: String::new(),
            fields,
        };
        certificate.signature = identity::sign(certifier, &certificate.canonical_bytes());

        Ok(Self {
            certificate,
            master_keyring,
        })
    }
}

/// Key that wraps one field key for one (subject, verifier) pair.
fn wrapping_key(shared_secret: &[u8; 32], serial_number: &str, field: &str) -> [u8; 32] {
    let mut info = Vec::new();
    write_len_prefixed(&mut info, KEYRING_CONTEXT);
    write_len_prefixed(&mut info, serial_number.as_bytes());
    write_len_prefixed(&mut info, field.as_bytes());
    hmac_sha256(shared_secret, &info)
}

/// Derive a keyring revealing `fields` to the verifier whose ECDH secret
/// with the subject is `shared_secret`.
///
/// Pure: no storage, no wallet. A keyring derived for one verifier does not
/// decrypt anything for another, since each verifier shares a different
/// secret with the subject.
pub fn create_keyring_for_verifier(
    certificate: &Certificate,
    master_keyring: &Keyring,
    shared_secret: &[u8; 32],
    fields: &[String],
) -> Result<Keyring, WalletError> {
    let mut keyring = Keyring::new();
    for field in fields {
        if !certificate.fields.contains_key(field) {
            return Err(WalletError::Other(format!(
                "field '{field}' is not part of certificate {}",
                certificate.serial_number
            )));
        }
        let field_key = master_keyring
            .get(field)
            .ok_or_else(|| WalletError::Other(format!("no master key for field '{field}'")))
            .and_then(|k| unb64(k).map_err(WalletError::Other))?;
        let wrap = wrapping_key(shared_secret, &certificate.serial_number, field);
        keyring.insert(field.clone(), encrypt(&wrap, &field_key)?);
    }
    Ok(keyring)
}

/// Decrypt the fields a keyring reveals, using the verifier's ECDH secret
/// with the subject.
pub fn decrypt_fields(
    certificate: &Certificate,
    keyring: &Keyring,
    shared_secret: &[u8; 32],
) -> Result<BTreeMap<String, String>, AuthPayError> {
    let mut revealed = BTreeMap::new();
    for (field, wrapped) in keyring {
        let ciphertext = certificate.fields.get(field).ok_or_else(|| {
            AuthPayError::CertificateRejected(format!("keyring names unknown field '{field}'"))
        })?;
        let wrap = wrapping_key(shared_secret, &certificate.serial_number, field);
        let field_key = decrypt(&wrap, wrapped).map_err(|_| {
            AuthPayError::CertificateRejected(format!(
                "keyring entry for '{field}' does not decrypt for this verifier"
            ))
        })?;
        let key: [u8; 32] = field_key.as_slice().try_into().map_err(|_| {
            AuthPayError::CertificateRejected(format!("bad key length for '{field}'"))
        })?;
        let plaintext = decrypt(&key, ciphertext).map_err(|_| {
            AuthPayError::CertificateRejected(format!("field '{field}' failed to decrypt"))
        })?;
        let value = String::from_utf8(plaintext).map_err(|_| {
            AuthPayError::CertificateRejected(format!("field '{field}' is not UTF-8"))
        })?;
        revealed.insert(field.clone(), value);
    }
    Ok(revealed)
}

/// Decrypt fields with the master keyring (the subject's own view).
pub fn decrypt_with_master_keyring(
    certificate: &Certificate,
    master_keyring: &Keyring,
) -> Result<BTreeMap<String, String>, WalletError> {
    let mut out = BTreeMap::new();
    for (field, ciphertext) in &certificate.fields {
        let key_b64 = master_keyring
            .get(field)
            .ok_or_else(|| WalletError::Other(format!("no master key for field '{field}'")))?;
        let key: [u8; 32] = unb64(key_b64)
            .map_err(WalletError::Other)?
            .as_slice()
            .try_into()
            .map_err(|_| WalletError::Other("bad field key length".into()))?;
        let plaintext = decrypt(&key, ciphertext).map_err(WalletError::Other)?;
        out.insert(
            field.clone(),
            String::from_utf8(plaintext).map_err(|e| WalletError::Other(e.to_string()))?,
        );
    }
    Ok(out)
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64(s: &str) -> Result<Vec<u8>, String> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| format!("invalid base64: {e}"))
}

/// AES-256-GCM, stored as `base64(nonce || ciphertext)`.
fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String, WalletError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| WalletError::Other(format!("cipher init failed: {e}")))?;
    let nonce_bytes: [u8; AES_NONCE_LEN] = random_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| WalletError::Other(format!("encryption failed: {e}")))?;
    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(b64(&out))
}

fn decrypt(key: &[u8; 32], encoded: &str) -> Result<Vec<u8>, String> {
    let raw = unb64(encoded)?;
    if raw.len() <= AES_NONCE_LEN {
        return Err("ciphertext too short".to_string());
    }
    let (nonce, ciphertext) = raw.split_at(AES_NONCE_LEN);
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| format!("cipher init failed: {e}"))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| "decryption failed".to_string())
}

/// Certificates one party asks the other to present.
///
/// `types` maps each certificate type to the fields that must be revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestedCertificateSet {
    pub certifiers: Vec<String>,
    pub types: BTreeMap<String, Vec<String>>,
}

impl RequestedCertificateSet {
    pub fn new(certifiers: Vec<String>, types: BTreeMap<String, Vec<String>>) -> Self {
        Self { certifiers, types }
    }

    pub fn is_empty(&self) -> bool {
        self.certifiers.is_empty() && self.types.is_empty()
    }

    /// A usable request names at least one certifier and one type, and every
    /// type asks for at least one field.
    pub fn validate(&self) -> Result<(), AuthPayError> {
        if self.certifiers.is_empty() {
            return Err(AuthPayError::InvalidCertificateRequest(
                "at least one certifier is required".into(),
            ));
        }
        if self.types.is_empty() {
            return Err(AuthPayError::InvalidCertificateRequest(
                "at least one certificate type is required".into(),
            ));
        }
        if let Some((t, _)) = self.types.iter().find(|(_, fields)| fields.is_empty()) {
            return Err(AuthPayError::InvalidCertificateRequest(format!(
                "type '{t}' requests no fields"
            )));
        }
        Ok(())
    }
}
