//! Payment remittance and its `x-bsv-payment` header encoding.
//!
//! The header value is base64 of a JSON object. JSON string escaping keeps
//! the encoding injective whatever characters the fields contain, and
//! base64 keeps it header-safe.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::MAX_PAYMENT_HEADER_LEN;
use crate::error::AuthPayError;
use crate::security::{sha256, write_len_prefixed};
use crate::wallet::WalletPaymentRemittance;

/// Metadata describing how a payment output was derived and who sent it,
/// together with the transaction that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PaymentRemittance {
    pub derivation_prefix: String,
    pub derivation_suffix: String,
    pub sender_identity_key: String,
    #[serde(with = "base64_bytes")]
    pub transaction: Vec<u8>,
}

/// Identifies the output a remittance funds: digest of the
/// `(derivation_prefix, derivation_suffix)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemittanceId(pub [u8; 32]);

impl RemittanceId {
    pub fn new(derivation_prefix: &str, derivation_suffix: &str) -> Self {
        let mut buf = Vec::new();
        write_len_prefixed(&mut buf, derivation_prefix.as_bytes());
        write_len_prefixed(&mut buf, derivation_suffix.as_bytes());
        Self(sha256(&buf))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for RemittanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl PaymentRemittance {
    pub fn id(&self) -> RemittanceId {
        RemittanceId::new(&self.derivation_prefix, &self.derivation_suffix)
    }

    /// The subset of the remittance the receiving wallet needs.
    pub fn wallet_remittance(&self) -> WalletPaymentRemittance {
        WalletPaymentRemittance {
            derivation_prefix: self.derivation_prefix.clone(),
            derivation_suffix: self.derivation_suffix.clone(),
            sender_identity_key: self.sender_identity_key.clone(),
        }
    }
}

/// Encode a remittance for the `x-bsv-payment` header.
pub fn encode_payment(remittance: &PaymentRemittance) -> Result<String, AuthPayError> {
    let json = serde_json::to_vec(remittance)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(&json))
}

/// Decode an `x-bsv-payment` header value.
///
/// Every failure is a `MalformedPaymentHeader`; missing or empty fields are
/// never defaulted.
pub fn decode_payment(encoded: &str) -> Result<PaymentRemittance, AuthPayError> {
    if encoded.len() > MAX_PAYMENT_HEADER_LEN {
        return Err(AuthPayError::MalformedPaymentHeader(format!(
            "header exceeds {MAX_PAYMENT_HEADER_LEN} bytes"
        )));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuthPayError::MalformedPaymentHeader(format!("invalid base64: {e}")))?;
    let remittance: PaymentRemittance = serde_json::from_slice(&bytes)
        .map_err(|e| AuthPayError::MalformedPaymentHeader(format!("invalid JSON: {e}")))?;

    let empty = [
        ("derivationPrefix", remittance.derivation_prefix.is_empty()),
        ("derivationSuffix", remittance.derivation_suffix.is_empty()),
        ("senderIdentityKey", remittance.sender_identity_key.is_empty()),
        ("transaction", remittance.transaction.is_empty()),
    ];
    if let Some((field, _)) = empty.iter().find(|(_, is_empty)| *is_empty) {
        return Err(AuthPayError::MalformedPaymentHeader(format!(
            "{field} must not be empty"
        )));
    }
    Ok(remittance)
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
