//! Wire constants. Header names are a compatibility surface: changing any of
//! them breaks interoperability with deployed peers.

/// Version of the mutual-authentication protocol.
pub const AUTH_VERSION: &str = "0.1";

/// Version of the payment protocol advertised on 402 responses.
pub const PAYMENT_VERSION: &str = "1.0";

/// Path of the handshake endpoint.
pub const AUTH_ENDPOINT: &str = "/.well-known/auth";

pub const HEADER_AUTH_VERSION: &str = "x-bsv-auth-version";
pub const HEADER_IDENTITY_KEY: &str = "x-bsv-auth-identity-key";
pub const HEADER_NONCE: &str = "x-bsv-auth-nonce";
pub const HEADER_YOUR_NONCE: &str = "x-bsv-auth-your-nonce";
pub const HEADER_SIGNATURE: &str = "x-bsv-auth-signature";

pub const HEADER_PAYMENT: &str = "x-bsv-payment";
pub const HEADER_PAYMENT_VERSION: &str = "x-bsv-payment-version";
pub const HEADER_SATOSHIS_REQUIRED: &str = "x-bsv-payment-satoshis-required";
pub const HEADER_DERIVATION_PREFIX: &str = "x-bsv-payment-derivation-prefix";
pub const HEADER_SATOSHIS_PAID: &str = "x-bsv-payment-satoshis-paid";

/// Protocol identifier for deriving payment keys (BRC-29 style).
pub const PAYMENT_PROTOCOL_ID: &str = "3241645161d8";

/// Maximum accepted length of an encoded payment header.
pub const MAX_PAYMENT_HEADER_LEN: usize = 64 * 1024;

/// Number of random bytes in session and request nonces.
pub const NONCE_LEN: usize = 32;

/// Description attached to internalized payments.
pub const PAYMENT_DESCRIPTION: &str = "Payment for request";
