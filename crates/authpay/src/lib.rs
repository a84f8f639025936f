//! Authenticated pay-per-request HTTP protocol.
//!
//! A client proves its identity to a server through a mutual certificate
//! handshake, then pays for each request with a transaction whose output is
//! derived from a per-payment key path. The server prices every request,
//! internalizes the attached payment exactly once and only then lets the
//! request through.
//!
//! # Pieces
//!
//! - [`certificate`]: certificates, field encryption, per-verifier keyrings
//! - [`negotiator`]: [`CertificateNegotiator`]: select/prove and verify certificates
//! - [`remittance`]: [`PaymentRemittance`] and its header codec
//! - [`wallet`]: the [`Wallet`] capability both sides consume
//! - [`replay_store`]: atomic claim of remittances already internalized
//! - [`revocation`]: certificate revocation oracles
//! - [`auth`]: handshake messages, sessions, request signing
//!
//! The client lives in `authpay-client`, the middleware in `authpay-server`
//! and an in-memory wallet in `authpay-wallet`.
//!
//! # Quick example (remittance header)
//!
//! ```
//! use authpay::{decode_payment, encode_payment, PaymentRemittance};
//!
//! let remittance = PaymentRemittance {
//!     derivation_prefix: "cHJlZml4".into(),
//!     derivation_suffix: "c3VmZml4".into(),
//!     sender_identity_key: "02aa".into(),
//!     transaction: vec![0xbe, 0xef],
//! };
//! let header = encode_payment(&remittance).unwrap();
//! assert_eq!(decode_payment(&header).unwrap(), remittance);
//! ```

// Core types
pub mod auth;
pub mod certificate;
pub mod constants;
pub mod error;
pub mod hmac;
pub mod identity;
pub mod remittance;
pub mod security;
pub mod wallet;

// Collaborators backed by storage or the network
#[cfg(feature = "full")]
pub mod negotiator;
#[cfg(feature = "full")]
pub mod replay_store;
#[cfg(feature = "full")]
pub mod revocation;

// Re-exports
pub use auth::{AuthMessage, PeerSession};
pub use certificate::{
    Certificate, Keyring, MasterCertificate, RequestedCertificateSet, VerifiableCertificate,
    VerifiedCertificate,
};
pub use constants::*;
pub use error::{AuthPayError, WalletError};
pub use remittance::{decode_payment, encode_payment, PaymentRemittance, RemittanceId};
pub use wallet::Wallet;

#[cfg(feature = "full")]
pub use negotiator::CertificateNegotiator;
#[cfg(feature = "full")]
pub use replay_store::{InMemoryReplayStore, ReplayStore, SqliteReplayStore};
#[cfg(feature = "full")]
pub use revocation::{HttpRevocationOracle, InMemoryRevocationOracle, RevocationOracle};
