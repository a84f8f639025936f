//! Handshake messages, sessions and request signing.
//!
//! Handshake (`POST /.well-known/auth`):
//!
//! 1. client → `initialRequest` with its identity key, a fresh nonce and the
//!    certificates it wants from the server;
//! 2. server → `initialResponse` with its identity key, its session nonce,
//!    the certificates the client asked for, the certificates it wants from
//!    the client, and a signature binding both nonces;
//! 3. client → `certificateResponse`, only when the server asked for
//!    certificates.
//!
//! Every later request carries the identity headers and a signature over
//! [`canonical_request`], checked against the session named by
//! `x-bsv-auth-your-nonce`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::{RequestedCertificateSet, VerifiableCertificate, VerifiedCertificate};
use crate::security::{sha256, write_len_prefixed};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "messageType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum AuthMessage {
    InitialRequest {
        version: String,
        identity_key: String,
        initial_nonce: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_certificates: Option<RequestedCertificateSet>,
    },
    InitialResponse {
        version: String,
        identity_key: String,
        initial_nonce: String,
        your_nonce: String,
        #[serde(default)]
        certificates: Vec<VerifiableCertificate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_certificates: Option<RequestedCertificateSet>,
        signature: String,
    },
    CertificateResponse {
        version: String,
        identity_key: String,
        nonce: String,
        your_nonce: String,
        certificates: Vec<VerifiableCertificate>,
        signature: String,
    },
}

/// Bytes the server signs in its `initialResponse`.
pub fn initial_response_payload(
    client_nonce: &str,
    server_nonce: &str,
    server_identity: &str,
    certificates: &[VerifiableCertificate],
    requested: Option<&RequestedCertificateSet>,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    write_len_prefixed(&mut buf, b"initialResponse");
    write_len_prefixed(&mut buf, client_nonce.as_bytes());
    write_len_prefixed(&mut buf, server_nonce.as_bytes());
    write_len_prefixed(&mut buf, server_identity.as_bytes());
    write_len_prefixed(&mut buf, &sha256(&serde_json::to_vec(certificates)?));
    write_len_prefixed(&mut buf, &sha256(&serde_json::to_vec(&requested)?));
    Ok(buf)
}

/// Bytes the client signs in its `certificateResponse`.
pub fn certificate_response_payload(
    nonce: &str,
    server_nonce: &str,
    certificates: &[VerifiableCertificate],
) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    write_len_prefixed(&mut buf, b"certificateResponse");
    write_len_prefixed(&mut buf, nonce.as_bytes());
    write_len_prefixed(&mut buf, server_nonce.as_bytes());
    write_len_prefixed(&mut buf, &sha256(&serde_json::to_vec(certificates)?));
    Ok(buf)
}

/// Canonical bytes signed for a general request.
///
/// Covers the method, path with query, both nonces, the body digest and the
/// payment header, so a signature cannot be moved to another request or
/// have a payment swapped underneath it.
pub fn canonical_request(
    method: &str,
    path_and_query: &str,
    nonce: &str,
    your_nonce: &str,
    body: &[u8],
    payment_header: Option<&str>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    write_len_prefixed(&mut buf, method.to_ascii_uppercase().as_bytes());
    write_len_prefixed(&mut buf, path_and_query.as_bytes());
    write_len_prefixed(&mut buf, nonce.as_bytes());
    write_len_prefixed(&mut buf, your_nonce.as_bytes());
    write_len_prefixed(&mut buf, &sha256(body));
    write_len_prefixed(&mut buf, payment_header.unwrap_or("").as_bytes());
    buf
}

/// An authenticated relationship with one peer.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_identity_key: String,
    /// Nonce the server issued for this session; requests quote it as
    /// `x-bsv-auth-your-nonce`.
    pub session_nonce: String,
    /// Nonce the client sent in its `initialRequest`.
    pub peer_nonce: String,
    pub certificates: Vec<VerifiedCertificate>,
    /// False while the server still waits for requested certificates.
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
}

impl PeerSession {
    pub fn new(peer_identity_key: String, session_nonce: String, peer_nonce: String) -> Self {
        Self {
            peer_identity_key,
            session_nonce,
            peer_nonce,
            certificates: Vec::new(),
            authenticated: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, ttl_secs: u64) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 >= ttl_secs
    }
}
