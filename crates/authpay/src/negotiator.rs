//! Certificate exchange for the mutual-authentication handshake.
//!
//! The same negotiator serves both roles: as holder it selects and proves
//! certificates for a verifier, as verifier it checks what a peer presented.

use std::collections::HashSet;
use std::sync::Arc;

use crate::certificate::{
    decrypt_fields, RequestedCertificateSet, VerifiableCertificate, VerifiedCertificate,
};
use crate::error::AuthPayError;
use crate::revocation::RevocationOracle;
use crate::wallet::{ListCertificatesArgs, ProveCertificateArgs, Wallet};

/// Privileged certificate access requested by the caller.
///
/// Whether a reason is sufficient is the wallet's policy; the negotiator
/// only refuses outright when no reason is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegedAccess {
    pub reason: Option<String>,
}

pub struct CertificateNegotiator<W, O> {
    wallet: Arc<W>,
    oracle: Arc<O>,
    privileged: Option<PrivilegedAccess>,
}

impl<W: Wallet, O: RevocationOracle> CertificateNegotiator<W, O> {
    pub fn new(wallet: Arc<W>, oracle: Arc<O>) -> Self {
        Self {
            wallet,
            oracle,
            privileged: None,
        }
    }

    /// Use privileged certificate storage for holder-side lookups.
    pub fn with_privileged(mut self, reason: Option<String>) -> Self {
        self.privileged = Some(PrivilegedAccess { reason });
        self
    }

    fn privilege_flags(&self) -> Result<(Option<bool>, Option<String>), AuthPayError> {
        match &self.privileged {
            None => Ok((None, None)),
            Some(PrivilegedAccess { reason }) => match reason.as_deref().map(str::trim) {
                Some(r) if !r.is_empty() => Ok((Some(true), Some(r.to_string()))),
                _ => Err(AuthPayError::PrivilegedOperationDenied(
                    "privileged access requested without a reason".into(),
                )),
            },
        }
    }

    /// Holder side: find stored certificates matching `required` and prove
    /// the requested fields to `verifier`.
    ///
    /// Each (certifier, type) pair is queried separately with exact string
    /// matching. The returned keyrings are scoped to `verifier` only.
    pub async fn request_certificates(
        &self,
        required: &RequestedCertificateSet,
        verifier: &str,
    ) -> Result<Vec<VerifiableCertificate>, AuthPayError> {
        required.validate()?;
        let (privileged, privileged_reason) = self.privilege_flags()?;

        let mut seen = HashSet::new();
        let mut proven = Vec::new();
        for certifier in &required.certifiers {
            for (cert_type, fields) in &required.types {
                let listed = self
                    .wallet
                    .list_certificates(ListCertificatesArgs {
                        certifiers: vec![certifier.clone()],
                        types: vec![cert_type.clone()],
                        limit: None,
                        offset: None,
                        privileged,
                        privileged_reason: privileged_reason.clone(),
                    })
                    .await?;

                for certificate in listed.certificates {
                    if &certificate.certifier != certifier || &certificate.cert_type != cert_type {
                        continue;
                    }
                    if !seen.insert((certificate.certifier.clone(), certificate.serial_number.clone())) {
                        continue;
                    }
                    let proof = self
                        .wallet
                        .prove_certificate(ProveCertificateArgs {
                            certificate: certificate.clone(),
                            fields_to_reveal: fields.clone(),
                            verifier: verifier.to_string(),
                            privileged,
                            privileged_reason: privileged_reason.clone(),
                        })
                        .await?;
                    proven.push(VerifiableCertificate {
                        certificate,
                        keyring: proof.keyring_for_verifier,
                    });
                }
            }
        }

        if proven.is_empty() {
            return Err(AuthPayError::CertificateNotFound(format!(
                "no stored certificate matches certifiers {:?} and types {:?}",
                required.certifiers,
                required.types.keys().collect::<Vec<_>>()
            )));
        }
        tracing::debug!(count = proven.len(), verifier = %verifier, "proved certificates");
        Ok(proven)
    }

    /// Verifier side: check every certificate `sender` presented against
    /// `required` and decrypt the revealed fields.
    ///
    /// Fails closed: an unreachable revocation oracle rejects the
    /// certificate. At least one certificate must pass.
    pub async fn verify_certificates(
        &self,
        required: &RequestedCertificateSet,
        presented: &[VerifiableCertificate],
        sender: &str,
    ) -> Result<Vec<VerifiedCertificate>, AuthPayError> {
        required.validate()?;
        if presented.is_empty() {
            return Err(AuthPayError::CertificateRejected(
                "no certificates presented".into(),
            ));
        }

        let mut verified = Vec::with_capacity(presented.len());
        for vc in presented {
            verified.push(self.verify_one(required, vc, sender).await?);
        }
        Ok(verified)
    }

    async fn verify_one(
        &self,
        required: &RequestedCertificateSet,
        vc: &VerifiableCertificate,
        sender: &str,
    ) -> Result<VerifiedCertificate, AuthPayError> {
        let cert = &vc.certificate;
        let reject = |reason: String| {
            tracing::warn!(
                serial = %cert.serial_number,
                certifier = %cert.certifier,
                reason = %reason,
                "certificate rejected"
            );
            AuthPayError::CertificateRejected(reason)
        };

        if !required.certifiers.iter().any(|c| c == &cert.certifier) {
            return Err(reject(format!("certifier {} is not accepted", cert.certifier)));
        }
        let Some(requested_fields) = required.types.get(&cert.cert_type) else {
            return Err(reject(format!("type {} was not requested", cert.cert_type)));
        };
        if cert.subject != sender {
            return Err(reject("certificate subject is not the sender".into()));
        }
        if !cert.verify_signature() {
            return Err(reject("invalid certifier signature".into()));
        }
        match self.oracle.is_unspent(&cert.revocation_outpoint).await {
            Ok(true) => {}
            Ok(false) => return Err(reject("certificate has been revoked".into())),
            Err(e) => {
                tracing::error!(error = %e, "revocation check failed");
                return Err(reject(format!("revocation status unavailable: {e}")));
            }
        }

        let shared = self.wallet.derive_shared_secret(&cert.subject).await?;
        let revealed = decrypt_fields(cert, &vc.keyring, &shared)?;
        if let Some(missing) = requested_fields.iter().find(|f| !revealed.contains_key(*f)) {
            return Err(reject(format!("requested field '{missing}' was not revealed")));
        }

        Ok(VerifiedCertificate {
            certificate: cert.clone(),
            revealed,
        })
    }
}
