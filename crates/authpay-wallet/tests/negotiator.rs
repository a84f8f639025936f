//! Certificate negotiation between two in-memory wallets.

use std::collections::BTreeMap;
use std::sync::Arc;

use authpay::certificate::MasterCertificate;
use authpay::identity::{identity_key_hex, random_secret_key};
use authpay::{
    AuthPayError, CertificateNegotiator, InMemoryRevocationOracle, RequestedCertificateSet,
    Wallet,
};
use authpay_wallet::{MemoryWallet, PrivilegePolicy};
use secp256k1::SecretKey;

const CERT_TYPE: &str = "membership";
const OUTPOINT: &str = "feedface.0";

struct Fixture {
    certifier: SecretKey,
    holder: Arc<MemoryWallet>,
    oracle: Arc<InMemoryRevocationOracle>,
}

impl Fixture {
    fn new() -> Self {
        let certifier = random_secret_key();
        let holder = Arc::new(MemoryWallet::random());
        let mc = issue(&certifier, &holder.identity_key(), "serial-1");
        holder.add_master_certificate(mc).unwrap();
        Self {
            certifier,
            holder,
            oracle: Arc::new(InMemoryRevocationOracle::new()),
        }
    }

    fn request(&self, fields: &[&str]) -> RequestedCertificateSet {
        RequestedCertificateSet::new(
            vec![identity_key_hex(&self.certifier)],
            BTreeMap::from([(
                CERT_TYPE.to_string(),
                fields.iter().map(|f| f.to_string()).collect(),
            )]),
        )
    }

    fn negotiator(
        &self,
        wallet: Arc<MemoryWallet>,
    ) -> CertificateNegotiator<MemoryWallet, InMemoryRevocationOracle> {
        CertificateNegotiator::new(wallet, self.oracle.clone())
    }
}

fn issue(certifier: &SecretKey, subject: &str, serial: &str) -> MasterCertificate {
    MasterCertificate::issue(
        certifier,
        subject,
        CERT_TYPE,
        serial,
        OUTPOINT,
        &BTreeMap::from([
            ("name".to_string(), "Alice".to_string()),
            ("tier".to_string(), "gold".to_string()),
        ]),
    )
    .unwrap()
}

#[tokio::test]
async fn verifier_sees_only_requested_fields() {
    let fx = Fixture::new();
    let verifier = Arc::new(MemoryWallet::random());
    let required = fx.request(&["tier"]);

    let presented = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap();
    assert_eq!(presented.len(), 1);

    let verified = fx
        .negotiator(verifier.clone())
        .verify_certificates(&required, &presented, &fx.holder.identity_key())
        .await
        .unwrap();
    assert_eq!(verified[0].revealed.get("tier").map(String::as_str), Some("gold"));
    assert!(!verified[0].revealed.contains_key("name"));
}

#[tokio::test]
async fn keyring_for_one_verifier_fails_for_another() {
    let fx = Fixture::new();
    let verifier_a = Arc::new(MemoryWallet::random());
    let verifier_b = Arc::new(MemoryWallet::random());
    let required = fx.request(&["name"]);

    let for_a = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&required, &verifier_a.identity_key())
        .await
        .unwrap();

    let err = fx
        .negotiator(verifier_b)
        .verify_certificates(&required, &for_a, &fx.holder.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::CertificateRejected(_)));
}

#[tokio::test]
async fn revoked_certificate_is_rejected() {
    let fx = Fixture::new();
    let verifier = Arc::new(MemoryWallet::random());
    let required = fx.request(&["name"]);
    let presented = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap();

    fx.oracle.revoke(OUTPOINT);
    let err = fx
        .negotiator(verifier)
        .verify_certificates(&required, &presented, &fx.holder.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::CertificateRejected(_)));
}

#[tokio::test]
async fn unreachable_oracle_fails_closed() {
    let fx = Fixture::new();
    let verifier = Arc::new(MemoryWallet::random());
    let required = fx.request(&["name"]);
    let presented = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap();

    fx.oracle.set_unavailable(true);
    let err = fx
        .negotiator(verifier)
        .verify_certificates(&required, &presented, &fx.holder.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::CertificateRejected(_)));
}

#[tokio::test]
async fn certificate_presented_for_someone_else_is_rejected() {
    let fx = Fixture::new();
    let verifier = Arc::new(MemoryWallet::random());
    let impostor = MemoryWallet::random();
    let required = fx.request(&["name"]);
    let presented = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap();

    let err = fx
        .negotiator(verifier)
        .verify_certificates(&required, &presented, &impostor.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::CertificateRejected(_)));
}

#[tokio::test]
async fn unknown_certifier_yields_not_found() {
    let fx = Fixture::new();
    let verifier = MemoryWallet::random();
    let required = RequestedCertificateSet::new(
        vec![identity_key_hex(&random_secret_key())],
        BTreeMap::from([(CERT_TYPE.to_string(), vec!["name".to_string()])]),
    );
    let err = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::CertificateNotFound(_)));
}

#[tokio::test]
async fn empty_request_is_invalid() {
    let fx = Fixture::new();
    let verifier = MemoryWallet::random();
    let err = fx
        .negotiator(fx.holder.clone())
        .request_certificates(&RequestedCertificateSet::default(), &verifier.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::InvalidCertificateRequest(_)));
}

#[tokio::test]
async fn privileged_access_without_reason_is_denied() {
    let fx = Fixture::new();
    let verifier = MemoryWallet::random();
    let err = fx
        .negotiator(fx.holder.clone())
        .with_privileged(None)
        .request_certificates(&fx.request(&["name"]), &verifier.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::PrivilegedOperationDenied(_)));
}

#[tokio::test]
async fn privileged_access_follows_wallet_policy() {
    let certifier = random_secret_key();
    let oracle = Arc::new(InMemoryRevocationOracle::new());
    let verifier = MemoryWallet::random();
    let required = RequestedCertificateSet::new(
        vec![identity_key_hex(&certifier)],
        BTreeMap::from([(CERT_TYPE.to_string(), vec!["name".to_string()])]),
    );

    // Default policy refuses even with a reason.
    let strict = Arc::new(MemoryWallet::random());
    strict
        .add_privileged_certificate(issue(&certifier, &strict.identity_key(), "p-1"))
        .unwrap();
    let err = CertificateNegotiator::new(strict, oracle.clone())
        .with_privileged(Some("compliance check".into()))
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthPayError::PrivilegedOperationDenied(_)));

    let permissive =
        Arc::new(MemoryWallet::random().with_privilege_policy(PrivilegePolicy::AllowWithReason));
    permissive
        .add_privileged_certificate(issue(&certifier, &permissive.identity_key(), "p-2"))
        .unwrap();
    let proven = CertificateNegotiator::new(permissive, oracle)
        .with_privileged(Some("compliance check".into()))
        .request_certificates(&required, &verifier.identity_key())
        .await
        .unwrap();
    assert_eq!(proven[0].certificate.serial_number, "p-2");
}
