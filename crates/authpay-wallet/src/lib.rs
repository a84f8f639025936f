//! In-memory wallet for authpay.
//!
//! Implements the [`Wallet`] capability without a ledger: funds are a plain
//! balance, transactions are a small JSON envelope and certificates live in
//! process memory. The demo binaries and the integration tests run against
//! it; production deployments plug in a real wallet instead.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, RwLock};

use authpay::certificate::{create_keyring_for_verifier, Certificate, MasterCertificate};
use authpay::constants::PAYMENT_PROTOCOL_ID;
use authpay::error::WalletError;
use authpay::identity;
use authpay::security::random_bytes;
use authpay::wallet::{
    CreateActionArgs, CreateActionResult, GetPublicKeyArgs, InternalizeActionArgs,
    InternalizeActionResult, InternalizeProtocol, ListCertificatesArgs, ListCertificatesResult,
    ProveCertificateArgs, ProveCertificateResult, Wallet,
};
use rand::seq::SliceRandom;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

/// Whether privileged certificate storage may be used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrivilegePolicy {
    /// Every privileged request is refused.
    #[default]
    Deny,
    /// Privileged requests are allowed when they carry a non-empty reason.
    AllowWithReason,
}

/// Transaction envelope produced by [`MemoryWallet::create_action`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTransaction {
    pub txid: String,
    pub outputs: Vec<MemoryOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryOutput {
    pub satoshis: u64,
    pub locking_script: String,
}

impl MemoryTransaction {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        serde_json::from_slice(bytes)
            .map_err(|e| WalletError::InvalidTransaction(format!("unreadable transaction: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WalletError> {
        serde_json::to_vec(self).map_err(|e| WalletError::Other(e.to_string()))
    }
}

#[derive(Default)]
struct Ledger {
    balance: u64,
    credited: u64,
    internalized: HashSet<String>,
}

#[derive(Default)]
struct CertificateStore {
    everyday: Vec<MasterCertificate>,
    privileged: Vec<MasterCertificate>,
}

impl CertificateStore {
    fn pool(&self, privileged: bool) -> &[MasterCertificate] {
        if privileged {
            &self.privileged
        } else {
            &self.everyday
        }
    }
}

pub struct MemoryWallet {
    secret: SecretKey,
    identity: String,
    policy: PrivilegePolicy,
    ledger: Mutex<Ledger>,
    certificates: RwLock<CertificateStore>,
}

impl MemoryWallet {
    pub fn new(secret: SecretKey) -> Self {
        Self {
            identity: identity::identity_key_hex(&secret),
            secret,
            policy: PrivilegePolicy::default(),
            ledger: Mutex::new(Ledger::default()),
            certificates: RwLock::new(CertificateStore::default()),
        }
    }

    /// Create a wallet from a hex-encoded secret key (with or without 0x prefix).
    pub fn from_hex(secret_hex: &str) -> Result<Self, WalletError> {
        Ok(Self::new(identity::parse_secret_key(secret_hex)?))
    }

    /// Wallet with a fresh random key.
    pub fn random() -> Self {
        Self::new(identity::random_secret_key())
    }

    pub fn with_balance(self, satoshis: u64) -> Self {
        self.lock_ledger().balance = satoshis;
        self
    }

    pub fn with_privilege_policy(mut self, policy: PrivilegePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Spendable satoshis.
    pub fn balance(&self) -> u64 {
        self.lock_ledger().balance
    }

    /// Total satoshis received through internalized payments.
    pub fn credited(&self) -> u64 {
        self.lock_ledger().credited
    }

    /// Number of transactions internalized so far.
    pub fn internalized_count(&self) -> usize {
        self.lock_ledger().internalized.len()
    }

    /// Store a certificate this wallet is the subject of.
    pub fn add_master_certificate(&self, certificate: MasterCertificate) -> Result<(), WalletError> {
        self.store_certificate(certificate, false)
    }

    /// Store a certificate only reachable through privileged access.
    pub fn add_privileged_certificate(
        &self,
        certificate: MasterCertificate,
    ) -> Result<(), WalletError> {
        self.store_certificate(certificate, true)
    }

    fn store_certificate(
        &self,
        certificate: MasterCertificate,
        privileged: bool,
    ) -> Result<(), WalletError> {
        if certificate.certificate.subject != self.identity {
            return Err(WalletError::Other(
                "certificate subject is not this wallet".to_string(),
            ));
        }
        if !certificate.certificate.verify_signature() {
            return Err(WalletError::Other(
                "certificate signature does not verify".to_string(),
            ));
        }
        let mut store = self
            .certificates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if privileged {
            store.privileged.push(certificate);
        } else {
            store.everyday.push(certificate);
        }
        Ok(())
    }

    fn lock_ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| {
            tracing::error!("wallet ledger mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Resolve the `privileged` / `privileged_reason` pair against the policy.
    fn check_privilege(
        &self,
        privileged: Option<bool>,
        reason: Option<&str>,
    ) -> Result<bool, WalletError> {
        if privileged != Some(true) {
            return Ok(false);
        }
        match self.policy {
            PrivilegePolicy::Deny => Err(WalletError::PrivilegedOperationDenied(
                "privileged access is disabled for this wallet".to_string(),
            )),
            PrivilegePolicy::AllowWithReason => match reason.map(str::trim) {
                Some(r) if !r.is_empty() => Ok(true),
                _ => Err(WalletError::PrivilegedOperationDenied(
                    "privileged access requires a reason".to_string(),
                )),
            },
        }
    }

    /// Public key of the payment output this wallet expects for a remittance.
    fn payment_key(
        &self,
        sender: &str,
        derivation_prefix: &str,
        derivation_suffix: &str,
    ) -> Result<PublicKey, WalletError> {
        let sender = identity::parse_public_key(sender)?;
        let key_id = format!("{derivation_prefix} {derivation_suffix}");
        let own = identity::derive_own_secret_key(&self.secret, &sender, PAYMENT_PROTOCOL_ID, &key_id)?;
        Ok(PublicKey::from_secret_key(SECP256K1, &own))
    }
}

fn matches_filter(values: &[String], value: &str) -> bool {
    values.is_empty() || values.iter().any(|v| v == value)
}

impl Wallet for MemoryWallet {
    fn identity_key(&self) -> String {
        self.identity.clone()
    }

    async fn get_public_key(&self, args: GetPublicKeyArgs) -> Result<String, WalletError> {
        if args.protocol_id.is_empty() {
            return Ok(self.identity.clone());
        }
        let counterparty = match args.counterparty.as_deref() {
            Some(key) => identity::parse_public_key(key)?,
            None => PublicKey::from_secret_key(SECP256K1, &self.secret),
        };
        let key = if args.for_self {
            let own = identity::derive_own_secret_key(
                &self.secret,
                &counterparty,
                &args.protocol_id,
                &args.key_id,
            )?;
            PublicKey::from_secret_key(SECP256K1, &own)
        } else {
            identity::derive_counterparty_public_key(
                &self.secret,
                &counterparty,
                &args.protocol_id,
                &args.key_id,
            )?
        };
        Ok(identity::public_key_hex(&key))
    }

    async fn create_signature(&self, data: &[u8]) -> Result<String, WalletError> {
        Ok(identity::sign(&self.secret, data))
    }

    async fn derive_shared_secret(&self, counterparty: &str) -> Result<[u8; 32], WalletError> {
        let key = identity::parse_public_key(counterparty)?;
        Ok(identity::shared_secret(&self.secret, &key))
    }

    async fn list_certificates(
        &self,
        args: ListCertificatesArgs,
    ) -> Result<ListCertificatesResult, WalletError> {
        let privileged =
            self.check_privilege(args.privileged, args.privileged_reason.as_deref())?;
        let store = self
            .certificates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let matching: Vec<Certificate> = store
            .pool(privileged)
            .iter()
            .map(|mc| &mc.certificate)
            .filter(|c| matches_filter(&args.certifiers, &c.certifier))
            .filter(|c| matches_filter(&args.types, &c.cert_type))
            .cloned()
            .collect();

        let total_certificates = matching.len() as u32;
        let offset = args.offset.unwrap_or(0) as usize;
        let limit = args.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(ListCertificatesResult {
            total_certificates,
            certificates: matching.into_iter().skip(offset).take(limit).collect(),
        })
    }

    async fn prove_certificate(
        &self,
        args: ProveCertificateArgs,
    ) -> Result<ProveCertificateResult, WalletError> {
        let privileged =
            self.check_privilege(args.privileged, args.privileged_reason.as_deref())?;
        let verifier = identity::parse_public_key(&args.verifier)?;

        let store = self
            .certificates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let master = store
            .pool(privileged)
            .iter()
            .find(|mc| mc.certificate == args.certificate)
            .ok_or_else(|| {
                WalletError::CertificateNotFound(format!(
                    "serial {} from certifier {}",
                    args.certificate.serial_number, args.certificate.certifier
                ))
            })?;

        let shared = identity::shared_secret(&self.secret, &verifier);
        let keyring_for_verifier = create_keyring_for_verifier(
            &master.certificate,
            &master.master_keyring,
            &shared,
            &args.fields_to_reveal,
        )?;
        Ok(ProveCertificateResult {
            keyring_for_verifier,
        })
    }

    async fn create_action(
        &self,
        args: CreateActionArgs,
        originator: Option<&str>,
    ) -> Result<CreateActionResult, WalletError> {
        if args.outputs.is_empty() {
            return Err(WalletError::InvalidTransaction(
                "action has no outputs".to_string(),
            ));
        }
        let mut outputs = Vec::with_capacity(args.outputs.len());
        let mut total: u64 = 0;
        for output in &args.outputs {
            hex::decode(&output.locking_script).map_err(|e| {
                WalletError::InvalidTransaction(format!("locking script is not hex: {e}"))
            })?;
            total = total.checked_add(output.satoshis).ok_or_else(|| {
                WalletError::InvalidTransaction("output total overflows".to_string())
            })?;
            outputs.push(MemoryOutput {
                satoshis: output.satoshis,
                locking_script: output.locking_script.clone(),
            });
        }
        if args.options.randomize_outputs {
            outputs.shuffle(&mut rand::thread_rng());
        }

        {
            let mut ledger = self.lock_ledger();
            if total > ledger.balance {
                return Err(WalletError::InsufficientFunds {
                    required: total,
                    available: ledger.balance,
                });
            }
            ledger.balance -= total;
        }

        let tx = MemoryTransaction {
            txid: hex::encode(random_bytes::<32>()),
            outputs,
        };
        tracing::debug!(
            txid = %tx.txid,
            satoshis = total,
            originator = originator.unwrap_or("-"),
            description = %args.description,
            "created action"
        );

        let bytes = if args.options.no_send || args.options.return_txid_only {
            None
        } else {
            Some(tx.to_bytes()?)
        };
        Ok(CreateActionResult {
            txid: args.options.return_txid_only.then_some(tx.txid),
            tx: bytes,
        })
    }

    async fn internalize_action(
        &self,
        args: InternalizeActionArgs,
        originator: Option<&str>,
    ) -> Result<InternalizeActionResult, WalletError> {
        let tx = MemoryTransaction::from_bytes(&args.tx)?;
        if args.outputs.is_empty() {
            return Err(WalletError::InvalidTransaction(
                "nothing to internalize".to_string(),
            ));
        }

        let mut received: u64 = 0;
        for out in &args.outputs {
            let output = tx.outputs.get(out.output_index as usize).ok_or_else(|| {
                WalletError::InvalidTransaction(format!(
                    "output index {} out of range",
                    out.output_index
                ))
            })?;
            match out.protocol {
                InternalizeProtocol::WalletPayment => {
                    let remittance = out.payment_remittance.as_ref().ok_or_else(|| {
                        WalletError::InvalidTransaction(
                            "wallet payment without remittance".to_string(),
                        )
                    })?;
                    let expected = self.payment_key(
                        &remittance.sender_identity_key,
                        &remittance.derivation_prefix,
                        &remittance.derivation_suffix,
                    )?;
                    if output.locking_script != identity::p2pk_locking_script(&expected) {
                        return Err(WalletError::InvalidTransaction(format!(
                            "output {} is not payable to this wallet",
                            out.output_index
                        )));
                    }
                    received = received.checked_add(output.satoshis).ok_or_else(|| {
                        WalletError::InvalidTransaction("payment total overflows".to_string())
                    })?;
                }
                InternalizeProtocol::BasketInsertion => {
                    if out.insertion_remittance.is_none() {
                        return Err(WalletError::InvalidTransaction(
                            "basket insertion without remittance".to_string(),
                        ));
                    }
                }
            }
        }

        let mut ledger = self.lock_ledger();
        if !ledger.internalized.insert(tx.txid.clone()) {
            return Err(WalletError::InvalidTransaction(format!(
                "transaction {} already internalized",
                tx.txid
            )));
        }
        ledger.balance = ledger.balance.saturating_add(received);
        ledger.credited = ledger.credited.saturating_add(received);
        drop(ledger);

        tracing::info!(
            txid = %tx.txid,
            satoshis = received,
            originator = originator.unwrap_or("-"),
            "internalized action"
        );
        Ok(InternalizeActionResult {
            accepted: true,
            satoshis: received,
        })
    }
}
