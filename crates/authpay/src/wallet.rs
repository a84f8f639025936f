//! The wallet capability consumed by both sides of the protocol.
//!
//! The wallet owns keys, stored certificates and funds. The protocol core
//! never touches any of those directly; it only calls the operations
//! below. `authpay-wallet` provides an in-memory implementation.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::certificate::{Certificate, Keyring};
use crate::error::WalletError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCertificatesArgs {
    pub certifiers: Vec<String>,
    pub types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCertificatesResult {
    pub total_certificates: u32,
    pub certificates: Vec<Certificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProveCertificateArgs {
    pub certificate: Certificate,
    pub fields_to_reveal: Vec<String>,
    pub verifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProveCertificateResult {
    pub keyring_for_verifier: Keyring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeyArgs {
    pub protocol_id: String,
    pub key_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty: Option<String>,
    #[serde(default)]
    pub for_self: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionOutput {
    pub locking_script: String,
    pub satoshis: u64,
    pub output_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionOptions {
    #[serde(default)]
    pub randomize_outputs: bool,
    #[serde(default)]
    pub return_txid_only: bool,
    #[serde(default)]
    pub no_send: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionArgs {
    pub description: String,
    pub outputs: Vec<CreateActionOutput>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub options: CreateActionOptions,
}

/// `txid` is set only when `return_txid_only` was requested; `tx` is set
/// unless `no_send` was requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateActionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InternalizeProtocol {
    #[serde(rename = "wallet payment")]
    WalletPayment,
    #[serde(rename = "basket insertion")]
    BasketInsertion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPaymentRemittance {
    pub derivation_prefix: String,
    pub derivation_suffix: String,
    pub sender_identity_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasketInsertionRemittance {
    pub basket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalizeOutput {
    pub output_index: u32,
    pub protocol: InternalizeProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_remittance: Option<WalletPaymentRemittance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insertion_remittance: Option<BasketInsertionRemittance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalizeActionArgs {
    pub tx: Vec<u8>,
    pub outputs: Vec<InternalizeOutput>,
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Result of internalizing a transaction. `satoshis` is the total value of
/// the outputs the wallet accepted as its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalizeActionResult {
    pub accepted: bool,
    pub satoshis: u64,
}

/// Wallet operations the protocol depends on.
///
/// Implementations must be thread-safe; certificate storage and funds are
/// shared across concurrently handled requests.
pub trait Wallet: Send + Sync {
    /// Hex identity public key of this wallet.
    fn identity_key(&self) -> String;

    /// Derive a public key for a protocol/key id, optionally with a
    /// counterparty (`for_self` selects our own side of the derivation).
    fn get_public_key(
        &self,
        args: GetPublicKeyArgs,
    ) -> impl Future<Output = Result<String, WalletError>> + Send;

    /// Sign `data` with the identity key.
    fn create_signature(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<String, WalletError>> + Send;

    /// ECDH secret between the identity key and `counterparty`.
    fn derive_shared_secret(
        &self,
        counterparty: &str,
    ) -> impl Future<Output = Result<[u8; 32], WalletError>> + Send;

    fn list_certificates(
        &self,
        args: ListCertificatesArgs,
    ) -> impl Future<Output = Result<ListCertificatesResult, WalletError>> + Send;

    /// Build a keyring revealing `fields_to_reveal` to `verifier`.
    /// Fails with `PrivilegedOperationDenied` when privileged access is
    /// requested and refused.
    fn prove_certificate(
        &self,
        args: ProveCertificateArgs,
    ) -> impl Future<Output = Result<ProveCertificateResult, WalletError>> + Send;

    fn create_action(
        &self,
        args: CreateActionArgs,
        originator: Option<&str>,
    ) -> impl Future<Output = Result<CreateActionResult, WalletError>> + Send;

    fn internalize_action(
        &self,
        args: InternalizeActionArgs,
        originator: Option<&str>,
    ) -> impl Future<Output = Result<InternalizeActionResult, WalletError>> + Send;
}
