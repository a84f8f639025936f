//! Revocation status of certificates, via their revocation outpoints.
//!
//! A certificate is revoked once its revocation outpoint is spent. The
//! ledger lookup itself is external; callers treat any oracle error as
//! "not verified" and reject.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashSet;
use serde::Deserialize;

/// Ledger-state oracle answering whether an outpoint is still unspent.
pub trait RevocationOracle: Send + Sync {
    fn is_unspent(&self, outpoint: &str) -> impl Future<Output = Result<bool, String>> + Send;
}

/// In-memory oracle: every outpoint is unspent unless explicitly revoked.
#[derive(Default)]
pub struct InMemoryRevocationOracle {
    spent: DashSet<String>,
    unavailable: AtomicBool,
}

impl InMemoryRevocationOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an outpoint spent, revoking any certificate that names it.
    pub fn revoke(&self, outpoint: &str) {
        self.spent.insert(outpoint.to_string());
    }

    /// Simulate an unreachable ledger.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl RevocationOracle for InMemoryRevocationOracle {
    async fn is_unspent(&self, outpoint: &str) -> Result<bool, String> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err("revocation oracle unavailable".to_string());
        }
        Ok(!self.spent.contains(outpoint))
    }
}

#[derive(Debug, Deserialize)]
struct OutpointStatus {
    spent: bool,
}

/// Oracle backed by an HTTP ledger lookup service.
///
/// Queries `GET {base_url}/outpoints/{outpoint}` and expects
/// `{"spent": bool}`.
pub struct HttpRevocationOracle {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRevocationOracle {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn with_http_client(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl RevocationOracle for HttpRevocationOracle {
    async fn is_unspent(&self, outpoint: &str) -> Result<bool, String> {
        let url = format!("{}/outpoints/{}", self.base_url, outpoint);
        let resp = self
            .http
            .get(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| format!("revocation lookup failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("revocation lookup returned {}", resp.status()));
        }
        let status: OutpointStatus = resp
            .json()
            .await
            .map_err(|e| format!("revocation response parse failed: {e}"))?;
        Ok(!status.spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_outpoint_is_spent() {
        let oracle = InMemoryRevocationOracle::new();
        assert_eq!(oracle.is_unspent("tx.0").await, Ok(true));
        oracle.revoke("tx.0");
        assert_eq!(oracle.is_unspent("tx.0").await, Ok(false));
        assert_eq!(oracle.is_unspent("tx.1").await, Ok(true));
    }

    #[tokio::test]
    async fn unavailable_oracle_errors() {
        let oracle = InMemoryRevocationOracle::new();
        oracle.set_unavailable(true);
        assert!(oracle.is_unspent("tx.0").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_http_oracle_errors() {
        let oracle = HttpRevocationOracle::new("http://127.0.0.1:1/");
        assert!(oracle.is_unspent("tx.0").await.is_err());
    }
}
