//! authpay client.
//!
//! [`AuthFetch`] wraps `reqwest::Client`: the first request to an origin
//! runs the mutual-authentication handshake, every request is signed, and a
//! `402 Payment Required` answer is paid through the [`authpay::Wallet`]
//! and retried once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use authpay::InMemoryRevocationOracle;
//! use authpay_client::{AuthFetch, AuthFetchConfig};
//! use authpay_wallet::MemoryWallet;
//!
//! # async fn run() -> Result<(), authpay::AuthPayError> {
//! let client = AuthFetch::new(
//!     Arc::new(MemoryWallet::random().with_balance(1_000)),
//!     Arc::new(InMemoryRevocationOracle::new()),
//!     AuthFetchConfig::default(),
//! )?;
//! let (resp, paid) = client
//!     .fetch(reqwest::Method::POST, "http://localhost:3000/resource", None)
//!     .await?;
//! println!("{} (paid {:?})", resp.status(), paid);
//! # Ok(())
//! # }
//! ```

pub mod auth_fetch;

pub use auth_fetch::{AuthFetch, AuthFetchConfig, ServerSession};
