//! authpay resource server: gates HTTP endpoints behind an authenticated
//! handshake and per-request payments.
//!
//! A client first posts to [`AUTH_ENDPOINT`](authpay::AUTH_ENDPOINT) to open
//! a session. Each gated request is then authenticated, priced, and, when
//! the price is non-zero, answered with a 402 naming the price and a
//! derivation prefix until it carries a payment the server's wallet accepts.
//!
//! # Modules
//!
//! - [`config`]: environment settings and route pricing ([`PaymentConfigBuilder`](config::PaymentConfigBuilder))
//! - [`middleware`]: the handshake endpoint and the payment gate ([`PaymentMiddleware`](middleware::PaymentMiddleware))
//! - [`pricing`]: request descriptors and pricing functions
//! - [`session`]: live peer sessions
//! - [`prefix`]: stateless, HMAC-tagged derivation prefixes
//! - [`error`]: HTTP rendering of protocol errors
//! - [`metrics`]: Prometheus metrics for requests, payments and handshakes

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod prefix;
pub mod pricing;
pub mod session;

pub use config::{PaymentConfig, PaymentConfigBuilder, PaymentGateConfig};
pub use error::GateError;
pub use middleware::{auth_endpoint, configure_auth, PaymentMiddleware, PaymentReceipt};
pub use pricing::{PricingFn, RequestDescriptor};
pub use session::SessionManager;
