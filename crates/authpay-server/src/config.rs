use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use authpay::identity;
use authpay::security::random_bytes;
use authpay::{AuthPayError, RequestedCertificateSet};
use futures::future::BoxFuture;
use futures::FutureExt;
use secp256k1::SecretKey;

use crate::pricing::{PricingFn, RequestDescriptor};

/// Process-level settings for the payment server, read from the environment.
#[derive(Debug, Clone)]
pub struct PaymentGateConfig {
    pub server_key: SecretKey,
    pub prefix_secret: Vec<u8>,
    pub default_price: u64,
    pub require_auth: bool,
    pub session_ttl_secs: u64,
    pub replay_db: Option<String>,
    pub revocation_url: Option<String>,
    pub rate_limit_rpm: u64,
    pub allowed_origins: Vec<String>,
    pub port: u16,
    pub metrics_token: Option<String>,
    pub public_metrics: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AuthPayError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| AuthPayError::ConfigError(format!("{name} is not a valid value: {v}"))),
        _ => Ok(default),
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl PaymentGateConfig {
    pub fn from_env() -> Result<Self, AuthPayError> {
        let server_key = match env_nonempty("AUTHPAY_SERVER_KEY") {
            Some(hex_key) => identity::parse_secret_key(hex_key.trim())
                .map_err(|e| AuthPayError::ConfigError(format!("AUTHPAY_SERVER_KEY: {e}")))?,
            None if env_flag("AUTHPAY_INSECURE_EPHEMERAL_KEY") => {
                tracing::warn!(
                    "AUTHPAY_INSECURE_EPHEMERAL_KEY=true: using a throwaway server identity. \
                     Payments made to it are lost on restart. DO NOT use this in production!"
                );
                identity::random_secret_key()
            }
            None => {
                return Err(AuthPayError::ConfigError(
                    "AUTHPAY_SERVER_KEY is required (hex secp256k1 secret key). \
                     For local development only, set AUTHPAY_INSECURE_EPHEMERAL_KEY=true."
                        .to_string(),
                ))
            }
        };

        let prefix_secret = match env_nonempty("AUTHPAY_PREFIX_SECRET") {
            Some(s) => s.into_bytes(),
            None => {
                tracing::info!(
                    "AUTHPAY_PREFIX_SECRET not set; derivation prefixes issued before a restart \
                     will be rejected afterwards"
                );
                random_bytes::<32>().to_vec()
            }
        };

        let allowed_origins: Vec<String> = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            server_key,
            prefix_secret,
            default_price: env_parse("AUTHPAY_DEFAULT_PRICE", 100)?,
            require_auth: env_parse("AUTHPAY_REQUIRE_AUTH", true)?,
            session_ttl_secs: env_parse("AUTHPAY_SESSION_TTL_SECS", 3600)?,
            replay_db: env_nonempty("AUTHPAY_REPLAY_DB"),
            revocation_url: env_nonempty("AUTHPAY_REVOCATION_URL"),
            rate_limit_rpm: env_parse("RATE_LIMIT_RPM", 60)?,
            allowed_origins,
            port: env_parse("PORT", 3000)?,
            metrics_token: env_nonempty("METRICS_TOKEN"),
            public_metrics: env_flag("AUTHPAY_PUBLIC_METRICS"),
        })
    }
}

/// Pricing and session policy for all protected routes.
pub struct PaymentConfig {
    pub routes: HashMap<String, u64>,
    pub default_price: u64,
    pub pricing: Option<PricingFn>,
    pub require_auth: bool,
    /// Per-route exceptions to `require_auth`, keyed like `routes`.
    pub route_auth: HashMap<String, bool>,
    pub session_ttl_secs: u64,
    pub prefix_secret: Vec<u8>,
    /// Certificates clients must present during the handshake.
    pub requested_certificates: Option<RequestedCertificateSet>,
}

impl PaymentConfig {
    /// Static route price, if one was registered (e.g. `"POST /resource"`).
    pub fn get_route(&self, method: &str, path: &str) -> Option<u64> {
        let key = format!("{} {path}", method.to_ascii_uppercase());
        self.routes.get(&key).copied()
    }

    /// Whether a request to this route must carry a session.
    pub fn requires_auth(&self, method: &str, path: &str) -> bool {
        let key = format!("{} {path}", method.to_ascii_uppercase());
        self.route_auth
            .get(&key)
            .copied()
            .unwrap_or(self.require_auth)
    }
}

/// Builder for a [`PaymentConfig`] with multiple priced routes.
pub struct PaymentConfigBuilder {
    routes: HashMap<String, u64>,
    default_price: u64,
    pricing: Option<PricingFn>,
    require_auth: bool,
    route_auth: HashMap<String, bool>,
    session_ttl_secs: u64,
    prefix_secret: Vec<u8>,
    requested_certificates: Option<RequestedCertificateSet>,
}

impl PaymentConfigBuilder {
    pub fn new(gate_config: &PaymentGateConfig) -> Self {
        Self {
            routes: HashMap::new(),
            default_price: gate_config.default_price,
            pricing: None,
            require_auth: gate_config.require_auth,
            route_auth: HashMap::new(),
            session_ttl_secs: gate_config.session_ttl_secs,
            prefix_secret: gate_config.prefix_secret.clone(),
            requested_certificates: None,
        }
    }

    /// Register a static price for a route (e.g. `route("POST", "/resource", 10)`).
    pub fn route(mut self, method: &str, path: &str, satoshis: u64) -> Self {
        let key = format!("{} {path}", method.to_ascii_uppercase());
        self.routes.insert(key, satoshis);
        self
    }

    pub fn default_price(mut self, satoshis: u64) -> Self {
        self.default_price = satoshis;
        self
    }

    /// Price requests with a custom function instead of the route table.
    pub fn pricing_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RequestDescriptor) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u64, String>> + Send + 'static,
    {
        self.pricing = Some(Arc::new(
            move |desc: RequestDescriptor| -> BoxFuture<'static, Result<u64, String>> {
                f(desc).boxed()
            },
        ));
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    /// Override `require_auth` for a single route.
    pub fn route_auth(mut self, method: &str, path: &str, require: bool) -> Self {
        let key = format!("{} {path}", method.to_ascii_uppercase());
        self.route_auth.insert(key, require);
        self
    }

    pub fn session_ttl_secs(mut self, secs: u64) -> Self {
        self.session_ttl_secs = secs;
        self
    }

    pub fn request_certificates(mut self, requested: RequestedCertificateSet) -> Self {
        self.requested_certificates = Some(requested);
        self
    }

    pub fn build(self) -> PaymentConfig {
        PaymentConfig {
            routes: self.routes,
            default_price: self.default_price,
            pricing: self.pricing,
            require_auth: self.require_auth,
            route_auth: self.route_auth,
            session_ttl_secs: self.session_ttl_secs,
            prefix_secret: self.prefix_secret,
            requested_certificates: self.requested_certificates,
        }
    }
}
