//! Request pricing.
//!
//! Every request is priced fresh. A custom pricing function takes precedence
//! over the static route table, which falls back to the default price.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use actix_web::HttpRequest;
use authpay::AuthPayError;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::config::PaymentConfig;

/// Custom pricing function. An `Err` or a panic rejects the request with
/// `InternalPricingError`; the client is never billed for it.
pub type PricingFn =
    Arc<dyn Fn(RequestDescriptor) -> BoxFuture<'static, Result<u64, String>> + Send + Sync>;

/// What a pricing function gets to see about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body_len: usize,
    /// Authenticated peer, when the request carried a valid session.
    pub identity_key: Option<String>,
}

impl RequestDescriptor {
    pub fn from_request(req: &HttpRequest, body_len: usize, identity_key: Option<String>) -> Self {
        Self {
            method: req.method().as_str().to_string(),
            path: req.path().to_string(),
            query: req.query_string().to_string(),
            body_len,
            identity_key,
        }
    }
}

/// Price a request under `config`.
pub async fn price_request(
    config: &PaymentConfig,
    desc: RequestDescriptor,
) -> Result<u64, AuthPayError> {
    let Some(pricing) = &config.pricing else {
        return Ok(config
            .get_route(&desc.method, &desc.path)
            .unwrap_or(config.default_price));
    };

    let method = desc.method.clone();
    let path = desc.path.clone();

    // panics while building the future and while polling it are both caught
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| pricing(desc))) {
        Ok(fut) => fut,
        Err(_) => {
            tracing::error!(method = %method, path = %path, "pricing function panicked");
            return Err(AuthPayError::InternalPricingError(
                "pricing function panicked".to_string(),
            ));
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(price)) => Ok(price),
        Ok(Err(e)) => {
            tracing::error!(method = %method, path = %path, error = %e, "pricing function failed");
            Err(AuthPayError::InternalPricingError(e))
        }
        Err(_) => {
            tracing::error!(method = %method, path = %path, "pricing function panicked");
            Err(AuthPayError::InternalPricingError(
                "pricing function panicked".to_string(),
            ))
        }
    }
}
