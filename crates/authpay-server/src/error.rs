use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use authpay::constants::{
    HEADER_DERIVATION_PREFIX, HEADER_PAYMENT_VERSION, HEADER_SATOSHIS_REQUIRED, PAYMENT_VERSION,
};
use authpay::AuthPayError;
use std::fmt;

/// Rejection returned by the handshake endpoint and payment-gated handlers.
///
/// Wraps [`AuthPayError`] so it can be rendered as an HTTP response; the
/// body is always `{"status": "error", "code": ..., "description": ...}`.
#[derive(Debug)]
pub struct GateError(pub AuthPayError);

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for GateError {}

impl From<AuthPayError> for GateError {
    fn from(e: AuthPayError) -> Self {
        GateError(e)
    }
}

impl GateError {
    /// Description safe to send to the client.
    fn public_description(&self) -> String {
        match &self.0 {
            AuthPayError::InternalPricingError(_)
            | AuthPayError::Wallet(_)
            | AuthPayError::ConfigError(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl ResponseError for GateError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            AuthPayError::AuthenticationRequired(_)
            | AuthPayError::CertificateRejected(_)
            | AuthPayError::HandshakeFailed(_) => StatusCode::UNAUTHORIZED,
            AuthPayError::CertificateNotFound(_) => StatusCode::NOT_FOUND,
            AuthPayError::PrivilegedOperationDenied(_) => StatusCode::FORBIDDEN,
            AuthPayError::PaymentRequired { .. } | AuthPayError::InsufficientPayment { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }
            AuthPayError::DuplicatePayment(_) => StatusCode::CONFLICT,
            AuthPayError::InvalidCertificateRequest(_)
            | AuthPayError::MalformedPaymentHeader(_)
            | AuthPayError::InvalidDerivationPrefix
            | AuthPayError::PaymentRejected(_)
            | AuthPayError::SerdeError(_) => StatusCode::BAD_REQUEST,
            AuthPayError::HttpError(_) | AuthPayError::PaymentAcknowledgementMismatch { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AuthPayError::InternalPricingError(_)
            | AuthPayError::PaymentConstructionFailed(_)
            | AuthPayError::Wallet(_)
            | AuthPayError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        }

        let mut body = serde_json::json!({
            "status": "error",
            "code": self.0.code(),
            "description": self.public_description(),
        });
        let mut resp = HttpResponse::build(status);

        match &self.0 {
            AuthPayError::PaymentRequired {
                satoshis_required,
                derivation_prefix,
            } => {
                resp.insert_header((HEADER_PAYMENT_VERSION, PAYMENT_VERSION))
                    .insert_header((HEADER_SATOSHIS_REQUIRED, satoshis_required.to_string()))
                    .insert_header((HEADER_DERIVATION_PREFIX, derivation_prefix.as_str()));
                body["satoshisRequired"] = (*satoshis_required).into();
                body["derivationPrefix"] = derivation_prefix.as_str().into();
            }
            AuthPayError::InsufficientPayment { required, paid } => {
                resp.insert_header((HEADER_SATOSHIS_REQUIRED, required.to_string()));
                body["satoshisRequired"] = (*required).into();
                body["satoshisPaid"] = (*paid).into();
            }
            _ => {}
        }
        resp.json(body)
    }
}
