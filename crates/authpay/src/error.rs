use thiserror::Error;

/// Errors returned by wallet implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("privileged operation denied: {0}")]
    PrivilegedOperationDenied(String),

    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("insufficient funds: need {required} satoshis, have {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("key error: {0}")]
    KeyError(String),

    #[error("wallet error: {0}")]
    Other(String),
}

/// Errors returned by authpay operations.
///
/// Every rejection the protocol can produce has its own variant so callers
/// can decide whether to retry with changes or give up.
#[derive(Debug, Error)]
pub enum AuthPayError {
    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("invalid certificate request: {0}")]
    InvalidCertificateRequest(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("payment required: {satoshis_required} satoshis")]
    PaymentRequired {
        satoshis_required: u64,
        derivation_prefix: String,
    },

    #[error("malformed payment header: {0}")]
    MalformedPaymentHeader(String),

    #[error("invalid derivation prefix")]
    InvalidDerivationPrefix,

    #[error("duplicate payment: {0}")]
    DuplicatePayment(String),

    #[error("insufficient payment: required {required}, paid {paid}")]
    InsufficientPayment { required: u64, paid: u64 },

    #[error("payment rejected: {0}")]
    PaymentRejected(String),

    #[error("privileged operation denied: {0}")]
    PrivilegedOperationDenied(String),

    #[error("internal pricing error: {0}")]
    InternalPricingError(String),

    #[error("payment construction failed: {0}")]
    PaymentConstructionFailed(String),

    #[error("payment acknowledgement mismatch: sent {sent}, acknowledged {acknowledged:?}")]
    PaymentAcknowledgementMismatch {
        sent: u64,
        acknowledged: Option<String>,
    },

    #[error("wallet error: {0}")]
    Wallet(WalletError),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("http error: {0}")]
    HttpError(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl From<WalletError> for AuthPayError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::PrivilegedOperationDenied(msg) => {
                AuthPayError::PrivilegedOperationDenied(msg)
            }
            WalletError::CertificateNotFound(msg) => AuthPayError::CertificateNotFound(msg),
            other => AuthPayError::Wallet(other),
        }
    }
}

impl AuthPayError {
    /// Stable machine-readable code carried in rejection bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthPayError::AuthenticationRequired(_) => "ERR_AUTHENTICATION_REQUIRED",
            AuthPayError::CertificateNotFound(_) => "ERR_CERTIFICATE_NOT_FOUND",
            AuthPayError::CertificateRejected(_) => "ERR_CERTIFICATE_REJECTED",
            AuthPayError::InvalidCertificateRequest(_) => "ERR_INVALID_CERTIFICATE_REQUEST",
            AuthPayError::HandshakeFailed(_) => "ERR_HANDSHAKE_FAILED",
            AuthPayError::PaymentRequired { .. } => "ERR_PAYMENT_REQUIRED",
            AuthPayError::MalformedPaymentHeader(_) => "ERR_MALFORMED_PAYMENT",
            AuthPayError::InvalidDerivationPrefix => "ERR_INVALID_DERIVATION_PREFIX",
            AuthPayError::DuplicatePayment(_) => "ERR_DUPLICATE_PAYMENT",
            AuthPayError::InsufficientPayment { .. } => "ERR_INSUFFICIENT_PAYMENT",
            AuthPayError::PaymentRejected(_) => "ERR_PAYMENT_REJECTED",
            AuthPayError::PrivilegedOperationDenied(_) => "ERR_PRIVILEGED_OPERATION_DENIED",
            AuthPayError::InternalPricingError(_) => "ERR_INTERNAL_PRICING",
            AuthPayError::PaymentConstructionFailed(_) => "ERR_PAYMENT_CONSTRUCTION_FAILED",
            AuthPayError::PaymentAcknowledgementMismatch { .. } => "ERR_PAYMENT_ACK_MISMATCH",
            AuthPayError::Wallet(_) => "ERR_WALLET",
            AuthPayError::ConfigError(_) => "ERR_CONFIG",
            AuthPayError::HttpError(_) => "ERR_HTTP",
            AuthPayError::SerdeError(_) => "ERR_SERIALIZATION",
        }
    }

    /// Whether the same request may succeed if retried with corrected input
    /// (more funds, a fresh payment, a new session).
    ///
    /// Duplicate payments, malformed headers and rejected certificates are
    /// final: resending them unchanged can never succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthPayError::AuthenticationRequired(_)
                | AuthPayError::PaymentRequired { .. }
                | AuthPayError::InsufficientPayment { .. }
                | AuthPayError::InternalPricingError(_)
                | AuthPayError::HttpError(_)
        )
    }

    /// Rebuild an error from the code and description of a rejection body.
    ///
    /// Used by the client to surface server rejections as the same kinds
    /// the server produced. Codes carrying structured data that is not in
    /// the body fall back to their message-only forms.
    pub fn from_code(code: &str, description: String) -> Self {
        match code {
            "ERR_AUTHENTICATION_REQUIRED" => AuthPayError::AuthenticationRequired(description),
            "ERR_CERTIFICATE_NOT_FOUND" => AuthPayError::CertificateNotFound(description),
            "ERR_CERTIFICATE_REJECTED" => AuthPayError::CertificateRejected(description),
            "ERR_INVALID_CERTIFICATE_REQUEST" => {
                AuthPayError::InvalidCertificateRequest(description)
            }
            "ERR_HANDSHAKE_FAILED" => AuthPayError::HandshakeFailed(description),
            "ERR_MALFORMED_PAYMENT" => AuthPayError::MalformedPaymentHeader(description),
            "ERR_INVALID_DERIVATION_PREFIX" => AuthPayError::InvalidDerivationPrefix,
            "ERR_DUPLICATE_PAYMENT" => AuthPayError::DuplicatePayment(description),
            "ERR_PAYMENT_REJECTED" => AuthPayError::PaymentRejected(description),
            "ERR_PRIVILEGED_OPERATION_DENIED" => {
                AuthPayError::PrivilegedOperationDenied(description)
            }
            "ERR_INTERNAL_PRICING" => AuthPayError::InternalPricingError(description),
            _ => AuthPayError::HttpError(format!("{code}: {description}")),
        }
    }
}
