use std::future::Future;
use std::sync::Arc;

use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use authpay::auth::{
    canonical_request, certificate_response_payload, initial_response_payload, AuthMessage,
    PeerSession,
};
use authpay::certificate::{RequestedCertificateSet, VerifiableCertificate};
use authpay::constants::{
    AUTH_ENDPOINT, AUTH_VERSION, HEADER_AUTH_VERSION, HEADER_IDENTITY_KEY, HEADER_NONCE,
    HEADER_PAYMENT, HEADER_SATOSHIS_PAID, HEADER_SIGNATURE, HEADER_YOUR_NONCE, NONCE_LEN,
    PAYMENT_DESCRIPTION,
};
use authpay::identity;
use authpay::security::random_nonce;
use authpay::wallet::{InternalizeActionArgs, InternalizeOutput, InternalizeProtocol, Wallet};
use authpay::{
    decode_payment, AuthPayError, CertificateNegotiator, RemittanceId, ReplayStore,
    RevocationOracle,
};

use crate::config::PaymentConfig;
use crate::error::GateError;
use crate::metrics::{HANDSHAKES, PAYMENT_ATTEMPTS, REQUESTS};
use crate::prefix::PrefixIssuer;
use crate::pricing::{price_request, RequestDescriptor};
use crate::session::SessionManager;

/// Outcome of a request that cleared the payment gate.
#[derive(Debug, Clone)]
pub struct PaymentReceipt {
    /// Authenticated peer, if the request carried a session.
    pub peer: Option<PeerSession>,
    pub price: u64,
    /// Satoshis the wallet credited (0 for free requests).
    pub satoshis_paid: u64,
    pub remittance_id: Option<RemittanceId>,
}

/// Server side of the protocol: answers handshakes and gates requests
/// behind authentication and payment.
pub struct PaymentMiddleware<W, O> {
    wallet: Arc<W>,
    identity: String,
    config: PaymentConfig,
    sessions: SessionManager,
    replay: Arc<dyn ReplayStore>,
    prefixes: PrefixIssuer,
    negotiator: CertificateNegotiator<W, O>,
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Use the matched route pattern (not the raw path) to keep label cardinality bounded.
fn endpoint_label(req: &HttpRequest) -> String {
    req.match_pattern().unwrap_or_else(|| "unknown".to_string())
}

impl<W: Wallet + 'static, O: RevocationOracle + 'static> PaymentMiddleware<W, O> {
    pub fn new(
        wallet: Arc<W>,
        oracle: Arc<O>,
        config: PaymentConfig,
        replay: Arc<dyn ReplayStore>,
    ) -> Self {
        Self {
            identity: wallet.identity_key(),
            negotiator: CertificateNegotiator::new(wallet.clone(), oracle),
            sessions: SessionManager::new(config.session_ttl_secs),
            prefixes: PrefixIssuer::new(config.prefix_secret.clone()),
            wallet,
            config,
            replay,
        }
    }

    pub fn identity_key(&self) -> &str {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // --- Handshake ---

    /// Answer one message posted to the handshake endpoint.
    pub async fn handle_auth_message(
        &self,
        msg: AuthMessage,
    ) -> Result<serde_json::Value, AuthPayError> {
        let result = match msg {
            AuthMessage::InitialRequest {
                version,
                identity_key,
                initial_nonce,
                requested_certificates,
            } => self
                .initial_response(version, identity_key, initial_nonce, requested_certificates)
                .await
                .and_then(|reply| Ok(serde_json::to_value(reply)?)),
            AuthMessage::CertificateResponse {
                version,
                identity_key,
                nonce,
                your_nonce,
                certificates,
                signature,
            } => self
                .accept_certificates(version, identity_key, nonce, your_nonce, certificates, signature)
                .await
                .map(|()| serde_json::json!({ "status": "success" })),
            AuthMessage::InitialResponse { .. } => Err(AuthPayError::HandshakeFailed(
                "initialResponse is not accepted by a server".to_string(),
            )),
        };
        let label = if result.is_ok() { "success" } else { "failure" };
        HANDSHAKES.with_label_values(&[label]).inc();
        result
    }

    async fn initial_response(
        &self,
        version: String,
        identity_key: String,
        client_nonce: String,
        requested: Option<RequestedCertificateSet>,
    ) -> Result<AuthMessage, AuthPayError> {
        if version != AUTH_VERSION {
            return Err(AuthPayError::HandshakeFailed(format!(
                "unsupported auth version {version}"
            )));
        }
        identity::parse_public_key(&identity_key)
            .map_err(|e| AuthPayError::HandshakeFailed(format!("bad identity key: {e}")))?;
        if client_nonce.is_empty() {
            return Err(AuthPayError::HandshakeFailed("empty initial nonce".to_string()));
        }
        self.sessions.purge_expired();

        let certificates = match &requested {
            Some(r) if !r.is_empty() => {
                self.negotiator
                    .request_certificates(r, &identity_key)
                    .await?
            }
            _ => Vec::new(),
        };

        let server_nonce = random_nonce(NONCE_LEN);
        let requested_from_client = self.config.requested_certificates.clone();
        let payload = initial_response_payload(
            &client_nonce,
            &server_nonce,
            &self.identity,
            &certificates,
            requested_from_client.as_ref(),
        )?;
        let signature = self.wallet.create_signature(&payload).await?;

        let mut session =
            PeerSession::new(identity_key.clone(), server_nonce.clone(), client_nonce.clone());
        session.authenticated = requested_from_client.is_none();
        self.sessions.insert(session);
        tracing::info!(
            peer = %identity_key,
            awaiting_certificates = requested_from_client.is_some(),
            "session created"
        );

        Ok(AuthMessage::InitialResponse {
            version: AUTH_VERSION.to_string(),
            identity_key: self.identity.clone(),
            initial_nonce: server_nonce,
            your_nonce: client_nonce,
            certificates,
            requested_certificates: requested_from_client,
            signature,
        })
    }

    async fn accept_certificates(
        &self,
        version: String,
        identity_key: String,
        nonce: String,
        your_nonce: String,
        certificates: Vec<VerifiableCertificate>,
        signature: String,
    ) -> Result<(), AuthPayError> {
        if version != AUTH_VERSION {
            return Err(AuthPayError::HandshakeFailed(format!(
                "unsupported auth version {version}"
            )));
        }
        let session = self
            .sessions
            .get(&your_nonce)
            .ok_or_else(|| AuthPayError::HandshakeFailed("unknown session".to_string()))?;
        if session.peer_identity_key != identity_key || session.peer_nonce != nonce {
            return Err(AuthPayError::HandshakeFailed(
                "certificate response does not match the session".to_string(),
            ));
        }
        let payload = certificate_response_payload(&nonce, &your_nonce, &certificates)?;
        if !identity::verify(&identity_key, &payload, &signature) {
            return Err(AuthPayError::HandshakeFailed(
                "invalid certificate response signature".to_string(),
            ));
        }
        let Some(required) = &self.config.requested_certificates else {
            return Err(AuthPayError::HandshakeFailed(
                "no certificates were requested".to_string(),
            ));
        };

        match self
            .negotiator
            .verify_certificates(required, &certificates, &identity_key)
            .await
        {
            Ok(verified) => {
                tracing::info!(peer = %identity_key, count = verified.len(), "certificates accepted");
                self.sessions.authenticate(&your_nonce, verified);
                Ok(())
            }
            Err(e) => {
                // no partial trust: the whole session goes
                self.sessions.remove(&your_nonce);
                Err(e)
            }
        }
    }

    // --- Per-request gate ---

    /// Check the identity headers of a general request.
    ///
    /// Returns `None` for requests without identity headers when the route
    /// does not require authentication.
    pub fn authenticate(
        &self,
        req: &HttpRequest,
        body: &[u8],
    ) -> Result<Option<PeerSession>, AuthPayError> {
        let Some(identity_key) = header(req, HEADER_IDENTITY_KEY) else {
            if self
                .config
                .requires_auth(req.method().as_str(), req.path())
            {
                return Err(AuthPayError::AuthenticationRequired(
                    "missing identity headers".to_string(),
                ));
            }
            return Ok(None);
        };
        if header(req, HEADER_AUTH_VERSION) != Some(AUTH_VERSION) {
            return Err(AuthPayError::AuthenticationRequired(
                "unsupported auth version".to_string(),
            ));
        }
        let (Some(nonce), Some(your_nonce), Some(signature)) = (
            header(req, HEADER_NONCE),
            header(req, HEADER_YOUR_NONCE),
            header(req, HEADER_SIGNATURE),
        ) else {
            return Err(AuthPayError::AuthenticationRequired(
                "incomplete identity headers".to_string(),
            ));
        };

        let session = self.sessions.get(your_nonce).ok_or_else(|| {
            AuthPayError::AuthenticationRequired("unknown or expired session".to_string())
        })?;
        if session.peer_identity_key != identity_key {
            return Err(AuthPayError::AuthenticationRequired(
                "identity key does not match the session".to_string(),
            ));
        }
        if !session.authenticated {
            return Err(AuthPayError::AuthenticationRequired(
                "session is waiting for requested certificates".to_string(),
            ));
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| req.path());
        let canonical = canonical_request(
            req.method().as_str(),
            path_and_query,
            nonce,
            your_nonce,
            body,
            header(req, HEADER_PAYMENT),
        );
        if !identity::verify(identity_key, &canonical, signature) {
            tracing::warn!(peer = %identity_key, "invalid request signature");
            return Err(AuthPayError::AuthenticationRequired(
                "invalid request signature".to_string(),
            ));
        }
        if !self.sessions.claim_request_nonce(your_nonce, nonce) {
            return Err(AuthPayError::AuthenticationRequired(
                "request nonce already used".to_string(),
            ));
        }
        Ok(Some(session))
    }

    /// Authenticate, price and settle a request without running a handler.
    ///
    /// The wallet is asked to internalize a given remittance at most once;
    /// a remittance it refuses is released so the client can retry.
    pub async fn require_payment(
        &self,
        req: &HttpRequest,
        body: &[u8],
    ) -> Result<PaymentReceipt, AuthPayError> {
        let peer = self.authenticate(req, body)?;
        let peer_key = peer.as_ref().map(|p| p.peer_identity_key.clone());

        let desc = RequestDescriptor::from_request(req, body.len(), peer_key.clone());
        let price = price_request(&self.config, desc).await?;
        if price == 0 {
            return Ok(PaymentReceipt {
                peer,
                price,
                satoshis_paid: 0,
                remittance_id: None,
            });
        }

        let bound_peer = peer_key.as_deref().unwrap_or("");
        let Some(raw_header) = req.headers().get(HEADER_PAYMENT) else {
            return Err(AuthPayError::PaymentRequired {
                satoshis_required: price,
                derivation_prefix: self.prefixes.issue(bound_peer),
            });
        };
        let header_value = raw_header.to_str().map_err(|_| {
            PAYMENT_ATTEMPTS.with_label_values(&["malformed"]).inc();
            tracing::warn!("payment header is not visible ASCII");
            AuthPayError::MalformedPaymentHeader("payment header is not visible ASCII".to_string())
        })?;

        let remittance = decode_payment(header_value).inspect_err(|e| {
            PAYMENT_ATTEMPTS.with_label_values(&["malformed"]).inc();
            tracing::warn!(error = %e, "invalid payment header");
        })?;
        if !self.prefixes.verify(&remittance.derivation_prefix, bound_peer) {
            PAYMENT_ATTEMPTS.with_label_values(&["malformed"]).inc();
            tracing::warn!(peer = %bound_peer, "derivation prefix was not issued by this server");
            return Err(AuthPayError::InvalidDerivationPrefix);
        }
        if let Some(key) = &peer_key {
            if &remittance.sender_identity_key != key {
                PAYMENT_ATTEMPTS.with_label_values(&["malformed"]).inc();
                return Err(AuthPayError::MalformedPaymentHeader(
                    "sender identity key does not match the authenticated peer".to_string(),
                ));
            }
        }

        let id = remittance.id();
        if !self.replay.try_claim(id) {
            PAYMENT_ATTEMPTS.with_label_values(&["duplicate"]).inc();
            tracing::warn!(remittance = %id, "duplicate payment");
            return Err(AuthPayError::DuplicatePayment(format!(
                "remittance {id} was already internalized"
            )));
        }

        tracing::info!(
            sender = %remittance.sender_identity_key,
            remittance = %id,
            price,
            "payment attempt"
        );

        let args = InternalizeActionArgs {
            tx: remittance.transaction.clone(),
            outputs: vec![InternalizeOutput {
                output_index: 0,
                protocol: InternalizeProtocol::WalletPayment,
                payment_remittance: Some(remittance.wallet_remittance()),
                insertion_remittance: None,
            }],
            description: PAYMENT_DESCRIPTION.to_string(),
            labels: Vec::new(),
        };
        let credited = match self
            .wallet
            .internalize_action(args, Some(&remittance.sender_identity_key))
            .await
        {
            Ok(result) if result.accepted => result.satoshis,
            Ok(_) => {
                self.replay.release(&id);
                PAYMENT_ATTEMPTS.with_label_values(&["rejected"]).inc();
                return Err(AuthPayError::PaymentRejected(
                    "wallet did not accept the payment".to_string(),
                ));
            }
            Err(e) => {
                self.replay.release(&id);
                PAYMENT_ATTEMPTS.with_label_values(&["rejected"]).inc();
                tracing::error!(remittance = %id, error = %e, "internalization failed");
                return Err(AuthPayError::PaymentRejected(e.to_string()));
            }
        };

        if credited < price {
            PAYMENT_ATTEMPTS.with_label_values(&["insufficient"]).inc();
            tracing::warn!(remittance = %id, required = price, paid = credited, "underpayment");
            return Err(AuthPayError::InsufficientPayment {
                required: price,
                paid: credited,
            });
        }

        PAYMENT_ATTEMPTS.with_label_values(&["success"]).inc();
        tracing::info!(remittance = %id, satoshis = credited, "payment accepted");
        Ok(PaymentReceipt {
            peer,
            price,
            satoshis_paid: credited,
            remittance_id: Some(id),
        })
    }

    /// Gate `handler` behind authentication and payment.
    ///
    /// The handler only runs once the payment is internalized and covers the
    /// price; its response gets the server identity and, for paid requests,
    /// the credited amount.
    pub async fn handle<F, Fut>(
        &self,
        req: &HttpRequest,
        body: &[u8],
        handler: F,
    ) -> Result<HttpResponse, GateError>
    where
        F: FnOnce(PaymentReceipt) -> Fut,
        Fut: Future<Output = HttpResponse>,
    {
        let endpoint = endpoint_label(req);
        let receipt = match self.require_payment(req, body).await {
            Ok(receipt) => receipt,
            Err(e) => {
                let err = GateError(e);
                REQUESTS
                    .with_label_values(&[endpoint.as_str(), err.status_code().as_str()])
                    .inc();
                return Err(err);
            }
        };

        let price = receipt.price;
        let paid = receipt.satoshis_paid;
        let mut resp = handler(receipt).await;
        REQUESTS
            .with_label_values(&[endpoint.as_str(), resp.status().as_str()])
            .inc();

        let headers = resp.headers_mut();
        headers.insert(
            HeaderName::from_static(HEADER_AUTH_VERSION),
            HeaderValue::from_static(AUTH_VERSION),
        );
        if let Ok(identity) = HeaderValue::from_str(&self.identity) {
            headers.insert(HeaderName::from_static(HEADER_IDENTITY_KEY), identity);
        }
        if price > 0 {
            headers.insert(
                HeaderName::from_static(HEADER_SATOSHIS_PAID),
                HeaderValue::from(paid),
            );
        }
        Ok(resp)
    }
}

/// `POST /.well-known/auth`
pub async fn auth_endpoint<W: Wallet + 'static, O: RevocationOracle + 'static>(
    gate: web::Data<PaymentMiddleware<W, O>>,
    msg: web::Json<AuthMessage>,
) -> Result<HttpResponse, GateError> {
    let reply = gate.handle_auth_message(msg.into_inner()).await?;
    Ok(HttpResponse::Ok().json(reply))
}

/// Register the handshake endpoint for a middleware stored as app data.
pub fn configure_auth<W: Wallet + 'static, O: RevocationOracle + 'static>(
    cfg: &mut web::ServiceConfig,
) {
    cfg.service(web::resource(AUTH_ENDPOINT).route(web::post().to(auth_endpoint::<W, O>)));
}
