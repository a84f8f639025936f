use std::sync::Arc;
use std::time::Duration;

use authpay::auth::{canonical_request, certificate_response_payload, initial_response_payload};
use authpay::constants::*;
use authpay::identity;
use authpay::security::{random_bytes, random_nonce};
use authpay::wallet::{
    CreateActionArgs, CreateActionOptions, CreateActionOutput, GetPublicKeyArgs,
};
use authpay::{
    encode_payment, AuthMessage, AuthPayError, CertificateNegotiator, PaymentRemittance,
    RequestedCertificateSet, RevocationOracle, VerifiedCertificate, Wallet, WalletError,
};
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use url::{Position, Url};

/// Client settings.
#[derive(Debug, Clone)]
pub struct AuthFetchConfig {
    /// Certificates the server must present during the handshake.
    pub requested_certificates: Option<RequestedCertificateSet>,
    /// Originator passed to the wallet when building payments.
    pub originator: Option<String>,
    pub timeout: Duration,
}

impl Default for AuthFetchConfig {
    fn default() -> Self {
        Self {
            requested_certificates: None,
            originator: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// An established session with one server origin.
#[derive(Debug, Clone)]
pub struct ServerSession {
    pub origin: String,
    pub server_identity_key: String,
    /// Session nonce issued by the server; quoted on every request.
    pub server_nonce: String,
    /// Server certificates verified during the handshake.
    pub certificates: Vec<VerifiedCertificate>,
}

type HandshakeOutcome = Result<Arc<ServerSession>, Arc<AuthPayError>>;
type PendingHandshake = Shared<BoxFuture<'static, HandshakeOutcome>>;

enum PeerState {
    /// One in-flight handshake; every caller for the origin awaits it.
    Handshaking(PendingHandshake),
    Authenticated(Arc<ServerSession>),
}

struct Inner<W, O> {
    http: reqwest::Client,
    wallet: Arc<W>,
    negotiator: CertificateNegotiator<W, O>,
    config: AuthFetchConfig,
    peers: DashMap<String, PeerState>,
}

/// HTTP client that authenticates to servers and pays for requests.
///
/// Sessions are cached per URL origin. The handshake for an origin runs on
/// its own task, so dropping a waiting request never cancels it for the
/// others.
pub struct AuthFetch<W, O> {
    inner: Arc<Inner<W, O>>,
}

impl<W, O> Clone for AuthFetch<W, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: String,
    #[serde(default)]
    description: String,
    satoshis_required: Option<u64>,
    satoshis_paid: Option<u64>,
    derivation_prefix: Option<String>,
}

impl<W, O> AuthFetch<W, O>
where
    W: Wallet + 'static,
    O: RevocationOracle + 'static,
{
    pub fn new(wallet: Arc<W>, oracle: Arc<O>, config: AuthFetchConfig) -> Result<Self, AuthPayError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthPayError::ConfigError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_http_client(wallet, oracle, config, http))
    }

    /// Create a client with a custom reqwest::Client.
    pub fn with_http_client(
        wallet: Arc<W>,
        oracle: Arc<O>,
        config: AuthFetchConfig,
        http: reqwest::Client,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                http,
                negotiator: CertificateNegotiator::new(Arc::clone(&wallet), oracle),
                wallet,
                config,
                peers: DashMap::new(),
            }),
        }
    }

    pub fn identity_key(&self) -> String {
        self.inner.wallet.identity_key()
    }

    /// Established session for `origin` (`scheme://host:port`), if any.
    pub fn session(&self, origin: &str) -> Option<Arc<ServerSession>> {
        match self.inner.peers.get(origin)?.value() {
            PeerState::Authenticated(session) => Some(Arc::clone(session)),
            PeerState::Handshaking(_) => None,
        }
    }

    /// Make a signed request, paying for it if the server asks.
    ///
    /// Returns the final response and, for paid requests, the acknowledged
    /// amount. Responses other than 401 and 402 to the unpaid attempt are
    /// returned unchanged.
    pub async fn fetch(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(reqwest::Response, Option<u64>), AuthPayError> {
        let url = Url::parse(url)
            .map_err(|e| AuthPayError::HttpError(format!("invalid url {url}: {e}")))?;
        let origin = url.origin().ascii_serialization();
        let body = body.unwrap_or_default();
        let session = self.session_for(&origin).await?;

        let unpaid = self.send_signed(&session, &method, &url, &body, None).await?;
        match unpaid.status().as_u16() {
            401 => {
                self.forget(&origin, &session);
                return Err(rejection(unpaid).await);
            }
            402 => {}
            _ => return Ok((unpaid, None)),
        }

        let (satoshis, prefix) = payment_terms(&unpaid)?;
        let payment = self.build_payment(&session, satoshis, &prefix).await?;
        let resp = self
            .send_signed(&session, &method, &url, &body, Some(&payment))
            .await?;
        if resp.status().as_u16() == 401 {
            self.forget(&origin, &session);
            return Err(rejection(resp).await);
        }

        let Some(acknowledged) = header_str(&resp, HEADER_SATOSHIS_PAID).map(str::to_string) else {
            if !resp.status().is_success() {
                return Err(rejection(resp).await);
            }
            return Err(AuthPayError::PaymentAcknowledgementMismatch {
                sent: satoshis,
                acknowledged: None,
            });
        };
        if acknowledged.parse::<u64>().ok() != Some(satoshis) {
            tracing::warn!(sent = satoshis, acknowledged = %acknowledged, "payment acknowledgement mismatch");
            return Err(AuthPayError::PaymentAcknowledgementMismatch {
                sent: satoshis,
                acknowledged: Some(acknowledged),
            });
        }
        if header_str(&resp, HEADER_IDENTITY_KEY) != Some(session.server_identity_key.as_str()) {
            return Err(AuthPayError::AuthenticationRequired(
                "paid response was not signed off by the session peer".to_string(),
            ));
        }

        tracing::info!(origin = %origin, satoshis, "request paid");
        Ok((resp, Some(satoshis)))
    }

    async fn session_for(&self, origin: &str) -> Result<Arc<ServerSession>, AuthPayError> {
        let pending = match self.inner.peers.entry(origin.to_string()) {
            Entry::Occupied(entry) => match entry.get() {
                PeerState::Authenticated(session) => return Ok(Arc::clone(session)),
                PeerState::Handshaking(pending) => pending.clone(),
            },
            Entry::Vacant(entry) => {
                let pending = self.start_handshake(origin);
                entry.insert(PeerState::Handshaking(pending.clone()));
                pending
            }
        };

        let outcome = pending.clone().await;
        self.settle(origin, &pending, &outcome);
        outcome.map_err(|e| surface(&e))
    }

    fn start_handshake(&self, origin: &str) -> PendingHandshake {
        let inner = Arc::clone(&self.inner);
        let origin = origin.to_string();
        let task = tokio::spawn(async move { inner.handshake(&origin).await });
        async move {
            match task.await {
                Ok(Ok(session)) => Ok(Arc::new(session)),
                Ok(Err(e)) => Err(Arc::new(e)),
                Err(e) => Err(Arc::new(AuthPayError::HandshakeFailed(format!(
                    "handshake task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared()
    }

    /// Replace the handshake slot with its outcome. A failed slot is cleared
    /// so the next request starts a fresh handshake.
    fn settle(&self, origin: &str, pending: &PendingHandshake, outcome: &HandshakeOutcome) {
        let Entry::Occupied(mut entry) = self.inner.peers.entry(origin.to_string()) else {
            return;
        };
        if !matches!(entry.get(), PeerState::Handshaking(current) if current.ptr_eq(pending)) {
            return;
        }
        match outcome {
            Ok(session) => {
                entry.insert(PeerState::Authenticated(Arc::clone(session)));
            }
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "handshake failed");
                entry.remove();
            }
        }
    }

    /// Drop a session the server no longer recognises.
    fn forget(&self, origin: &str, session: &Arc<ServerSession>) {
        self.inner.peers.remove_if(origin, |_, state| {
            matches!(state, PeerState::Authenticated(current) if Arc::ptr_eq(current, session))
        });
        tracing::debug!(origin = %origin, "session dropped");
    }

    async fn send_signed(
        &self,
        session: &ServerSession,
        method: &reqwest::Method,
        url: &Url,
        body: &[u8],
        payment: Option<&str>,
    ) -> Result<reqwest::Response, AuthPayError> {
        let nonce = random_nonce(NONCE_LEN);
        let path_and_query = &url[Position::BeforePath..Position::AfterQuery];
        let canonical = canonical_request(
            method.as_str(),
            path_and_query,
            &nonce,
            &session.server_nonce,
            body,
            payment,
        );
        let signature = self.inner.wallet.create_signature(&canonical).await?;

        let mut req = self
            .inner
            .http
            .request(method.clone(), url.clone())
            .header(HEADER_AUTH_VERSION, AUTH_VERSION)
            .header(HEADER_IDENTITY_KEY, self.inner.wallet.identity_key())
            .header(HEADER_NONCE, nonce)
            .header(HEADER_YOUR_NONCE, session.server_nonce.as_str())
            .header(HEADER_SIGNATURE, signature)
            .body(body.to_vec());
        if let Some(payment) = payment {
            req = req.header(HEADER_PAYMENT, payment);
        }
        req.send()
            .await
            .map_err(|e| AuthPayError::HttpError(format!("request failed: {e}")))
    }

    /// Fund a key derived for the server and encode the remittance header.
    async fn build_payment(
        &self,
        session: &ServerSession,
        satoshis: u64,
        prefix: &str,
    ) -> Result<String, AuthPayError> {
        let wallet = &self.inner.wallet;
        let suffix = base64::engine::general_purpose::STANDARD.encode(random_bytes::<16>());
        let key = wallet
            .get_public_key(GetPublicKeyArgs {
                protocol_id: PAYMENT_PROTOCOL_ID.to_string(),
                key_id: format!("{prefix} {suffix}"),
                counterparty: Some(session.server_identity_key.clone()),
                for_self: false,
            })
            .await
            .map_err(construction)?;
        let script = identity::p2pk_locking_script(&identity::parse_public_key(&key).map_err(construction)?);

        let action = wallet
            .create_action(
                CreateActionArgs {
                    description: PAYMENT_DESCRIPTION.to_string(),
                    outputs: vec![CreateActionOutput {
                        locking_script: script,
                        satoshis,
                        output_description: "request payment".to_string(),
                        custom_instructions: None,
                    }],
                    labels: vec![],
                    options: CreateActionOptions::default(),
                },
                self.inner.config.originator.as_deref(),
            )
            .await
            .map_err(construction)?;
        let transaction = action.tx.ok_or_else(|| {
            AuthPayError::PaymentConstructionFailed("wallet returned no transaction".to_string())
        })?;

        encode_payment(&PaymentRemittance {
            derivation_prefix: prefix.to_string(),
            derivation_suffix: suffix,
            sender_identity_key: wallet.identity_key(),
            transaction,
        })
    }
}

impl<W: Wallet, O: RevocationOracle> Inner<W, O> {
    async fn handshake(&self, origin: &str) -> Result<ServerSession, AuthPayError> {
        let endpoint = format!("{origin}{AUTH_ENDPOINT}");
        let client_nonce = random_nonce(NONCE_LEN);
        let identity_key = self.wallet.identity_key();
        tracing::debug!(origin = %origin, "starting handshake");

        let reply = self
            .post_auth(
                &endpoint,
                &AuthMessage::InitialRequest {
                    version: AUTH_VERSION.to_string(),
                    identity_key: identity_key.clone(),
                    initial_nonce: client_nonce.clone(),
                    requested_certificates: self.config.requested_certificates.clone(),
                },
            )
            .await?;
        let AuthMessage::InitialResponse {
            version,
            identity_key: server_identity,
            initial_nonce: server_nonce,
            your_nonce,
            certificates,
            requested_certificates,
            signature,
        } = serde_json::from_value::<AuthMessage>(reply)?
        else {
            return Err(AuthPayError::HandshakeFailed(
                "expected initialResponse".to_string(),
            ));
        };
        if version != AUTH_VERSION {
            return Err(AuthPayError::HandshakeFailed(format!(
                "unsupported auth version {version}"
            )));
        }
        if your_nonce != client_nonce {
            return Err(AuthPayError::HandshakeFailed(
                "server answered a different nonce".to_string(),
            ));
        }
        let payload = initial_response_payload(
            &client_nonce,
            &server_nonce,
            &server_identity,
            &certificates,
            requested_certificates.as_ref(),
        )?;
        if !identity::verify(&server_identity, &payload, &signature) {
            return Err(AuthPayError::HandshakeFailed(
                "invalid server signature".to_string(),
            ));
        }

        let verified = match &self.config.requested_certificates {
            Some(required) => {
                self.negotiator
                    .verify_certificates(required, &certificates, &server_identity)
                    .await?
            }
            None => Vec::new(),
        };

        if let Some(requested) = requested_certificates {
            let proven = self
                .negotiator
                .request_certificates(&requested, &server_identity)
                .await?;
            let payload = certificate_response_payload(&client_nonce, &server_nonce, &proven)?;
            let signature = self.wallet.create_signature(&payload).await?;
            self.post_auth(
                &endpoint,
                &AuthMessage::CertificateResponse {
                    version,
                    identity_key,
                    nonce: client_nonce,
                    your_nonce: server_nonce.clone(),
                    certificates: proven,
                    signature,
                },
            )
            .await?;
        }

        tracing::info!(origin = %origin, server = %server_identity, "session established");
        Ok(ServerSession {
            origin: origin.to_string(),
            server_identity_key: server_identity,
            server_nonce,
            certificates: verified,
        })
    }

    async fn post_auth(
        &self,
        endpoint: &str,
        msg: &AuthMessage,
    ) -> Result<serde_json::Value, AuthPayError> {
        let resp = self
            .http
            .post(endpoint)
            .json(msg)
            .send()
            .await
            .map_err(|e| AuthPayError::HandshakeFailed(format!("handshake request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        resp.json()
            .await
            .map_err(|e| AuthPayError::HandshakeFailed(format!("invalid handshake reply: {e}")))
    }
}

fn header_str<'a>(resp: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Price and derivation prefix of a 402 response.
fn payment_terms(resp: &reqwest::Response) -> Result<(u64, String), AuthPayError> {
    let satoshis = header_str(resp, HEADER_SATOSHIS_REQUIRED).and_then(|v| v.parse::<u64>().ok());
    let prefix = header_str(resp, HEADER_DERIVATION_PREFIX).filter(|p| !p.is_empty());
    match (satoshis, prefix) {
        (Some(satoshis), Some(prefix)) => Ok((satoshis, prefix.to_string())),
        _ => Err(AuthPayError::HttpError(
            "402 response without payment terms".to_string(),
        )),
    }
}

/// Turn a rejection body back into the error kind the server raised.
async fn rejection(resp: reqwest::Response) -> AuthPayError {
    let status = resp.status();
    let Ok(body) = resp.json::<ErrorBody>().await else {
        return AuthPayError::HttpError(format!("server returned {status}"));
    };
    match (body.code.as_str(), body.satoshis_required) {
        ("ERR_PAYMENT_REQUIRED", Some(required)) => AuthPayError::PaymentRequired {
            satoshis_required: required,
            derivation_prefix: body.derivation_prefix.unwrap_or_default(),
        },
        ("ERR_INSUFFICIENT_PAYMENT", Some(required)) => AuthPayError::InsufficientPayment {
            required,
            paid: body.satoshis_paid.unwrap_or(0),
        },
        _ => AuthPayError::from_code(&body.code, body.description),
    }
}

fn construction(e: WalletError) -> AuthPayError {
    match e {
        WalletError::PrivilegedOperationDenied(msg) => AuthPayError::PrivilegedOperationDenied(msg),
        other => AuthPayError::PaymentConstructionFailed(other.to_string()),
    }
}

/// Error handed to every caller that waited on a failed handshake.
fn surface(err: &AuthPayError) -> AuthPayError {
    match err {
        AuthPayError::PrivilegedOperationDenied(msg) => {
            AuthPayError::PrivilegedOperationDenied(msg.clone())
        }
        AuthPayError::HandshakeFailed(msg) => AuthPayError::HandshakeFailed(msg.clone()),
        other => AuthPayError::HandshakeFailed(other.to_string()),
    }
}
