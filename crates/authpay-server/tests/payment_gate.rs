use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use actix_web::http::header::HeaderValue;
use actix_web::{test, web, App, HttpRequest, HttpResponse};
use authpay::auth::{canonical_request, certificate_response_payload, initial_response_payload};
use authpay::certificate::MasterCertificate;
use authpay::constants::*;
use authpay::identity::{self, identity_key_hex, random_secret_key};
use authpay::security::random_nonce;
use authpay::wallet::{CreateActionArgs, CreateActionOptions, CreateActionOutput, GetPublicKeyArgs};
use authpay::{
    encode_payment, AuthMessage, CertificateNegotiator, InMemoryReplayStore,
    InMemoryRevocationOracle, PaymentRemittance, RequestedCertificateSet, Wallet,
};
use authpay_server::config::PaymentConfig;
use authpay_server::{
    configure_auth, GateError, PaymentConfigBuilder, PaymentGateConfig, PaymentMiddleware,
};
use authpay_wallet::MemoryWallet;
use secp256k1::SecretKey;

type Gate = PaymentMiddleware<MemoryWallet, InMemoryRevocationOracle>;

fn gate_config() -> PaymentGateConfig {
    PaymentGateConfig {
        server_key: random_secret_key(),
        prefix_secret: b"integration-prefix-secret".to_vec(),
        default_price: 100,
        require_auth: true,
        session_ttl_secs: 3600,
        replay_db: None,
        revocation_url: None,
        rate_limit_rpm: 60,
        allowed_origins: vec![],
        port: 0,
        metrics_token: None,
        public_metrics: false,
    }
}

struct Server {
    wallet: Arc<MemoryWallet>,
    gate: web::Data<Gate>,
    calls: web::Data<AtomicUsize>,
}

fn server_with(config: PaymentConfig) -> Server {
    let wallet = Arc::new(MemoryWallet::new(random_secret_key()));
    let gate = web::Data::new(PaymentMiddleware::new(
        wallet.clone(),
        Arc::new(InMemoryRevocationOracle::new()),
        config,
        Arc::new(InMemoryReplayStore::new()),
    ));
    Server {
        wallet,
        gate,
        calls: web::Data::new(AtomicUsize::new(0)),
    }
}

fn priced_server() -> Server {
    server_with(
        PaymentConfigBuilder::new(&gate_config())
            .route("POST", "/resource", 10)
            .route("GET", "/free", 0)
            .build(),
    )
}

async fn protected(
    req: HttpRequest,
    body: web::Bytes,
    gate: web::Data<Gate>,
    calls: web::Data<AtomicUsize>,
) -> Result<HttpResponse, GateError> {
    gate.handle(&req, &body, |receipt| async move {
        calls.fetch_add(1, Ordering::SeqCst);
        HttpResponse::Ok().json(serde_json::json!({ "paid": receipt.satoshis_paid }))
    })
    .await
}

macro_rules! app {
    ($server:expr) => {
        test::init_service(
            App::new()
                .app_data($server.gate.clone())
                .app_data($server.calls.clone())
                .configure(configure_auth::<MemoryWallet, InMemoryRevocationOracle>)
                .route("/resource", web::post().to(protected))
                .route("/free", web::get().to(protected)),
        )
        .await
    };
}

/// Client side of one session, driven by hand.
struct Client {
    secret: SecretKey,
    wallet: MemoryWallet,
    initial_nonce: String,
    server_identity: String,
    server_nonce: String,
}

impl Client {
    fn new(balance: u64) -> Self {
        let secret = random_secret_key();
        Self {
            secret,
            wallet: MemoryWallet::new(secret).with_balance(balance),
            initial_nonce: random_nonce(NONCE_LEN),
            server_identity: String::new(),
            server_nonce: String::new(),
        }
    }

    fn initial_request(&self) -> test::TestRequest {
        test::TestRequest::post()
            .uri(AUTH_ENDPOINT)
            .set_json(AuthMessage::InitialRequest {
                version: AUTH_VERSION.to_string(),
                identity_key: self.wallet.identity_key(),
                initial_nonce: self.initial_nonce.clone(),
                requested_certificates: None,
            })
    }

    /// Record the server's `initialResponse`, checking its signature.
    fn accept(&mut self, reply: AuthMessage) -> Option<RequestedCertificateSet> {
        let AuthMessage::InitialResponse {
            identity_key,
            initial_nonce,
            your_nonce,
            certificates,
            requested_certificates,
            signature,
            ..
        } = reply
        else {
            panic!("expected initialResponse");
        };
        assert_eq!(your_nonce, self.initial_nonce);
        let payload = initial_response_payload(
            &self.initial_nonce,
            &initial_nonce,
            &identity_key,
            &certificates,
            requested_certificates.as_ref(),
        )
        .unwrap();
        assert!(identity::verify(&identity_key, &payload, &signature));
        self.server_identity = identity_key;
        self.server_nonce = initial_nonce;
        requested_certificates
    }

    fn signed(&self, method: &str, path: &str, body: &[u8], payment: Option<&str>) -> test::TestRequest {
        let nonce = random_nonce(NONCE_LEN);
        let canonical = canonical_request(method, path, &nonce, &self.server_nonce, body, payment);
        let mut req = match method {
            "GET" => test::TestRequest::get(),
            _ => test::TestRequest::post(),
        }
        .uri(path)
        .insert_header((HEADER_AUTH_VERSION, AUTH_VERSION))
        .insert_header((HEADER_IDENTITY_KEY, self.wallet.identity_key()))
        .insert_header((HEADER_NONCE, nonce))
        .insert_header((HEADER_YOUR_NONCE, self.server_nonce.clone()))
        .insert_header((HEADER_SIGNATURE, identity::sign(&self.secret, &canonical)))
        .set_payload(body.to_vec());
        if let Some(p) = payment {
            req = req.insert_header((HEADER_PAYMENT, p.to_string()));
        }
        req
    }

    async fn payment(&self, prefix: &str, satoshis: u64) -> String {
        self.payment_to(&self.server_identity, prefix, satoshis).await
    }

    async fn payment_to(&self, recipient: &str, prefix: &str, satoshis: u64) -> String {
        let suffix = random_nonce(16);
        let key = self
            .wallet
            .get_public_key(GetPublicKeyArgs {
                protocol_id: PAYMENT_PROTOCOL_ID.to_string(),
                key_id: format!("{prefix} {suffix}"),
                counterparty: Some(recipient.to_string()),
                for_self: false,
            })
            .await
            .unwrap();
        let script = identity::p2pk_locking_script(&identity::parse_public_key(&key).unwrap());
        let action = self
            .wallet
            .create_action(
                CreateActionArgs {
                    description: PAYMENT_DESCRIPTION.to_string(),
                    outputs: vec![CreateActionOutput {
                        locking_script: script,
                        satoshis,
                        output_description: "payment".into(),
                        custom_instructions: None,
                    }],
                    labels: vec![],
                    options: CreateActionOptions::default(),
                },
                None,
            )
            .await
            .unwrap();
        encode_payment(&PaymentRemittance {
            derivation_prefix: prefix.to_string(),
            derivation_suffix: suffix,
            sender_identity_key: self.wallet.identity_key(),
            transaction: action.tx.unwrap(),
        })
        .unwrap()
    }
}

fn required_price(resp: &actix_web::dev::ServiceResponse) -> (u64, String) {
    let price = resp
        .headers()
        .get(HEADER_SATOSHIS_REQUIRED)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let prefix = resp
        .headers()
        .get(HEADER_DERIVATION_PREFIX)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    (price, prefix)
}

#[actix_rt::test]
async fn test_missing_payment_returns_price_and_prefix() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let resp = test::call_service(&app, client.signed("POST", "/resource", b"{}", None).to_request()).await;
    assert_eq!(resp.status(), 402);
    let (price, prefix) = required_price(&resp);
    assert_eq!(price, 10);
    assert!(!prefix.is_empty());
    assert_eq!(resp.headers().get(HEADER_PAYMENT_VERSION).unwrap(), PAYMENT_VERSION);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_PAYMENT_REQUIRED");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
}

#[actix_rt::test]
async fn test_exact_payment_is_forwarded_and_acknowledged() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let quote = test::call_service(&app, client.signed("POST", "/resource", b"{}", None).to_request()).await;
    let (price, prefix) = required_price(&quote);
    let payment = client.payment(&prefix, price).await;

    let resp = test::call_service(
        &app,
        client.signed("POST", "/resource", b"{}", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get(HEADER_SATOSHIS_PAID).unwrap(), "10");
    assert_eq!(
        resp.headers().get(HEADER_IDENTITY_KEY).unwrap().to_str().unwrap(),
        client.server_identity
    );
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.wallet.credited(), 10);
    assert_eq!(client.wallet.balance(), 90);
}

#[actix_rt::test]
async fn test_underpayment_never_reaches_handler() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let quote = test::call_service(&app, client.signed("POST", "/resource", b"", None).to_request()).await;
    let (_, prefix) = required_price(&quote);
    let payment = client.payment(&prefix, 9).await;

    let resp = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 402);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_INSUFFICIENT_PAYMENT");
    assert_eq!(body["satoshisRequired"], 10);
    assert_eq!(body["satoshisPaid"], 9);
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
}

#[actix_rt::test]
async fn test_duplicate_payment_rejected_and_not_credited_twice() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let quote = test::call_service(&app, client.signed("POST", "/resource", b"", None).to_request()).await;
    let (_, prefix) = required_price(&quote);
    let payment = client.payment(&prefix, 10).await;

    let first = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(first.status(), 200);

    let second = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(second.status(), 409);
    let body: serde_json::Value = test::read_body_json(second).await;
    assert_eq!(body["code"], "ERR_DUPLICATE_PAYMENT");
    assert_eq!(server.wallet.credited(), 10);
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
}

#[actix_rt::test]
async fn test_overpayment_is_accepted_with_credited_ack() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let quote = test::call_service(&app, client.signed("POST", "/resource", b"", None).to_request()).await;
    let (_, prefix) = required_price(&quote);
    let payment = client.payment(&prefix, 12).await;

    let resp = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get(HEADER_SATOSHIS_PAID).unwrap(), "12");
}

#[actix_rt::test]
async fn test_free_route_needs_no_payment() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(0);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let resp = test::call_service(&app, client.signed("GET", "/free", b"", None).to_request()).await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().get(HEADER_SATOSHIS_PAID).is_none());
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
}

#[actix_rt::test]
async fn test_unauthenticated_request_rejected() {
    let server = priced_server();
    let app = app!(server);

    let req = test::TestRequest::post().uri("/resource").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_AUTHENTICATION_REQUIRED");
}

#[actix_rt::test]
async fn test_non_ascii_payment_header_is_malformed() {
    let server = server_with(
        PaymentConfigBuilder::new(&gate_config())
            .require_auth(false)
            .route("POST", "/resource", 10)
            .build(),
    );
    let app = app!(server);

    let req = test::TestRequest::post()
        .uri("/resource")
        .insert_header((
            HEADER_PAYMENT,
            HeaderValue::from_bytes(b"\xff\xfegarbage").unwrap(),
        ))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    assert!(resp.headers().get(HEADER_SATOSHIS_REQUIRED).is_none());
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_MALFORMED_PAYMENT");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
}

#[actix_rt::test]
async fn test_route_can_opt_out_of_authentication() {
    let server = server_with(
        PaymentConfigBuilder::new(&gate_config())
            .route("POST", "/resource", 10)
            .route("GET", "/free", 0)
            .route_auth("GET", "/free", false)
            .build(),
    );
    let app = app!(server);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/free").to_request()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);

    // The global switch still applies everywhere else.
    let resp = test::call_service(&app, test::TestRequest::post().uri("/resource").to_request()).await;
    assert_eq!(resp.status(), 401);
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
}

#[actix_rt::test]
async fn test_route_can_require_authentication_when_global_switch_is_off() {
    let server = server_with(
        PaymentConfigBuilder::new(&gate_config())
            .require_auth(false)
            .route("POST", "/resource", 10)
            .route("GET", "/free", 0)
            .route_auth("POST", "/resource", true)
            .build(),
    );
    let app = app!(server);

    let resp = test::call_service(&app, test::TestRequest::post().uri("/resource").to_request()).await;
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_AUTHENTICATION_REQUIRED");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/free").to_request()).await;
    assert_eq!(resp.status(), 200);
}

#[actix_rt::test]
async fn test_tampered_body_fails_signature() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let req = client
        .signed("POST", "/resource", b"original", None)
        .set_payload(b"tampered".to_vec())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);
}

#[actix_rt::test]
async fn test_pricing_failure_is_internal_and_unbilled() {
    let server = server_with(
        PaymentConfigBuilder::new(&gate_config())
            .pricing_fn(|_| async { Err("price feed unavailable".to_string()) })
            .build(),
    );
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let resp = test::call_service(&app, client.signed("POST", "/resource", b"", None).to_request()).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_INTERNAL_PRICING");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    assert_eq!(client.wallet.balance(), 100);
}

#[actix_rt::test]
async fn test_prefix_not_issued_by_server_rejected() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let payment = client.payment("bWFkZSB1cCBwcmVmaXg=", 10).await;
    let resp = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_INVALID_DERIVATION_PREFIX");
    assert_eq!(server.wallet.credited(), 0);
}

#[actix_rt::test]
async fn test_refused_payment_can_be_retried() {
    let server = priced_server();
    let app = app!(server);
    let mut client = Client::new(100);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    client.accept(reply);

    let quote = test::call_service(&app, client.signed("POST", "/resource", b"", None).to_request()).await;
    let (_, prefix) = required_price(&quote);
    // Funds a key derived for someone else: the server wallet refuses it.
    let stranger = MemoryWallet::random();
    let payment = client.payment_to(&stranger.identity_key(), &prefix, 10).await;

    let resp = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&payment)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["code"], "ERR_PAYMENT_REJECTED");
    assert_eq!(server.calls.load(Ordering::SeqCst), 0);

    let good = client.payment(&prefix, 10).await;
    let resp = test::call_service(
        &app,
        client.signed("POST", "/resource", b"", Some(&good)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
}

#[actix_rt::test]
async fn test_certificates_required_before_requests() {
    let certifier = random_secret_key();
    let requested = RequestedCertificateSet::new(
        vec![identity_key_hex(&certifier)],
        BTreeMap::from([("membership".to_string(), vec!["tier".to_string()])]),
    );
    let server = server_with(
        PaymentConfigBuilder::new(&gate_config())
            .route("GET", "/free", 0)
            .request_certificates(requested)
            .build(),
    );
    let app = app!(server);

    let mut client = Client::new(0);
    let reply = test::call_and_read_body_json(&app, client.initial_request().to_request()).await;
    let asked = client.accept(reply).expect("server asks for certificates");

    // Session exists but is not open yet.
    let resp = test::call_service(&app, client.signed("GET", "/free", b"", None).to_request()).await;
    assert_eq!(resp.status(), 401);

    let holder = Arc::new(MemoryWallet::new(client.secret));
    holder
        .add_master_certificate(
            MasterCertificate::issue(
                &certifier,
                &client.wallet.identity_key(),
                "membership",
                "serial-1",
                "outpoint.0",
                &BTreeMap::from([("tier".to_string(), "gold".to_string())]),
            )
            .unwrap(),
        )
        .unwrap();
    let certificates = CertificateNegotiator::new(holder, Arc::new(InMemoryRevocationOracle::new()))
        .request_certificates(&asked, &client.server_identity)
        .await
        .unwrap();
    let payload =
        certificate_response_payload(&client.initial_nonce, &client.server_nonce, &certificates)
            .unwrap();
    let msg = AuthMessage::CertificateResponse {
        version: AUTH_VERSION.to_string(),
        identity_key: client.wallet.identity_key(),
        nonce: client.initial_nonce.clone(),
        your_nonce: client.server_nonce.clone(),
        certificates,
        signature: identity::sign(&client.secret, &payload),
    };
    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri(AUTH_ENDPOINT).set_json(msg).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(&app, client.signed("GET", "/free", b"", None).to_request()).await;
    assert_eq!(resp.status(), 200);
}
