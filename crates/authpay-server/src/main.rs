use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authpay::constants::{
    HEADER_AUTH_VERSION, HEADER_DERIVATION_PREFIX, HEADER_IDENTITY_KEY, HEADER_PAYMENT_VERSION,
    HEADER_SATOSHIS_PAID, HEADER_SATOSHIS_REQUIRED,
};
use authpay::{
    HttpRevocationOracle, InMemoryReplayStore, InMemoryRevocationOracle, ReplayStore,
    RevocationOracle, SqliteReplayStore,
};
use authpay_server::{configure_auth, PaymentConfigBuilder, PaymentGateConfig, PaymentMiddleware};
use authpay_wallet::MemoryWallet;

mod routes;

/// Revocation lookups over HTTP when a ledger service is configured,
/// otherwise an in-memory oracle that treats every outpoint as unspent.
pub enum LedgerOracle {
    Memory(InMemoryRevocationOracle),
    Http(HttpRevocationOracle),
}

impl RevocationOracle for LedgerOracle {
    async fn is_unspent(&self, outpoint: &str) -> Result<bool, String> {
        match self {
            LedgerOracle::Memory(oracle) => oracle.is_unspent(outpoint).await,
            LedgerOracle::Http(oracle) => oracle.is_unspent(outpoint).await,
        }
    }
}

pub type DemoGate = PaymentMiddleware<MemoryWallet, LedgerOracle>;

fn build_cors(origins: &[String]) -> Cors {
    let cors = if origins.is_empty() {
        Cors::default().allowed_origin_fn(|origin, _| {
            origin
                .to_str()
                .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                .unwrap_or(false)
        })
    } else {
        origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
    };
    cors.allow_any_method()
        .allow_any_header()
        .expose_headers([
            HEADER_AUTH_VERSION,
            HEADER_IDENTITY_KEY,
            HEADER_PAYMENT_VERSION,
            HEADER_SATOSHIS_REQUIRED,
            HEADER_DERIVATION_PREFIX,
            HEADER_SATOSHIS_PAID,
        ])
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let gate_config = match PaymentGateConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    let port = gate_config.port;
    let cors_origins = gate_config.allowed_origins.clone();

    let wallet = Arc::new(MemoryWallet::new(gate_config.server_key));
    let oracle = Arc::new(match &gate_config.revocation_url {
        Some(url) => {
            tracing::info!("Revocation oracle: {url}");
            LedgerOracle::Http(HttpRevocationOracle::new(url))
        }
        None => LedgerOracle::Memory(InMemoryRevocationOracle::new()),
    });
    let replay: Arc<dyn ReplayStore> = match &gate_config.replay_db {
        Some(path) => {
            tracing::info!("Replay store: {path}");
            Arc::new(SqliteReplayStore::open(path).map_err(std::io::Error::other)?)
        }
        None => {
            tracing::warn!("AUTHPAY_REPLAY_DB not set; replay protection does not survive restarts");
            Arc::new(InMemoryReplayStore::new())
        }
    };

    let config = PaymentConfigBuilder::new(&gate_config)
        .route("POST", "/resource", 10)
        .route("GET", "/free", 0)
        .build();
    let gate = web::Data::new(PaymentMiddleware::new(wallet, oracle, config, replay));

    tracing::info!("authpay server listening at http://localhost:{port}");
    tracing::info!("Server identity: {}", gate.identity_key());
    tracing::info!("Endpoints: POST /.well-known/auth, POST /resource (10 sat), GET /free, GET /health, GET /metrics");
    tracing::info!("Rate limit: {} req/min per IP", gate_config.rate_limit_rpm);

    let purge_gate = gate.clone();
    actix_web::rt::spawn(async move {
        let mut interval = actix_web::rt::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let purged = purge_gate.sessions().purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "purged expired sessions");
            }
        }
    });

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(gate_config.rate_limit_rpm)
        .finish()
        .ok_or_else(|| std::io::Error::other("failed to build rate limiter config"))?;
    let gate_config = web::Data::new(gate_config);

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(web::JsonConfig::default().limit(65_536))
            .app_data(web::PayloadConfig::new(1024 * 1024))
            .app_data(gate.clone())
            .app_data(gate_config.clone())
            .configure(configure_auth::<MemoryWallet, LedgerOracle>)
            .service(routes::resource)
            .service(routes::free)
            .service(routes::metrics_endpoint)
            .service(routes::health)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
