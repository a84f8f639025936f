use std::sync::Arc;

use authpay::InMemoryRevocationOracle;
use authpay_client::{AuthFetch, AuthFetchConfig};
use authpay_wallet::MemoryWallet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let key = match std::env::var("AUTHPAY_CLIENT_KEY") {
        Ok(key) => key,
        Err(_) => {
            tracing::error!("AUTHPAY_CLIENT_KEY environment variable is required");
            std::process::exit(1);
        }
    };
    let balance: u64 = std::env::var("AUTHPAY_CLIENT_BALANCE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000);
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://localhost:3000/resource".to_string());

    let wallet = match MemoryWallet::from_hex(&key) {
        Ok(wallet) => wallet.with_balance(balance),
        Err(e) => {
            tracing::error!("invalid AUTHPAY_CLIENT_KEY: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(identity = %authpay::Wallet::identity_key(&wallet), "client wallet ready");

    let client = match AuthFetch::new(
        Arc::new(wallet),
        Arc::new(InMemoryRevocationOracle::new()),
        AuthFetchConfig::default(),
    ) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };

    match client.fetch(reqwest::Method::POST, &url, None).await {
        Ok((resp, paid)) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            match paid {
                Some(satoshis) => tracing::info!(%status, satoshis, "paid request complete"),
                None => tracing::info!(%status, "request complete"),
            }
            println!("{body}");
        }
        Err(e) => {
            tracing::error!(code = e.code(), "request failed: {e}");
            std::process::exit(1);
        }
    }
}
