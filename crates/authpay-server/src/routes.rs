use actix_web::{get, post, web, HttpRequest, HttpResponse};
use authpay_server::{GateError, PaymentGateConfig};

use crate::DemoGate;

#[post("/resource")]
pub async fn resource(
    req: HttpRequest,
    body: web::Bytes,
    gate: web::Data<DemoGate>,
) -> Result<HttpResponse, GateError> {
    gate.handle(&req, &body, |receipt| async move {
        HttpResponse::Ok().json(serde_json::json!({
            "message": "paid resource",
            "satoshisPaid": receipt.satoshis_paid,
            "peer": receipt.peer.map(|p| p.peer_identity_key),
        }))
    })
    .await
}

#[get("/free")]
pub async fn free(
    req: HttpRequest,
    body: web::Bytes,
    gate: web::Data<DemoGate>,
) -> Result<HttpResponse, GateError> {
    gate.handle(&req, &body, |_| async {
        HttpResponse::Ok().json(serde_json::json!({ "message": "free resource" }))
    })
    .await
}

#[get("/metrics")]
pub async fn metrics_endpoint(
    req: HttpRequest,
    config: web::Data<PaymentGateConfig>,
) -> HttpResponse {
    match &config.metrics_token {
        Some(expected) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|token| {
                    authpay::security::constant_time_eq(token.as_bytes(), expected.as_bytes())
                })
                .unwrap_or(false);

            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "status": "error",
                    "code": "ERR_UNAUTHORIZED",
                    "description": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            // No token configured: metrics are protected by default.
            if !config.public_metrics {
                return HttpResponse::Forbidden().json(serde_json::json!({
                    "status": "error",
                    "code": "ERR_FORBIDDEN",
                    "description": "Set METRICS_TOKEN or AUTHPAY_PUBLIC_METRICS=true to access /metrics"
                }));
            }
        }
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(authpay_server::metrics::metrics_output())
}

#[get("/health")]
pub async fn health(gate: web::Data<DemoGate>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "authpay-server",
        "identityKey": gate.identity_key(),
        "sessions": gate.sessions().len(),
    }))
}
