mod backoff;
mod channel;
mod collab;
mod event;
mod http;
mod idempotency;
mod jobs;
mod metrics;
mod models;
mod normalize;
mod recovery;
mod resolve;
mod security;
mod status;
mod store;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use collab::{CollabConfig, Collaborators};
use event::EventError;
use idempotency::IdempotencyLedger;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, DeliveryReceipt, Marketplace, WebhookDelivery};
use normalize::{NormalizeError, Normalizer};
use recovery::RecoveryService;
use security::{AuthContext, WebhookAuthState, require_webhook_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use store::Store;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "portside.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = WebhookAuthState::from_env();
    let store = Store::new();
    if parse_env_bool("DEMO_SEED") {
        seed_demo_catalog(&store).await;
    }

    let ledger = IdempotencyLedger::from_env();
    let recovery = RecoveryService::from_env();
    let collaborators = Arc::new(Collaborators::new(CollabConfig::from_env()));
    let (queue, _workers) = jobs::JobQueue::spawn(collaborators, ledger, recovery.clone());
    let normalizer = Normalizer::new(store.clone(), queue.clone());

    spawn_recovery_timer(recovery.clone(), queue.clone());

    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        normalizer,
        store,
        queue,
        recovery,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/webhooks/{marketplace}", post(receive_webhook))
        .route("/events/{id}", get(get_webhook_status))
        .nest(
            "/recovery",
            Router::new()
                .route("/stats", get(recovery_stats))
                .route("/run", post(recovery_run))
                .route("/cleanup", post(recovery_cleanup)),
        )
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(
            auth_state,
            require_webhook_auth,
        ));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            concurrency_limit_from_env(),
        ))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "portside.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    normalizer: Normalizer,
    store: Store,
    queue: jobs::JobQueue,
    recovery: RecoveryService,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn spawn_recovery_timer(recovery: RecoveryService, queue: jobs::JobQueue) {
    let interval_secs = std::env::var("RECOVER_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let enqueued = recovery.recover(&queue).await;
            if enqueued > 0 {
                info!(
                    target = "portside.recovery",
                    enqueued = enqueued,
                    "periodic sweep re-enqueued jobs"
                );
            }
        }
    });
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "portside-sync-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Forbidden("docs"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Accept one webhook delivery from a marketplace.
///
/// - Method: `POST`
/// - Path: `/webhooks/{marketplace}`
/// - Auth: `Authorization: Bearer <key>` or `X-Portside-Key: <key>`
/// - Headers: `X-Webhook-Topic` (event type), optional `X-Webhook-Id`
///   (delivery id; redeliveries reuse it)
/// - Response: `DeliveryReceipt`
async fn receive_webhook(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(marketplace): Path<String>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<DeliveryReceipt>, AppError> {
    crate::metrics::inc_requests("/webhooks");
    let Some(marketplace) = Marketplace::from_str(&marketplace) else {
        return Err(AppError::NotFound("unknown marketplace"));
    };
    if context.marketplace != marketplace {
        return Err(AppError::Forbidden("marketplace_mismatch"));
    }

    let event_type = header_value(&headers, &["x-webhook-topic", "x-shopify-topic"])
        .ok_or(AppError::BadRequest("missing X-Webhook-Topic header"))?;
    let delivery_id = header_value(&headers, &["x-webhook-id", "x-shopify-webhook-id"])
        .and_then(|value| Uuid::parse_str(&value).ok())
        .unwrap_or_else(Uuid::new_v4);

    info!(
        target = "portside.api",
        marketplace = marketplace.code(),
        api_key = %context.api_key_id,
        event_type = %event_type,
        delivery_id = %delivery_id,
        "webhook delivery received",
    );

    let delivery = WebhookDelivery {
        id: delivery_id,
        marketplace,
        event_type,
        payload,
        headers: collect_headers(&headers),
    };
    let outcome = state.normalizer.process(delivery).await?;

    Ok(Json(DeliveryReceipt {
        event_id: delivery_id,
        outcome: outcome.label().to_string(),
        order_id: outcome.order_id(),
    }))
}

#[derive(Debug, Serialize)]
struct WebhookStatusResponse {
    id: Uuid,
    marketplace: Marketplace,
    event_type: String,
    processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<Uuid>,
    received_at: DateTime<Utc>,
}

async fn get_webhook_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<WebhookStatusResponse>, AppError> {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid event id"));
    };
    let Some(row) = state.store.event(uuid).await else {
        return Err(AppError::NotFound("event not found"));
    };
    Ok(Json(WebhookStatusResponse {
        id: row.id,
        marketplace: row.marketplace,
        event_type: row.event_type,
        processed: row.order_id.is_some(),
        order_id: row.order_id,
        received_at: row.received_at,
    }))
}

async fn recovery_stats(State(state): State<AppState>) -> Json<recovery::RecoveryStats> {
    crate::metrics::inc_requests("/recovery/stats");
    Json(state.recovery.stats().await)
}

async fn recovery_run(State(state): State<AppState>) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/recovery/run");
    let enqueued = state.recovery.recover(&state.queue).await;
    Json(json!({ "enqueued": enqueued }))
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    #[serde(default = "CleanupRequest::default_days")]
    older_than_days: i64,
}

impl CleanupRequest {
    fn default_days() -> i64 {
        30
    }
}

async fn recovery_cleanup(
    State(state): State<AppState>,
    request: Option<Json<CleanupRequest>>,
) -> Json<serde_json::Value> {
    crate::metrics::inc_requests("/recovery/cleanup");
    let older_than_days = request
        .map(|Json(body)| body.older_than_days)
        .unwrap_or_else(CleanupRequest::default_days);
    let deleted = state
        .recovery
        .cleanup_old_records(older_than_days.max(0))
        .await;
    Json(json!({ "deleted": deleted }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = Uuid::parse_str(&id) else {
        return Err(AppError::BadRequest("invalid job id"));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::NotFound("job not found"))
    }
}

#[derive(Debug)]
enum AppError {
    Normalize(NormalizeError),
    BadRequest(&'static str),
    NotFound(&'static str),
    Forbidden(&'static str),
}

impl From<NormalizeError> for AppError {
    fn from(value: NormalizeError) -> Self {
        Self::Normalize(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::Normalize(NormalizeError::Event(err)) => {
                let status = match &err {
                    EventError::UnknownEventType(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    EventError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
                };
                (status, "event_rejected", err.to_string())
            }
            AppError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "invalid_input", detail.to_string())
            }
            AppError::NotFound(detail) => {
                (StatusCode::NOT_FOUND, "not_found", detail.to_string())
            }
            AppError::Forbidden(detail) => {
                (StatusCode::FORBIDDEN, "forbidden", detail.to_string())
            }
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn header_value(headers: &axum::http::HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn collect_headers(headers: &axum::http::HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn concurrency_limit_from_env() -> usize {
    std::env::var("MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256)
}

fn parse_env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Small catalog so a demo deployment can resolve line items end to end.
async fn seed_demo_catalog(store: &Store) {
    use crate::store::{Credential, Listing, ListingStatus, Product, ProductStatus};

    store
        .upsert_product(Product {
            id: 311,
            title: "Leather satchel".into(),
            status: ProductStatus::Active,
            stock: 1,
        })
        .await;
    store
        .upsert_listing(Listing {
            id: Uuid::new_v4(),
            product_id: 311,
            marketplace: Marketplace::Shopify,
            provider_listing_id: "shp-8899".into(),
            status: ListingStatus::Active,
            price: 120.0,
        })
        .await;
    store
        .insert_credential(Credential {
            id: Uuid::new_v4(),
            marketplace: Marketplace::Shopify,
            label: "demo-webhook-secret".into(),
            active: true,
        })
        .await;
    info!(target = "portside.api", "seeded demo catalog");
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
