//! HTTP API for health checks, order status, and resolver/operator actions

use crate::chain::{ChainSide, GatewayError};
use crate::config::ApiConfig;
use crate::coordination::{CoordinationEngine, EngineStatus};
use crate::error::{RelayerError, RelayerResult};
use crate::fill::FillRequest;
use crate::order::{Order, OrderStatus, RefundProgress};
use crate::state::{StateStats, StateStore};
use crate::store::StoreStats;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CoordinationEngine>,
    pub state: Arc<dyn StateStore>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<CoordinationEngine>, state: Arc<dyn StateStore>) -> Self {
        Self {
            engine,
            state,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/stats", get(get_stats))
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/secret", post(reveal_secret))
        .route("/orders/:id/fills", post(request_fill))
        .route("/orders/:id/cancel", post(cancel_order))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Run the HTTP API server until `shutdown` resolves
pub async fn run_server<F>(config: ApiConfig, state: AppState, shutdown: F) -> RelayerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Config(format!("cannot bind API server to {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server failed: {}", e)))?;

    info!("API server stopped");
    Ok(())
}

/// Error body returned by every failing endpoint
pub struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayerError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayerError::OrderNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::StaleStatus { .. } | RelayerError::InvalidStateTransition { .. } => {
                StatusCode::CONFLICT
            }
            RelayerError::Gateway { source, .. } if source.is_transient() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayerError::Gateway {
                source: GatewayError::Rejected(_),
                ..
            } => StatusCode::CONFLICT,
            RelayerError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - state store and both ledgers reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.state.health_check().await.is_ok();

    let timeout = state.engine.config().gateway_timeout();
    let details: Vec<ChainHealth> = state
        .engine
        .chains()
        .health_check(timeout)
        .await
        .into_iter()
        .map(|(side, chain_id, healthy)| ChainHealth {
            side,
            chain_id,
            healthy,
        })
        .collect();
    let chains = details.len() == ChainSide::BOTH.len() && details.iter().all(|c| c.healthy);

    let ready = database && chains && !state.engine.is_shutting_down();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            details,
        }),
    )
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        engine: state.engine.status().await,
    })
}

/// Order counts from memory and from the state store
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let orders = state.engine.stats().await;
    let persisted = state.state.get_stats().await?;
    Ok(Json(StatsResponse { orders, persisted }))
}

async fn list_orders(State(state): State<AppState>) -> impl IntoResponse {
    let orders: Vec<OrderSummary> = state
        .engine
        .active_orders()
        .await
        .iter()
        .map(OrderSummary::from)
        .collect();
    Json(orders)
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    state
        .engine
        .get_order(&order_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(RelayerError::OrderNotFound { order_id }))
}

async fn reveal_secret(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(body): Json<SecretBody>,
) -> Result<Json<AcceptedResponse>, ApiError> {
    state.engine.reveal_secret(&order_id, &body.secret).await?;
    Ok(Json(AcceptedResponse {
        order_id,
        accepted: true,
    }))
}

async fn request_fill(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Json(body): Json<FillBody>,
) -> Result<Json<FillRequest>, ApiError> {
    let amount = body.amount.value()?;
    let request = state.engine.request_fill(&order_id, amount).await?;
    Ok(Json(request))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<RefundProgress>, ApiError> {
    let progress = state.engine.cancel_order(&order_id).await?;
    Ok(Json(progress))
}

// Request types

#[derive(Deserialize)]
struct SecretBody {
    /// 32 bytes, hex
    secret: String,
}

#[derive(Deserialize)]
struct FillBody {
    amount: Amount,
}

/// Token amounts may exceed what JSON numbers carry safely, so strings
/// are accepted too
#[derive(Deserialize)]
#[serde(untagged)]
enum Amount {
    Number(u64),
    Text(String),
}

impl Amount {
    fn value(&self) -> RelayerResult<u128> {
        match self {
            Amount::Number(n) => Ok(u128::from(*n)),
            Amount::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| RelayerError::Validation(format!("invalid amount `{}`", s))),
        }
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    side: ChainSide,
    chain_id: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    engine: EngineStatus,
}

#[derive(Serialize)]
struct StatsResponse {
    orders: StoreStats,
    persisted: StateStats,
}

#[derive(Serialize)]
struct AcceptedResponse {
    order_id: String,
    accepted: bool,
}

#[derive(Serialize)]
struct OrderSummary {
    order_id: String,
    status: OrderStatus,
    source_chain_id: String,
    destination_chain_id: String,
    source_amount: String,
    destination_amount: String,
    current_price: Option<String>,
    remaining: Option<String>,
    expires_at: u64,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            status: order.status,
            source_chain_id: order.source_chain_id.clone(),
            destination_chain_id: order.destination_chain_id.clone(),
            source_amount: order.source_asset.amount.to_string(),
            destination_amount: order.destination_asset.amount.to_string(),
            current_price: order.current_price.map(|p| p.to_string()),
            remaining: order
                .partial_fill
                .as_ref()
                .map(|ledger| ledger.remaining_amount.to_string()),
            expires_at: order.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainHandle, ChainManager, SimulatedLedger};
    use crate::config::RelayerConfig;
    use crate::coordination::ManualClock;
    use crate::state::MemoryStateStore;
    use crate::store::tests::sample_order;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<CoordinationEngine>) {
        let chains = ChainManager::new(
            ChainHandle::new(ChainSide::A, "alpha", Arc::new(SimulatedLedger::new("chain-a", 1_000)), 0),
            ChainHandle::new(ChainSide::B, "beta", Arc::new(SimulatedLedger::new("chain-b", 1_000)), 0),
        )
        .unwrap();
        let state: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let engine = Arc::new(
            CoordinationEngine::new(
                Arc::new(chains),
                state.clone(),
                RelayerConfig::default(),
                Arc::new(ManualClock::new(1_000)),
            )
            .await
            .unwrap(),
        );
        (router(AppState::new(engine.clone(), state)), engine)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let (app, _) = app().await;

        let (status, body) = send(app.clone(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(app, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["details"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_order_is_404() {
        let (app, _) = app().await;
        let (status, body) = send(app, get("/orders/deadbeef")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("deadbeef"));
    }

    #[tokio::test]
    async fn test_orders_are_listed() {
        let (app, engine) = app().await;
        let order = sample_order(3);
        engine.store().insert(order.clone()).await;

        let (status, body) = send(app.clone(), get("/orders")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["order_id"], order.order_id.as_str());
        assert_eq!(body[0]["status"], "pending");
        assert_eq!(body[0]["source_amount"], "100");

        let (status, _) = send(app, get(&format!("/orders/{}", order.order_id))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_secret_must_open_the_hashlock() {
        let (app, engine) = app().await;
        let order = sample_order(4);
        engine.store().insert(order.clone()).await;
        let uri = format!("/orders/{}/secret", order.order_id);

        let wrong = hex::encode([1u8; 32]);
        let (status, _) = send(app.clone(), post_json(&uri, serde_json::json!({ "secret": wrong }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let right = hex::encode([7u8; 32]);
        let (status, body) = send(app, post_json(&uri, serde_json::json!({ "secret": right }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accepted"], true);
        assert!(engine.vault().contains(&order.order_id));
    }

    #[tokio::test]
    async fn test_fill_on_pending_order_is_rejected() {
        let (app, engine) = app().await;
        let order = sample_order(5);
        engine.store().insert(order.clone()).await;

        let uri = format!("/orders/{}/fills", order.order_id);
        let (status, body) = send(app.clone(), post_json(&uri, serde_json::json!({ "amount": "40" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cannot be filled"));

        let (status, _) = send(app, post_json(&uri, serde_json::json!({ "amount": "forty" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_requires_expiry() {
        let (app, engine) = app().await;
        let order = sample_order(6);
        engine.store().insert(order.clone()).await;

        let uri = format!("/orders/{}/cancel", order.order_id);
        let (status, _) = send(app, post_json(&uri, serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
