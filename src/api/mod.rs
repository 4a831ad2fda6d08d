// Observer and admin API for DMPool
//
// Read-only endpoints for balances, payouts, block distributions and pool
// statistics, plus admin endpoints gated by a bearer token carrying the
// admin role.

pub mod error;
pub mod routes;

use crate::auth::Authorizer;
use crate::config::ApiConfig;
use crate::health::HealthChecker;
use crate::ledger::Ledger;
use crate::payout::PayoutManager;
use crate::store::LedgerStore;
use axum::{
    Router,
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use chrono::TimeDelta;
use error::ApiError;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct ApiState {
    pub store: Arc<LedgerStore>,
    pub ledger: Ledger,
    pub payouts: Arc<PayoutManager>,
    pub authorizer: Arc<Authorizer>,
    pub health: Arc<HealthChecker>,
    /// Pending payouts older than this are listed as stuck
    pub stuck_grace: TimeDelta,
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    let admin = Router::new()
        .route("/api/admin/payouts/run", post(routes::run_payouts))
        .route("/api/admin/payouts/:id/reset", post(routes::reset_payout))
        .route(
            "/api/admin/thresholds/:address",
            put(routes::set_threshold).delete(routes::clear_threshold),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin_middleware,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/balances", get(routes::list_balances))
        .route("/api/v1/balances/:address", get(routes::get_balance))
        .route("/api/v1/payouts", get(routes::list_payouts))
        .route("/api/v1/payouts/stuck", get(routes::stuck_payouts))
        .route("/api/v1/payouts/:id", get(routes::get_payout))
        .route("/api/v1/blocks", get(routes::list_blocks))
        .route("/api/v1/blocks/:height", get(routes::get_block))
        .route("/api/v1/stats", get(routes::stats))
        .merge(admin)
        .with_state(state)
}

/// Verify the bearer token and hand the resulting capability to the handler
async fn admin_middleware(
    State(state): State<Arc<ApiState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let capability = state.authorizer.authorize_header(header).map_err(|e| {
        warn!("Rejected admin request to {}: {}", request.uri().path(), e);
        ApiError::from(e)
    })?;

    request.extensions_mut().insert(capability);
    Ok(next.run(request).await)
}

/// Start the API server; it stops when `shutdown` flips to true
pub async fn start_api_server(
    config: &ApiConfig,
    state: Arc<ApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, std::io::Error> {
    let app = create_router(state);
    let addr = format!("{}:{}", config.hostname, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("API server listening on http://{}", addr);

    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("API server shutdown signal received");
            })
            .await;
        if let Err(e) = result {
            warn!("API server error: {}", e);
        }
        info!("API server stopped");
    });

    Ok(handle)
}
