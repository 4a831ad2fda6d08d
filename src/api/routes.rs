// API route handlers for DMPool

use super::ApiState;
use super::error::ApiError;
use crate::auth::AdminCapability;
use crate::distributor::{self, BlockEvent};
use crate::health::HealthStatus;
use crate::ledger::{MinerBalance, PoolAccount};
use crate::payout::{Payout, PayoutQuery, PayoutRunReport, PayoutStats};
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub payouts: PayoutStats,
    pub pool: PoolAccount,
    pub miners: usize,
    pub blocks_credited: usize,
    pub last_processed_height: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ThresholdRequest {
    pub threshold_satoshis: u64,
}

#[derive(Debug, Serialize)]
pub struct ThresholdResponse {
    pub address: String,
    pub threshold_satoshis: u64,
}

/// 503 when the ledger is unusable so load balancers take the instance out
pub async fn health(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<HealthStatus>) {
    let status = state.health.check().await;
    let code = if status.status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

pub async fn list_balances(State(state): State<Arc<ApiState>>) -> Json<Vec<MinerBalance>> {
    Json(state.ledger.list_balances().await)
}

pub async fn get_balance(
    State(state): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Result<Json<MinerBalance>, ApiError> {
    state
        .ledger
        .get_balance(&address)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No balance for {}", address)))
}

pub async fn list_payouts(
    State(state): State<Arc<ApiState>>,
    Query(mut query): Query<PayoutQuery>,
) -> Json<Vec<Payout>> {
    query.limit = query.limit.map(|l| l.min(MAX_LIMIT));
    Json(state.payouts.list_payouts(&query).await)
}

pub async fn stuck_payouts(State(state): State<Arc<ApiState>>) -> Json<Vec<Payout>> {
    Json(state.payouts.stuck_payouts(state.stuck_grace).await)
}

pub async fn get_payout(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payout>, ApiError> {
    state
        .payouts
        .get_payout(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Payout {}", id)))
}

pub async fn list_blocks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<BlockEvent>> {
    let limit = query.limit.unwrap_or(100).min(MAX_LIMIT);
    Json(distributor::list_blocks(&state.store, limit).await)
}

/// PPLNS distribution detail of a credited block
pub async fn get_block(
    State(state): State<Arc<ApiState>>,
    Path(height): Path<u64>,
) -> Result<Json<BlockEvent>, ApiError> {
    distributor::block_detail(&state.store, height)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No distribution recorded at height {}", height)))
}

pub async fn stats(State(state): State<Arc<ApiState>>) -> Json<PoolStats> {
    let payouts = state.payouts.stats().await;
    let (pool, miners, blocks_credited, last_processed_height) = state
        .store
        .read(|s| {
            (
                s.pool.clone(),
                s.balances.len(),
                s.blocks.len(),
                s.cursor.last_processed_height,
            )
        })
        .await;
    Json(PoolStats {
        payouts,
        pool,
        miners,
        blocks_credited,
        last_processed_height,
    })
}

pub async fn run_payouts(
    State(state): State<Arc<ApiState>>,
    Extension(capability): Extension<AdminCapability>,
) -> Json<PayoutRunReport> {
    Json(state.payouts.run_now(&capability).await)
}

pub async fn reset_payout(
    State(state): State<Arc<ApiState>>,
    Extension(capability): Extension<AdminCapability>,
    Path(id): Path<Uuid>,
) -> Result<Json<Payout>, ApiError> {
    Ok(Json(state.payouts.reset_retries(&capability, id).await?))
}

pub async fn set_threshold(
    State(state): State<Arc<ApiState>>,
    Extension(capability): Extension<AdminCapability>,
    Path(address): Path<String>,
    Json(request): Json<ThresholdRequest>,
) -> Result<Json<ThresholdResponse>, ApiError> {
    state
        .payouts
        .set_threshold_override(&capability, &address, Some(request.threshold_satoshis))
        .await?;
    Ok(Json(ThresholdResponse {
        address,
        threshold_satoshis: request.threshold_satoshis,
    }))
}

pub async fn clear_threshold(
    State(state): State<Arc<ApiState>>,
    Extension(capability): Extension<AdminCapability>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .payouts
        .set_threshold_override(&capability, &address, None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
