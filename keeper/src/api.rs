//! Status API of the keeper
//!
//! Read-only views of requests, safes, balances and proposals, plus the
//! `/bus` inbox used by the HTTP group bus.

use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::{routing::get, Json, Router};
use safe_common::bus::bus_router;
use safe_common::BusFrame;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::node::KeeperNode;
use crate::storage::StorageError;
use crate::types::{BalanceRecord, LedgerTransaction, ProposalRecord, RequestRecord, SafeRecord};

pub struct AppState {
    pub node: Arc<KeeperNode>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn not_found(what: &str, key: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("NOT_FOUND", format!("{} not found", what)).with_details(key)),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new("BAD_REQUEST", message)))
}

fn storage_error(e: StorageError) -> ApiError {
    tracing::error!(error = %e, "status query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("STORAGE_ERROR", e.to_string())),
    )
}

fn parse_uuid(value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value).map_err(|e| bad_request(format!("invalid id {}: {}", value, e)))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub keeper_id: String,
    pub version: String,
    /// Request counts keyed by state
    pub requests: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct RequestResponse {
    #[serde(flatten)]
    pub request: RequestRecord,
    pub transactions: Vec<LedgerTransaction>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub address: String,
    pub asset_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bond_asset_id: Option<Uuid>,
    /// Integer amount in the asset's smallest unit
    pub balance: String,
}

impl From<BalanceRecord> for BalanceResponse {
    fn from(record: BalanceRecord) -> Self {
        Self {
            address: record.address,
            asset_id: record.asset_id,
            bond_asset_id: Some(record.bond_asset_id),
            balance: record.balance.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SafeResponse {
    #[serde(flatten)]
    pub safe: SafeRecord,
    pub balances: Vec<BalanceResponse>,
}

#[derive(Debug, Serialize)]
pub struct ProposalResponse {
    pub id: Uuid,
    pub holder: String,
    pub address: String,
    pub chain: String,
    pub asset_id: Uuid,
    pub amount: String,
    pub receiver: String,
    pub digest: String,
    pub session_id: Uuid,
    pub signature: Option<String>,
    pub state: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<ProposalRecord> for ProposalResponse {
    fn from(p: ProposalRecord) -> Self {
        Self {
            id: p.id,
            holder: p.holder,
            address: p.address,
            chain: p.chain.to_string(),
            asset_id: p.asset_id,
            amount: p.amount.to_string(),
            receiver: p.receiver,
            digest: p.digest,
            session_id: p.session_id,
            signature: p.signature,
            state: p.state.to_string(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// Create the router; frames posted to `/bus` go to `inbound`
pub fn create_router(state: Arc<AppState>, inbound: mpsc::UnboundedSender<BusFrame>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .route("/requests/{id}", get(request_handler))
        .route("/safes/{holder}", get(safe_handler))
        .route("/balances/{address}/{asset_id}", get(balance_handler))
        .route("/proposals/{id}", get(proposal_handler))
        .with_state(state)
        .merge(bus_router(inbound))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let requests = state.node.store().count_requests().await.map_err(storage_error)?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        keeper_id: state.node.config().keeper_id.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        requests,
    }))
}

async fn request_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RequestResponse>, ApiError> {
    let id = parse_uuid(&id)?;
    let store = state.node.store();
    let request = store
        .get_request(id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| not_found("request", id.to_string()))?;
    let transactions = store.request_transactions(id).await.map_err(storage_error)?;
    Ok(Json(RequestResponse { request, transactions }))
}

async fn safe_handler(
    State(state): State<Arc<AppState>>,
    Path(holder): Path<String>,
) -> Result<Json<SafeResponse>, ApiError> {
    let holder = holder.to_lowercase();
    let store = state.node.store();
    let safe = store
        .get_safe(&holder)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| not_found("safe", holder.clone()))?;
    let balances = match &safe.address {
        Some(address) => store.balances(address).await.map_err(storage_error)?,
        None => Vec::new(),
    };
    Ok(Json(SafeResponse {
        safe,
        balances: balances.into_iter().map(BalanceResponse::from).collect(),
    }))
}

async fn balance_handler(
    State(state): State<Arc<AppState>>,
    Path((address, asset_id)): Path<(String, String)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let asset_id = parse_uuid(&asset_id)?;
    let store = state.node.store();
    if store.safe_by_address(&address).await.map_err(storage_error)?.is_none() {
        return Err(not_found("safe", address));
    }
    let balance = store.read_balance(&address, asset_id).await.map_err(storage_error)?;
    Ok(Json(BalanceResponse {
        address,
        asset_id,
        bond_asset_id: None,
        balance: balance.to_string(),
    }))
}

async fn proposal_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ProposalResponse>, ApiError> {
    let id = parse_uuid(&id)?;
    state
        .node
        .store()
        .get_proposal(id)
        .await
        .map_err(storage_error)?
        .map(|p| Json(ProposalResponse::from(p)))
        .ok_or_else(|| not_found("proposal", id.to_string()))
}
