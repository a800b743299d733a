//! REST API for the payment watcher
//!
//! Endpoints:
//! - GET /api/health - Health check (no auth required)
//! - GET /api/summary - Balance/sync snapshots for all networks
//! - GET /api/summary/:network - Snapshot for one network
//! - GET /api/state - Wallet session state per network
//! - POST /api/prompts/:network - Issue a deposit address and register a payment prompt
//! - GET /api/prompts/:network - Outstanding prompts for a network
//! - DELETE /api/prompts/:network/:address/:payment_id - Drop a prompt (invoice finalized/expired)
//! - GET /api/transfers/:network/:txid - Look up one transfer on the wallet daemon
//! - POST /api/accounts/:network - Create a wallet account
//! - POST /api/dev/:network/pay - Pay from the cash-cow wallet (non-mainnet only)
//! - POST /api/dev/:network/mine - Mine blocks (non-mainnet only)

use crate::pool::WalletPool;
use crate::reconciler::{PaymentPrompt, PromptRegistry};
use crate::rpc::RpcTransport;
use crate::summary::{SummaryMap, WalletSummary};
use crate::wallet::{DetectedTransfer, TransferDestination, WalletError};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state for API handlers
pub struct ApiState<T: RpcTransport> {
    pub pool: Arc<WalletPool<T>>,
    pub prompts: Arc<PromptRegistry>,
    pub summaries: SummaryMap,
    pub api_token: String,
}

/// Create the API router
pub fn create_router<T: RpcTransport + 'static>(state: ApiState<T>) -> Router {
    let api_token = state.api_token.clone();

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/summary", get(get_all_summaries::<T>))
        .route("/api/summary/:network", get(get_network_summary::<T>))
        .route("/api/state", get(get_session_states::<T>))
        .route(
            "/api/prompts/:network",
            get(list_prompts::<T>).post(create_prompt::<T>),
        )
        .route(
            "/api/prompts/:network/:address/:payment_id",
            delete(remove_prompt::<T>),
        )
        .route("/api/transfers/:network/:txid", get(get_transfer::<T>))
        .route("/api/accounts/:network", post(create_account::<T>))
        .route("/api/dev/:network/pay", post(dev_pay::<T>))
        .route("/api/dev/:network/mine", post(dev_mine::<T>))
        .layer(middleware::from_fn(move |req: Request<Body>, next: Next| {
            let token = api_token.clone();
            async move { require_auth(token, req, next).await }
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Authentication middleware
async fn require_auth(api_token: String, request: Request<Body>, next: Next) -> Response {
    // Skip auth if token is not configured
    if api_token.is_empty() {
        return next.run(request).await;
    }

    // Allow health check without auth
    if request.uri().path() == "/api/health" {
        return next.run(request).await;
    }

    if let Some(auth_header) = request.headers().get("Authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                if token == api_token {
                    return next.run(request).await;
                }
            }
        }
    }

    (StatusCode::UNAUTHORIZED, "Invalid or missing API token").into_response()
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "payment-watcher"
    }))
}

#[derive(Serialize)]
struct SummaryResponse {
    networks: Vec<WalletSummary>,
    /// Networks disabled at startup for missing daemon URIs
    unconfigured: Vec<String>,
}

async fn get_all_summaries<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
) -> Json<SummaryResponse> {
    let summaries = state.summaries.read().await;
    let mut networks: Vec<WalletSummary> = summaries.values().cloned().collect();
    networks.sort_by(|a, b| a.network.cmp(&b.network));

    Json(SummaryResponse {
        networks,
        unconfigured: state.pool.unconfigured().to_vec(),
    })
}

async fn get_network_summary<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path(network): Path<String>,
) -> Result<Json<WalletSummary>, (StatusCode, String)> {
    let summaries = state.summaries.read().await;
    summaries
        .get(&network.to_uppercase())
        .cloned()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, format!("no summary for {network}")))
}

/// Wallet session state per network, the reachability health signal
async fn get_session_states<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
) -> Json<serde_json::Value> {
    let mut states = serde_json::Map::new();

    for handle in state.pool.handles() {
        let session_state = handle.wallet().state().await;
        states.insert(
            handle.network().to_string(),
            serde_json::Value::String(session_state.to_string()),
        );
    }
    for network in state.pool.unconfigured() {
        let session_state = state.pool.session_state(network).await;
        states.insert(
            network.clone(),
            serde_json::Value::String(session_state.to_string()),
        );
    }

    Json(serde_json::Value::Object(states))
}

async fn list_prompts<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path(network): Path<String>,
) -> Json<Vec<PaymentPrompt>> {
    Json(state.prompts.outstanding(&network.to_uppercase()).await)
}

/// Look up one transfer by transaction id on the wallet daemon
async fn get_transfer<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path((network, txid)): Path<(String, String)>,
) -> Result<Json<DetectedTransfer>, (StatusCode, String)> {
    let handle = state
        .pool
        .handle(&network)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown network {network}")))?;

    let transfer = handle
        .wallet()
        .get_transfer_by_txid(&txid, None)
        .await
        .map_err(wallet_error_response)?;

    Ok(Json(transfer))
}

#[derive(Deserialize)]
struct CreatePromptRequest {
    /// Expected amount in atomic units
    amount: u64,
    #[serde(default)]
    account_index: u64,
}

#[derive(Serialize)]
struct CreatePromptResponse {
    address: String,
    payment_id: String,
}

/// Issue a fresh integrated address and register the prompt for it
async fn create_prompt<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path(network): Path<String>,
    Json(request): Json<CreatePromptRequest>,
) -> Result<Json<CreatePromptResponse>, (StatusCode, String)> {
    let handle = state
        .pool
        .handle(&network)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown network {network}")))?;

    let integrated = handle
        .wallet()
        .create_address()
        .await
        .map_err(wallet_error_response)?;

    let prompt = PaymentPrompt {
        network: handle.network().to_string(),
        address: integrated.integrated_address.clone(),
        payment_id: integrated.payment_id.clone(),
        account_index: request.account_index,
        expected_amount: request.amount,
    };

    state
        .prompts
        .register(prompt)
        .await
        .map_err(|e| (StatusCode::CONFLICT, e.to_string()))?;

    Ok(Json(CreatePromptResponse {
        address: integrated.integrated_address,
        payment_id: integrated.payment_id,
    }))
}

async fn remove_prompt<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path((network, address, payment_id)): Path<(String, String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .prompts
        .remove(&network.to_uppercase(), &address, &payment_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or((StatusCode::NOT_FOUND, "no such prompt".to_string()))
}

#[derive(Serialize)]
struct CreateAccountResponse {
    account_index: u64,
    address: String,
}

async fn create_account<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path(network): Path<String>,
) -> Result<Json<CreateAccountResponse>, (StatusCode, String)> {
    let handle = state
        .pool
        .handle(&network)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown network {network}")))?;

    let account = handle
        .wallet()
        .create_account()
        .await
        .map_err(wallet_error_response)?;

    Ok(Json(CreateAccountResponse {
        account_index: account.account_index,
        address: account.address,
    }))
}

#[derive(Deserialize)]
struct DevPayRequest {
    address: String,
    amount: u64,
}

/// Pay an address from the cash-cow wallet, for exercising checkout flows on
/// test networks
async fn dev_pay<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path(network): Path<String>,
    Json(request): Json<DevPayRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let handle = state
        .pool
        .handle(&network)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown network {network}")))?;

    if handle.config().mainnet {
        return Err((
            StatusCode::FORBIDDEN,
            "dev payments are disabled on mainnet".to_string(),
        ));
    }

    let cashcow = handle.cashcow().ok_or((
        StatusCode::CONFLICT,
        "no cash-cow wallet configured".to_string(),
    ))?;

    let tx_hash = cashcow
        .transfer(&[TransferDestination {
            address: request.address,
            amount: request.amount,
        }])
        .await
        .map_err(wallet_error_response)?;

    Ok(Json(serde_json::json!({ "tx_hash": tx_hash })))
}

#[derive(Deserialize)]
struct DevMineRequest {
    wallet_address: String,
    #[serde(default = "default_mine_blocks")]
    blocks: u64,
}

fn default_mine_blocks() -> u64 {
    1
}

/// Mine blocks on a test network so pending transfers confirm
async fn dev_mine<T: RpcTransport + 'static>(
    State(state): State<Arc<ApiState<T>>>,
    Path(network): Path<String>,
    Json(request): Json<DevMineRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let handle = state
        .pool
        .handle(&network)
        .ok_or((StatusCode::NOT_FOUND, format!("unknown network {network}")))?;

    if handle.config().mainnet {
        return Err((
            StatusCode::FORBIDDEN,
            "block generation is disabled on mainnet".to_string(),
        ));
    }

    handle
        .generate_blocks(&request.wallet_address, request.blocks)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;

    Ok(StatusCode::OK)
}

fn wallet_error_response(err: WalletError) -> (StatusCode, String) {
    let status = match &err {
        WalletError::Transport(_) | WalletError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
        WalletError::InsufficientFunds(_) | WalletError::InvalidDestination(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}
