//! # REST + JSON-RPC + WebSocket API
//!
//! The axum router in front of the node's [`VaultRegistry`]. All handlers
//! share [`AppState`] through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path                            | Description                        |
//! |--------|---------------------------------|------------------------------------|
//! | GET    | `/health`                       | Liveness probe                     |
//! | GET    | `/status`                       | Node and registry summary          |
//! | GET    | `/vaults`                       | Every vault's summary              |
//! | GET    | `/vaults/:name`                 | One vault's summary                |
//! | GET    | `/vaults/:name/claims/:owner`   | A depositor's claim                |
//! | GET    | `/markets`                      | Markets listed on the venue        |
//! | GET    | `/events`                       | Recent vault events                |
//! | GET    | `/ws`                           | Live vault events                  |
//! | POST   | `/rpc`                          | JSON-RPC 2.0 gateway               |
//!
//! ## Signed calls
//!
//! Every mutating RPC method takes an object of params that includes
//! `signer` (base58 public key), `nonce` (u64) and `signature` (hex
//! Ed25519). The signed message is [`signing_message`]: the method name, a
//! colon, and the params object without `signature` as compact JSON. The
//! signer is the vault admin for privileged calls and the depositor for
//! `strata_deposit` and `strata_redeem`.
//!
//! Each signer's nonces must strictly increase. A request whose nonce is not
//! above the signer's last accepted one fails with `REPLAYED_REQUEST`, so a
//! captured request cannot be submitted twice.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use strata_contracts::{AuctionOrder, RegistryError, VaultError, VaultEvent, VaultRegistry};
use strata_protocol::crypto::{Pubkey, Signature};
use strata_protocol::epoch::{EpochTimes, Operation};
use strata_protocol::exchange::{OrderId, Side, SimulatedExchange};

use crate::metrics::SharedMetrics;

/// The registry the node serves: vaults trading on the simulated venue.
pub type NodeRegistry = VaultRegistry<SimulatedExchange>;

/// Broadcast capacity for WebSocket subscribers. Slow clients past this
/// lag and skip ahead.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const DEFAULT_EVENT_LIMIT: usize = 50;

// JSON-RPC error codes.
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const BAD_SIGNATURE: i32 = -32003;
pub const REPLAYED_REQUEST: i32 = -32004;
pub const VAULT_ERROR: i32 = -32010;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    /// Network label, e.g. "devnet".
    pub network: String,
    pub registry: Arc<NodeRegistry>,
    /// Committed vault events, fanned out to WebSocket clients.
    pub event_tx: broadcast::Sender<VaultEvent>,
    pub metrics: SharedMetrics,
}

impl AppState {
    /// Wires the registry's events into a broadcast channel.
    pub fn new(
        version: String,
        network: String,
        registry: Arc<NodeRegistry>,
        metrics: SharedMetrics,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sink = event_tx.clone();
        registry.subscribe(move |event| {
            // No receivers is fine.
            let _ = sink.send(event.clone());
        });
        let state = Self {
            version,
            network,
            registry,
            event_tx,
            metrics,
        };
        state.refresh_gauges();
        state
    }

    /// Re-reads registry totals into the metric gauges.
    pub fn refresh_gauges(&self) {
        let (collateral, supply) = self.registry.totals();
        self.metrics
            .set_totals(self.registry.len(), collateral, supply);
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the API router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/vaults", get(list_vaults_handler))
        .route("/vaults/:name", get(vault_handler))
        .route("/vaults/:name/claims/:owner", get(claim_handler))
        .route("/markets", get(markets_handler))
        .route("/events", get(events_handler))
        .route("/ws", get(ws_handler))
        .route("/rpc", post(rpc_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// JSON-RPC Types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// Must be "2.0".
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Value>,
    /// Echoed back in the response.
    pub id: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

impl JsonRpcResponse {
    fn reply(id: Value, outcome: Result<Value, JsonRpcError>) -> Self {
        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: "2.0".into(),
            result,
            error,
            id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<RegistryError> for JsonRpcError {
    fn from(e: RegistryError) -> Self {
        let kind = match &e {
            RegistryError::Storage(_) => {
                tracing::error!(error = %e, "storage failure during rpc call");
                return JsonRpcError::new(INTERNAL_ERROR, format!("internal error: {e}"));
            }
            RegistryError::StaleNonce { .. } => {
                return JsonRpcError {
                    code: REPLAYED_REQUEST,
                    message: e.to_string(),
                    data: Some(json!({ "kind": "stale_nonce" })),
                };
            }
            RegistryError::VaultNotFound(_) => "vault_not_found",
            RegistryError::Vault(v) => v.kind(),
        };
        JsonRpcError {
            code: VAULT_ERROR,
            message: e.to_string(),
            data: Some(json!({ "kind": kind })),
        }
    }
}

// ---------------------------------------------------------------------------
// RPC Params
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SignedParams {
    signer: Pubkey,
    nonce: u64,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct InitializeParams {
    name: String,
    epoch: ScheduleParams,
}

/// Epoch boundaries as a client sends them. Without `epoch_cadence` the
/// registry's default cadence applies.
#[derive(Debug, Deserialize)]
struct ScheduleParams {
    start_epoch: i64,
    end_deposits: i64,
    start_auction: i64,
    end_auction: i64,
    start_settlement: i64,
    end_epoch: i64,
    #[serde(default)]
    epoch_cadence: Option<i64>,
}

impl ScheduleParams {
    fn into_times(self, default_cadence: i64) -> Result<EpochTimes, RegistryError> {
        EpochTimes::new(
            self.start_epoch,
            self.end_deposits,
            self.start_auction,
            self.end_auction,
            self.start_settlement,
            self.end_epoch,
            self.epoch_cadence.unwrap_or(default_cadence),
        )
        .map_err(|e| VaultError::from(e).into())
    }
}

#[derive(Debug, Deserialize)]
struct AmountParams {
    name: String,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct RedeemParams {
    name: String,
    claim_amount: u64,
}

#[derive(Debug, Deserialize)]
struct MarketParams {
    name: String,
    market: Pubkey,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderParams {
    name: String,
    #[serde(flatten)]
    order: AuctionOrder,
}

#[derive(Debug, Deserialize)]
struct CancelOrderParams {
    name: String,
    market: Pubkey,
    side: Side,
    order_id: OrderId,
}

#[derive(Debug, Deserialize)]
struct DrainParams {
    name: String,
    destination: Pubkey,
}

#[derive(Debug, Deserialize)]
struct RolloverParams {
    name: String,
    #[serde(default)]
    new_cadence: Option<i64>,
}

/// The message a client signs for `method` with `unsigned_params` (the
/// params object without `signature`).
pub fn signing_message(method: &str, unsigned_params: &Value) -> String {
    format!("{method}:{unsigned_params}")
}

/// The vault operation behind a mutating RPC method.
fn operation_for(method: &str) -> Option<Operation> {
    Some(match method {
        "strata_initialize" => Operation::Initialize,
        "strata_initMarginAccount" => Operation::InitMarginAccount,
        "strata_deposit" => Operation::Deposit,
        "strata_depositToMargin" => Operation::DepositToMargin,
        "strata_openMarginPosition" => Operation::OpenMarginPosition,
        "strata_initOpenOrders" => Operation::InitOpenOrders,
        "strata_placeOrder" => Operation::PlaceOrder,
        "strata_cancelOrder" => Operation::CancelOrder,
        "strata_withdrawFromMargin" => Operation::WithdrawFromMargin,
        "strata_closeMarginPosition" => Operation::CloseMarginPosition,
        "strata_redeem" => Operation::Redeem,
        "strata_drainResidual" => Operation::DrainResidual,
        "strata_rollover" => Operation::Rollover,
        _ => return None,
    })
}

fn parse<T: DeserializeOwned>(params: &Value) -> Result<T, JsonRpcError> {
    T::deserialize(params)
        .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("invalid params: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, format!("internal error: {e}")))
}

/// Checks the signature on a mutating call and returns the signer and the
/// request nonce.
fn authenticate(method: &str, params: &Value) -> Result<(Pubkey, u64), JsonRpcError> {
    let Value::Object(fields) = params else {
        return Err(JsonRpcError::new(INVALID_PARAMS, "invalid params: expected an object"));
    };
    let auth: SignedParams = parse(params)?;
    let signature = Signature::from_hex(&auth.signature)
        .map_err(|e| JsonRpcError::new(BAD_SIGNATURE, format!("bad signature: {e}")))?;

    let mut unsigned = fields.clone();
    unsigned.remove("signature");
    let message = signing_message(method, &Value::Object(unsigned));
    if !auth.signer.verify(message.as_bytes(), &signature) {
        tracing::warn!(%method, signer = %auth.signer, "rejected rpc call with bad signature");
        return Err(JsonRpcError::new(
            BAD_SIGNATURE,
            format!("bad signature: does not verify for {}", auth.signer),
        ));
    }
    Ok((auth.signer, auth.nonce))
}

/// Runs one mutating method for an authenticated signer.
fn execute(
    registry: &NodeRegistry,
    operation: Operation,
    signer: Pubkey,
    params: &Value,
) -> Result<Result<Value, RegistryError>, JsonRpcError> {
    Ok(match operation {
        Operation::Initialize => {
            let p: InitializeParams = parse(params)?;
            p.epoch
                .into_times(registry.params().default_cadence_secs)
                .and_then(|epoch| registry.initialize(&p.name, epoch, signer))
                .map(|summary| json!(summary))
        }
        Operation::InitMarginAccount => {
            let p: NameParams = parse(params)?;
            registry
                .init_margin_account(&p.name, &signer)
                .map(|account| json!({ "margin_account": account }))
        }
        Operation::InitOpenOrders => {
            let p: MarketParams = parse(params)?;
            registry
                .init_open_orders(&p.name, &signer, p.market)
                .map(|account| json!({ "open_orders": account }))
        }
        Operation::Deposit => {
            let p: AmountParams = parse(params)?;
            registry
                .deposit(&p.name, &signer, p.amount)
                .map(|minted| json!({ "minted": minted }))
        }
        Operation::DepositToMargin => {
            let p: AmountParams = parse(params)?;
            registry
                .deposit_to_margin(&p.name, &signer, p.amount)
                .map(|()| json!({ "amount": p.amount }))
        }
        Operation::OpenMarginPosition => {
            let p: NameParams = parse(params)?;
            registry
                .open_margin_position(&p.name, &signer)
                .map(|amount| json!({ "amount": amount }))
        }
        Operation::PlaceOrder => {
            let p: PlaceOrderParams = parse(params)?;
            registry
                .place_order(&p.name, &signer, p.order)
                .map(|(order_id, size)| json!({ "order_id": order_id, "size": size }))
        }
        Operation::CancelOrder => {
            let p: CancelOrderParams = parse(params)?;
            registry
                .cancel_order(&p.name, &signer, &p.market, p.side, p.order_id)
                .map(|()| json!({ "cancelled": p.order_id }))
        }
        Operation::WithdrawFromMargin => {
            let p: AmountParams = parse(params)?;
            registry
                .withdraw_from_margin(&p.name, &signer, p.amount)
                .map(|()| json!({ "amount": p.amount }))
        }
        Operation::CloseMarginPosition => {
            let p: NameParams = parse(params)?;
            registry
                .close_margin_position(&p.name, &signer)
                .map(|amount| json!({ "amount": amount }))
        }
        Operation::Redeem => {
            let p: RedeemParams = parse(params)?;
            registry
                .redeem(&p.name, &signer, p.claim_amount)
                .map(|payout| json!({ "claims_burned": p.claim_amount, "payout": payout }))
        }
        Operation::DrainResidual => {
            let p: DrainParams = parse(params)?;
            registry
                .drain_residual(&p.name, &signer, &p.destination)
                .map(|amount| json!({ "amount": amount, "destination": p.destination }))
        }
        Operation::Rollover => {
            let p: RolloverParams = parse(params)?;
            registry
                .rollover(&p.name, &signer, p.new_cadence)
                .map(|epoch| json!(epoch))
        }
    })
}

fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, JsonRpcError> {
    match method {
        "strata_getVault" => {
            let p: NameParams = parse(&params)?;
            return to_json(&state.registry.summary(&p.name)?);
        }
        "strata_version" => return Ok(json!(state.version)),
        _ => {}
    }

    let operation = operation_for(method)
        .ok_or_else(|| JsonRpcError::new(METHOD_NOT_FOUND, format!("method not found: {method}")))?;
    let (signer, nonce) = authenticate(method, &params)?;
    state.registry.accept_nonce(&signer, nonce)?;

    let started = Instant::now();
    let result = execute(&state.registry, operation, signer, &params)?;
    state
        .metrics
        .observe(operation.as_str(), &result, started.elapsed());
    if result.is_ok() {
        state.refresh_gauges();
    }
    Ok(result?)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub network: String,
    pub vaults: usize,
    pub total_collateral: u64,
    pub total_claim_supply: u64,
    /// The registry clock, unix seconds.
    pub node_time: i64,
    pub timestamp: String,
}

/// `GET /vaults/:name/claims/:owner`. Zeroed for owners that never
/// deposited.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub vault: String,
    pub owner: Pubkey,
    /// Derived claim-account address for this owner.
    pub claim_account: Pubkey,
    pub balance: u64,
    pub total_deposited: u64,
    pub total_redeemed: u64,
    /// What redeeming the whole balance would pay right now.
    pub redemption_value: u64,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
    pub vault: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Only forward events for this vault.
    pub vault: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
        .into_response()
}

fn registry_failure(e: RegistryError) -> Response {
    match e {
        RegistryError::VaultNotFound(name) => {
            error_response(StatusCode::NOT_FOUND, format!("vault {name} not found"))
        }
        other => error_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`. Liveness only; `/status` has the details.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (total_collateral, total_claim_supply) = state.registry.totals();
    Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        vaults: state.registry.len(),
        total_collateral,
        total_claim_supply,
        node_time: state.registry.now(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn list_vaults_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn vault_handler(Path(name): Path<String>, State(state): State<AppState>) -> Response {
    match state.registry.summary(&name) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => registry_failure(e),
    }
}

async fn claim_handler(
    Path((name, owner)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    let owner = match Pubkey::from_str(&owner) {
        Ok(key) => key,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("bad owner: {e}")),
    };
    let vault = match state.registry.vault(&name) {
        Ok(v) => v,
        Err(e) => return registry_failure(e),
    };

    let claim = vault.claim_of(&owner).cloned().unwrap_or_default();
    let redemption_value = if claim.balance == 0 {
        0
    } else {
        vault.redemption_quote(claim.balance).unwrap_or(0)
    };
    Json(ClaimResponse {
        vault: name,
        owner,
        claim_account: vault.claim_address(&owner),
        balance: claim.balance,
        total_deposited: claim.total_deposited,
        total_redeemed: claim.total_redeemed,
        redemption_value,
    })
    .into_response()
}

async fn markets_handler(State(state): State<AppState>) -> impl IntoResponse {
    let markets = state.registry.exchange().lock().markets();
    Json(markets)
}

/// `GET /events?limit=N&vault=NAME`, oldest first.
async fn events_handler(
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let events: Vec<VaultEvent> = match &query.vault {
        Some(vault) => {
            let mut matching: Vec<_> = state
                .registry
                .recent_events(usize::MAX)
                .into_iter()
                .filter(|e| &e.vault == vault)
                .collect();
            let skip = matching.len().saturating_sub(limit);
            matching.drain(..skip);
            matching
        }
        None => state.registry.recent_events(limit),
    };
    Json(events)
}

/// `POST /rpc`.
async fn rpc_handler(
    State(state): State<AppState>,
    Json(req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    if req.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::reply(
            req.id,
            Err(JsonRpcError::new(
                INVALID_REQUEST,
                "invalid request: jsonrpc must be \"2.0\"",
            )),
        ));
    }
    let outcome = dispatch(&state, &req.method, req.params.unwrap_or(Value::Null));
    Json(JsonRpcResponse::reply(req.id, outcome))
}

/// `GET /ws?vault=NAME`. Push-only; client messages are ignored.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.vault))
}

async fn handle_ws_connection(mut socket: WebSocket, state: AppState, vault: Option<String>) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        if vault.as_ref().is_some_and(|v| v != &ev.vault) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
