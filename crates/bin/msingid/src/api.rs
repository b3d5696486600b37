//! HTTP + WebSocket surface
//!
//! Read endpoints are open; anything that mutates global state sits
//! behind the admin gate (loopback peer, shared secret header, or an
//! explicit demo toggle). Cross-origin access is denied unless an
//! origin is allowlisted. Every handler inherits a request deadline.

use crate::clock::Clock;
use crate::config::AdminMode;
use crate::counters::Counters;
use crate::error::SpendError;
use crate::events::{EventHub, EventKind};
use crate::prover::{DispatchJob, DispatcherHandle, Orphan, OrphanLedger, PublicInputs};
use crate::registry::RegistryService;
use crate::store::NullifierStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use msingi_core::nullifier::SpendMode;
use msingi_core::{Commitment, MerkleError, Nullifier, RewardTier};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// handler deadline; exceeding it returns 504
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// header carrying the shared admin secret
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

pub struct AppState {
    pub registry: RegistryService,
    pub store: Arc<NullifierStore>,
    pub dispatcher: DispatcherHandle,
    pub orphans: OrphanLedger,
    pub hub: EventHub,
    pub counters: Arc<Counters>,
    pub clock: Clock,
    pub admin_mode: AdminMode,
    pub admin_secret: Option<String>,
    pub demo_mode: bool,
    pub prover_mock: bool,
    pub ingress_ready: Arc<AtomicBool>,
    pub cors_origins: Vec<String>,
    pub started_at: Instant,
}

/// error body shape: `{ "error": ..., "code": ... }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "code": self.code }));
        (self.status, body).into_response()
    }
}

impl From<SpendError> for ApiError {
    fn from(e: SpendError) -> Self {
        match &e {
            SpendError::AlreadySpent { .. } => {
                Self::new(StatusCode::CONFLICT, "already_spent", e.to_string())
            }
            SpendError::EpochOutOfWindow { .. } => {
                Self::bad_request("epoch_out_of_window", e.to_string())
            }
            SpendError::Storage(_) | SpendError::Corrupt { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", e.to_string())
            }
        }
    }
}

impl From<MerkleError> for ApiError {
    fn from(e: MerkleError) -> Self {
        match &e {
            MerkleError::NotFound => Self::new(
                StatusCode::NOT_FOUND,
                "unknown_commitment",
                e.to_string(),
            ),
            MerkleError::RegistryFull(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "registry_full",
                e.to_string(),
            ),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "registry", e.to_string()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cors_origins);
    let admin = Router::new()
        .route("/register-commitment", post(register_commitment))
        .route("/claim-reward", post(claim_reward))
        .layer(middleware::from_fn_with_state(state.clone(), admin_gate));

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/merkle-proof/{commitment}", get(merkle_proof))
        .route("/ws", get(ws_upgrade))
        .merge(admin)
        .layer(middleware::from_fn(deadline))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        // no allowlist: no CORS headers, browsers deny cross-origin
        return CorsLayer::new();
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring unparseable cors origin {:?}", o);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            ADMIN_SECRET_HEADER.parse().unwrap(),
        ])
}

async fn deadline(req: Request<axum::body::Body>, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_DEADLINE, next.run(req)).await {
        Ok(response) => response,
        Err(_) => ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "deadline",
            "request deadline exceeded",
        )
        .into_response(),
    }
}

/// the decision behind the admin gate, kept pure for tests
pub fn admin_allows(
    mode: AdminMode,
    configured_secret: Option<&str>,
    demo_mode: bool,
    peer: IpAddr,
    presented_secret: Option<&str>,
) -> Result<(), ApiError> {
    if demo_mode || mode == AdminMode::Demo {
        return Ok(());
    }
    match mode {
        AdminMode::Loopback => {
            if peer.is_loopback() {
                Ok(())
            } else {
                Err(ApiError::new(
                    StatusCode::FORBIDDEN,
                    "admin_loopback_only",
                    "admin endpoints are restricted to loopback",
                ))
            }
        }
        AdminMode::SharedSecret => match (configured_secret, presented_secret) {
            (Some(expected), Some(presented)) if expected == presented => Ok(()),
            (_, None) => Err(ApiError::new(
                StatusCode::UNAUTHORIZED,
                "admin_secret_required",
                "missing admin secret header",
            )),
            _ => Err(ApiError::new(
                StatusCode::FORBIDDEN,
                "admin_secret_mismatch",
                "admin secret rejected",
            )),
        },
        AdminMode::Demo => Ok(()),
    }
}

async fn admin_gate(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match admin_allows(
        state.admin_mode,
        state.admin_secret.as_deref(),
        state.demo_mode,
        addr.ip(),
        presented.as_deref(),
    ) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    components: serde_json::Value,
    uptime_s: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let ingress = if state.ingress_ready.load(Ordering::Acquire) {
        "ready"
    } else {
        "down"
    };
    Json(HealthResponse {
        status: "ok",
        components: json!({
            "ingress": ingress,
            "prover": if state.prover_mock { "mock" } else { "configured" },
            "registry": {
                "leaf_count": state.registry.len(),
                "merkle_root": hex::encode(state.registry.root()),
            },
            "version": env!("CARGO_PKG_VERSION"),
        }),
        uptime_s: state.started_at.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    packets_received: u64,
    packets_dropped: u64,
    proofs_generated: u64,
    nullifiers_spent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_proof_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avg_rssi: Option<f64>,
    orphaned_dispatches: Vec<Orphan>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let last = state.counters.last_proof_ms.load(Ordering::Relaxed);
    Json(StatusResponse {
        packets_received: state.counters.packets_received.load(Ordering::Relaxed),
        packets_dropped: state.counters.packets_dropped.load(Ordering::Relaxed),
        proofs_generated: state.counters.proofs_generated.load(Ordering::Relaxed),
        nullifiers_spent: state.counters.nullifiers_spent.load(Ordering::Relaxed),
        last_proof_ms: (last != 0).then_some(last),
        avg_rssi: state.counters.avg_rssi(),
        orphaned_dispatches: state.orphans.list(),
    })
}

#[derive(Deserialize)]
struct RegisterRequest {
    commitment: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    merkle_root: String,
    leaf_index: u64,
}

async fn register_commitment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let commitment = Commitment::from_hex(&req.commitment)
        .ok_or_else(|| ApiError::bad_request("bad_commitment", "commitment must be 32 bytes hex"))?;

    let (outcome, root, leaf_count) = state.registry.insert(commitment)?;
    if outcome.is_fresh() {
        debug!("registered {} at leaf {}", commitment, outcome.leaf_index());
        state.hub.publish(EventKind::RegistryUpdated {
            merkle_root: hex::encode(root),
            leaf_count,
        });
    }
    Ok(Json(RegisterResponse {
        merkle_root: hex::encode(root),
        leaf_index: outcome.leaf_index(),
    }))
}

#[derive(Serialize, Debug)]
struct ProofResponse {
    commitment: String,
    leaf_index: u64,
    merkle_root: String,
    siblings: Vec<String>,
    path_bits: Vec<bool>,
}

async fn merkle_proof(
    State(state): State<Arc<AppState>>,
    Path(commitment): Path<String>,
) -> Result<Json<ProofResponse>, ApiError> {
    let commitment = Commitment::from_hex(&commitment)
        .ok_or_else(|| ApiError::bad_request("bad_commitment", "commitment must be 32 bytes hex"))?;
    let proof = state.registry.proof_for(&commitment)?;
    Ok(Json(ProofResponse {
        commitment: commitment.to_hex(),
        leaf_index: proof.leaf_index,
        merkle_root: hex::encode(proof.root),
        siblings: proof.siblings.iter().map(hex::encode).collect(),
        path_bits: proof.path_bits,
    }))
}

#[derive(Deserialize)]
struct ClaimRequest {
    nullifier: String,
    proof: String,
    sensor_data_hash: String,
}

#[derive(Serialize, Debug)]
struct ClaimResponse {
    reward_tier: RewardTier,
    reward_micro: u64,
    epoch: u64,
    nullifier: String,
}

async fn claim_reward(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let nullifier = Nullifier::from_hex(&req.nullifier)
        .ok_or_else(|| ApiError::bad_request("bad_nullifier", "nullifier must be 32 bytes hex"))?;
    let data_hash = msingi_core::parse_hex32(&req.sensor_data_hash).ok_or_else(|| {
        ApiError::bad_request("bad_data_hash", "sensor_data_hash must be 32 bytes hex")
    })?;
    base64::engine::general_purpose::STANDARD
        .decode(&req.proof)
        .map_err(|_| ApiError::bad_request("bad_proof", "proof must be base64"))?;

    let epoch = state.clock.current_epoch();
    let tier = state
        .store
        .try_spend(nullifier, epoch, data_hash, SpendMode::Manual)?;
    state
        .counters
        .nullifiers_spent
        .fetch_add(1, Ordering::Relaxed);

    let public = PublicInputs {
        nullifier: nullifier.to_bytes(),
        data_hash,
        epoch,
        merkle_root: state.registry.root(),
    };
    if state
        .dispatcher
        .enqueue(DispatchJob::Manual {
            public,
            proof_b64: req.proof,
        })
        .is_err()
    {
        // the spend is durable either way; surface the stalled dispatch
        state.orphans.push(Orphan {
            nullifier: nullifier.to_hex(),
            epoch,
            reason: "dispatch queue unavailable".into(),
            at_ms: state.clock.now_ms(),
        });
        return Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            "dispatch_unavailable",
            "claim recorded but settlement dispatch failed",
        ));
    }

    Ok(Json(ClaimResponse {
        reward_tier: tier,
        reward_micro: tier.micro(),
        epoch,
        nullifier: nullifier.to_hex(),
    }))
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let rx = state.hub.subscribe();
    ws.on_upgrade(move |socket| ws_stream(socket, rx))
}

async fn ws_stream(mut socket: WebSocket, mut rx: broadcast::Receiver<crate::events::Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }
            // clients tolerate drops; skip what we missed
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("ws subscriber lagged, dropped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
