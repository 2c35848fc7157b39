//! Gateway server assembly and HTTP surface
//!
//! [`GatewayServerBuilder`] wires the store adapter, worker census, rate
//! limiter, rule matcher and session manager together; [`GatewayServer`]
//! exposes them on one Axum router: `POST /` for plain JSON-RPC and
//! `GET /ws` for duplex sessions, plus a handful of `pal_*` service
//! methods answered locally.

use crate::blocknum::BlockNumberCache;
use crate::census::WorkerCensus;
use crate::config::RulesConfig;
use crate::envelope;
use crate::gateway::{ProxyGateway, UpstreamClient};
use crate::limiter::{LimiterSettings, RateLimiter};
use crate::manager::DuplexSessionManager;
use crate::session::SessionContext;
use crate::store::{CounterStore, MemoryCounterStore, RedisCounterStore, SqlCounterStore};
use crate::tx::{EnvelopeTxDecoder, TxDecoder};
use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{HeaderMap, Method},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use eyre::Result;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Which backing store the gateway shares counters through
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Process-local store; single-process deployments only
    Memory,
    /// Shared Redis instance
    Redis(String),
    /// Shared SQL database
    Sql(String),
}

/// Builder for configuring a GatewayServer with sensible defaults
pub struct GatewayServerBuilder {
    upstream_http_url: String,
    upstream_ws_url: Option<String>,
    rules: RulesConfig,
    store: StoreConfig,
    settings: LimiterSettings,
    upstream_timeout: u64,
    heartbeat_interval: u64,
    sweep_interval: u64,
    stats_interval: u64,
    block_number_ttl: u64,
    fixed_workers: Option<u64>,
    decoder: Option<Arc<dyn TxDecoder>>,
}

impl GatewayServerBuilder {
    /// Creates a builder for the given upstream HTTP endpoint
    pub fn new(upstream_http_url: impl Into<String>) -> Self {
        Self {
            upstream_http_url: upstream_http_url.into(),
            upstream_ws_url: None,
            rules: RulesConfig::default(),
            store: StoreConfig::Memory,
            settings: LimiterSettings::default(),
            upstream_timeout: 10,
            heartbeat_interval: 10,
            sweep_interval: 30,
            stats_interval: 60,
            block_number_ttl: 5,
            fixed_workers: None,
            decoder: None,
        }
    }

    /// Set the upstream socket URL; duplex sessions are rejected without one
    pub fn upstream_ws_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_ws_url = Some(url.into());
        self
    }

    /// Set the admission policy
    pub fn rules(mut self, rules: RulesConfig) -> Self {
        self.rules = rules;
        self
    }

    /// Set the backing store
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the limiter tuning knobs
    pub fn limiter_settings(mut self, settings: LimiterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the upstream HTTP timeout in seconds
    pub fn upstream_timeout(mut self, seconds: u64) -> Self {
        self.upstream_timeout = seconds;
        self
    }

    /// Set the worker heartbeat cadence in seconds
    pub fn heartbeat_interval(mut self, seconds: u64) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    /// Set the dead-session sweep cadence in seconds
    pub fn sweep_interval(mut self, seconds: u64) -> Self {
        self.sweep_interval = seconds;
        self
    }

    /// Set the session stats log cadence in seconds
    pub fn stats_interval(mut self, seconds: u64) -> Self {
        self.stats_interval = seconds;
        self
    }

    /// Set the block-number cache TTL in seconds
    pub fn block_number_ttl(mut self, seconds: u64) -> Self {
        self.block_number_ttl = seconds;
        self
    }

    /// Pin the worker count instead of estimating it from heartbeats
    pub fn fixed_workers(mut self, workers: u64) -> Self {
        self.fixed_workers = Some(workers);
        self
    }

    /// Substitute the raw-transaction decoder (used by tests)
    pub fn tx_decoder(mut self, decoder: Arc<dyn TxDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Build the GatewayServer with the configured settings
    pub async fn build(self) -> Result<GatewayServer> {
        let store: Arc<dyn CounterStore> = match &self.store {
            StoreConfig::Memory => Arc::new(MemoryCounterStore::new()),
            StoreConfig::Redis(url) => Arc::new(RedisCounterStore::connect(url).await?),
            StoreConfig::Sql(url) => Arc::new(SqlCounterStore::connect(url).await?),
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        let census = match self.fixed_workers {
            Some(workers) => Arc::new(WorkerCensus::fixed(workers)),
            None => {
                let census = Arc::new(WorkerCensus::new(
                    store.clone(),
                    Duration::from_secs(self.heartbeat_interval),
                ));
                if let Err(e) = census.beat().await {
                    warn!("initial worker heartbeat failed: {}", e);
                }
                tokio::spawn(Arc::clone(&census).run(shutdown_tx.subscribe()));
                census
            }
        };

        let limiter = Arc::new(RateLimiter::new(store.clone(), census, self.settings));
        let matcher = self.rules.build_matcher()?;
        let upstream = UpstreamClient::new(
            self.upstream_http_url,
            Duration::from_secs(self.upstream_timeout),
        )?;
        let decoder = self.decoder.unwrap_or_else(|| Arc::new(EnvelopeTxDecoder));

        let gateway = Arc::new(ProxyGateway::new(
            self.rules.allowed_method_set(),
            matcher,
            limiter,
            decoder,
            upstream,
            BlockNumberCache::new(store, Duration::from_secs(self.block_number_ttl)),
        ));

        let manager = Arc::new(DuplexSessionManager::new(
            gateway.clone(),
            self.upstream_ws_url,
            shutdown_tx.clone(),
            Duration::from_secs(self.sweep_interval),
            Duration::from_secs(self.stats_interval),
        ));
        manager.spawn_maintenance();

        let started_at =
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        Ok(GatewayServer { gateway, manager, shutdown_tx, started_at })
    }
}

/// The assembled gateway: dispatcher, session manager and HTTP surface
#[derive(Clone)]
pub struct GatewayServer {
    gateway: Arc<ProxyGateway>,
    /// Duplex session registry and lifecycle
    pub manager: Arc<DuplexSessionManager>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: u64,
}

#[derive(Clone)]
struct AppState {
    server: GatewayServer,
}

impl GatewayServer {
    /// The request dispatcher
    pub fn gateway(&self) -> &Arc<ProxyGateway> {
        &self.gateway
    }

    /// Signals every background loop to stop and the server to drain
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Starts the server listening on the specified address
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let app = Router::new()
            .route("/", post(handle_rpc))
            .route("/ws", get(ws_handler))
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::POST, Method::GET])
                    .allow_headers(Any)
                    .allow_origin(Any),
            )
            .with_state(AppState { server: self });

        let listener = TcpListener::bind(addr).await?;
        info!("Palisade gateway listening on {}", addr);

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, stopping gateway");
            })
            .await?;

        Ok(())
    }
}

fn session_context(addr: SocketAddr, headers: &HeaderMap) -> SessionContext {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    SessionContext { ip: forwarded.or(Some(addr.ip())), headers }
}

async fn handle_rpc(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Json<Value> {
    let ctx = session_context(addr, &headers);

    // Service methods answered locally, without touching the upstream.
    if let Some(method) = request.get("method").and_then(Value::as_str) {
        let id = envelope::request_id(&request);
        match method {
            "pal_ping" => return Json(envelope::success(id, json!("pong"))),
            "pal_info" => {
                let now =
                    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
                return Json(envelope::success(
                    id,
                    json!({
                        "service": "palisade-gateway",
                        "version": env!("CARGO_PKG_VERSION"),
                        "uptime": now - state.server.started_at,
                        "pid": std::process::id(),
                    }),
                ));
            }
            "pal_sessions" => {
                return Json(envelope::success(
                    id,
                    json!({"active_sessions": state.server.manager.active_sessions()}),
                ));
            }
            _ => {}
        }
    }

    Json(state.server.gateway.dispatch(request, &ctx, None).await)
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = session_context(addr, &headers);
    let manager = state.server.manager.clone();
    ws.on_upgrade(move |socket| manager.handle_socket(socket, ctx))
}
