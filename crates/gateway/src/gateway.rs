//! Proxy gateway: validation, admission and forwarding
//!
//! Every client request - whether it arrived over plain HTTP or through a
//! duplex session - flows through [`ProxyGateway::dispatch`]. Methods off
//! the allow-list are rejected, `eth_sendRawTransaction` runs the full
//! admission pipeline (decode, rule match with inline rate limit, gas
//! simulation, forward, usage recording) and everything else is forwarded
//! as-is: through the session's upstream socket when one is attached,
//! over HTTP otherwise.

use crate::blocknum::BlockNumberCache;
use crate::envelope;
use crate::error::GatewayError;
use crate::limiter::RateLimiter;
use crate::rules::RuleMatcher;
use crate::session::{DuplexSession, SessionContext};
use crate::tx::{DecodedTransaction, TxDecoder};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Methods forwarded when no explicit allow-list is configured
pub const DEFAULT_ALLOWED_METHODS: &[&str] = &[
    "eth_blockNumber",
    "eth_call",
    "eth_chainId",
    "eth_estimateGas",
    "eth_gasPrice",
    "eth_getBalance",
    "eth_getBlockByHash",
    "eth_getBlockByNumber",
    "eth_getCode",
    "eth_getLogs",
    "eth_getStorageAt",
    "eth_getTransactionByHash",
    "eth_getTransactionCount",
    "eth_getTransactionReceipt",
    "eth_sendRawTransaction",
    "eth_subscribe",
    "eth_unsubscribe",
    "net_version",
    "web3_clientVersion",
];

/// HTTP client for the upstream execution node
pub struct UpstreamClient {
    client: reqwest::Client,
    url: String,
}

impl UpstreamClient {
    /// Creates a client for the given upstream URL
    pub fn new(url: String, timeout: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    /// Posts a JSON-RPC body and returns the response envelope
    ///
    /// Transport-level failures surface as [`GatewayError::UpstreamUnreachable`]
    /// with the original message; JSON-RPC level errors come back inside
    /// the envelope untouched.
    pub async fn post(&self, body: &Value) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;

        response.json().await.map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))
    }
}

/// Top-level request entry for both HTTP and duplex traffic
pub struct ProxyGateway {
    allowed_methods: HashSet<String>,
    matcher: RuleMatcher,
    limiter: Arc<RateLimiter>,
    decoder: Arc<dyn TxDecoder>,
    upstream: UpstreamClient,
    block_cache: BlockNumberCache,
}

impl ProxyGateway {
    /// Assembles a gateway from its collaborators
    pub fn new(
        allowed_methods: HashSet<String>,
        matcher: RuleMatcher,
        limiter: Arc<RateLimiter>,
        decoder: Arc<dyn TxDecoder>,
        upstream: UpstreamClient,
        block_cache: BlockNumberCache,
    ) -> Self {
        Self { allowed_methods, matcher, limiter, decoder, upstream, block_cache }
    }

    /// The rate limiter this gateway admits through
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Dispatches a request body, single or batch
    ///
    /// Batches answer an array in request order. Every rejection yields a
    /// well-formed error envelope carrying the client's request id.
    pub async fn dispatch(
        &self,
        body: Value,
        ctx: &SessionContext,
        session: Option<&DuplexSession>,
    ) -> Value {
        if let Value::Array(batch) = body {
            if batch.is_empty() {
                return GatewayError::InvalidRequest.to_envelope(Value::Null);
            }
            let mut responses = Vec::with_capacity(batch.len());
            for entry in batch {
                responses.push(self.dispatch_single(entry, ctx, session).await);
            }
            return Value::Array(responses);
        }

        self.dispatch_single(body, ctx, session).await
    }

    async fn dispatch_single(
        &self,
        body: Value,
        ctx: &SessionContext,
        session: Option<&DuplexSession>,
    ) -> Value {
        let id = envelope::request_id(&body);

        match self.handle_request(body, ctx, session).await {
            Ok(response) => response,
            Err(err) => {
                debug!("request rejected: {}", err);
                err.to_envelope(id)
            }
        }
    }

    async fn handle_request(
        &self,
        body: Value,
        ctx: &SessionContext,
        session: Option<&DuplexSession>,
    ) -> Result<Value, GatewayError> {
        if !envelope::is_valid_envelope(&body) {
            return Err(GatewayError::InvalidRequest);
        }

        // is_valid_envelope guarantees the method is present
        let method = envelope::method_name(&body).unwrap_or_default().to_string();
        if !self.allowed_methods.contains(&method) {
            return Err(GatewayError::MethodNotAllowed(method));
        }

        match method.as_str() {
            "eth_blockNumber" => {
                let id = envelope::request_id(&body);
                self.cached_block_number(id, session).await
            }
            "eth_sendRawTransaction" => self.send_raw_transaction(body, ctx, session).await,
            _ => self.forward(body, session).await,
        }
    }

    /// Forwards an envelope upstream through the session socket when one
    /// is attached, over HTTP otherwise
    async fn forward(
        &self,
        body: Value,
        session: Option<&DuplexSession>,
    ) -> Result<Value, GatewayError> {
        match session {
            Some(session) => Ok(session.send_to_server(body).await),
            None => self.upstream.post(&body).await,
        }
    }

    /// Serves `eth_blockNumber` from the shared TTL cache
    async fn cached_block_number(
        &self,
        id: Value,
        session: Option<&DuplexSession>,
    ) -> Result<Value, GatewayError> {
        if let Some(value) = self.block_cache.get().await? {
            return Ok(envelope::success(id, json!(format!("0x{value:x}"))));
        }

        let request =
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": []});
        let mut response = self.forward(request, session).await?;

        if response.get("error").is_none() {
            let parsed = response
                .get("result")
                .and_then(Value::as_str)
                .and_then(|raw| u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok());
            if let Some(value) = parsed {
                if let Err(e) = self.block_cache.put(value).await {
                    warn!("failed to cache block number: {}", e);
                }
            }
        }

        if let Some(obj) = response.as_object_mut() {
            obj.insert("id".to_string(), id);
        }
        Ok(response)
    }

    /// The `eth_sendRawTransaction` admission pipeline
    async fn send_raw_transaction(
        &self,
        body: Value,
        ctx: &SessionContext,
        session: Option<&DuplexSession>,
    ) -> Result<Value, GatewayError> {
        let raw = body
            .get("params")
            .and_then(Value::as_array)
            .and_then(|params| params.first())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GatewayError::TransactionInvalid("missing raw transaction parameter".into())
            })?;

        let tx = self.decoder.decode(raw)?;

        // Deploy transactions have no recipient and bypass the rule list.
        let bucket = if tx.to.is_none() {
            self.matcher.check_deploy(&tx.from_hex())?;
            None
        } else {
            self.matcher.match_transaction(&tx, &self.limiter).await?
        };

        self.simulate_gas(&tx, session).await?;

        let response = self.forward(body, session).await?;

        if response.get("error").is_none() {
            if let Some((key, rule)) = bucket {
                self.limiter.record_usage(&key, rule).await;
            }
            info!(
                ip = ?ctx.ip,
                from = %tx.from_hex(),
                to = tx.to_hex().as_deref().unwrap_or("(deploy)"),
                "transaction forwarded"
            );
        }

        Ok(response)
    }

    /// Asks the upstream to estimate gas for the decoded transaction
    ///
    /// An upstream JSON-RPC error here means the transaction would revert
    /// or is otherwise unexecutable; its message is propagated to the
    /// client as the rejection reason.
    async fn simulate_gas(
        &self,
        tx: &DecodedTransaction,
        session: Option<&DuplexSession>,
    ) -> Result<(), GatewayError> {
        let mut call = json!({
            "from": tx.from_hex(),
            "value": format!("0x{:x}", tx.value),
            "data": format!("0x{}", alloy_primitives::hex::encode(&tx.input)),
        });
        if let Some(to) = tx.to_hex() {
            call["to"] = json!(to);
        }

        let request =
            json!({"jsonrpc": "2.0", "id": 1, "method": "eth_estimateGas", "params": [call]});
        let response = self.forward(request, session).await?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("gas estimation failed");
            return Err(GatewayError::GasCheckFailed(message.to_string()));
        }

        Ok(())
    }
}
