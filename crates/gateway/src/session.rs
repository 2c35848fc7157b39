// Palisade - JSON-RPC admission gateway
// Copyright (C) 2026 Palisade Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Duplex session state and correlation
//!
//! A duplex session pairs one client socket with one upstream socket.
//! Client traffic flows through the gateway; upstream traffic is relayed
//! back verbatim unless its id names a pending proxy-initiated request,
//! in which case it is captured for the `send_to_server` caller instead
//! of being forwarded.
//!
//! Correlation is poll-based on purpose: the upstream reader task is the
//! only writer of pending-slot values, so there is no race between the
//! generic relay path and per-request awaiters.

use crate::envelope;
use crate::gateway::ProxyGateway;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// The single abnormal-closure code sessions close with
pub const SESSION_CLOSE_CODE: u16 = 1011;

/// Default cadence of the `send_to_server` poll loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default deadline for a proxy-initiated upstream request
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames queued toward the client socket
#[derive(Debug)]
pub enum ClientFrame {
    /// A text payload
    Text(String),
    /// Close the socket with the fixed code and this reason
    Close(&'static str),
}

/// Frames queued toward the upstream socket
#[derive(Debug)]
pub enum UpstreamFrame {
    /// A text payload
    Text(String),
    /// Close the socket
    Close,
}

/// Request-scoped client context handed to the gateway
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Peer address, when known
    pub ip: Option<IpAddr>,
    /// Selected request headers
    pub headers: HashMap<String, String>,
}

/// One paired client/upstream connection
///
/// Owned by the session manager; the pending-request table is owned
/// exclusively by this session and never shared across sessions.
pub struct DuplexSession {
    id: u64,
    context: SessionContext,
    pending: Mutex<HashMap<String, Option<Value>>>,
    to_client: mpsc::Sender<ClientFrame>,
    to_upstream: mpsc::Sender<UpstreamFrame>,
    closed: AtomicBool,
}

fn correlation_token() -> String {
    let mut rng = rand::rng();
    format!("pal-{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}

impl DuplexSession {
    /// Creates a paired session over the given outbound queues
    pub fn new(
        id: u64,
        context: SessionContext,
        to_client: mpsc::Sender<ClientFrame>,
        to_upstream: mpsc::Sender<UpstreamFrame>,
    ) -> Self {
        Self {
            id,
            context,
            pending: Mutex::new(HashMap::new()),
            to_client,
            to_upstream,
            closed: AtomicBool::new(false),
        }
    }

    /// Session id within the manager registry
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The client context this session was opened with
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Marks the session as closing/closed
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Whether either side of the pairing has reached a terminal state
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
            || self.to_client.is_closed()
            || self.to_upstream.is_closed()
    }

    /// Number of proxy-initiated requests still awaiting answers
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queues the close frames for both sockets
    pub async fn force_close(&self, reason: &'static str) {
        self.mark_closed();
        let _ = self.to_client.send(ClientFrame::Close(reason)).await;
        let _ = self.to_upstream.send(UpstreamFrame::Close).await;
    }

    /// Handles one message from the client socket
    ///
    /// Literal `"ping"` short-circuits to `"pong"` without touching the
    /// gateway; non-JSON payloads answer the fixed parse-error envelope;
    /// everything else goes through gateway dispatch with this session
    /// attached so multi-step flows can call back into `send_to_server`.
    pub async fn handle_client_message(&self, text: &str, gateway: &ProxyGateway) {
        if text == "ping" {
            let _ = self.to_client.send(ClientFrame::Text("pong".to_string())).await;
            return;
        }

        let body: Value = match serde_json::from_str(text) {
            Ok(body) => body,
            Err(_) => {
                let _ =
                    self.to_client.send(ClientFrame::Text(envelope::parse_error().to_string())).await;
                return;
            }
        };

        let response = gateway.dispatch(body, &self.context, Some(self)).await;
        let _ = self.to_client.send(ClientFrame::Text(response.to_string())).await;
    }

    /// Handles one message from the upstream socket
    ///
    /// A frame whose id names a pending correlation slot is data for a
    /// `send_to_server` caller and is captured instead of forwarded; this
    /// method is the sole writer of slot values. Anything else - pushes,
    /// subscription notifications, answers that outlived their deadline -
    /// is relayed to the client verbatim.
    pub async fn handle_upstream_message(&self, text: &str) {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            let token = value.get("id").and_then(Value::as_str).map(str::to_owned);
            if let Some(token) = token {
                let mut pending = self.pending.lock();
                if let Some(slot) = pending.get_mut(&token) {
                    *slot = Some(value);
                    return;
                }
            }
        }

        let _ = self.to_client.send(ClientFrame::Text(text.to_string())).await;
    }

    /// Sends a proxy-initiated request upstream with default pacing
    pub async fn send_to_server(&self, request: Value) -> Value {
        self.send_to_server_with(request, DEFAULT_POLL_INTERVAL, DEFAULT_SEND_TIMEOUT).await
    }

    /// Sends a proxy-initiated request upstream and awaits its answer
    ///
    /// The request id is rewritten to a fresh unguessable token so the
    /// answer can be told apart from organic client traffic sharing the
    /// connection. The caller's id is always restored on the way out, and
    /// the pending slot is always removed - on timeout too, so a late
    /// upstream answer degrades to pass-through rather than leaking state.
    pub async fn send_to_server_with(
        &self,
        mut request: Value,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Value {
        let original_id = envelope::request_id(&request);
        let token = correlation_token();

        match request.as_object_mut() {
            Some(obj) => {
                obj.insert("id".to_string(), Value::String(token.clone()));
            }
            None => return envelope::error_envelope(original_id, -32600, "invalid request"),
        }

        self.pending.lock().insert(token.clone(), None);

        if self.to_upstream.send(UpstreamFrame::Text(request.to_string())).await.is_err() {
            self.pending.lock().remove(&token);
            return envelope::error_envelope(original_id, -32603, "upstream unreachable");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut response: Option<Value> = None;

        loop {
            tokio::time::sleep(poll_interval).await;

            if let Some(slot) = self.pending.lock().get_mut(&token) {
                if slot.is_some() {
                    response = slot.take();
                }
            }

            if response.is_some() || tokio::time::Instant::now() >= deadline {
                break;
            }
        }

        self.pending.lock().remove(&token);

        match response {
            Some(mut value) => {
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("id".to_string(), original_id);
                }
                value
            }
            None => {
                debug!(session = self.id, "proxy-initiated request timed out");
                envelope::error_envelope(original_id, -32603, "request timeout")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_support::plain_gateway;
    use serde_json::json;
    use std::sync::Arc;

    fn session() -> (Arc<DuplexSession>, mpsc::Receiver<ClientFrame>, mpsc::Receiver<UpstreamFrame>)
    {
        let (to_client, client_rx) = mpsc::channel(16);
        let (to_upstream, upstream_rx) = mpsc::channel(16);
        let session =
            Arc::new(DuplexSession::new(1, SessionContext::default(), to_client, to_upstream));
        (session, client_rx, upstream_rx)
    }

    #[tokio::test]
    async fn test_send_to_server_restores_original_id() {
        let (session, _client_rx, mut upstream_rx) = session();

        let responder = {
            let session = session.clone();
            tokio::spawn(async move {
                let UpstreamFrame::Text(sent) = upstream_rx.recv().await.unwrap() else {
                    panic!("expected text frame");
                };
                let sent: Value = serde_json::from_str(&sent).unwrap();
                let token = sent["id"].as_str().unwrap().to_string();
                // The wire-level id is the rewritten token, not the caller's.
                assert_ne!(sent["id"], json!(7));

                session
                    .handle_upstream_message(
                        &json!({"jsonrpc": "2.0", "id": token, "result": "0x1"}).to_string(),
                    )
                    .await;
            })
        };

        let request = json!({"jsonrpc": "2.0", "id": 7, "method": "eth_chainId"});
        let response = session
            .send_to_server_with(request, Duration::from_millis(5), Duration::from_secs(1))
            .await;

        responder.await.unwrap();
        assert_eq!(response["id"], 7);
        assert_eq!(response["result"], "0x1");
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_send_to_server_timeout_then_late_answer_passes_through() {
        let (session, mut client_rx, mut upstream_rx) = session();

        let request = json!({"jsonrpc": "2.0", "id": 3, "method": "eth_chainId"});
        let response = session
            .send_to_server_with(request, Duration::from_millis(5), Duration::from_millis(40))
            .await;

        assert_eq!(response["id"], 3);
        assert_eq!(response["error"]["message"], "request timeout");
        assert_eq!(session.pending_requests(), 0);

        // The upstream answers after the deadline; its slot is gone, so the
        // frame is treated as an ordinary pass-through message.
        let UpstreamFrame::Text(sent) = upstream_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let token = serde_json::from_str::<Value>(&sent).unwrap()["id"].as_str().unwrap().to_string();
        let late = json!({"jsonrpc": "2.0", "id": token, "result": "0x2"}).to_string();
        session.handle_upstream_message(&late).await;

        let ClientFrame::Text(relayed) = client_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert_eq!(relayed, late);
    }

    #[tokio::test]
    async fn test_ping_answers_pong_without_gateway() {
        let (session, mut client_rx, _upstream_rx) = session();
        let gateway = plain_gateway().await;

        session.handle_client_message("ping", &gateway).await;

        let ClientFrame::Text(reply) = client_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn test_non_json_client_payload_answers_parse_error() {
        let (session, mut client_rx, _upstream_rx) = session();
        let gateway = plain_gateway().await;

        session.handle_client_message("not-json", &gateway).await;

        let ClientFrame::Text(reply) = client_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert!(reply["id"].is_null());
        assert_eq!(reply["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_unknown_upstream_id_is_relayed() {
        let (session, mut client_rx, _upstream_rx) = session();

        let push =
            json!({"jsonrpc": "2.0", "method": "eth_subscription", "params": {"result": "0xb"}})
                .to_string();
        session.handle_upstream_message(&push).await;

        let ClientFrame::Text(relayed) = client_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        assert_eq!(relayed, push);
    }
}
