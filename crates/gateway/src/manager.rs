//! Duplex session lifecycle management
//!
//! The manager accepts upgraded client sockets, dials the paired upstream
//! socket for each, runs the relay pumps, and keeps the session registry.
//! Two periodic loops - a defensive garbage-collection sweep and a stats
//! log - run until the shared shutdown signal fires; both stop together.

use crate::gateway::ProxyGateway;
use crate::session::{
    ClientFrame, DuplexSession, SessionContext, UpstreamFrame, SESSION_CLOSE_CODE,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

/// Capacity of the per-session outbound frame queues
const FRAME_QUEUE_DEPTH: usize = 64;

/// Accepts, registers and garbage-collects duplex sessions
pub struct DuplexSessionManager {
    sessions: DashMap<u64, Arc<DuplexSession>>,
    next_id: AtomicU64,
    gateway: Arc<ProxyGateway>,
    upstream_ws_url: Option<String>,
    shutdown_tx: broadcast::Sender<()>,
    sweep_interval: Duration,
    stats_interval: Duration,
}

impl DuplexSessionManager {
    /// Creates a session manager
    ///
    /// # Arguments
    /// * `gateway` - Dispatch target for client messages
    /// * `upstream_ws_url` - Upstream socket URL; sessions are rejected when unset
    /// * `shutdown_tx` - Shared shutdown signal for the maintenance loops
    /// * `sweep_interval` - Seconds between dead-session sweeps
    /// * `stats_interval` - Seconds between active-session stat logs
    pub fn new(
        gateway: Arc<ProxyGateway>,
        upstream_ws_url: Option<String>,
        shutdown_tx: broadcast::Sender<()>,
        sweep_interval: Duration,
        stats_interval: Duration,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            gateway,
            upstream_ws_url,
            shutdown_tx,
            sweep_interval,
            stats_interval,
        }
    }

    /// Number of sessions currently registered
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Starts the sweep and stats loops
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.sweep_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.sweep().await,
                    _ = shutdown.recv() => {
                        debug!("session sweep loop stopped");
                        break;
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.stats_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!(active = manager.active_sessions(), "duplex sessions");
                    }
                    _ = shutdown.recv() => {
                        debug!("session stats loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Force-closes sessions whose sockets died without being cleaned up
    ///
    /// Normal teardown removes sessions inline; this sweep is a backstop
    /// against missed close events.
    async fn sweep(&self) {
        let dead: Vec<u64> =
            self.sessions.iter().filter(|e| e.value().is_closed()).map(|e| *e.key()).collect();

        for id in dead {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.force_close("closed by server").await;
                warn!(session = id, "collected dead session");
            }
        }
    }

    /// Runs one duplex session to completion
    ///
    /// Phases: dial the upstream while buffering client frames that race
    /// the dial (Connecting), register and replay the buffer (Paired),
    /// relay until either side terminates (Active), then force-close both
    /// sockets and drop the registry entry (Closing).
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, context: SessionContext) {
        let Some(upstream_url) = self.upstream_ws_url.clone() else {
            warn!("rejected duplex session: no upstream socket configured");
            close_client(socket, "server error").await;
            return;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (mut client_tx, mut client_rx) = socket.split();

        // Connecting: the client may already be talking while the upstream
        // dial is in flight; its frames are buffered, not dropped.
        let connect = connect_async(upstream_url);
        tokio::pin!(connect);
        let mut buffered: Vec<String> = Vec::new();

        let upstream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((stream, _)) => break stream,
                    Err(e) => {
                        warn!(session = id, "upstream connect failed: {}", e);
                        let _ = client_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: SESSION_CLOSE_CODE,
                                reason: "server error".into(),
                            })))
                            .await;
                        return;
                    }
                },
                frame = client_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => buffered.push(text.to_string()),
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session = id, "client left during upstream dial");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = id, "client socket error during dial: {}", e);
                        return;
                    }
                },
            }
        };

        let (mut upstream_tx, mut upstream_rx) = upstream.split();
        let (to_client, mut client_out) = mpsc::channel::<ClientFrame>(FRAME_QUEUE_DEPTH);
        let (to_upstream, mut upstream_out) = mpsc::channel::<UpstreamFrame>(FRAME_QUEUE_DEPTH);

        let session = Arc::new(DuplexSession::new(id, context, to_client, to_upstream));
        self.sessions.insert(id, session.clone());
        info!(session = id, "duplex session paired");

        // Writer pumps own the socket sinks.
        let client_writer = tokio::spawn(async move {
            while let Some(frame) = client_out.recv().await {
                match frame {
                    ClientFrame::Text(text) => {
                        if client_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    ClientFrame::Close(reason) => {
                        let _ = client_tx
                            .send(Message::Close(Some(CloseFrame {
                                code: SESSION_CLOSE_CODE,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        });

        let upstream_writer = tokio::spawn(async move {
            while let Some(frame) = upstream_out.recv().await {
                match frame {
                    UpstreamFrame::Text(text) => {
                        if upstream_tx.send(tungstenite::Message::Text(text.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    UpstreamFrame::Close => {
                        let _ = upstream_tx.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Upstream reader; the sole writer of correlation slot values.
        let upstream_reader = {
            let session = session.clone();
            tokio::spawn(async move {
                while let Some(frame) = upstream_rx.next().await {
                    match frame {
                        Ok(tungstenite::Message::Text(text)) => {
                            session.handle_upstream_message(text.as_str()).await;
                        }
                        Ok(tungstenite::Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                session.mark_closed();
            })
        };

        // Paired: replay whatever raced the dial, in arrival order.
        for text in buffered {
            session.handle_client_message(&text, &self.gateway).await;
        }

        // Active: relay client traffic until either side terminates.
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                frame = client_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        session.handle_client_message(text.as_str(), &self.gateway).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = id, "client socket error: {}", e);
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            }

            if session.is_closed() {
                break;
            }
        }

        // Closing: both sockets force-closed, registry entry dropped.
        session.force_close("closed by server").await;
        self.sessions.remove(&id);
        upstream_reader.abort();
        let _ = client_writer.await;
        let _ = upstream_writer.await;
        info!(session = id, "duplex session closed");
    }
}

/// Closes a freshly accepted client socket with the fixed error code
async fn close_client(socket: WebSocket, reason: &'static str) {
    let (mut sender, _) = socket.split();
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: SESSION_CLOSE_CODE,
            reason: reason.into(),
        })))
        .await;
}
