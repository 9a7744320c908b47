//! WebSocket hub: lets `RemoteBus` clients in other processes share one `MemoryBus`.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use meshcell_core::Result;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bus::{Bus, BusMessage};
use crate::frame::Frame;
use crate::memory::MemoryBus;

#[derive(Clone)]
struct HubState {
    bus: MemoryBus,
    shutdown: CancellationToken,
    next_conn: Arc<AtomicU64>,
}

pub fn router(bus: MemoryBus, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/bus", get(handle_upgrade))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(HubState {
            bus,
            shutdown,
            next_conn: Arc::new(AtomicU64::new(1)),
        })
}

/// Serve the hub until `shutdown` fires. Open connections are closed on shutdown.
pub async fn serve(listener: TcpListener, bus: MemoryBus, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Bus hub listening");
    let app = router(bus, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Bus hub stopped");
    Ok(())
}

async fn handle_health(State(state): State<HubState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "subscriptions": state.bus.subscriber_count(),
    }))
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: HubState) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    info!(conn, "Bus client connected");

    let (mut sink, mut stream) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut forwarders: HashMap<u64, JoinHandle<()>> = HashMap::new();

    loop {
        let incoming = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            incoming = stream.next() => incoming,
        };
        let text = match incoming {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn, error = %e, "Bus client receive error");
                break;
            }
        };

        let frame = match serde_json::from_str::<Frame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = frames_tx.send(Frame::Error {
                    sid: None,
                    message: format!("malformed frame: {}", e),
                });
                continue;
            }
        };

        match frame {
            Frame::Pub {
                topic,
                reply_to,
                payload,
            } => {
                let message = BusMessage {
                    topic,
                    reply_to,
                    payload,
                };
                if let Err(e) = state.bus.route(message) {
                    warn!(conn, error = %e, "Failed to route message");
                }
            }
            Frame::Sub { sid, pattern } => match state.bus.subscribe(&pattern).await {
                Ok(mut subscription) => {
                    let out = frames_tx.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(message) = subscription.recv().await {
                            if out.send(Frame::deliver(sid, message)).is_err() {
                                break;
                            }
                        }
                    });
                    if let Some(previous) = forwarders.insert(sid, forwarder) {
                        previous.abort();
                    }
                    debug!(conn, sid, pattern = %pattern, "Subscribed");
                    let _ = frames_tx.send(Frame::SubAck { sid });
                }
                Err(e) => {
                    let _ = frames_tx.send(Frame::Error {
                        sid: Some(sid),
                        message: e.to_string(),
                    });
                }
            },
            Frame::Unsub { sid } => {
                if let Some(forwarder) = forwarders.remove(&sid) {
                    forwarder.abort();
                    debug!(conn, sid, "Unsubscribed");
                }
            }
            other => {
                let _ = frames_tx.send(Frame::Error {
                    sid: None,
                    message: format!("unexpected frame from client: {:?}", other),
                });
            }
        }
    }

    for (_, forwarder) in forwarders.drain() {
        forwarder.abort();
    }
    drop(frames_tx);
    let _ = writer.await;
    info!(conn, "Bus client disconnected");
}
