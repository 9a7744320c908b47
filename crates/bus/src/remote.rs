use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use meshcell_core::{Error, Result, TopicPattern};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::backoff::{retry_with_backoff, ReconnectPolicy};
use crate::bus::{Bus, BusConnector, BusMessage, Subscription};
use crate::frame::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

struct RemoteSub {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

enum Outbound {
    Frame(Frame),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Shared {
    subs: Mutex<HashMap<u64, RemoteSub>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn subs(&self) -> MutexGuard<'_, HashMap<u64, RemoteSub>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acks(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.subs().clear();
        self.acks().clear();
    }

    fn dispatch(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame from hub");
                return;
            }
        };
        match frame {
            Frame::Msg {
                sid,
                topic,
                reply_to,
                payload,
            } => {
                let subs = self.subs();
                match subs.get(&sid) {
                    Some(sub) => {
                        let _ = sub.tx.send(BusMessage {
                            topic,
                            reply_to,
                            payload,
                        });
                    }
                    None => debug!(sid, topic = %topic, "Message for a cancelled subscription"),
                }
            }
            Frame::SubAck { sid } => {
                if let Some(ack) = self.acks().remove(&sid) {
                    let _ = ack.send(());
                }
            }
            Frame::Error { sid, message } => {
                warn!(sid = ?sid, message = %message, "Hub rejected a frame");
                if let Some(sid) = sid {
                    self.acks().remove(&sid);
                }
            }
            other => debug!(frame = ?other, "Ignoring unexpected frame from hub"),
        }
    }
}

/// Bus client for a `meshcell hub`, over WebSocket.
///
/// Lost connections are re-established with the reconnect policy and every
/// live subscription is re-sent. When the budget is spent the bus closes and
/// all subscriptions end.
pub struct RemoteBus {
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
    next_sid: AtomicU64,
}

impl RemoteBus {
    pub async fn connect(url: &str, policy: ReconnectPolicy) -> Result<Arc<Self>> {
        url::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid bus url '{}': {}", url, e)))?;

        let ws = retry_with_backoff(policy, "bus connect", |_| open(url.to_string())).await?;
        info!(url = %url, "Connected to bus");

        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(ws, outbound_rx, url.to_string(), policy, shared.clone()));

        Ok(Arc::new(Self {
            url: url.to_string(),
            outbound,
            shared,
            next_sid: AtomicU64::new(1),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, out: Outbound) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(format!("bus connection to {} is closed", self.url)));
        }
        self.outbound
            .send(out)
            .map_err(|_| Error::Closed(format!("bus connection to {} was released", self.url)))
    }
}

async fn open(url: String) -> Result<WsStream> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::Connection(format!("{}: {}", url, e)))?;
    Ok(ws)
}

async fn drive(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    url: String,
    policy: ReconnectPolicy,
    shared: Arc<Shared>,
) {
    loop {
        match pump(&mut ws, &mut outbound, &shared).await {
            Ok(()) => {
                debug!(url = %url, "Bus connection released");
                break;
            }
            Err(reason) => {
                shared.connected.store(false, Ordering::SeqCst);
                warn!(url = %url, error = %reason, "Bus connection lost, reconnecting");
                match retry_with_backoff(policy, "bus reconnect", |_| open(url.clone())).await {
                    Ok(fresh) => {
                        ws = fresh;
                        if let Err(e) = resubscribe(&mut ws, &shared).await {
                            warn!(error = %e, "Failed to restore subscriptions");
                        }
                        shared.connected.store(true, Ordering::SeqCst);
                        info!(url = %url, "Reconnected to bus");
                    }
                    Err(e) => {
                        error!(url = %url, error = %e, "Bus reconnect budget exhausted, closing");
                        shared.close();
                        break;
                    }
                }
            }
        }
    }
    shared.connected.store(false, Ordering::SeqCst);
}

async fn pump(
    ws: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    shared: &Shared,
) -> std::result::Result<(), String> {
    loop {
        tokio::select! {
            out = outbound.recv() => match out {
                None => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                Some(Outbound::Frame(frame)) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode frame");
                            continue;
                        }
                    };
                    ws.send(WsMessage::Text(text)).await.map_err(|e| e.to_string())?;
                }
                Some(Outbound::Flush(ack)) => {
                    SinkExt::flush(&mut *ws).await.map_err(|e| e.to_string())?;
                    let _ = ack.send(());
                }
            },
            incoming = ws.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => shared.dispatch(&text),
                Some(Ok(WsMessage::Ping(data))) => {
                    ws.send(WsMessage::Pong(data)).await.map_err(|e| e.to_string())?;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err("closed by hub".to_string()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.to_string()),
            },
        }
    }
}

async fn resubscribe(ws: &mut WsStream, shared: &Shared) -> Result<()> {
    let frames: Vec<Frame> = shared
        .subs()
        .iter()
        .map(|(sid, sub)| Frame::Sub {
            sid: *sid,
            pattern: sub.pattern.clone(),
        })
        .collect();
    let count = frames.len();
    for frame in frames {
        let text = serde_json::to_string(&frame)?;
        ws.send(WsMessage::Text(text))
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
    }
    debug!(count, "Subscriptions restored");
    Ok(())
}

#[async_trait]
impl Bus for RemoteBus {
    async fn publish_message(&self, message: BusMessage) -> Result<()> {
        self.send(Outbound::Frame(Frame::publish(message)))
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        TopicPattern::parse(pattern)?;
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.subs().insert(
            sid,
            RemoteSub {
                pattern: pattern.to_string(),
                tx,
            },
        );
        self.shared.acks().insert(sid, ack_tx);

        if let Err(e) = self.send(Outbound::Frame(Frame::Sub {
            sid,
            pattern: pattern.to_string(),
        })) {
            self.shared.subs().remove(&sid);
            self.shared.acks().remove(&sid);
            return Err(e);
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let outbound = self.outbound.clone();
        let subscription = Subscription::new(pattern, rx, move || {
            if let Some(shared) = weak.upgrade() {
                shared.subs().remove(&sid);
                shared.acks().remove(&sid);
            }
            let _ = outbound.send(Outbound::Frame(Frame::Unsub { sid }));
        });

        match tokio::time::timeout(SUBSCRIBE_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => Ok(subscription),
            Ok(Err(_)) if self.shared.closed.load(Ordering::SeqCst) => Err(Error::Closed(
                format!("bus closed before '{}' was subscribed", pattern),
            )),
            Ok(Err(_)) => Err(Error::Validation(format!(
                "hub rejected subscription '{}'",
                pattern
            ))),
            Err(_) => {
                // Still registered locally; it is re-sent on reconnect.
                self.shared.acks().remove(&sid);
                warn!(pattern = %pattern, "Subscription not acknowledged yet, continuing");
                Ok(subscription)
            }
        }
    }

    async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Outbound::Flush(tx))?;
        rx.await
            .map_err(|_| Error::Closed("bus closed before flush completed".to_string()))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst) && !self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Connects a `RemoteBus`, retrying with the policy.
#[derive(Debug, Clone)]
pub struct RemoteConnector {
    pub url: String,
    pub policy: ReconnectPolicy,
}

impl RemoteConnector {
    pub fn new(url: &str, policy: ReconnectPolicy) -> Self {
        Self {
            url: url.to_string(),
            policy,
        }
    }

    pub fn from_config(config: &meshcell_core::config::BusConfig) -> Self {
        Self::new(&config.url, ReconnectPolicy::from_config(config))
    }
}

#[async_trait]
impl BusConnector for RemoteConnector {
    async fn connect(&self) -> Result<Arc<dyn Bus>> {
        let bus: Arc<dyn Bus> = RemoteBus::connect(&self.url, self.policy).await?;
        Ok(bus)
    }
}
