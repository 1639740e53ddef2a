use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use log::{debug, info, warn};
use serde_json::Value;

use tokio::sync::{Notify, mpsc};
use tokio::time::{Duration, sleep};

use rand::random_range;

use crate::collaborators::{EventSink, Notification};
use crate::config::NotifierConfig;
use crate::metrics::RuntimeMetrics;

const QUEUE_CAPACITY: usize = 10_000;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(5);

/// ============================================================
/// NotifierSender
/// ============================================================
///
/// Represents a **single persistent WebSocket connection** to the
/// notification hub that fans processed-record updates out to UIs.
///
/// Responsibilities:
/// - Perform login handshake
/// - Send JSON messages from an internal queue
/// - Send periodic JSON pings
/// - Detect connection loss
/// - Reconnect automatically (with jitter)
///
/// Design constraints:
/// - Must never block the router or the monitor
/// - Must tolerate hub restarts
/// - Must drop data gracefully under backpressure
#[derive(Clone)]
pub struct NotifierSender {
    /// Queue used to enqueue outgoing messages.
    ///
    /// This sender is replaced on every reconnect.
    queue: Arc<Mutex<mpsc::Sender<Value>>>,

    /// True while a connection is established.
    connected: Arc<AtomicBool>,
}

impl NotifierSender {

    /// Starts a persistent reconnect loop to the hub.
    ///
    /// CONTRACT:
    /// - This function never fails
    /// - All errors are handled internally
    pub fn connect_loop(hub_url: String, login_msg: String, debug: bool) -> Self {
        let (tx, _) = mpsc::channel::<Value>(QUEUE_CAPACITY);
        let queue = Arc::new(Mutex::new(tx));
        let connected = Arc::new(AtomicBool::new(false));

        let sender = Self {
            queue: queue.clone(),
            connected: connected.clone(),
        };

        tokio::spawn(async move {
            loop {
                // Fresh queue per connection
                let (tx, rx) = mpsc::channel::<Value>(QUEUE_CAPACITY);
                *queue.lock().unwrap_or_else(PoisonError::into_inner) = tx;

                if let Err(e) = Self::try_connect(
                    &hub_url,
                    &login_msg,
                    debug,
                    rx,
                    connected.clone(),
                ).await {
                    warn!("notifier connection lost: {}", e);
                }
                connected.store(false, Ordering::Relaxed);

                // Jittered backoff so a pool does not reconnect in lockstep
                let jitter = Duration::from_millis(random_range(0..2_000));
                sleep(RECONNECT_BASE + jitter).await;
            }
        });

        sender
    }

    /// Establishes a single WebSocket connection to the hub.
    ///
    /// TERMINATION:
    /// - Returns an error when the connection is closed
    async fn try_connect(
        hub_url: &str,
        login_msg: &str,
        debug: bool,
        mut rx: mpsc::Receiver<Value>,
        connected: Arc<AtomicBool>,
    ) -> Result<()> {
        let (ws, _) = connect_async(hub_url).await?;
        let (mut write, mut read) = ws.split();

        // Used to notify the writer when the reader detects EOF
        let closed = Arc::new(Notify::new());

        // ------------------------------------------------------------
        // LOGIN HANDSHAKE
        // ------------------------------------------------------------
        write.send(Message::Text(login_msg.to_string().into())).await?;
        connected.store(true, Ordering::Relaxed);
        info!("notifier connected to {}", hub_url);

        let mut ping_interval = tokio::time::interval(PING_INTERVAL);

        // ------------------------------------------------------------
        // READER TASK
        // ------------------------------------------------------------
        // Consumes incoming messages (ignored) and signals the
        // writer on EOF.
        tokio::spawn({
            let closed = closed.clone();

            async move {
                while let Some(Ok(msg)) = read.next().await {
                    if let Message::Text(text) = msg {
                        if debug {
                            debug!("[notifier recv] {}", text);
                        }
                    }
                }
                closed.notify_one();
            }
        });

        // ------------------------------------------------------------
        // WRITER LOOP
        // ------------------------------------------------------------
        loop {
            tokio::select! {
                Some(msg) = rx.recv() => {
                    let json = serde_json::to_string(&msg)?;
                    if debug {
                        debug!("[notifier send] {}", json);
                    }
                    write.send(Message::Text(json.into())).await?;
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Text(r#"{"op":"ping"}"#.into())).await?;
                }

                _ = closed.notified() => {
                    return Err(anyhow::anyhow!("hub closed connection"));
                }
            }
        }
    }

    /// Enqueues a message without waiting.
    ///
    /// Returns false if the connection is down or the queue is full.
    pub fn try_send(&self, msg: Value) -> bool {
        if !self.connected.load(Ordering::Relaxed) {
            return false;
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_send(msg)
            .is_ok()
    }
}

/// ============================================================
/// NotifierPool
/// ============================================================
///
/// Manages multiple `NotifierSender` connections and implements
/// `EventSink`.
///
/// Purpose:
/// - Redundancy
/// - Load distribution
/// - Fault tolerance
///
/// DEMO MODE:
/// - No network connections
/// - Notifications are only logged
pub struct NotifierPool {
    senders: Vec<NotifierSender>,
    demo: bool,
    metrics: Arc<RuntimeMetrics>,
}

impl NotifierPool {

    /// Creates a pool of hub connections.
    ///
    /// LOGIN FORMAT:
    /// - key=<API_KEY>&role=collector
    pub fn new(cfg: &NotifierConfig, debug: bool, metrics: Arc<RuntimeMetrics>) -> Self {
        let demo = cfg.demo.unwrap_or(false);
        if demo {
            info!("notifier running in DEMO mode");
        }

        let senders = if demo {
            Vec::new()
        } else {
            (0..cfg.connections.max(1))
                .map(|_| {
                    NotifierSender::connect_loop(
                        cfg.url.clone(),
                        format!("key={}&role=collector", cfg.key),
                        debug,
                    )
                })
                .collect()
        };

        Self { senders, demo, metrics }
    }

    /// Sends through a randomly selected sender, trying each
    /// connection at most once.
    fn dispatch(&self, msg: Value) -> bool {
        if self.senders.is_empty() {
            return false;
        }

        let start = random_range(0..self.senders.len());
        (0..self.senders.len())
            .map(|offset| &self.senders[(start + offset) % self.senders.len()])
            .any(|sender| sender.try_send(msg.clone()))
    }
}

impl EventSink for NotifierPool {
    fn notify(&self, notification: Notification) {
        let msg = match serde_json::to_value(&notification) {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to serialize notification: {}", e);
                return;
            }
        };

        if self.demo {
            info!("DEMO notify -> {}", msg);
            RuntimeMetrics::incr(&self.metrics.notifications_sent);
            return;
        }

        if self.dispatch(msg) {
            RuntimeMetrics::incr(&self.metrics.notifications_sent);
        } else {
            RuntimeMetrics::incr(&self.metrics.notifications_dropped);
        }
    }
}
