// =============================================================================
// Trade Stream Ingestor — OKX public `trades` channel → message bus
// =============================================================================
//
// State machine:
//
//   Disconnected ──dial ok──▶ Connected ──read error / remote close──▶ Disconnected
//        │  ▲                     │
//   dial failed: sleep(backoff)   └──cancel──▶ send Close(Normal) ──▶ Stopped
//        └──┘
//
// Backoff doubles on every consecutive dial failure (capped) and resets on a
// successful connect.  A disconnect reconnects immediately.  Cancellation is
// observed while dialing, while sleeping and inside the connected loop.
//
// Every text frame that decodes as a trade push is forwarded verbatim to the
// bus topic and also logged per trade.  Anything else is counted and skipped.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::AppConfig;
use crate::market_data::backoff::{Backoff, Sleeper, TokioSleeper};
use crate::okx::messages::{EventMessage, SubscribeRequest, TradeMessage};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on a single outbound frame; a peer that stops reading must not
/// hold up shutdown.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens the WebSocket connection.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<WsStream>;
}

pub struct EndpointDialer {
    url: String,
}

impl EndpointDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for EndpointDialer {
    async fn dial(&self) -> Result<WsStream> {
        info!(url = %self.url, "connecting to trade WebSocket");
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .context("failed to connect to trade WebSocket")?;
        Ok(ws)
    }
}

// ---------------------------------------------------------------------------
// Stream stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Disconnected,
    Connected,
    Stopped,
}

/// Live counters of the ingestor, shared with the status API.
pub struct StreamStats {
    state: RwLock<StreamState>,
    connects: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_skipped: AtomicU64,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub state: StreamState,
    pub connects: u64,
    pub frames_forwarded: u64,
    pub frames_skipped: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self {
            state: RwLock::new(StreamState::Disconnected),
            connects: AtomicU64::new(0),
            frames_forwarded: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }
}

impl StreamStats {
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            state: self.state(),
            connects: self.connects.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }

    fn on_connected(&self) {
        *self.state.write() = StreamState::Connected;
        *self.last_connected_at.write() = Some(Utc::now());
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnected(&self, reason: String) {
        *self.state.write() = StreamState::Disconnected;
        *self.last_error.write() = Some(reason);
    }

    fn on_stopped(&self) {
        *self.state.write() = StreamState::Stopped;
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

enum SessionEnd {
    Cancelled,
    Disconnected(String),
}

pub struct TradeStreamIngestor {
    pairs: Vec<String>,
    topic: String,
    ping_interval: Duration,
    backoff: Backoff,
    dialer: Arc<dyn Dialer>,
    sleeper: Arc<dyn Sleeper>,
    bus: Arc<dyn MessageBus>,
    stats: Arc<StreamStats>,
}

impl TradeStreamIngestor {
    pub fn new(config: &AppConfig, dialer: Arc<dyn Dialer>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            pairs: config.pairs(),
            topic: config.bus.trades_topic.clone(),
            ping_interval: config.stream.ping_interval(),
            backoff: Backoff::new(config.stream.backoff_initial(), config.stream.backoff_max()),
            dialer,
            sleeper: Arc::new(TokioSleeper),
            bus,
            stats: Arc::new(StreamStats::default()),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Run until `cancel` fires.  Never returns an error: every failure is
    /// logged and answered with a reconnect.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = self.backoff.clone();
        info!(pairs = ?self.pairs, topic = %self.topic, "trade stream starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let dialed = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.dialer.dial() => res,
            };

            match dialed {
                Ok(ws) => {
                    backoff.reset();
                    self.stats.on_connected();
                    info!("trade WebSocket connected");

                    match self.session(ws, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Disconnected(reason) => {
                            warn!(reason = %reason, "trade WebSocket disconnected; reconnecting");
                            self.stats.on_disconnected(reason);
                        }
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %format!("{e:#}"),
                        retry_in_secs = delay.as_secs(),
                        "trade WebSocket dial failed"
                    );
                    self.stats.on_disconnected(format!("{e:#}"));

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        }

        self.stats.on_stopped();
        info!("trade stream stopped");
    }

    async fn session(&self, ws: WsStream, cancel: &CancellationToken) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let subscribe = match serde_json::to_string(&SubscribeRequest::trades(&self.pairs)) {
            Ok(s) => s,
            Err(e) => return SessionEnd::Disconnected(format!("subscribe encode failed: {e}")),
        };
        if let Err(e) = send_bounded(&mut write, Message::Text(subscribe), SEND_TIMEOUT).await {
            return SessionEnd::Disconnected(format!("subscribe send failed: {e}"));
        }
        debug!(count = self.pairs.len(), "trades subscription sent");

        let mut ping = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    };
                    if let Err(e) =
                        send_bounded(&mut write, Message::Close(Some(frame)), SEND_TIMEOUT).await
                    {
                        debug!(error = %e, "close frame not delivered");
                    }
                    return SessionEnd::Cancelled;
                }
                _ = ping.tick() => {
                    if let Err(e) = send_bounded(&mut write, Message::Ping(Vec::new()), SEND_TIMEOUT).await {
                        return SessionEnd::Disconnected(format!("ping failed: {e}"));
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by remote ({}): {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by remote".to_string());
                        return SessionEnd::Disconnected(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Disconnected(format!("read error: {e}")),
                    None => return SessionEnd::Disconnected("stream ended".to_string()),
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let msg = match TradeMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                match serde_json::from_str::<EventMessage>(text) {
                    Ok(ev) if ev.event == "error" => {
                        warn!(code = %ev.code, msg = %ev.msg, "exchange rejected request")
                    }
                    Ok(ev) => debug!(event = %ev.event, "control frame"),
                    Err(_) => warn!(error = %e, frame = %text, "skipping malformed frame"),
                }
                return;
            }
        };

        self.bus.publish(&self.topic, text.to_string());
        self.stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);

        for record in msg.records() {
            match record {
                Ok(t) => info!(
                    inst_id = %t.inst_id,
                    trade_id = %t.trade_id,
                    px = %t.price,
                    sz = %t.size,
                    side = %t.side,
                    ts = %t.time.to_rfc3339(),
                    "trade"
                ),
                Err(e) => warn!(error = %e, "undecodable trade entry"),
            }
        }
    }
}

async fn send_bounded<S>(sink: &mut S, msg: Message, limit: Duration) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(limit, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("send timed out after {}ms", limit.as_millis())),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::accept_async;

    const TRADE: &str = r#"{"arg":{"channel":"trades","instId":"BTC-USDT"},"data":[{"instId":"BTC-USDT","tradeId":"130639474","px":"42219.9","sz":"0.12060306","side":"buy","ts":"1630048897897"}]}"#;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.exchange.currencies = vec!["BTC".into()];
        config.stream.ping_interval_secs = 30;
        config
    }

    /// Fails or connects according to a script; fails once the script runs out.
    struct ScriptedDialer {
        script: Mutex<VecDeque<Option<String>>>,
        dials: AtomicU64,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Option<String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                dials: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self) -> Result<WsStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front().flatten();
            match next {
                Some(url) => Ok(connect_async(url.as_str()).await?.0),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    /// Records requested delays without sleeping; cancels after `limit` sleeps.
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
        limit: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, delay: Duration) {
            let mut delays = self.delays.lock();
            delays.push(delay);
            if delays.len() >= self.limit {
                self.cancel.cancel();
            }
        }
    }

    /// Accepts one client, completes the handshake and closes right away.
    async fn closing_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = ws.close(None).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn backoff_doubles_and_resets_after_connect() {
        let url = closing_server().await;
        let dialer = Arc::new(ScriptedDialer::new(vec![None, None, None, Some(url), None, None]));
        let cancel = CancellationToken::new();
        let sleeper = Arc::new(RecordingSleeper {
            delays: Mutex::new(Vec::new()),
            limit: 5,
            cancel: cancel.clone(),
        });

        let ingestor = TradeStreamIngestor::new(&config(), dialer.clone(), Arc::new(LocalBus::default()))
            .with_sleeper(sleeper.clone());
        let stats = ingestor.stats();

        tokio::time::timeout(Duration::from_secs(10), ingestor.run(cancel))
            .await
            .expect("stream task must stop once cancelled");

        let secs: Vec<u64> = sleeper.delays.lock().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 1, 2]);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 6);
        let snap = stats.snapshot();
        assert_eq!(snap.connects, 1);
        assert_eq!(snap.state, StreamState::Stopped);
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped_and_cancel_sends_normal_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (subscribed_tx, subscribed_rx) = oneshot::channel::<String>();
        let (closed_tx, closed_rx) = oneshot::channel::<Option<CloseCode>>();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(sub))) = ws.next().await {
                let _ = subscribed_tx.send(sub);
            }
            ws.send(Message::Text("not json".into())).await.unwrap();
            ws.send(Message::Text(
                r#"{"event":"subscribe","arg":{"channel":"trades","instId":"BTC-USDT"}}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(TRADE.into())).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let _ = closed_tx.send(frame.map(|f| f.code));
                    break;
                }
            }
        });

        let bus = LocalBus::new(16);
        let mut rx = bus.subscribe();
        let dialer = Arc::new(ScriptedDialer::new(vec![Some(url)]));
        let ingestor = Arc::new(TradeStreamIngestor::new(&config(), dialer.clone(), Arc::new(bus)));
        let stats = ingestor.stats();
        let cancel = CancellationToken::new();

        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(cancel).await })
        };

        let sub = subscribed_rx.await.unwrap();
        assert_eq!(
            sub,
            r#"{"op":"subscribe","args":[{"channel":"trades","instId":"BTC-USDT"}]}"#
        );

        let forwarded = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.topic, "trades");
        assert_eq!(forwarded.payload, TRADE);
        assert_eq!(stats.state(), StreamState::Connected);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(CloseCode::Normal));

        let snap = stats.snapshot();
        assert_eq!(snap.frames_forwarded, 1);
        assert_eq!(snap.frames_skipped, 2);
        assert_eq!(snap.state, StreamState::Stopped);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_before_start_never_dials() {
        let dialer = Arc::new(ScriptedDialer::new(vec![]));
        let ingestor = TradeStreamIngestor::new(&config(), dialer.clone(), Arc::new(LocalBus::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        ingestor.run(cancel).await;

        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        assert_eq!(ingestor.stats().state(), StreamState::Stopped);
    }

    /// A sink whose peer never drains: every send stays pending.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn stalled_close_send_gives_up_after_limit() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let started = std::time::Instant::now();

        let res = send_bounded(
            &mut StalledSink,
            Message::Close(Some(frame)),
            Duration::from_millis(50),
        )
        .await;

        assert!(res.unwrap_err().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
