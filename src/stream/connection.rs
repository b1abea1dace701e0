//! Venue channel connection lifecycle
//!
//! Idle -> Connecting -> Open -> Reconnecting -> Connecting ... until an
//! explicit close moves the channel to Closed. Subscriptions, heartbeat and
//! inbound frames are all driven from one `select!` loop per channel, so ticks
//! for a channel are dispatched strictly in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::normalizer::{self, ControlFrame, Inbound};
use super::planner::{plan, SubscribeRequest, PING_FRAME};
use super::transport::{Connector, Frame, Session};
use super::{isolate, FeedHandler, VenueChannel};
use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::types::ConnectionState;

/// Upper bound on the close handshake during teardown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Exponential reconnect delay: doubles per consecutive failure, capped,
/// reset after a successful open. No jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(feed: &FeedConfig) -> Self {
        Self::new(
            Duration::from_millis(feed.initial_backoff_ms),
            Duration::from_millis(feed.max_backoff_ms),
        )
    }

    /// Delay to wait now; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Why an open session ended
enum SessionEnd {
    Cancelled,
    Closed(&'static str),
    Failed(FeedError),
}

/// Owns one venue channel's socket lifecycle
pub struct ConnectionManager {
    channel: VenueChannel,
    settings: FeedConfig,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn FeedHandler>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// Returned by [`ConnectionManager::open`]; closing it is terminal
pub struct ConnectionHandle {
    channel: String,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the channel task. Must be called inside a tokio runtime.
    pub fn open(
        channel: VenueChannel,
        settings: &FeedConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn FeedHandler>,
    ) -> ConnectionHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let cancel = CancellationToken::new();
        let name = channel.name.clone();

        let manager = Self {
            channel,
            settings: settings.clone(),
            connector,
            handler,
            state: state_tx,
            cancel: cancel.clone(),
        };
        manager.set_state(ConnectionState::Connecting);
        let task = tokio::spawn(manager.run());

        ConnectionHandle {
            channel: name,
            state: state_rx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn notify<F>(&self, callback: &'static str, f: F)
    where
        F: FnOnce(&dyn FeedHandler) -> anyhow::Result<()>,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = isolate(callback, || f(self.handler.as_ref())) {
            warn!(channel = %self.channel.name, error = %e, "Handler callback failed");
        }
    }

    async fn run(self) {
        let mut backoff = Backoff::from_config(&self.settings);
        let mut attempt: u32 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            attempt = attempt.saturating_add(1);
            info!(
                channel = %self.channel.name,
                endpoint = %self.channel.endpoint,
                attempt,
                "Connecting venue channel..."
            );

            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.channel.endpoint) => result,
            };

            match connected {
                Ok(session) => {
                    backoff.reset();
                    attempt = 0;
                    self.set_state(ConnectionState::Open);
                    info!(channel = %self.channel.name, "✅ Venue channel open");
                    self.notify("on_open", |h| h.on_open(&self.channel.name));

                    match self.pump(session).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Closed(reason) => {
                            warn!(channel = %self.channel.name, reason, "Venue channel closed");
                            self.notify("on_close", |h| h.on_close(&self.channel.name));
                        }
                        SessionEnd::Failed(e) => {
                            error!(channel = %self.channel.name, error = %e, "Venue channel failed");
                            self.notify("on_error", |h| h.on_error(&self.channel.name, &e));
                            self.notify("on_close", |h| h.on_close(&self.channel.name));
                        }
                    }
                }
                Err(e) => {
                    warn!(channel = %self.channel.name, error = %e, attempt, "Connection failed");
                    self.notify("on_error", |h| h.on_error(&self.channel.name, &e));
                }
            }

            let delay = backoff.next_delay();
            self.set_state(ConnectionState::Reconnecting);
            info!(
                channel = %self.channel.name,
                delay_ms = delay.as_millis() as u64,
                "🔄 Reconnect scheduled"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Closed);
        debug!(channel = %self.channel.name, "Venue channel task finished");
    }

    async fn pump(&self, session: Session) -> SessionEnd {
        let Session {
            mut sink,
            mut stream,
        } = session;

        let mut batches: VecDeque<Vec<String>> =
            plan(&self.channel.topics, self.channel.max_batch_size).into();
        let stagger = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(stagger);

        let period = self.settings.heartbeat();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let silence_timeout = self.settings.silence_timeout();
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                    return SessionEnd::Cancelled;
                }

                _ = &mut stagger, if !batches.is_empty() => {
                    if let Some(args) = batches.pop_front() {
                        let request = SubscribeRequest::new(&args).to_json();
                        if let Err(e) = sink.send_text(request).await {
                            return SessionEnd::Failed(e);
                        }
                        debug!(
                            channel = %self.channel.name,
                            topics = args.len(),
                            remaining = batches.len(),
                            "Subscribe batch sent"
                        );
                    }
                    stagger.as_mut().reset(Instant::now() + self.settings.stagger());
                }

                _ = heartbeat.tick() => {
                    if let Some(limit) = silence_timeout {
                        if last_inbound.elapsed() >= limit {
                            warn!(
                                channel = %self.channel.name,
                                silence_secs = limit.as_secs(),
                                "Silence watchdog timeout: recycling channel"
                            );
                            return SessionEnd::Failed(FeedError::Transport(format!(
                                "no inbound frames for {}s",
                                limit.as_secs()
                            )));
                        }
                    }
                    if let Err(e) = sink.send_text(PING_FRAME.to_string()).await {
                        return SessionEnd::Failed(e);
                    }
                }

                frame = stream.next_frame() => {
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            last_inbound = Instant::now();
                            self.handle_text(&text);
                        }
                        Some(Ok(Frame::Ping(payload))) => {
                            last_inbound = Instant::now();
                            if let Err(e) = sink.send_pong(payload).await {
                                return SessionEnd::Failed(e);
                            }
                        }
                        Some(Ok(Frame::Pong)) => {
                            last_inbound = Instant::now();
                        }
                        Some(Ok(Frame::Close)) => return SessionEnd::Closed("remote_close"),
                        Some(Err(e)) => return SessionEnd::Failed(e),
                        None => return SessionEnd::Closed("stream_ended"),
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let received_at = chrono::Utc::now().timestamp_millis();

        match normalizer::decode(text, received_at) {
            Ok(Inbound::Tickers(ticks)) => {
                for tick in ticks {
                    self.notify("on_tick", |h| h.on_tick(tick));
                }
            }
            Ok(Inbound::Control(ControlFrame::Ack {
                success: false,
                message,
            })) => {
                warn!(
                    channel = %self.channel.name,
                    message = message.as_deref().unwrap_or(""),
                    "Subscription rejected by venue"
                );
            }
            Ok(Inbound::Control(control)) => {
                trace!(channel = %self.channel.name, ?control, "Control frame");
            }
            Err(e) => {
                trace!(channel = %self.channel.name, error = %e, "Dropped inbound frame");
            }
        }
    }
}

impl ConnectionHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the channel for good.
    ///
    /// Idempotent. Once this returns no callback runs and no timer fires for
    /// this channel.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                error!(channel = %self.channel, error = %e, "Venue channel task panicked");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FrameSink, FrameStream};
    use crate::types::{Tick, Venue};
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    enum Script {
        Fail,
        Accept(mpsc::UnboundedReceiver<Frame>),
    }

    struct FakeConnector {
        script: SyncMutex<VecDeque<Script>>,
        attempts: mpsc::UnboundedSender<Instant>,
        sent: Arc<SyncMutex<Vec<String>>>,
    }

    impl FakeConnector {
        fn new(script: Vec<Script>) -> (Arc<Self>, mpsc::UnboundedReceiver<Instant>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                script: SyncMutex::new(script.into()),
                attempts: tx,
                sent: Arc::new(SyncMutex::new(Vec::new())),
            });
            (connector, rx)
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    struct FakeSink(Arc<SyncMutex<Vec<String>>>);

    #[async_trait]
    impl FrameSink for FakeSink {
        async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
            self.0.lock().push(text);
            Ok(())
        }

        async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<(), FeedError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), FeedError> {
            Ok(())
        }
    }

    struct FakeStream(mpsc::UnboundedReceiver<Frame>);

    #[async_trait]
    impl FrameStream for FakeStream {
        async fn next_frame(&mut self) -> Option<Result<Frame, FeedError>> {
            self.0.recv().await.map(Ok)
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, _endpoint: &str) -> Result<Session, FeedError> {
            let _ = self.attempts.send(Instant::now());
            let next = self.script.lock().pop_front();
            match next {
                Some(Script::Accept(rx)) => Ok(Session {
                    sink: Box::new(FakeSink(self.sent.clone())),
                    stream: Box::new(FakeStream(rx)),
                }),
                Some(Script::Fail) | None => {
                    Err(FeedError::Transport("connection refused".to_string()))
                }
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        opens: AtomicUsize,
        closes: AtomicUsize,
        errors: AtomicUsize,
        ticks: SyncMutex<Vec<Tick>>,
    }

    impl FeedHandler for Recorder {
        fn on_open(&self, _channel: &str) -> anyhow::Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_close(&self, _channel: &str) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, _channel: &str, _error: &FeedError) -> anyhow::Result<()> {
            self.errors.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_tick(&self, tick: Tick) -> anyhow::Result<()> {
            match tick.last_price {
                Some(p) if p == 1.0 => panic!("handler blew up"),
                Some(p) if p == 2.0 => anyhow::bail!("handler rejected tick"),
                _ => {}
            }
            self.ticks.lock().push(tick);
            Ok(())
        }
    }

    fn channel(topics: usize) -> VenueChannel {
        VenueChannel {
            name: "spot".to_string(),
            venue: Venue::Spot,
            endpoint: "wss://example.com".to_string(),
            topics: (0..topics).map(|i| format!("tickers.SYM{}USDT", i)).collect(),
            max_batch_size: 10,
        }
    }

    fn ticker(symbol: &str, price: f64) -> Frame {
        Frame::Text(
            serde_json::json!({
                "topic": format!("tickers.{}", symbol),
                "data": {"lastPrice": price.to_string()}
            })
            .to_string(),
        )
    }

    async fn gaps_ms(attempts: &mut mpsc::UnboundedReceiver<Instant>, n: usize) -> Vec<u64> {
        let mut times = Vec::with_capacity(n);
        for _ in 0..n {
            times.push(attempts.recv().await.expect("connector dropped"));
        }
        times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }

    #[test]
    fn test_backoff_sequence_caps_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_millis(30_000));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_back_off_exponentially() {
        let (connector, mut attempts) = FakeConnector::new(Vec::new());
        let recorder = Arc::new(Recorder::default());
        let handle = ConnectionManager::open(
            channel(1),
            &FeedConfig::default(),
            connector,
            recorder.clone(),
        );

        let gaps = gaps_ms(&mut attempts, 8).await;
        assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(handle.state(), ConnectionState::Reconnecting);
        assert!(recorder.errors.load(Ordering::SeqCst) >= 7);
        assert_eq!(recorder.opens.load(Ordering::SeqCst), 0);

        handle.close().await;
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_open() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tx); // session ends right after it opens
        let (connector, mut attempts) =
            FakeConnector::new(vec![Script::Fail, Script::Fail, Script::Accept(rx)]);
        let recorder = Arc::new(Recorder::default());
        let handle = ConnectionManager::open(
            channel(1),
            &FeedConfig::default(),
            connector,
            recorder.clone(),
        );

        let gaps = gaps_ms(&mut attempts, 4).await;
        assert_eq!(gaps, vec![1000, 2000, 1000]);
        assert_eq!(recorder.opens.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_plan_replayed_on_every_open() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (_tx2, rx2) = mpsc::unbounded_channel();
        let (connector, _attempts) =
            FakeConnector::new(vec![Script::Accept(rx1), Script::Accept(rx2)]);
        let recorder = Arc::new(Recorder::default());
        let handle = ConnectionManager::open(
            channel(17),
            &FeedConfig::default(),
            connector.clone(),
            recorder.clone(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = connector.sent();
        assert_eq!(sent.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(first["op"], "subscribe");
        assert_eq!(first["args"].as_array().unwrap().len(), 10);
        assert_eq!(second["args"].as_array().unwrap().len(), 7);
        assert_eq!(first["args"][0], "tickers.SYM0USDT");
        assert_eq!(second["args"][0], "tickers.SYM10USDT");

        // Drop the first session; the plan is sent again after the reconnect
        drop(tx1);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let sent = connector.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2..], sent[..2]);
        assert_eq!(recorder.opens.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state(), ConnectionState::Open);

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_batches_staggered() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (connector, _attempts) = FakeConnector::new(vec![Script::Accept(rx)]);
        let handle = ConnectionManager::open(
            channel(25),
            &FeedConfig::default(),
            connector.clone(),
            Arc::new(Recorder::default()),
        );

        // default stagger is 60ms: 10 + 10 + 5 topics
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(connector.sent().len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(connector.sent().len(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let sent = connector.sent();
        assert_eq!(sent.len(), 3);
        let last: serde_json::Value = serde_json::from_str(&sent[2]).unwrap();
        assert_eq!(last["args"].as_array().unwrap().len(), 5);

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_stagger_follows_config() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (connector, _attempts) = FakeConnector::new(vec![Script::Accept(rx)]);
        let settings = FeedConfig {
            subscribe_stagger_ms: 200,
            ..FeedConfig::default()
        };
        let handle = ConnectionManager::open(
            channel(25),
            &settings,
            connector.clone(),
            Arc::new(Recorder::default()),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(connector.sent().len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.sent().len(), 2);

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sent_while_open() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (connector, _attempts) = FakeConnector::new(vec![Script::Accept(rx)]);
        let handle = ConnectionManager::open(
            channel(0),
            &FeedConfig::default(),
            connector.clone(),
            Arc::new(Recorder::default()),
        );

        tokio::time::sleep(Duration::from_millis(19_900)).await;
        assert!(connector.sent().is_empty());

        tokio::time::sleep(Duration::from_millis(21_000)).await;
        let sent = connector.sent();
        assert_eq!(sent, vec![PING_FRAME.to_string(), PING_FRAME.to_string()]);

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_forwarded_in_order_and_failures_isolated() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (connector, _attempts) = FakeConnector::new(vec![Script::Accept(rx)]);
        let recorder = Arc::new(Recorder::default());
        let handle = ConnectionManager::open(
            channel(1),
            &FeedConfig::default(),
            connector,
            recorder.clone(),
        );

        tx.send(Frame::Text(r#"{"success":true,"op":"subscribe"}"#.to_string()))
            .unwrap();
        tx.send(ticker("BTCUSDT", 1.0)).unwrap(); // panics in handler
        tx.send(ticker("BTCUSDT", 2.0)).unwrap(); // errors in handler
        tx.send(Frame::Text("garbage".to_string())).unwrap();
        tx.send(ticker("BTCUSDT", 3.0)).unwrap();
        tx.send(ticker("ETHUSDT", 4.0)).unwrap();
        tx.send(ticker("BTCUSDT", 5.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let prices: Vec<f64> = recorder
            .ticks
            .lock()
            .iter()
            .filter_map(|t| t.last_price)
            .collect();
        assert_eq!(prices, vec![3.0, 4.0, 5.0]);
        assert_eq!(handle.state(), ConnectionState::Open);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);

        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_terminal_and_idempotent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (connector, mut attempts) = FakeConnector::new(vec![Script::Accept(rx)]);
        let recorder = Arc::new(Recorder::default());
        let handle = ConnectionManager::open(
            channel(1),
            &FeedConfig::default(),
            connector,
            recorder.clone(),
        );

        tx.send(ticker("BTCUSDT", 10.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.ticks.lock().len(), 1);

        handle.close().await;
        handle.close().await;
        assert_eq!(handle.state(), ConnectionState::Closed);

        let _ = tx.send(ticker("BTCUSDT", 11.0));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(recorder.ticks.lock().len(), 1);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 0);

        // Only the initial attempt, nothing reconnects after close
        assert!(attempts.try_recv().is_ok());
        assert!(attempts.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_watchdog_recycles_quiet_channel() {
        let (_tx1, rx1) = mpsc::unbounded_channel();
        let (_tx2, rx2) = mpsc::unbounded_channel();
        let (connector, mut attempts) =
            FakeConnector::new(vec![Script::Accept(rx1), Script::Accept(rx2)]);
        let recorder = Arc::new(Recorder::default());
        let settings = FeedConfig {
            silence_timeout_secs: 30,
            ..FeedConfig::default()
        };
        let handle = ConnectionManager::open(channel(0), &settings, connector, recorder.clone());

        // heartbeat at 20s is within the limit, the one at 40s is not
        let gaps = gaps_ms(&mut attempts, 2).await;
        assert_eq!(gaps, vec![41_000]);
        assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);

        handle.close().await;
    }
}
