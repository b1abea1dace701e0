//! Market Desk - the API the presentation layer talks to
//!
//! Wires venue channels, the quote table and the active candle series
//! together. Every tick from every channel passes through [`MarketDesk::ingest`].

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, FeedConfig};
use crate::error::FeedError;
use crate::market::sources::BybitKlineClient;
use crate::market::{
    CandleSynthesizer, HistoryLoader, HistoryOutcome, KlineSource, QuoteAggregator, QuoteFlusher,
    QuoteSnapshot,
};
use crate::stream::{
    isolate, ConnectionHandle, ConnectionManager, Connector, FeedHandler, TungsteniteConnector,
    VenueChannel,
};
use crate::types::{Bar, FeedStatus, Quote, Selection, Tick, Timeframe, Venue, MAX_POINTS};

/// Consumer tick listener
pub type TickListener = Arc<dyn Fn(&Tick) + Send + Sync>;

const SNAPSHOT_CAPACITY: usize = 64;

/// Tunables the desk needs at runtime
#[derive(Debug, Clone)]
pub struct DeskSettings {
    pub feed: FeedConfig,
    pub flush_interval: Duration,
    pub history_limit: usize,
    pub max_points: usize,
}

impl Default for DeskSettings {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            flush_interval: Duration::from_millis(300),
            history_limit: 300,
            max_points: MAX_POINTS,
        }
    }
}

impl DeskSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            feed: config.feed.clone(),
            flush_interval: Duration::from_millis(config.quotes.flush_interval_ms),
            history_limit: config.history.limit,
            max_points: config.candles.max_points,
        }
    }
}

#[derive(Debug)]
struct SelectionState {
    /// Selection receiving live ticks; set only once its bootstrap applied
    active: Option<Selection>,
    /// Selection whose bootstrap is still loading
    pending: Option<Selection>,
    series: CandleSynthesizer,
}

struct DeskInner {
    settings: DeskSettings,
    connector: Arc<dyn Connector>,
    quotes: Arc<QuoteAggregator>,
    loader: HistoryLoader,
    selection: Mutex<SelectionState>,
    inflight: Mutex<Option<AbortHandle>>,
    listeners: RwLock<Vec<TickListener>>,
    status: watch::Sender<FeedStatus>,
    snapshots: broadcast::Sender<QuoteSnapshot>,
}

/// Cheap to clone; all clones share the same state
#[derive(Clone)]
pub struct MarketDesk {
    inner: Arc<DeskInner>,
}

impl MarketDesk {
    pub fn new(
        settings: DeskSettings,
        connector: Arc<dyn Connector>,
        source: Arc<dyn KlineSource>,
    ) -> Self {
        let (status, _) = watch::channel(FeedStatus::Idle);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        let series = CandleSynthesizer::new(Timeframe::default(), settings.max_points);

        Self {
            inner: Arc::new(DeskInner {
                loader: HistoryLoader::new(source, settings.history_limit),
                settings,
                connector,
                quotes: Arc::new(QuoteAggregator::new()),
                selection: Mutex::new(SelectionState {
                    active: None,
                    pending: None,
                    series,
                }),
                inflight: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
                status,
                snapshots,
            }),
        }
    }

    /// Desk backed by the live Bybit stream and REST endpoints
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let source = BybitKlineClient::new(&config.history)?;
        Ok(Self::new(
            DeskSettings::from_config(config),
            Arc::new(TungsteniteConnector),
            Arc::new(source),
        ))
    }

    /// Stream tickers for `symbols` over the spot channel
    pub fn subscribe(&self, symbols: &[String]) -> Subscription {
        self.subscribe_venues(symbols, &[])
    }

    /// One channel per venue with a non-empty symbol list
    pub fn subscribe_venues(&self, spot: &[String], linear: &[String]) -> Subscription {
        let inner = &self.inner;
        let handler: Arc<dyn FeedHandler> = Arc::new(DeskHandler {
            inner: inner.clone(),
        });

        let connections: Vec<ConnectionHandle> = [(Venue::Spot, spot), (Venue::Linear, linear)]
            .into_iter()
            .filter_map(|(venue, symbols)| {
                VenueChannel::tickers(venue, symbols, &inner.settings.feed)
            })
            .map(|channel| {
                info!(
                    channel = %channel.name,
                    topics = channel.topics.len(),
                    "📡 Opening venue channel"
                );
                ConnectionManager::open(
                    channel,
                    &inner.settings.feed,
                    inner.connector.clone(),
                    handler.clone(),
                )
            })
            .collect();

        if !connections.is_empty() {
            inner.set_status(FeedStatus::Connecting);
        }

        let flusher = QuoteFlusher::spawn(
            inner.quotes.clone(),
            inner.settings.flush_interval,
            inner.snapshots.clone(),
        );

        Subscription {
            inner: inner.clone(),
            connections,
            flusher,
        }
    }

    /// Register a listener for every normalized tick
    pub fn on_tick<F>(&self, listener: F)
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    pub fn quote_snapshot(&self) -> Vec<Quote> {
        self.inner.quotes.snapshot()
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.inner.quotes.get(symbol)
    }

    /// Flushed snapshots, emitted only when something changed
    pub fn snapshots(&self) -> broadcast::Receiver<QuoteSnapshot> {
        self.inner.snapshots.subscribe()
    }

    /// Switch the candle series to `symbol` at `timeframe`.
    ///
    /// The previous series and any in-flight bootstrap are discarded before
    /// this returns; live ticks feed the new series only after its bootstrap
    /// bars are in place. The returned handle completes once that happens (or
    /// the load is superseded).
    pub fn set_active_selection(
        &self,
        symbol: impl Into<String>,
        timeframe: Timeframe,
    ) -> JoinHandle<()> {
        let selection = Selection {
            symbol: symbol.into(),
            timeframe,
        };

        let token = {
            let mut state = self.inner.selection.lock();
            state.active = None;
            state.pending = Some(selection.clone());
            state.series.reset(timeframe, Vec::new());
            self.inner.loader.issue_token()
        };
        info!(selection = %selection, token, "🎯 Active selection changed");

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.load_selection(selection, token).await });

        if let Some(previous) = self.inner.inflight.lock().replace(task.abort_handle()) {
            previous.abort();
        }
        task
    }

    /// Reload the bootstrap for the current selection, e.g. after a failed
    /// history request
    pub fn refresh(&self) -> Option<JoinHandle<()>> {
        let selection = {
            let state = self.inner.selection.lock();
            state.pending.clone().or_else(|| state.active.clone())
        }?;
        Some(self.set_active_selection(selection.symbol, selection.timeframe))
    }

    /// Bars of the active series in ascending period order
    pub fn bars(&self) -> Vec<Bar> {
        self.inner.selection.lock().series.bars()
    }

    pub fn active_selection(&self) -> Option<Selection> {
        self.inner.selection.lock().active.clone()
    }

    pub fn connection_status(&self) -> FeedStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.inner.status.subscribe()
    }

    /// Apply one normalized tick to the quote table, the active series and
    /// the registered listeners
    pub fn ingest(&self, tick: Tick) {
        self.inner.ingest(tick);
    }
}

impl DeskInner {
    fn set_status(&self, status: FeedStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(from = %current, to = %status, "Feed status changed");
            *current = status;
            true
        });
    }

    fn ingest(&self, tick: Tick) {
        self.quotes.update(&tick);
        self.set_status(FeedStatus::Live);

        {
            let mut state = self.selection.lock();
            let feeding = state
                .active
                .as_ref()
                .map_or(false, |active| active.symbol == tick.symbol);
            if feeding {
                state.series.feed(&tick);
            }
        }

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = isolate("on_tick", || {
                listener(&tick);
                Ok(())
            }) {
                warn!(symbol = %tick.symbol, error = %e, "Tick listener failed");
            }
        }
    }

    async fn load_selection(&self, selection: Selection, token: u64) {
        let outcome = self
            .loader
            .fetch_with_token(&selection.symbol, selection.timeframe, token)
            .await;

        let bars = match outcome {
            HistoryOutcome::Loaded { bars, .. } => bars,
            // live ticks still build the series from scratch
            HistoryOutcome::Unavailable { .. } => Vec::new(),
            HistoryOutcome::Superseded { .. } => return,
        };

        let mut state = self.selection.lock();
        if !self.loader.is_current(token) || state.pending.as_ref() != Some(&selection) {
            debug!(selection = %selection, token, "Discarding stale bootstrap");
            return;
        }
        state.series.reset(selection.timeframe, bars);
        state.pending = None;
        debug!(selection = %selection, bars = state.series.len(), "Live feeding enabled");
        state.active = Some(selection);
    }
}

/// Routes channel callbacks into the desk
struct DeskHandler {
    inner: Arc<DeskInner>,
}

impl FeedHandler for DeskHandler {
    fn on_open(&self, _channel: &str) -> anyhow::Result<()> {
        // live once the first tick lands
        self.inner.set_status(FeedStatus::Connecting);
        Ok(())
    }

    fn on_close(&self, _channel: &str) -> anyhow::Result<()> {
        self.inner.set_status(FeedStatus::Reconnecting);
        Ok(())
    }

    fn on_error(&self, _channel: &str, _error: &FeedError) -> anyhow::Result<()> {
        self.inner.set_status(FeedStatus::Error);
        Ok(())
    }

    fn on_tick(&self, tick: Tick) -> anyhow::Result<()> {
        self.inner.ingest(tick);
        Ok(())
    }
}

/// Open venue channels plus the snapshot flusher
pub struct Subscription {
    inner: Arc<DeskInner>,
    connections: Vec<ConnectionHandle>,
    flusher: QuoteFlusher,
}

impl Subscription {
    pub fn channels(&self) -> Vec<&str> {
        self.connections.iter().map(|c| c.channel()).collect()
    }

    /// Close every channel and stop flushing. No callback fires once this
    /// returns; calling it again is a no-op.
    pub async fn teardown(&mut self) {
        for connection in &self.connections {
            connection.close().await;
        }
        self.flusher.stop().await;
        self.inner.set_status(FeedStatus::Idle);
        info!("🔌 Subscription torn down");
    }
}
