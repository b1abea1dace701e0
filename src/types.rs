//! Core types used throughout the desk
//!
//! Defines timeframes, venues, ticks, quotes, bars and connection states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of bars retained for the active series
pub const MAX_POINTS: usize = 360;

/// Chart timeframes offered by the desk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    Min5,
    Min15,
    Hour1,
    Day1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Min15
    }
}

impl Timeframe {
    /// Get duration in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::Min5 => 5 * 60 * 1000,
            Timeframe::Min15 => 15 * 60 * 1000,
            Timeframe::Hour1 => 60 * 60 * 1000,
            Timeframe::Day1 => 24 * 60 * 60 * 1000,
        }
    }

    /// Interval code for the Bybit v5 kline endpoint
    pub fn bybit_interval(&self) -> &'static str {
        match self {
            Timeframe::Min5 => "5",
            Timeframe::Min15 => "15",
            Timeframe::Hour1 => "60",
            Timeframe::Day1 => "D",
        }
    }

    /// Start of the bucket containing `ts_ms`
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        let frame = self.duration_ms();
        ts_ms.div_euclid(frame) * frame
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "5m" | "5" => Some(Timeframe::Min5),
            "15m" | "15min" | "15" => Some(Timeframe::Min15),
            "1h" | "1hour" | "60" => Some(Timeframe::Hour1),
            "1d" | "d" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Min5 => write!(f, "5m"),
            Timeframe::Min15 => write!(f, "15m"),
            Timeframe::Hour1 => write!(f, "1h"),
            Timeframe::Day1 => write!(f, "1d"),
        }
    }
}

/// Upstream market a venue channel streams from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Spot,
    Linear,
}

impl Venue {
    /// Topic for the ticker stream of `symbol`
    pub fn ticker_topic(symbol: &str) -> String {
        format!("tickers.{}", symbol)
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Spot => write!(f, "spot"),
            Venue::Linear => write!(f, "linear"),
        }
    }
}

/// One normalized real-time update for a symbol.
///
/// At least one of `last_price` / `change_percent_24h` is always present;
/// [`Tick::new`] refuses to build anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub change_percent_24h: Option<f64>,
    /// Local receive time in milliseconds
    pub received_at: i64,
}

impl Tick {
    pub fn new(
        symbol: impl Into<String>,
        last_price: Option<f64>,
        change_percent_24h: Option<f64>,
        received_at: i64,
    ) -> Option<Self> {
        if last_price.is_none() && change_percent_24h.is_none() {
            return None;
        }
        Some(Self {
            symbol: symbol.into(),
            last_price,
            change_percent_24h,
            received_at,
        })
    }
}

/// Latest known values for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Option<f64>,
    pub change_percent: Option<f64>,
    pub updated_at: i64,
}

/// One close-price sample of the active series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Aligned bucket start in milliseconds
    pub period_start: i64,
    pub close: f64,
    /// Time of the last update applied to this bar
    pub updated_at: i64,
}

impl Bar {
    pub fn new(period_start: i64, close: f64) -> Self {
        Self {
            period_start,
            close,
            updated_at: period_start,
        }
    }
}

/// The (symbol, timeframe) pair the candle series tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Socket lifecycle state of one venue channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Terminal; only reached through an explicit close
    Closed,
}

/// Feed status shown to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Idle,
    Connecting,
    Live,
    Reconnecting,
    Error,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedStatus::Idle => write!(f, "idle"),
            FeedStatus::Connecting => write!(f, "connecting"),
            FeedStatus::Live => write!(f, "live"),
            FeedStatus::Reconnecting => write!(f, "reconnecting"),
            FeedStatus::Error => write!(f, "error"),
        }
    }
}
