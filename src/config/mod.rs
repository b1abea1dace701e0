//! Configuration management for the desk
//!
//! Loads from config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::types::Timeframe;

pub const DEFAULT_SPOT_URL: &str = "wss://stream.bybit.com/v5/public/spot";
pub const DEFAULT_LINEAR_URL: &str = "wss://stream.bybit.com/v5/public/linear";
pub const DEFAULT_REST_URL: &str = "https://api.bybit.com";

const DEFAULT_SYMBOLS: [&str; 17] = [
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "DOGEUSDT", "HYPEUSDT", "XRPUSDT", "APTUSDT", "SEIUSDT",
    "ADAUSDT", "AVAXUSDT", "ENAUSDT", "BNBUSDT", "TRUMPUSDT", "MNTUSDT", "LTCUSDT", "TRXUSDT",
    "ARBUSDT",
];

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub desk: DeskConfig,
    pub feed: FeedConfig,
    pub quotes: QuotesConfig,
    pub history: HistoryConfig,
    pub candles: CandlesConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeskConfig {
    /// Symbols streamed from the spot channel
    pub spot_symbols: Vec<String>,
    /// Symbols streamed from the linear derivatives channel
    pub linear_symbols: Vec<String>,
    /// Selection activated at startup
    pub default_symbol: String,
    pub default_timeframe: String,
}

impl DeskConfig {
    pub fn timeframe(&self) -> Result<Timeframe> {
        match Timeframe::from_str(&self.default_timeframe) {
            Some(tf) => Ok(tf),
            None => bail!("Unknown timeframe: {}", self.default_timeframe),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub spot_url: String,
    pub linear_url: String,
    /// Keepalive period while a channel is open
    pub heartbeat_secs: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Delay between consecutive subscribe batches
    pub subscribe_stagger_ms: u64,
    /// Max topics per subscribe request on the spot channel
    pub spot_batch_size: usize,
    /// Recycle a channel that received nothing for this long (0 = off)
    pub silence_timeout_secs: u64,
}

impl FeedConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.subscribe_stagger_ms)
    }

    pub fn silence_timeout(&self) -> Option<Duration> {
        (self.silence_timeout_secs > 0).then(|| Duration::from_secs(self.silence_timeout_secs))
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            spot_url: DEFAULT_SPOT_URL.to_string(),
            linear_url: DEFAULT_LINEAR_URL.to_string(),
            heartbeat_secs: 20,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            subscribe_stagger_ms: 60,
            spot_batch_size: 10,
            silence_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotesConfig {
    /// Snapshot flush cadence in milliseconds
    pub flush_interval_ms: u64,
}

impl Default for QuotesConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub rest_url: String,
    /// Bybit market category (spot, linear)
    pub category: String,
    /// Bootstrap rows per request
    pub limit: usize,
    pub timeout_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            rest_url: DEFAULT_REST_URL.to_string(),
            category: "spot".to_string(),
            limit: 300,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandlesConfig {
    pub max_points: usize,
}

impl Default for CandlesConfig {
    fn default() -> Self {
        Self {
            max_points: crate::types::MAX_POINTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let feed = FeedConfig::default();
        let history = HistoryConfig::default();

        let config = Config::builder()
            // Desk defaults
            .set_default("desk.spot_symbols", DEFAULT_SYMBOLS.to_vec())?
            .set_default("desk.linear_symbols", Vec::<String>::new())?
            .set_default("desk.default_symbol", "SOLUSDT")?
            .set_default("desk.default_timeframe", "15m")?
            // Feed defaults
            .set_default("feed.spot_url", feed.spot_url)?
            .set_default("feed.linear_url", feed.linear_url)?
            .set_default("feed.heartbeat_secs", feed.heartbeat_secs)?
            .set_default("feed.initial_backoff_ms", feed.initial_backoff_ms)?
            .set_default("feed.max_backoff_ms", feed.max_backoff_ms)?
            .set_default("feed.subscribe_stagger_ms", feed.subscribe_stagger_ms)?
            .set_default("feed.spot_batch_size", feed.spot_batch_size as u64)?
            .set_default("feed.silence_timeout_secs", feed.silence_timeout_secs)?
            // Quotes defaults
            .set_default(
                "quotes.flush_interval_ms",
                QuotesConfig::default().flush_interval_ms,
            )?
            // History defaults
            .set_default("history.rest_url", history.rest_url)?
            .set_default("history.category", history.category)?
            .set_default("history.limit", history.limit as u64)?
            .set_default("history.timeout_secs", history.timeout_secs)?
            // Candle defaults
            .set_default("candles.max_points", crate::types::MAX_POINTS as u64)?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (SIGNALDESK_*)
            .add_source(
                Environment::with_prefix("SIGNALDESK")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("desk.spot_symbols")
                    .with_list_parse_key("desk.linear_symbols")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject values the feed cannot run with
    pub fn validate(&self) -> Result<()> {
        self.desk.timeframe()?;
        if self.feed.heartbeat_secs == 0 {
            bail!("feed.heartbeat_secs must be positive");
        }
        if self.feed.initial_backoff_ms == 0 || self.feed.max_backoff_ms < self.feed.initial_backoff_ms
        {
            bail!(
                "feed backoff must satisfy 0 < initial_backoff_ms ({}) <= max_backoff_ms ({})",
                self.feed.initial_backoff_ms,
                self.feed.max_backoff_ms
            );
        }
        if self.quotes.flush_interval_ms == 0 {
            bail!("quotes.flush_interval_ms must be positive");
        }
        if self.candles.max_points == 0 {
            bail!("candles.max_points must be positive");
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "spot={} linear={} selection={}@{} flush_ms={} max_points={}",
            self.desk.spot_symbols.len(),
            self.desk.linear_symbols.len(),
            self.desk.default_symbol,
            self.desk.default_timeframe,
            self.quotes.flush_interval_ms,
            self.candles.max_points
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AppConfig {
        AppConfig {
            desk: DeskConfig {
                spot_symbols: vec!["BTCUSDT".to_string()],
                linear_symbols: vec![],
                default_symbol: "BTCUSDT".to_string(),
                default_timeframe: "15m".to_string(),
            },
            feed: FeedConfig::default(),
            quotes: QuotesConfig::default(),
            history: HistoryConfig::default(),
            candles: CandlesConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_timeframe() {
        let mut cfg = sample();
        cfg.desk.default_timeframe = "7m".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut cfg = sample();
        cfg.feed.max_backoff_ms = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_silence_timeout_disabled_by_default() {
        assert!(FeedConfig::default().silence_timeout().is_none());
    }
}
