//! Market module - quotes, history and the active candle series
//!
//! Collects real-time ticks from every venue channel into a latest-quote
//! table and keeps one bounded close-price series for the active selection.

mod aggregator;
mod candles;
pub mod history;
pub mod sources;

pub use aggregator::{QuoteAggregator, QuoteFlusher, QuoteSnapshot};
pub use candles::{CandleSynthesizer, FeedOutcome};
pub use history::{HistoryLoader, HistoryOutcome, KlineRow, KlineSource};
