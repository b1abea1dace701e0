//! Signal Desk Library
//!
//! Live market-data ingestion for a trading dashboard: Bybit ticker streams,
//! a shared latest-quote table and a bounded candle series for the selected
//! symbol.

pub mod config;
pub mod desk;
pub mod error;
pub mod market;
pub mod stream;
pub mod types;

pub use desk::{DeskSettings, MarketDesk, Subscription};
pub use error::FeedError;
