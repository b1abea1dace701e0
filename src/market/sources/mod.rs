//! Upstream data sources

mod bybit;

pub use bybit::BybitKlineClient;
