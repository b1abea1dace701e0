//! Bybit REST client for historical klines
//!
//! `GET /v5/market/kline?category=&symbol=&interval=&limit=`; rows come back
//! newest-first as arrays of strings.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::HistoryConfig;
use crate::error::FeedError;
use crate::market::history::{KlineRow, KlineSource};
use crate::types::Timeframe;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<KlineRow>,
}

#[derive(Debug, Clone)]
pub struct BybitKlineClient {
    http: reqwest::Client,
    base_url: String,
    category: String,
}

impl BybitKlineClient {
    pub fn new(config: &HistoryConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            category: config.category.clone(),
        })
    }

    fn kline_url(&self) -> String {
        format!("{}/v5/market/kline", self.base_url)
    }
}

/// Unwrap the v5 envelope, turning non-zero `retCode` into a request error
fn parse_kline_response(body: &str) -> Result<Vec<KlineRow>, FeedError> {
    let response: KlineResponse = serde_json::from_str(body)
        .map_err(|e| FeedError::Request(format!("invalid kline response: {}", e)))?;

    if response.ret_code != 0 {
        return Err(FeedError::Request(format!(
            "Bybit API returned retCode {}: {}",
            response.ret_code, response.ret_msg
        )));
    }

    Ok(response.result.map(|r| r.list).unwrap_or_default())
}

#[async_trait]
impl KlineSource for BybitKlineClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<KlineRow>, FeedError> {
        let limit = limit.to_string();
        tracing::info!(
            symbol,
            timeframe = %timeframe,
            category = %self.category,
            "📥 Fetching historical klines from Bybit..."
        );

        let response = self
            .http
            .get(self.kline_url())
            .query(&[
                ("category", self.category.as_str()),
                ("symbol", symbol),
                ("interval", timeframe.bybit_interval()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::Request(format!(
                "Bybit API returned error: {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        parse_kline_response(&body)
    }
}
