//! History Loader - bootstrap bars for the active selection
//!
//! Every fetch takes a fresh request token. A result only counts if its token
//! is still the latest when it resolves: most recent request wins, never the
//! first response to arrive.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::stream::normalizer::coerce_number;
use crate::types::{Bar, Timeframe};

/// Raw kline row: `[periodStart, open, high, low, close, ...]`
pub type KlineRow = Vec<Value>;

/// Upstream source of historical klines, rows newest-first
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<KlineRow>, FeedError>;
}

/// Result of one fetch
#[derive(Debug, Clone)]
pub enum HistoryOutcome {
    /// Bars in ascending order
    Loaded { token: u64, bars: Vec<Bar> },
    /// Request failed; consumers treat this as an empty series
    Unavailable { token: u64, error: FeedError },
    /// A newer request was issued before this one resolved
    Superseded { token: u64 },
}

impl HistoryOutcome {
    pub fn token(&self) -> u64 {
        match self {
            HistoryOutcome::Loaded { token, .. }
            | HistoryOutcome::Unavailable { token, .. }
            | HistoryOutcome::Superseded { token } => *token,
        }
    }
}

pub struct HistoryLoader {
    source: Arc<dyn KlineSource>,
    limit: usize,
    latest: AtomicU64,
}

impl HistoryLoader {
    pub fn new(source: Arc<dyn KlineSource>, limit: usize) -> Self {
        Self {
            source,
            limit,
            latest: AtomicU64::new(0),
        }
    }

    /// Whether `token` still belongs to the most recent request
    pub fn is_current(&self, token: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == token
    }

    /// Invalidate every in-flight request
    pub fn cancel_pending(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Take the token for a new request, superseding every earlier one
    pub fn issue_token(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn fetch(&self, symbol: &str, timeframe: Timeframe) -> HistoryOutcome {
        let token = self.issue_token();
        self.fetch_with_token(symbol, timeframe, token).await
    }

    /// Fetch under a token taken earlier with [`issue_token`](Self::issue_token)
    pub async fn fetch_with_token(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        token: u64,
    ) -> HistoryOutcome {
        debug!(symbol, timeframe = %timeframe, token, "Fetching history");

        let result = self.source.fetch_klines(symbol, timeframe, self.limit).await;

        if !self.is_current(token) {
            debug!(symbol, timeframe = %timeframe, token, "History result superseded");
            return HistoryOutcome::Superseded { token };
        }

        match result {
            Ok(rows) => {
                let bars = bars_from_rows(rows);
                info!(symbol, timeframe = %timeframe, count = bars.len(), "✅ History loaded");
                HistoryOutcome::Loaded { token, bars }
            }
            Err(error) => {
                warn!(symbol, timeframe = %timeframe, error = %error, "History unavailable");
                HistoryOutcome::Unavailable { token, error }
            }
        }
    }
}

/// Newest-first rows to ascending bars keyed by period start, close as value.
///
/// Short or unparseable rows are skipped, as is any row that would not be
/// strictly later than the one before it.
pub fn bars_from_rows(rows: Vec<KlineRow>) -> Vec<Bar> {
    let mut bars: Vec<Bar> = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        if row.len() < 5 {
            continue;
        }
        let (Some(start), Some(close)) = (coerce_number(&row[0]), coerce_number(&row[4])) else {
            continue;
        };
        let start = start as i64;
        if bars.last().map_or(true, |last| start > last.period_start) {
            bars.push(Bar::new(start, close));
        }
    }
    bars
}
