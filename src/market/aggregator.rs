//! Quote Aggregator - latest value per symbol across all venue channels
//!
//! Ticks from every channel merge field by field into one table; consumers
//! read it through periodic flushes instead of per-tick updates.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::types::{Quote, Tick};

/// Immutable view of the quote table, ordered by symbol
pub type QuoteSnapshot = Arc<Vec<Quote>>;

#[derive(Debug, Default)]
struct QuoteTable {
    quotes: BTreeMap<String, Quote>,
    /// A price or change value moved since the last flush
    dirty: bool,
}

/// Process-wide latest-quote table.
///
/// Writers from several channels may interleave freely: a missing field
/// never overwrites a known one, so only same-symbol order within one channel
/// matters and the channel task already preserves it.
#[derive(Debug, Default)]
pub struct QuoteAggregator {
    table: RwLock<QuoteTable>,
}

impl QuoteAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a tick; returns whether any value changed
    pub fn update(&self, tick: &Tick) -> bool {
        let mut table = self.table.write();
        let quote = table
            .quotes
            .entry(tick.symbol.clone())
            .or_insert_with(|| Quote {
                symbol: tick.symbol.clone(),
                price: None,
                change_percent: None,
                updated_at: tick.received_at,
            });

        let mut changed = false;
        if let Some(price) = tick.last_price {
            changed |= quote.price != Some(price);
            quote.price = Some(price);
        }
        if let Some(change) = tick.change_percent_24h {
            changed |= quote.change_percent != Some(change);
            quote.change_percent = Some(change);
        }
        quote.updated_at = quote.updated_at.max(tick.received_at);

        table.dirty |= changed;
        changed
    }

    /// Snapshot of the table, or `None` when nothing changed since the
    /// previous flush
    pub fn flush(&self) -> Option<QuoteSnapshot> {
        let mut table = self.table.write();
        if !table.dirty {
            return None;
        }
        table.dirty = false;
        Some(Arc::new(table.quotes.values().cloned().collect()))
    }

    /// Current table regardless of flush state
    pub fn snapshot(&self) -> Vec<Quote> {
        self.table.read().quotes.values().cloned().collect()
    }

    pub fn get(&self, symbol: &str) -> Option<Quote> {
        self.table.read().quotes.get(symbol).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flushes the aggregator on a fixed cadence and broadcasts changed snapshots
pub struct QuoteFlusher {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl QuoteFlusher {
    pub fn spawn(
        quotes: Arc<QuoteAggregator>,
        every: Duration,
        tx: broadcast::Sender<QuoteSnapshot>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Some(snapshot) = quotes.flush() {
                            tracing::trace!(quotes = snapshot.len(), "Quote snapshot flushed");
                            // No receivers is fine
                            let _ = tx.send(snapshot);
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stop flushing; idempotent
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for QuoteFlusher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
