//! Candle Synthesizer - keeps the active close-price series current
//!
//! Bootstrapped from history on every selection change, then extended from
//! live ticks: a tick in the last bar's bucket moves that bar in place, a tick
//! in a later bucket opens a new bar.

use std::collections::VecDeque;

use crate::types::{Bar, Tick, Timeframe, MAX_POINTS};

/// What a fed tick did to the series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Last bar's close moved in place
    Updated,
    /// A new bucket was opened
    Appended,
    /// Tick had no price or fell before the last bar
    Skipped,
}

/// Bounded, strictly time-ordered bar series for one (symbol, timeframe)
#[derive(Debug, Clone)]
pub struct CandleSynthesizer {
    timeframe: Timeframe,
    bars: VecDeque<Bar>,
    max_points: usize,
}

impl CandleSynthesizer {
    pub fn new(timeframe: Timeframe, max_points: usize) -> Self {
        let max_points = max_points.max(1);
        Self {
            timeframe,
            bars: VecDeque::with_capacity(max_points + 1),
            max_points,
        }
    }

    /// Replace the whole series.
    ///
    /// Bars that would break strict ordering are dropped; only the newest
    /// `max_points` are kept.
    pub fn reset(&mut self, timeframe: Timeframe, bars: Vec<Bar>) {
        self.timeframe = timeframe;
        self.bars.clear();
        for bar in bars {
            if self
                .bars
                .back()
                .map_or(true, |last| bar.period_start > last.period_start)
            {
                self.bars.push_back(bar);
            }
        }
        self.evict();
    }

    /// Apply a live tick for the active symbol.
    ///
    /// An empty series (no bootstrap bars, e.g. after a failed history
    /// request) is started from the tick's bucket rather than left empty.
    pub fn feed(&mut self, tick: &Tick) -> FeedOutcome {
        let Some(price) = tick.last_price else {
            return FeedOutcome::Skipped;
        };
        let bucket = self.timeframe.bucket_start(tick.received_at);

        if let Some(last) = self.bars.back_mut() {
            let last_bucket = self.timeframe.bucket_start(last.period_start);
            if bucket == last_bucket {
                last.close = price;
                last.updated_at = last.updated_at.max(tick.received_at);
                return FeedOutcome::Updated;
            }
            if bucket < last_bucket {
                tracing::debug!(
                    symbol = %tick.symbol,
                    bucket,
                    last_bucket,
                    "Tick older than last bar; skipped"
                );
                return FeedOutcome::Skipped;
            }
        }

        self.bars.push_back(Bar {
            period_start: bucket,
            close: price,
            updated_at: tick.received_at,
        });
        self.evict();
        FeedOutcome::Appended
    }

    fn evict(&mut self) {
        while self.bars.len() > self.max_points {
            self.bars.pop_front();
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn bars(&self) -> Vec<Bar> {
        self.bars.iter().copied().collect()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn clear(&mut self) {
        self.bars.clear();
    }
}

impl Default for CandleSynthesizer {
    fn default() -> Self {
        Self::new(Timeframe::default(), MAX_POINTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: i64 = 15 * 60 * 1000;
    // 2023-11-14 22:00:00 UTC, aligned to 15m
    const BASE: i64 = 1_699_999_200_000;

    fn tick(price: f64, at: i64) -> Tick {
        Tick::new("BTCUSDT", Some(price), None, at).unwrap()
    }

    fn history(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(BASE - (n - 1 - i) as i64 * FRAME, 100.0 + i as f64))
            .collect()
    }

    fn assert_strictly_increasing(bars: &[Bar]) {
        assert!(bars.windows(2).all(|w| w[0].period_start < w[1].period_start));
    }

    #[test]
    fn test_tick_in_current_bucket_updates_in_place() {
        let mut synth = CandleSynthesizer::new(Timeframe::Min15, MAX_POINTS);
        synth.reset(Timeframe::Min15, history(3));

        let outcome = synth.feed(&tick(250.0, BASE + 60_000));
        assert_eq!(outcome, FeedOutcome::Updated);
        assert_eq!(synth.len(), 3);
        let last = synth.last().unwrap();
        assert_eq!(last.period_start, BASE);
        assert_eq!(last.close, 250.0);
        assert_eq!(last.updated_at, BASE + 60_000);
    }

    #[test]
    fn test_tick_in_next_bucket_appends_aligned_bar() {
        let mut synth = CandleSynthesizer::new(Timeframe::Min15, MAX_POINTS);
        synth.reset(Timeframe::Min15, history(3));

        let outcome = synth.feed(&tick(251.0, BASE + FRAME + 5_000));
        assert_eq!(outcome, FeedOutcome::Appended);
        assert_eq!(synth.len(), 4);
        assert_eq!(synth.last().unwrap().period_start, BASE + FRAME);
        assert_eq!(synth.last().unwrap().close, 251.0);
    }

    #[test]
    fn test_series_bounded_and_ordered_after_many_feeds() {
        let mut synth = CandleSynthesizer::new(Timeframe::Min15, MAX_POINTS);
        synth.reset(Timeframe::Min15, history(MAX_POINTS));
        assert_eq!(synth.len(), MAX_POINTS);

        for i in 0..1_000i64 {
            // a few ticks per bucket, some buckets skipped entirely
            synth.feed(&tick(i as f64, BASE + i * FRAME / 3));
            assert!(synth.len() <= MAX_POINTS);
        }

        let bars = synth.bars();
        assert_eq!(bars.len(), MAX_POINTS);
        assert_strictly_increasing(&bars);
    }

    #[test]
    fn test_reset_sanitizes_input() {
        let mut synth = CandleSynthesizer::new(Timeframe::Min15, 3);
        let bars = vec![
            Bar::new(BASE, 1.0),
            Bar::new(BASE, 2.0),
            Bar::new(BASE - FRAME, 3.0),
            Bar::new(BASE + FRAME, 4.0),
            Bar::new(BASE + 2 * FRAME, 5.0),
            Bar::new(BASE + 3 * FRAME, 6.0),
        ];
        synth.reset(Timeframe::Min15, bars);

        let closes: Vec<f64> = synth.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_stale_or_priceless_ticks_skipped() {
        let mut synth = CandleSynthesizer::new(Timeframe::Min15, MAX_POINTS);
        synth.reset(Timeframe::Min15, history(2));

        assert_eq!(synth.feed(&tick(1.0, BASE - 2 * FRAME)), FeedOutcome::Skipped);
        let change_only = Tick::new("BTCUSDT", None, Some(1.0), BASE).unwrap();
        assert_eq!(synth.feed(&change_only), FeedOutcome::Skipped);
        assert_eq!(synth.len(), 2);
    }

    #[test]
    fn test_empty_series_starts_from_live_tick() {
        let mut synth = CandleSynthesizer::new(Timeframe::Hour1, MAX_POINTS);
        assert_eq!(synth.feed(&tick(5.0, BASE + 1_234)), FeedOutcome::Appended);
        assert_eq!(synth.last().unwrap().period_start, BASE);
    }
}
