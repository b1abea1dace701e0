//! Stream module - venue channel ingestion
//!
//! One [`ConnectionManager`] task per venue channel keeps a Bybit v5 public
//! stream alive, replays the subscription plan on every open and pushes
//! normalized ticks to a [`FeedHandler`].

mod connection;
pub mod normalizer;
pub mod planner;
pub mod transport;

pub use connection::{Backoff, ConnectionHandle, ConnectionManager};
pub use normalizer::{normalize, ControlFrame, Inbound};
pub use planner::plan;
pub use transport::{Connector, Frame, FrameSink, FrameStream, Session, TungsteniteConnector};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::config::FeedConfig;
use crate::error::FeedError;
use crate::types::{Tick, Venue};

/// Callbacks invoked by a venue channel.
///
/// Errors and panics raised here are caught where they are invoked and never
/// reach the socket loop.
pub trait FeedHandler: Send + Sync {
    fn on_open(&self, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_close(&self, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&self, _channel: &str, _error: &FeedError) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_tick(&self, tick: Tick) -> anyhow::Result<()>;
}

/// One logical upstream streaming endpoint and the topics it carries
#[derive(Debug, Clone, PartialEq)]
pub struct VenueChannel {
    pub name: String,
    pub venue: Venue,
    pub endpoint: String,
    pub topics: Vec<String>,
    /// Max topics per subscribe request
    pub max_batch_size: usize,
}

impl VenueChannel {
    /// Build the ticker channel for `symbols`, or `None` when there is nothing
    /// to stream
    pub fn tickers(venue: Venue, symbols: &[String], feed: &FeedConfig) -> Option<Self> {
        if symbols.is_empty() {
            return None;
        }

        let (endpoint, max_batch_size) = match venue {
            Venue::Spot => (feed.spot_url.clone(), feed.spot_batch_size),
            // linear accepts the whole list in one request
            Venue::Linear => (feed.linear_url.clone(), usize::MAX),
        };

        Some(Self {
            name: venue.to_string(),
            venue,
            endpoint,
            topics: symbols.iter().map(|s| Venue::ticker_topic(s)).collect(),
            max_batch_size,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Run a consumer callback, turning errors and panics into a `FeedError`
pub(crate) fn isolate<F>(callback: &'static str, f: F) -> Result<(), FeedError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FeedError::Callback {
            callback,
            message: format!("{:#}", e),
        }),
        Err(payload) => Err(FeedError::Callback {
            callback,
            message: panic_message(payload.as_ref()),
        }),
    }
}
