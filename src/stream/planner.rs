//! Subscription planning
//!
//! Splits a topic list into subscribe batches that respect the upstream
//! per-request argument limit. Subscriptions never survive a reconnect, so
//! the whole plan is replayed on every open.

use serde::Serialize;

/// Outbound subscribe request: `{"op":"subscribe","args":[...]}`
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeRequest<'a> {
    op: &'static str,
    args: &'a [String],
}

impl<'a> SubscribeRequest<'a> {
    pub fn new(args: &'a [String]) -> Self {
        Self {
            op: "subscribe",
            args,
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings inside; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Keepalive frame sent while a channel is open
pub const PING_FRAME: &str = r#"{"op":"ping"}"#;

/// Chunk `topics` into consecutive batches of at most `max_batch_size`.
///
/// Order is preserved. A batch size of zero is treated as one.
pub fn plan(topics: &[String], max_batch_size: usize) -> Vec<Vec<String>> {
    topics
        .chunks(max_batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
