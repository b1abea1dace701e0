//! Inbound frame normalization
//!
//! Turns raw Bybit v5 ticker frames into [`Tick`]s. Control frames (pong,
//! subscription acks) are classified and kept off the data path; anything
//! malformed is dropped quietly, it is expected background noise.

use serde::Deserialize;
use serde_json::Value;

use crate::error::FeedError;
use crate::types::Tick;

/// One alias a logical field may arrive under
#[derive(Debug, Clone, Copy)]
pub struct FieldAlias {
    pub key: &'static str,
    /// Multiplier applied after coercion (fraction -> percent)
    pub scale: f64,
}

const fn alias(key: &'static str, scale: f64) -> FieldAlias {
    FieldAlias { key, scale }
}

/// Last price, in order of preference
pub const LAST_PRICE_ALIASES: &[FieldAlias] = &[
    alias("lastPrice", 1.0),
    alias("last_price", 1.0),
    alias("lp", 1.0),
    alias("ltp", 1.0),
    alias("bid1Price", 1.0),
];

/// 24h change; `price24hPcnt` is a fraction, `change24hP` already a percent
pub const CHANGE_24H_ALIASES: &[FieldAlias] =
    &[alias("price24hPcnt", 100.0), alias("change24hP", 1.0)];

/// Frames that acknowledge or keep the connection alive
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Pong,
    Ping,
    /// Subscription ack; `success == false` means upstream rejected it
    Ack { success: bool, message: Option<String> },
    Subscribed,
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(ControlFrame),
    Tickers(Vec<Tick>),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    op: Option<String>,
    success: Option<bool>,
    event: Option<String>,
    ret_msg: Option<String>,
    topic: Option<String>,
    data: Option<Value>,
}

/// Coerce a JSON number or numeric string into a finite f64
pub(crate) fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// First alias that is present and coerces wins
pub fn extract_field(item: &Value, aliases: &[FieldAlias]) -> Option<f64> {
    aliases.iter().find_map(|a| {
        item.get(a.key)
            .and_then(coerce_number)
            .map(|v| v * a.scale)
    })
}

/// Decode a raw frame, reporting why it was dropped
pub fn decode(raw: &str, received_at: i64) -> Result<Inbound, FeedError> {
    let frame: RawFrame = serde_json::from_str(raw)?;

    match frame.op.as_deref() {
        Some("pong") => return Ok(Inbound::Control(ControlFrame::Pong)),
        Some("ping") => return Ok(Inbound::Control(ControlFrame::Ping)),
        _ => {}
    }
    if let Some(success) = frame.success {
        return Ok(Inbound::Control(ControlFrame::Ack {
            success,
            message: frame.ret_msg,
        }));
    }
    if frame.event.as_deref() == Some("subscribed") {
        return Ok(Inbound::Control(ControlFrame::Subscribed));
    }

    let topic = frame
        .topic
        .ok_or_else(|| FeedError::Data("frame without topic".to_string()))?;
    let data = frame
        .data
        .ok_or_else(|| FeedError::Data(format!("{} frame without data", topic)))?;
    if !topic.starts_with("tickers") {
        return Err(FeedError::Data(format!("unsupported topic {}", topic)));
    }

    let topic_symbol = topic.split_once('.').map(|(_, sym)| sym);
    let items = match data {
        Value::Array(items) => items,
        other => vec![other],
    };

    let ticks = items
        .iter()
        .filter_map(|item| {
            let symbol = item
                .get("symbol")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .or(topic_symbol)
                .filter(|s| !s.is_empty())?;
            Tick::new(
                symbol,
                extract_field(item, LAST_PRICE_ALIASES),
                extract_field(item, CHANGE_24H_ALIASES),
                received_at,
            )
        })
        .collect();

    Ok(Inbound::Tickers(ticks))
}

/// Normalize a raw frame into zero or more ticks
pub fn normalize(raw: &str, received_at: i64) -> Vec<Tick> {
    match decode(raw, received_at) {
        Ok(Inbound::Tickers(ticks)) => ticks,
        Ok(Inbound::Control(_)) => Vec::new(),
        Err(e) => {
            tracing::trace!(error = %e, "Dropped inbound frame");
            Vec::new()
        }
    }
}
