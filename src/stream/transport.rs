//! Socket seam for venue channels
//!
//! A [`Connector`] opens a channel and hands back split sink/stream halves so
//! the connection loop can read and write from different `select!` arms.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::error::FeedError;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Inbound websocket frame, reduced to what the feed cares about
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong,
    Close,
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), FeedError>;

    async fn close(&mut self) -> Result<(), FeedError>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, `None` once the stream has ended. Must be cancel safe.
    async fn next_frame(&mut self) -> Option<Result<Frame, FeedError>>;
}

/// An open channel
pub struct Session {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Session, FeedError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, endpoint: &str) -> Result<Session, FeedError> {
        let (ws_stream, _) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(endpoint),
        )
        .await
        .map_err(|_| FeedError::Transport(format!("connect to {} timed out", endpoint)))??;

        let (write, read) = ws_stream.split();
        Ok(Session {
            sink: Box::new(WsSink(write)),
            stream: Box::new(WsSource(read)),
        })
    }
}

struct WsSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.0.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), FeedError> {
        self.0.send(Message::Pong(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), FeedError> {
        self.0.send(Message::Close(None)).await?;
        Ok(())
    }
}

struct WsSource(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, FeedError>> {
        loop {
            let frame = match self.0.next().await? {
                Ok(Message::Text(text)) => Frame::Text(text),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => continue,
                },
                Ok(Message::Ping(payload)) => Frame::Ping(payload),
                Ok(Message::Pong(_)) => Frame::Pong,
                Ok(Message::Close(_)) => Frame::Close,
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            };
            return Some(Ok(frame));
        }
    }
}
