//! WebSocket transport.
//!
//! One text message carries one JSON document. Binary, ping and pong
//! messages are ignored; a close message ends the stream.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::frame::{FrameReader, FrameWriter};

// ============================================================================
// Split
// ============================================================================

/// Splits a WebSocket into frame reader and writer halves.
pub fn split<S>(stream: WebSocketStream<S>) -> (WsReader<S>, WsWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = stream.split();
    (WsReader { stream }, WsWriter { sink })
}

// ============================================================================
// WsReader
// ============================================================================

/// Inbound half of a WebSocket.
pub struct WsReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(text.as_str().as_bytes().to_vec()));
                }

                Some(Ok(WsMessage::Close(_))) => {
                    debug!("WebSocket closed by remote");
                    return Ok(None);
                }

                Some(Err(e)) => return Err(e.into()),

                None => return Ok(None),

                // Ignore Binary, Ping, Pong
                Some(Ok(other)) => trace!(kind = message_kind(&other), "Ignoring WebSocket message"),
            }
        }
    }
}

fn message_kind(message: &WsMessage) -> &'static str {
    match message {
        WsMessage::Text(_) => "text",
        WsMessage::Binary(_) => "binary",
        WsMessage::Ping(_) => "ping",
        WsMessage::Pong(_) => "pong",
        WsMessage::Close(_) => "close",
        WsMessage::Frame(_) => "frame",
    }
}

// ============================================================================
// WsWriter
// ============================================================================

/// Outbound half of a WebSocket.
pub struct WsWriter<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| Error::protocol(format!("outbound frame is not UTF-8: {e}")))?;
        self.sink.feed(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.sink.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}
