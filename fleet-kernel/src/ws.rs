//! Device frames over an axum websocket: one JSON text message per frame.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use fleet_sim::{DeviceFrame, FrameSink, FrameSource, LinkError, ServerFrame};
use tracing::debug;

pub struct WsSink(SplitSink<WebSocket, Message>);

pub struct WsSource(SplitStream<WebSocket>);

pub fn split(socket: WebSocket) -> (WsSink, WsSource) {
    let (sink, stream) = socket.split();
    (WsSink(sink), WsSource(stream))
}

impl WsSink {
    /// Sends a close frame so the device sees a clean end of session.
    pub async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            debug!("websocket close failed: {e}");
        }
    }
}

#[async_trait]
impl FrameSink<ServerFrame> for WsSink {
    async fn send(&mut self, frame: ServerFrame) -> Result<(), LinkError> {
        let text = serde_json::to_string(&frame)?;
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FrameSource<DeviceFrame> for WsSource {
    async fn recv(&mut self) -> Option<Result<DeviceFrame, LinkError>> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(LinkError::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).map_err(LinkError::from))
                }
                Message::Binary(bytes) => {
                    return Some(serde_json::from_slice(&bytes).map_err(LinkError::from))
                }
                Message::Close(_) => return None,
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}
