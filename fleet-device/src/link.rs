//! Websocket link to the kernel: one JSON text message per frame.

use async_trait::async_trait;
use fleet_sim::{DeviceFrame, FrameSink, FrameSource, LinkError, ServerFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct KernelSink(SplitSink<WsStream, Message>);

pub struct KernelSource(SplitStream<WsStream>);

pub async fn connect(url: &str) -> Result<(KernelSink, KernelSource), LinkError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| LinkError::Transport(e.to_string()))?;
    let (sink, source) = stream.split();
    Ok((KernelSink(sink), KernelSource(source)))
}

impl KernelSink {
    /// Sends a close frame so the kernel frees the slot right away.
    pub async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            debug!("websocket close failed: {e}");
        }
    }
}

#[async_trait]
impl FrameSink<DeviceFrame> for KernelSink {
    async fn send(&mut self, frame: DeviceFrame) -> Result<(), LinkError> {
        let text = serde_json::to_string(&frame)?;
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FrameSource<ServerFrame> for KernelSource {
    async fn recv(&mut self) -> Option<Result<ServerFrame, LinkError>> {
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
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}
