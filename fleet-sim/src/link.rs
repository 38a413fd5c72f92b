//! Transport-agnostic halves of a duplex frame channel.
//!
//! A device session only needs somewhere to push frames and somewhere to pull
//! them from. The websocket client, the kernel's websocket adapter and the
//! in-process embedded devices all plug in through these two traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::LinkError;
use crate::protocol::{DeviceFrame, ServerFrame};

#[async_trait]
pub trait FrameSink<T: Send + 'static>: Send {
    async fn send(&mut self, frame: T) -> Result<(), LinkError>;
}

#[async_trait]
pub trait FrameSource<T: Send + 'static>: Send {
    /// `None` once the peer has gone away for good.
    async fn recv(&mut self) -> Option<Result<T, LinkError>>;
}

#[async_trait]
impl<T: Send + 'static> FrameSink<T> for mpsc::Sender<T> {
    async fn send(&mut self, frame: T) -> Result<(), LinkError> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| LinkError::Closed)
    }
}

#[async_trait]
impl<T: Send + 'static> FrameSource<T> for mpsc::Receiver<T> {
    async fn recv(&mut self) -> Option<Result<T, LinkError>> {
        mpsc::Receiver::recv(self).await.map(Ok)
    }
}

#[async_trait]
impl<T: Send + 'static, S: FrameSink<T> + ?Sized> FrameSink<T> for Box<S> {
    async fn send(&mut self, frame: T) -> Result<(), LinkError> {
        (**self).send(frame).await
    }
}

#[async_trait]
impl<T: Send + 'static, S: FrameSource<T> + ?Sized> FrameSource<T> for Box<S> {
    async fn recv(&mut self) -> Option<Result<T, LinkError>> {
        (**self).recv().await
    }
}

/// One side of an in-memory duplex link.
#[derive(Debug)]
pub struct Endpoint<Out, In> {
    pub sink: mpsc::Sender<Out>,
    pub source: mpsc::Receiver<In>,
}

pub type DeviceEnd = Endpoint<DeviceFrame, ServerFrame>;
pub type ServerEnd = Endpoint<ServerFrame, DeviceFrame>;

/// In-memory link, each direction bounded to `buffer` frames.
pub fn pair(buffer: usize) -> (DeviceEnd, ServerEnd) {
    let (device_tx, server_rx) = mpsc::channel(buffer.max(1));
    let (server_tx, device_rx) = mpsc::channel(buffer.max(1));
    (
        Endpoint {
            sink: device_tx,
            source: device_rx,
        },
        Endpoint {
            sink: server_tx,
            source: server_rx,
        },
    )
}
