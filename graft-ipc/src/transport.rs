//! IPC transport implementations

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use graft_core::MessageFormat;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::trace;

use crate::error::IpcError;

/// Upper bound for a single message; large arrays travel in one frame
pub const MAX_FRAME_LENGTH: usize = 1 << 30;

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), IpcError>;

    /// Receive the next message from the other end.
    ///
    /// Cancel safe: dropping the future before it completes loses no data,
    /// so it can be raced against a timeout.
    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<T, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Length-prefixed messages over any byte stream
pub struct FramedTransport<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    format: MessageFormat,
    max_frame_length: usize,
    closed: bool,
}

/// Transport used between processes
pub type TcpTransport = FramedTransport<TcpStream>;

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, format: MessageFormat) -> Self {
        Self::with_max_frame_length(stream, format, MAX_FRAME_LENGTH)
    }

    /// Transport refusing frames longer than `max_frame_length` in either direction
    pub fn with_max_frame_length(stream: S, format: MessageFormat, max_frame_length: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_length)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            format,
            max_frame_length,
            closed: false,
        }
    }

    pub fn format(&self) -> MessageFormat {
        self.format
    }
}

impl TcpTransport {
    /// Connect to a `tcp://host:port` endpoint
    pub async fn connect(address: &str, format: MessageFormat) -> Result<Self, IpcError> {
        let target = parse_address(address)?;
        let stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, format))
    }
}

#[async_trait]
impl<S> IpcTransport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), IpcError> {
        if self.closed {
            return Err(IpcError::NotConnected);
        }
        let payload = self.format.to_bytes(message)?;
        // nothing has been written yet, so the stream stays usable
        if payload.len() > self.max_frame_length {
            return Err(IpcError::SerializationError(format!(
                "message of {} bytes exceeds the {} byte frame limit",
                payload.len(),
                self.max_frame_length
            )));
        }
        trace!(bytes = payload.len(), "Sending frame");
        self.framed.send(Bytes::from(payload)).await?;
        Ok(())
    }

    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<T, IpcError> {
        if self.closed {
            return Err(IpcError::NotConnected);
        }
        match self.framed.next().await {
            Some(Ok(frame)) => {
                trace!(bytes = frame.len(), "Received frame");
                Ok(self.format.from_bytes(&frame)?)
            }
            // oversized length prefix; the rest of the stream cannot be framed
            Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Err(IpcError::InvalidMessage(e.to_string()))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(IpcError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Strip the `tcp://` scheme from an endpoint address
pub fn parse_address(address: &str) -> Result<&str, IpcError> {
    let target = address.strip_prefix("tcp://").unwrap_or(address);
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(target),
        _ => Err(IpcError::InvalidAddress(address.to_string())),
    }
}

/// Endpoint address passed to a remote on its command line
pub fn format_address(addr: SocketAddr) -> String {
    format!("tcp://{}", addr)
}
