//! Length-delimited framing over a local TCP stream.

use crate::codec::Codec;
use crate::error::TunnelError;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame either side will accept.
const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// A TCP connection carrying one codec-encoded message per frame.
pub struct FramedSocket<C> {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    codec: C,
    peer: Option<SocketAddr>,
}

impl<C: Codec> FramedSocket<C> {
    pub fn new(stream: TcpStream, codec: C) -> Self {
        let peer = stream.peer_addr().ok();
        let framing = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            framed: Framed::new(stream, framing),
            codec,
            peer,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub async fn send(&mut self, message: &C::Input) -> Result<(), TunnelError> {
        let payload = self.codec.encode(message)?;
        tracing::trace!(peer = ?self.peer, len = payload.len(), "Sending frame");
        self.framed.send(payload).await?;
        Ok(())
    }

    /// Next message, or `None` once the peer has closed the connection.
    ///
    /// A frame that fails to decode yields [`TunnelError::InvalidMessage`]
    /// and leaves the connection usable.
    pub async fn receive(&mut self) -> Result<Option<C::Output>, TunnelError> {
        let Some(frame) = self.framed.next().await else {
            return Ok(None);
        };
        let frame = frame?;
        tracing::trace!(peer = ?self.peer, len = frame.len(), "Received frame");
        Ok(Some(self.codec.decode(&frame)?))
    }
}
