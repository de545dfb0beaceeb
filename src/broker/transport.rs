//! Transport seam of the broker connection.
//!
//! Messages are multi-frame envelopes of UTF-8 strings. The wire format
//! packs one envelope into a single length-delimited blob: a `u16` frame
//! count followed by `u32`-length-prefixed frames. Tests talk to the
//! connection through an in-memory mock instead.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use err_derive::Error;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(display = "IO error: {}", _0)]
    Io(#[error(source)] std::io::Error),

    #[error(display = "connection closed")]
    Closed,

    #[error(display = "malformed message: {}", _0)]
    Malformed(String),

    #[error(display = "not connected")]
    NotConnected,
}

/// Encode an envelope into one wire blob.
pub fn encode_frames(frames: &[String]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(frames.len() as u16);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame.as_bytes());
    }
    buf.freeze()
}

/// Decode one wire blob back into an envelope.
pub fn decode_frames(mut buf: &[u8]) -> Result<Vec<String>, TransportError> {
    if buf.len() < 2 {
        return Err(TransportError::Malformed("missing frame count".into()));
    }
    let count = buf.get_u16();
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.len() < 4 {
            return Err(TransportError::Malformed("truncated frame header".into()));
        }
        let len = buf.get_u32() as usize;
        if buf.len() < len {
            return Err(TransportError::Malformed("truncated frame body".into()));
        }
        let frame = std::str::from_utf8(&buf[..len])
            .map_err(|e| TransportError::Malformed(e.to_string()))?
            .to_owned();
        buf.advance(len);
        frames.push(frame);
    }
    Ok(frames)
}

/// Sends and receives multi-frame envelopes.
#[async_trait]
pub trait BrokerTransport: Send {
    async fn connect(&mut self, uri: &str) -> Result<(), TransportError>;
    async fn send(&mut self, frames: &[String]) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Vec<String>, TransportError>;
}

/// TCP transport with length-delimited framing.
#[derive(Default)]
pub struct TcpTransport {
    framed: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport { framed: None }
    }
}

#[async_trait]
impl BrokerTransport for TcpTransport {
    async fn connect(&mut self, uri: &str) -> Result<(), TransportError> {
        let addr = uri.strip_prefix("tcp://").unwrap_or(uri);
        let stream = TcpStream::connect(addr).await?;
        self.framed = Some(Framed::new(stream, LengthDelimitedCodec::new()));
        Ok(())
    }

    async fn send(&mut self, frames: &[String]) -> Result<(), TransportError> {
        let framed = self.framed.as_mut().ok_or(TransportError::NotConnected)?;
        framed.send(encode_frames(frames)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<String>, TransportError> {
        let framed = self.framed.as_mut().ok_or(TransportError::NotConnected)?;
        match framed.next().await {
            Some(Ok(blob)) => decode_frames(&blob),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }
}
