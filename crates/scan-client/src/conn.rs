//! One framed connection to an indexer's scan port.

use futures::{SinkExt, StreamExt};
use scan_proto::{FrameCodec, Message};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub struct Conn {
    framed: Framed<TcpStream, FrameCodec>,
    endpoint: String,
}

impl Conn {
    pub async fn connect(
        endpoint: &str,
        max_payload: usize,
        connect_timeout: Duration,
    ) -> crate::Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| crate::Error::Timeout)??;
        stream.set_nodelay(true)?;

        Ok(Self {
            framed: Framed::new(stream, FrameCodec::new(max_payload)),
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Write one frame under `deadline`.
    pub async fn send(&mut self, msg: Message, deadline: Duration) -> crate::Result<()> {
        tokio::time::timeout(deadline, self.framed.send(msg))
            .await
            .map_err(|_| crate::Error::Timeout)?
            .map_err(crate::Error::Frame)
    }

    /// Read one frame under `deadline`. A peer close is an unexpected EOF:
    /// streams are always terminated by an explicit end-of-stream frame.
    pub async fn recv(&mut self, deadline: Duration) -> crate::Result<Message> {
        match tokio::time::timeout(deadline, self.framed.next()).await {
            Err(_) => Err(crate::Error::Timeout),
            Ok(None) => Err(crate::Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Some(result)) => result.map_err(crate::Error::Frame),
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("endpoint", &self.endpoint).finish()
    }
}
