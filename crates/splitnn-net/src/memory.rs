//! In-process duplex streams.
//!
//! [`memory_link`] returns a [`MemoryConnector`] and a [`MemoryListener`].
//! Every `connect` on the connector produces a [`MemoryPeer`] on the listener
//! side, which can script replies, inject transport errors and close the
//! stream. `MemoryPeer` is itself a [`DuplexStream`], so a remote stage can
//! serve it directly.

use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::stream::{Connector, DuplexStream, Frame, StreamEvent};

pub fn memory_link() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (MemoryConnector { accept_tx }, MemoryListener { accept_rx })
}

// ── Connector / Listener ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> io::Result<Box<dyn DuplexStream>> {
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            address: address.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx.send(peer).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener dropped")
        })?;
        debug!(%address, "memory stream connected");

        Ok(Box::new(MemoryStream {
            outbound: Some(client_tx),
            inbound: client_rx,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection. `None` once the connector is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

// ── Client Side ───────────────────────────────────────────────────────────────

struct MemoryStream {
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    inbound: mpsc::UnboundedReceiver<StreamEvent>,
}

#[async_trait]
impl DuplexStream for MemoryStream {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        let tx = self
            .outbound
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream closed"))?;
        tx.send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer dropped"))
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.outbound = None;
        Ok(())
    }
}

// ── Peer Side ─────────────────────────────────────────────────────────────────

/// The accepting end of a memory stream.
#[derive(Debug)]
pub struct MemoryPeer {
    address: String,
    to_client: mpsc::UnboundedSender<StreamEvent>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Address the client connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next frame from the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Push a frame to the client. Returns `false` if the client is gone.
    pub fn push(&self, frame: Frame) -> bool {
        self.to_client.send(StreamEvent::Frame(frame)).is_ok()
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Frame::Text(text.into()))
    }

    /// Report a non-fatal transport error to the client.
    pub fn inject_error(&self, message: impl Into<String>) -> bool {
        self.to_client.send(StreamEvent::Error(message.into())).is_ok()
    }

    /// Close from the remote side.
    pub fn hang_up(self) {
        let _ = self.to_client.send(StreamEvent::Closed { reason: None });
    }
}

#[async_trait]
impl DuplexStream for MemoryPeer {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        if self.push(frame) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client dropped"))
        }
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        self.recv().await.map(StreamEvent::Frame)
    }

    async fn close(&mut self) -> io::Result<()> {
        let _ = self.to_client.send(StreamEvent::Closed { reason: None });
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut listener) = memory_link();
        let mut client = connector.connect("mem://tail").await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.address(), "mem://tail");

        client.send(Frame::Text("ping".into())).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Text("ping".into())));

        assert!(peer.push_text("pong"));
        assert_eq!(
            client.next_event().await,
            Some(StreamEvent::Frame(Frame::Text("pong".into())))
        );
    }

    #[tokio::test]
    async fn client_close_ends_peer_stream() {
        let (connector, mut listener) = memory_link();
        let mut client = connector.connect("mem://tail").await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        client.close().await.unwrap();
        assert!(peer.recv().await.is_none());
        assert!(client.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn refused_without_listener() {
        let (connector, listener) = memory_link();
        drop(listener);
        let err = connector.connect("mem://tail").await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
