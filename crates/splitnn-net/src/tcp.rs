// splitnn-net::tcp — newline-delimited frames over a TCP stream.
//
// Wire format: one frame per line, `\n` terminated. Exchange payloads are
// base64 or JSON text and never contain a newline; frames that do are
// rejected on send. Lines that are not valid UTF-8 arrive as binary frames.
// A line longer than the frame limit ends the stream with an error.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::frame::MAX_FRAME_BYTES;
use crate::stream::{Connector, DuplexStream, Frame, StreamEvent};

/// Inbound events buffered between the reader task and the consumer.
const INBOUND_CAPACITY: usize = 64;

// ── Connector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    max_frame_bytes: usize,
}

impl TcpConnector {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> io::Result<Box<dyn DuplexStream>> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        debug!(%address, "tcp stream connected");
        Ok(Box::new(TcpDuplex::with_max_frame_bytes(stream, self.max_frame_bytes)))
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// One TCP connection. A background task splits the read half into lines so
/// that [`DuplexStream::next_event`] is a cancel-safe channel receive.
pub struct TcpDuplex {
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<StreamEvent>,
    reader: JoinHandle<()>,
}

impl TcpDuplex {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_max_frame_bytes(stream, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(stream: TcpStream, max_frame_bytes: usize) -> Self {
        let (read, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader = tokio::spawn(read_lines(read, tx, max_frame_bytes));
        Self { writer, inbound, reader }
    }
}

impl Drop for TcpDuplex {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl DuplexStream for TcpDuplex {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        let bytes = match frame {
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(bytes) => bytes,
            Frame::Blob(blob) => blob.to_bytes(),
        };
        if bytes.contains(&b'\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame contains a line terminator",
            ));
        }
        self.writer.write_all(&bytes).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// Read `\n`-terminated lines until EOF, error, or a line over `max_line`.
async fn read_lines(read: OwnedReadHalf, tx: mpsc::Sender<StreamEvent>, max_line: usize) {
    let mut reader = BufReader::new(read);
    let mut line = Vec::new();
    // Room for the terminator plus one byte to detect an oversized line.
    let window = (max_line as u64).saturating_add(2);
    loop {
        line.clear();
        match (&mut reader).take(window).read_until(b'\n', &mut line).await {
            Ok(0) => {
                let _ = tx.send(StreamEvent::Closed { reason: None }).await;
                return;
            }
            Ok(_) => {
                let terminated = line.last() == Some(&b'\n');
                if line.len() - usize::from(terminated) > max_line {
                    let reason = format!("frame exceeds {max_line} bytes");
                    warn!(%reason, "closing tcp stream");
                    let _ = tx.send(StreamEvent::Error(reason.clone())).await;
                    let _ = tx.send(StreamEvent::Closed { reason: Some(reason) }).await;
                    return;
                }
                if terminated {
                    line.pop();
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let frame = match String::from_utf8(std::mem::take(&mut line)) {
                    Ok(text) => Frame::Text(text),
                    Err(e) => Frame::Binary(e.into_bytes()),
                };
                if tx.send(StreamEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let reason = e.to_string();
                let _ = tx.send(StreamEvent::Error(reason.clone())).await;
                let _ = tx.send(StreamEvent::Closed { reason: Some(reason) }).await;
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
