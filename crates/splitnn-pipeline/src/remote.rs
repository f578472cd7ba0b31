// splitnn-pipeline::remote — the tail half of a split network.
//
// Serves one exchange at a time per stream: decode an activations frame, run
// the tail session, answer with a logits frame. Failures are answered with an
// error frame (framed format) so the client never stalls on a bad request.
// Both replies echo the request's exchange id.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use splitnn_net::{DuplexStream, Frame, FrameCodec, StreamEvent, TcpDuplex};
use splitnn_runtime::SessionManager;
use splitnn_types::message::MessageType;
use splitnn_types::Result;

pub struct RemoteStage {
    sessions: Arc<SessionManager>,
    codec: FrameCodec,
}

impl RemoteStage {
    pub fn new(sessions: Arc<SessionManager>, codec: FrameCodec) -> Self {
        Self { sessions, codec }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Answer one inbound frame. `None` when the failure cannot be reported
    /// in the configured wire format.
    pub async fn handle_frame(&self, text: &str) -> Option<String> {
        let exchange = self.codec.exchange_id(text);
        match self.run_tail(text, exchange).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(?exchange, %e, "tail exchange failed");
                self.codec.encode_error(&e.to_string(), exchange)
            }
        }
    }

    async fn run_tail(&self, text: &str, exchange: Option<u64>) -> Result<String> {
        let activations = self.codec.decode(text, MessageType::Activations)?;
        let out = self.sessions.infer(activations).await?;
        debug!(?exchange, backend = %out.backend, elapsed = ?out.elapsed, "tail inference complete");
        self.codec.encode_for(MessageType::Logits, &out.tensor, exchange)
    }

    /// Serve a single stream until it closes.
    pub async fn serve_stream(&self, mut stream: Box<dyn DuplexStream>) {
        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::Frame(frame) => {
                    let Some(reply) = self.handle_frame(&frame.into_text()).await else {
                        continue;
                    };
                    if let Err(e) = stream.send(Frame::Text(reply)).await {
                        warn!(%e, "reply send failed");
                        break;
                    }
                }
                StreamEvent::Error(message) => warn!(error = %message, "stream error"),
                StreamEvent::Closed { .. } => break,
            }
        }
        debug!("stream finished");
    }

    /// Accept TCP connections forever, one task per connection.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "remote stage listening");
        loop {
            let (socket, peer) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                debug!(%e, "set_nodelay failed");
            }
            info!(%peer, "client connected");

            let stage = Arc::clone(&self);
            tokio::spawn(async move {
                let stream = TcpDuplex::with_max_frame_bytes(socket, stage.codec.max_frame_bytes());
                stage.serve_stream(Box::new(stream)).await;
                info!(%peer, "client disconnected");
            });
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
