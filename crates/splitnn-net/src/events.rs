use tokio::sync::mpsc;

/// Callbacks fired by a [`crate::Connection`] from its background task.
///
/// All methods default to no-ops. Messages always arrive as text, whatever
/// frame shape carried them.
pub trait ConnectionObserver: Send + Sync {
    fn on_open(&self) {}
    fn on_message(&self, _text: String) {}
    fn on_error(&self, _message: &str) {}
    fn on_close(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// Domain-level connection events, for callers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Message(String),
    Error(String),
    Closed,
}

/// Observer that forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_open(&self) {
        let _ = self.tx.send(ConnectionEvent::Opened);
    }

    fn on_message(&self, text: String) {
        let _ = self.tx.send(ConnectionEvent::Message(text));
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(ConnectionEvent::Error(message.to_string()));
    }

    fn on_close(&self) {
        let _ = self.tx.send(ConnectionEvent::Closed);
    }
}
