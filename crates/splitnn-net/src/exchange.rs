// splitnn-net::exchange — single pending request/reply slot.
//
// At most one exchange is outstanding per slot. A caller reserves the slot
// before doing any work, so a concurrent caller fails fast with
// `ExchangeBusy` instead of disturbing the first exchange. The slot is
// released when the ticket is dropped, including on timeout and error.
// Correlated replies must carry the id of the armed exchange; anything else
// is dropped as unsolicited.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use splitnn_types::{Result, SplitError};

use crate::connection::{Connection, ConnectionState};
use crate::events::ConnectionObserver;
use crate::frame::FrameCodec;

struct Pending {
    id: u64,
    armed: bool,
    reply_tx: Option<oneshot::Sender<Result<String>>>,
}

#[derive(Default)]
struct SlotState {
    next_id: u64,
    pending: Option<Pending>,
}

#[derive(Default)]
pub struct ExchangeSlot {
    state: Mutex<SlotState>,
}

impl ExchangeSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the slot. Fails with `ExchangeBusy` if an exchange is pending.
    pub fn reserve(self: &Arc<Self>) -> Result<ExchangeTicket> {
        let mut state = self.state.lock();
        if state.pending.is_some() {
            return Err(SplitError::ExchangeBusy);
        }
        state.next_id += 1;
        let id = state.next_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        state.pending = Some(Pending {
            id,
            armed: false,
            reply_tx: Some(reply_tx),
        });
        debug!(exchange = id, "exchange slot reserved");
        Ok(ExchangeTicket {
            slot: Arc::clone(self),
            id,
            reply_rx,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Deliver an uncorrelated reply to the armed exchange. Returns `false`
    /// and drops the reply if nothing is waiting for one.
    pub fn complete(&self, reply: String) -> bool {
        self.deliver(None, reply)
    }

    /// Deliver a reply to the armed exchange only if it is exchange `id`.
    pub fn complete_exchange(&self, id: u64, reply: String) -> bool {
        self.deliver(Some(id), reply)
    }

    fn deliver(&self, id: Option<u64>, reply: String) -> bool {
        let mut state = self.state.lock();
        let tx = match state.pending.as_mut() {
            Some(p) if p.armed && id.map_or(true, |id| id == p.id) => p.reply_tx.take(),
            _ => None,
        };
        match tx {
            Some(tx) => tx.send(Ok(reply)).is_ok(),
            None => {
                warn!(exchange = ?id, bytes = reply.len(), "unsolicited reply dropped");
                false
            }
        }
    }

    /// Fail the armed exchange, if any. A reserved exchange that has not sent
    /// yet is left alone.
    pub fn fail(&self, err: SplitError) {
        let mut state = self.state.lock();
        let tx = match state.pending.as_mut() {
            Some(p) if p.armed => p.reply_tx.take(),
            _ => None,
        };
        if let Some(tx) = tx {
            let _ = tx.send(Err(err));
        }
    }

    fn arm(&self, id: u64) {
        if let Some(p) = self.state.lock().pending.as_mut() {
            if p.id == id {
                p.armed = true;
            }
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        if state.pending.as_ref().map(|p| p.id) == Some(id) {
            state.pending = None;
            debug!(exchange = id, "exchange slot released");
        }
    }
}

/// A reserved exchange. Dropping it frees the slot.
pub struct ExchangeTicket {
    slot: Arc<ExchangeSlot>,
    id: u64,
    reply_rx: oneshot::Receiver<Result<String>>,
}

impl ExchangeTicket {
    /// Id to tag the outbound request with.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send `payload` and wait for exactly one reply.
    pub async fn exchange(
        mut self,
        connection: &Connection,
        payload: String,
        timeout: Option<Duration>,
    ) -> Result<String> {
        if connection.state() != ConnectionState::Open {
            return Err(SplitError::ConnectionClosed);
        }
        self.slot.arm(self.id);
        if !connection.send(payload) {
            return Err(SplitError::ConnectionClosed);
        }

        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.reply_rx)
                .await
                .map_err(|_| {
                    warn!(exchange = self.id, ?limit, "exchange timed out");
                    SplitError::ExchangeTimeout(limit)
                })?,
            None => (&mut self.reply_rx).await,
        };
        reply.map_err(|_| SplitError::ConnectionClosed)?
    }
}

impl Drop for ExchangeTicket {
    fn drop(&mut self) {
        self.slot.release(self.id);
    }
}

// ── Observer ──────────────────────────────────────────────────────────────────

/// Routes inbound messages into an [`ExchangeSlot`] and fails the pending
/// exchange when the connection closes. Callbacks are forwarded to `inner`.
pub struct ExchangeObserver {
    slot: Arc<ExchangeSlot>,
    codec: Option<FrameCodec>,
    inner: Option<Arc<dyn ConnectionObserver>>,
}

impl ExchangeObserver {
    pub fn new(slot: Arc<ExchangeSlot>, inner: Option<Arc<dyn ConnectionObserver>>) -> Self {
        Self {
            slot,
            codec: None,
            inner,
        }
    }

    /// Match replies to exchanges by the id `codec` reads from each frame.
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = Some(codec);
        self
    }

    fn route(&self, text: String) {
        match &self.codec {
            Some(codec) if codec.correlates() => match codec.exchange_id(&text) {
                Some(id) => {
                    self.slot.complete_exchange(id, text);
                }
                None => warn!(bytes = text.len(), "reply without exchange id dropped"),
            },
            _ => {
                self.slot.complete(text);
            }
        }
    }
}

impl ConnectionObserver for ExchangeObserver {
    fn on_open(&self) {
        if let Some(inner) = &self.inner {
            inner.on_open();
        }
    }

    fn on_message(&self, text: String) {
        match &self.inner {
            Some(inner) => {
                self.route(text.clone());
                inner.on_message(text);
            }
            None => self.route(text),
        }
    }

    fn on_error(&self, message: &str) {
        if let Some(inner) = &self.inner {
            inner.on_error(message);
        }
    }

    fn on_close(&self) {
        self.slot.fail(SplitError::ConnectionClosed);
        if let Some(inner) = &self.inner {
            inner.on_close();
        }
    }
}
