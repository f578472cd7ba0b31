//! Connection state machine over a [`DuplexStream`].
//!
//! ```text
//! Idle | Closed ──connect──▶ Connecting ──handshake──▶ Open
//! Connecting | Open ──disconnect──▶ Closing ──▶ Closed
//! Connecting | Open ──remote close / failed handshake──▶ Closed
//! ```
//!
//! A background task owns the stream. [`Connection`] is the handle: it posts
//! commands into the task over an mpsc channel and reads state from a
//! `watch` channel. Observer callbacks run on the task.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use splitnn_types::{Result, SplitError};

use crate::events::ConnectionObserver;
use crate::stream::{Connector, DuplexStream, Frame, StreamEvent};

const DEFAULT_COMMAND_CAPACITY: usize = 64;

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle       => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open       => write!(f, "open"),
            Self::Closing    => write!(f, "closing"),
            Self::Closed     => write!(f, "closed"),
        }
    }
}

// ── Shared Status ─────────────────────────────────────────────────────────────

/// Status written by the task, read by the handle. Writes from a task whose
/// generation is no longer current are ignored.
struct Status {
    state: watch::Sender<ConnectionState>,
    errors: Mutex<Vec<String>>,
    address: Mutex<Option<String>>,
    generation: AtomicU64,
}

impl Status {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        if self.is_current(generation) {
            self.state.send_replace(state);
        }
    }

    fn report_error(&self, generation: u64, observer: &dyn ConnectionObserver, message: String) {
        warn!(error = %message, "transport error");
        if self.is_current(generation) {
            self.errors.lock().push(message.clone());
        }
        observer.on_error(&message);
    }

    fn finish(&self, generation: u64, observer: &dyn ConnectionObserver) {
        if self.is_current(generation) {
            self.state.send_replace(ConnectionState::Closed);
            self.errors.lock().clear();
        }
        info!("connection closed");
        observer.on_close();
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Send(Frame),
    Disconnect,
}

struct Active {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

// ── Connection ────────────────────────────────────────────────────────────────

/// Handle to one logical connection. Reconnecting tears down the previous
/// stream first; at most one background task exists at a time.
pub struct Connection {
    connector: Arc<dyn Connector>,
    command_capacity: usize,
    status: Arc<Status>,
    active: Mutex<Option<Active>>,
}

impl Connection {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_capacity(connector, DEFAULT_COMMAND_CAPACITY)
    }

    pub fn with_capacity(connector: Arc<dyn Connector>, command_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            connector,
            command_capacity: command_capacity.max(1),
            status: Arc::new(Status {
                state,
                errors: Mutex::new(Vec::new()),
                address: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.state.borrow()
    }

    /// Transport errors reported since the connection last opened.
    pub fn errors(&self) -> Vec<String> {
        self.status.errors.lock().clone()
    }

    pub fn address(&self) -> Option<String> {
        self.status.address.lock().clone()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.state.subscribe()
    }

    /// Open a stream to `address`. Any existing connection is disconnected
    /// first. Returns once the connect attempt is underway; use
    /// [`Connection::wait_open`] to await the handshake.
    pub async fn connect(&self, address: &str, observer: Arc<dyn ConnectionObserver>) {
        self.disconnect().await;

        let generation = self.status.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.status.address.lock() = Some(address.to_string());
        self.status.errors.lock().clear();
        self.status.state.send_replace(ConnectionState::Connecting);
        info!(%address, generation, "connecting");

        let (cmd_tx, cmd_rx) = mpsc::channel(self.command_capacity);
        let task = tokio::spawn(run_connection(
            Arc::clone(&self.connector),
            address.to_string(),
            Arc::clone(&self.status),
            generation,
            observer,
            cmd_rx,
        ));
        *self.active.lock() = Some(Active { cmd_tx, task });
    }

    /// Wait until the current connect attempt settles. `Ok` once open,
    /// `ConnectionClosed` if it failed or nothing is connecting.
    pub async fn wait_open(&self) -> Result<()> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|s| *s)
            .map_err(|_| SplitError::ConnectionClosed)?;
        match state {
            ConnectionState::Open => Ok(()),
            _ => Err(SplitError::ConnectionClosed),
        }
    }

    /// Queue a text payload. Dropped unless the connection is open.
    /// Returns whether the payload was queued.
    pub fn send(&self, payload: impl Into<String>) -> bool {
        self.send_frame(Frame::Text(payload.into()))
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        let state = self.state();
        if state != ConnectionState::Open {
            debug!(%state, "send dropped: connection not open");
            return false;
        }
        let guard = self.active.lock();
        let Some(active) = guard.as_ref() else {
            return false;
        };
        match active.cmd_tx.try_send(Command::Send(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("send dropped: command channel full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("send dropped: connection task finished");
                false
            }
        }
    }

    /// Close the stream and wait for the task to finish. No-op when idle.
    pub async fn disconnect(&self) {
        let active = self.active.lock().take();
        let Some(Active { cmd_tx, task }) = active else {
            return;
        };
        let _ = cmd_tx.send(Command::Disconnect).await;
        drop(cmd_tx);
        if let Err(e) = task.await {
            error!(%e, "connection task exited abnormally");
            self.status.state.send_replace(ConnectionState::Closed);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.task.abort();
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

enum Handshake {
    Opened(Box<dyn DuplexStream>),
    Failed(String),
    Aborted,
}

async fn run_connection(
    connector: Arc<dyn Connector>,
    address: String,
    status: Arc<Status>,
    generation: u64,
    observer: Arc<dyn ConnectionObserver>,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    let handshake = {
        let connect = connector.connect(&address);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                res = &mut connect => break match res {
                    Ok(stream) => Handshake::Opened(stream),
                    Err(e) => Handshake::Failed(format!("connect to {address} failed: {e}")),
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(_)) => debug!("send dropped: still connecting"),
                    Some(Command::Disconnect) | None => break Handshake::Aborted,
                },
            }
        }
    };

    let mut stream = match handshake {
        Handshake::Opened(stream) => stream,
        Handshake::Failed(message) => {
            status.report_error(generation, observer.as_ref(), message);
            status.finish(generation, observer.as_ref());
            return;
        }
        Handshake::Aborted => {
            status.set_state(generation, ConnectionState::Closing);
            status.finish(generation, observer.as_ref());
            return;
        }
    };

    status.set_state(generation, ConnectionState::Open);
    info!(%address, "connection open");
    observer.on_open();

    loop {
        tokio::select! {
            event = stream.next_event() => match event {
                Some(StreamEvent::Frame(frame)) => {
                    debug!(bytes = frame.len(), "frame received");
                    observer.on_message(frame.into_text());
                }
                Some(StreamEvent::Error(message)) => {
                    status.report_error(generation, observer.as_ref(), message);
                }
                Some(StreamEvent::Closed { reason }) => {
                    info!(reason = reason.as_deref().unwrap_or("none"), "remote closed stream");
                    break;
                }
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(frame)) => {
                    let bytes = frame.len();
                    match stream.send(frame).await {
                        Ok(()) => debug!(bytes, "frame sent"),
                        Err(e) => status.report_error(
                            generation,
                            observer.as_ref(),
                            format!("send failed: {e}"),
                        ),
                    }
                }
                Some(Command::Disconnect) | None => {
                    status.set_state(generation, ConnectionState::Closing);
                    if let Err(e) = stream.close().await {
                        debug!(%e, "stream close failed");
                    }
                    break;
                }
            },
        }
    }

    status.finish(generation, observer.as_ref());
}

// ── Tests ─────────────────────────────────────────────────────────────────────
