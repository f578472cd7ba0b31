//! splitnn-net — wire side of split inference.
//!
//! - [`tensor_codec`]: typed array ↔ base64 text
//! - [`frame`]: tensor ↔ one self-describing (or bare) text frame
//! - [`stream`]: the physical duplex stream seam, with [`tcp`] and [`memory`]
//!   implementations
//! - [`connection`]: the connection state machine driven by a background task
//! - [`exchange`]: the single pending request/reply slot

// ── Module declarations ───────────────────────────────────────────────────────

pub mod connection;
pub mod events;
pub mod exchange;
pub mod frame;
pub mod memory;
pub mod stream;
pub mod tcp;
pub mod tensor_codec;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use connection::{Connection, ConnectionState};
pub use events::{ChannelObserver, ConnectionEvent, ConnectionObserver, NoopObserver};
pub use exchange::{ExchangeObserver, ExchangeSlot, ExchangeTicket};
pub use frame::FrameCodec;
pub use memory::{memory_link, MemoryConnector, MemoryListener, MemoryPeer};
pub use stream::{Blob, Connector, DuplexStream, Frame, StreamEvent};
pub use tcp::{TcpConnector, TcpDuplex};
