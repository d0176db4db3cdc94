//! Network Module Implementation
//!
//! Per-connection byte handling for the game server engine.
//!
//! # Components
//!
//! - `RingBuffer`: two-region byte buffer backing both directions of a connection
//! - `Transport`: the non-blocking byte pipe a connection drives
//! - `Connection`: lifecycle, buffers and send serialization for one peer
//! - `FrameDecoder`: splits the read buffer into length-prefixed frames
//!
//! # Wire format
//!
//! `opcode: u16 LE | length: u32 LE | payload`, with `length <= 65535`.

pub use connection::{
    next_connection_id, Connection, ConnectionFactory, ConnectionId, ConnectionState,
    ConnectionStats, HandlerFactory, PacketHandler,
};
pub(crate) use connection::ReadinessNotifier;
pub use frame::{Frame, FrameDecoder, Frames, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use ring_buffer::RingBuffer;
pub use transport::{MemoryTransport, Transport};

mod connection;
mod frame;
mod ring_buffer;
mod transport;
