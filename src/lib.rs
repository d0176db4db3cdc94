pub mod multiplexer;
pub mod network;
pub mod service;

pub use multiplexer::{Backend, BackendKind, Interest, MemoryBackend, Multiplexer, WorkerPool};
pub use network::{
    Connection, ConnectionFactory, ConnectionId, ConnectionState, Frame, FrameDecoder,
    HandlerFactory, PacketHandler, RingBuffer,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Server, ServerConfig, ServerHandle,
    Shutdown,
};
