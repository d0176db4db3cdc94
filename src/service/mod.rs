pub use app_error::{AppError, AppResult};
pub use config::{BufferConfig, MultiplexerConfig, NetworkConfig, ServerConfig};
pub use listener::Listener;
pub use server::{Server, ServerHandle};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod listener;
mod server;
mod shutdown;
mod tracing_config;
