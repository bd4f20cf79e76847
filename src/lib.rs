//! A multi-reactor, non-blocking TCP server library built on
//! [mio](https://docs.rs/mio).
//!
//! - **One loop per thread:** a base reactor accepts connections and N
//!   worker reactors own them, picked round-robin. Every connection is
//!   driven by exactly one thread, so user callbacks never need locks for
//!   per-connection state.
//! - **Callback API:** register connection / message / write-complete
//!   callbacks on the server; they run on the owning worker loop with the
//!   connection handle, which is itself safe to use from any thread.
//! - **Backpressure built in:** output is buffered with a high-water-mark
//!   callback, write interest is leased only while data is pending, and
//!   `shutdown` defers the FIN until buffered output drains.
//! - **Configurable:** tune thread count, `SO_REUSEPORT`, and the
//!   high-water mark through the [`config`](https://docs.rs/config/) crate,
//!   with per-instance namespacing.
//!
//! # Quick Start
//!
//! An echo server with four worker reactors:
//!
//! ```no_run
//! use rustloop::{EventLoop, ServerOption, TcpServer};
//!
//! fn main() -> Result<(), rustloop::Error> {
//!     let base_loop = EventLoop::new()?;
//!     let mut server = TcpServer::new(
//!         &base_loop,
//!         "127.0.0.1:9000".parse().unwrap(),
//!         "echo",
//!         ServerOption::NoReusePort,
//!     )?;
//!     server.set_thread_num(4);
//!     server.set_connection_callback(|conn| {
//!         if conn.connected() {
//!             println!("{} is up", conn.name());
//!         } else {
//!             println!("{} is down", conn.name());
//!         }
//!     });
//!     server.set_message_callback(|conn, buffer, _at| {
//!         conn.send(buffer.retrieve_all_as_bytes());
//!     });
//!     server.start()?;
//!     base_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Threading model
//!
//! An [`EventLoop`] is bound to the thread that created it and cannot move;
//! at most one loop exists per thread. Everything reachable from a loop
//! (channels, pollers, connection internals) is owned by that thread. The
//! two types that do cross threads are [`EventLoopInterface`] — post
//! closures to a loop, wake it, quit it — and [`TcpConnection`] — send,
//! shutdown, inspect. Both are cheap clones over shared state.
//!
//! Callbacks run on the loop that owns the connection and must not block;
//! offload slow work and call [`TcpConnection::send`] with the result from
//! whatever thread it finishes on.
//!
//! # Configuration
//!
//! | Key | Description |
//! |-----|-------------|
//! | `threads` | Worker loop count (0 = single-reactor) |
//! | `reuse_port` | Set `SO_REUSEPORT` on the listen socket |
//! | `high_water_mark` | Output-buffer backpressure threshold in bytes |
//!
//! Keys may be namespaced per server name (`[echo] threads = 8`) and are
//! read by [`TcpServer::with_config`].
//!
//! Setting the `RUSTLOOP_USE_POLL` environment variable requests a
//! poll(2)-based readiness backend; this build ships only the default
//! (epoll-backed) one and logs the fallback.

pub mod buffer;
pub(crate) mod config;
pub(crate) mod error;
pub mod net;
pub mod reactor;

pub use buffer::Buffer;
pub use config::ServerConfig;
pub use error::Error;
pub use net::{
    ConnectionCallback, ConnectionState, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use net::{ServerOption, TcpServer};
pub use reactor::{
    Channel, EventLoop, EventLoopInterface, EventLoopThread, EventLoopThreadPool, Ready,
    ThreadInitCallback,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::Error;
    pub use crate::net::{ServerOption, TcpConnection, TcpServer};
    pub use crate::reactor::{EventLoop, EventLoopInterface};
}
