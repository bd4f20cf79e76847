//! TCP networking on top of the reactor core: acceptor, connections, and
//! the server façade.

mod acceptor;
mod connection;
mod server;
mod sockets;

pub use connection::{
    ConnectionCallback, ConnectionState, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use server::{ServerOption, TcpServer};
