//! Minimal echo server.
//!
//! Run with `cargo run --example echo [addr]` (default 127.0.0.1:9000),
//! then poke it with `nc 127.0.0.1 9000`. Four worker reactors handle the
//! connections; the main thread runs the base loop and the acceptor.

use rustloop::{EventLoop, ServerOption, TcpServer};

fn main() -> Result<(), rustloop::Error> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9000".to_string());

    let base_loop = EventLoop::new()?;
    let mut server = TcpServer::new(
        &base_loop,
        addr.parse().expect("invalid listen address"),
        "echo",
        ServerOption::NoReusePort,
    )?;
    server.set_thread_num(4);
    server.set_connection_callback(|conn| {
        if conn.connected() {
            println!("{} up from {}", conn.name(), conn.peer_address());
        } else {
            println!("{} down", conn.name());
        }
    });
    server.set_message_callback(|conn, buffer, _at| {
        conn.send(buffer.retrieve_all_as_bytes());
    });

    server.start()?;
    println!("echo server listening on {}", server.local_addr());
    base_loop.run();
    Ok(())
}
