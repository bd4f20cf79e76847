//! Character-generator server: floods every client with a rolling pattern
//! as fast as it will read it.
//!
//! Exercises the whole send path under sustained pressure: the
//! write-complete callback immediately refills the output buffer, and the
//! high-water-mark callback reports when a slow client lets it pile up.
//!
//! Run with `cargo run --example chargen [addr]`, then
//! `nc 127.0.0.1 9001 | pv > /dev/null` to watch throughput.

use rustloop::{EventLoop, ServerOption, TcpConnection, TcpServer};

fn pattern_block() -> Vec<u8> {
    // The classic RFC 864 rotating printable-character pattern.
    let mut block = Vec::with_capacity(72 * 95);
    for shift in 0..95u8 {
        for col in 0..72u8 {
            block.push(33 + (shift + col) % 95);
        }
        block.push(b'\n');
    }
    block
}

fn refill(conn: &TcpConnection, block: &[u8]) {
    conn.send(block.to_vec());
}

fn main() -> Result<(), rustloop::Error> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9001".to_string());
    let block = pattern_block();

    let base_loop = EventLoop::new()?;
    let mut server = TcpServer::new(
        &base_loop,
        addr.parse().expect("invalid listen address"),
        "chargen",
        ServerOption::NoReusePort,
    )?;
    server.set_thread_num(2);
    server.set_high_water_mark(4 * 1024 * 1024);

    let connect_block = block.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            println!("{} up", conn.name());
            conn.set_high_water_mark_callback(
                |conn, size| println!("{} is slow, {} bytes queued", conn.name(), size),
                4 * 1024 * 1024,
            );
            refill(conn, &connect_block);
        } else {
            println!("{} down", conn.name());
        }
    });
    server.set_message_callback(|_conn, buffer, _at| {
        // Input is noise for a chargen service.
        buffer.retrieve_all();
    });
    let complete_block = block;
    server.set_write_complete_callback(move |conn| refill(conn, &complete_block));

    server.start()?;
    println!("chargen server listening on {}", server.local_addr());
    base_loop.run();
    Ok(())
}
