use rustloop::{EventLoopInterface, EventLoop, ServerOption, TcpConnection, TcpServer};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    base: EventLoopInterface,
    addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
    final_count: mpsc::Receiver<usize>,
}

/// Runs a server on its own base-loop thread and hands back the pieces the
/// test needs. The final connection-table size is reported once the loop
/// exits.
fn spawn_server(
    threads: usize,
    configure: impl FnOnce(&mut TcpServer) + Send + 'static,
) -> TestServer {
    let (ready_tx, ready_rx) = mpsc::channel();
    let (count_tx, count_rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let base_loop = EventLoop::new().expect("failed to create base loop");
        let mut server = TcpServer::new(
            &base_loop,
            "127.0.0.1:0".parse().unwrap(),
            "test",
            ServerOption::NoReusePort,
        )
        .expect("failed to create server");
        server.set_thread_num(threads);
        configure(&mut server);
        server.start().expect("failed to start server");
        ready_tx
            .send((base_loop.interface(), server.local_addr()))
            .expect("failed to publish server address");
        base_loop.run();
        let _ = count_tx.send(server.connection_count());
    });
    let (base, addr) = ready_rx.recv().expect("server thread died during startup");
    TestServer {
        base,
        addr,
        thread: Some(thread),
        final_count: count_rx,
    }
}

impl TestServer {
    /// Quits the base loop, joins, and returns the final table size.
    fn shutdown(mut self) -> usize {
        self.base.quit();
        self.thread
            .take()
            .unwrap()
            .join()
            .expect("server thread panicked");
        self.final_count.recv().expect("no final connection count")
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn echo_one_worker() {
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));

    let server = {
        let connects = connects.clone();
        let disconnects = disconnects.clone();
        spawn_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    connects.fetch_add(1, Ordering::SeqCst);
                } else {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
            });
            server.set_message_callback(|conn, buffer, _at| {
                conn.send(buffer.retrieve_all_as_bytes());
            });
        })
    };

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    client.write_all(b"hello").expect("failed to send");
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).expect("failed to read echo");
    assert_eq!(&echoed, b"hello");

    drop(client);
    wait_until("disconnect callback", || {
        disconnects.load(Ordering::SeqCst) == 1
    });
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(server.shutdown(), 0, "connection table not emptied");
}

#[test]
fn echo_single_reactor() {
    // Zero workers: accepting and connection I/O share the base loop.
    let server = spawn_server(0, |server| {
        server.set_message_callback(|conn, buffer, _at| {
            conn.send(buffer.retrieve_all_as_bytes());
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    client.write_all(b"base loop only").expect("failed to send");
    let mut echoed = [0u8; 14];
    client.read_exact(&mut echoed).expect("failed to read echo");
    assert_eq!(&echoed, b"base loop only");

    drop(client);
    thread::sleep(Duration::from_millis(300));
    server.shutdown();
}

#[test]
fn round_robin_across_three_workers() {
    let owners: Arc<Mutex<Vec<thread::ThreadId>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let owners = owners.clone();
        spawn_server(3, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    owners.lock().unwrap().push(thread::current().id());
                }
            });
        })
    };

    // Connect sequentially so arrival order is deterministic.
    let mut clients = Vec::new();
    for i in 0..6 {
        clients.push(TcpStream::connect(server.addr).expect("failed to connect"));
        let owners = owners.clone();
        wait_until("connection callback", move || owners.lock().unwrap().len() == i + 1);
    }

    let owners = owners.lock().unwrap().clone();
    assert_eq!(owners.len(), 6);
    let first_round = &owners[..3];
    assert!(
        first_round[0] != first_round[1]
            && first_round[1] != first_round[2]
            && first_round[0] != first_round[2],
        "three sequential connections should land on three distinct workers"
    );
    assert_eq!(&owners[3..], first_round, "second round must repeat the first");

    drop(clients);
    server.shutdown();
}

#[test]
fn cross_thread_send_is_fifo() {
    let slot: Arc<Mutex<Option<TcpConnection>>> = Arc::new(Mutex::new(None));

    let server = {
        let slot = slot.clone();
        spawn_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    *slot.lock().unwrap() = Some(conn.clone());
                }
            });
        })
    };

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    wait_until("connection handle", || slot.lock().unwrap().is_some());
    let conn = slot.lock().unwrap().clone().unwrap();

    // A plain thread, not an event loop: every send crosses into the
    // worker loop through its task queue.
    let sender = thread::spawn(move || {
        for i in 0..1000u32 {
            conn.send(vec![(i % 256) as u8]);
        }
    });

    let mut received = vec![0u8; 1000];
    client
        .read_exact(&mut received)
        .expect("failed to read 1000 bytes");
    let expected: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
    assert_eq!(received, expected, "cross-thread sends arrived out of order");

    sender.join().expect("sender thread panicked");
    drop(client);
    server.shutdown();
}

#[test]
fn backpressure_fires_high_water_mark_once_then_write_complete() {
    const THRESHOLD: usize = 256 * 1024;
    const BLOB: usize = 16 * 1024 * 1024;

    let hwm_calls = Arc::new(AtomicUsize::new(0));
    let hwm_size = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let server = {
        let hwm_calls = hwm_calls.clone();
        let hwm_size = hwm_size.clone();
        let write_completes = write_completes.clone();
        spawn_server(1, move |server| {
            let hwm_calls = hwm_calls.clone();
            let hwm_size = hwm_size.clone();
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    let hwm_calls = hwm_calls.clone();
                    let hwm_size = hwm_size.clone();
                    conn.set_high_water_mark_callback(
                        move |_conn, size| {
                            hwm_calls.fetch_add(1, Ordering::SeqCst);
                            hwm_size.store(size, Ordering::SeqCst);
                        },
                        THRESHOLD,
                    );
                }
            });
            server.set_message_callback(|conn, buffer, _at| {
                // Wait for the complete "go" trigger before responding.
                if buffer.readable_bytes() < 2 {
                    return;
                }
                buffer.retrieve_all();
                conn.send(vec![0x42u8; BLOB]);
            });
            server.set_write_complete_callback(move |_conn| {
                write_completes.fetch_add(1, Ordering::SeqCst);
            });
        })
    };

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    client.write_all(b"go").expect("failed to send");

    // The peer is not reading: the blob cannot fit the kernel buffers, so
    // the crossing is reported exactly once.
    wait_until("high-water-mark callback", || {
        hwm_calls.load(Ordering::SeqCst) == 1
    });
    assert!(
        hwm_size.load(Ordering::SeqCst) >= THRESHOLD,
        "reported size {} below the {} threshold",
        hwm_size.load(Ordering::SeqCst),
        THRESHOLD
    );
    assert_eq!(write_completes.load(Ordering::SeqCst), 0);

    // Now drain; write-complete must fire exactly once.
    let mut received = vec![0u8; BLOB];
    client.read_exact(&mut received).expect("failed to drain blob");
    assert!(received.iter().all(|&b| b == 0x42));
    wait_until("write-complete callback", || {
        write_completes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(hwm_calls.load(Ordering::SeqCst), 1);

    drop(client);
    server.shutdown();
}

#[test]
fn write_complete_fires_once_for_small_direct_send() {
    let write_completes = Arc::new(AtomicUsize::new(0));

    let server = {
        let write_completes = write_completes.clone();
        spawn_server(1, move |server| {
            server.set_message_callback(|conn, buffer, _at| {
                conn.send(buffer.retrieve_all_as_bytes());
            });
            server.set_write_complete_callback(move |_conn| {
                write_completes.fetch_add(1, Ordering::SeqCst);
            });
        })
    };

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    client.write_all(b"small").expect("failed to send");
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).expect("failed to read echo");
    assert_eq!(&echoed, b"small");

    // A 5-byte echo goes through the idle socket in one write, so the
    // completion comes from the direct-write path: no write interest was
    // ever enabled and nothing was buffered.
    wait_until("write-complete callback", || {
        write_completes.load(Ordering::SeqCst) == 1
    });
    // Give a duplicate every chance to surface before asserting exactly-once.
    thread::sleep(Duration::from_millis(200));
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);

    drop(client);
    server.shutdown();
}

#[test]
fn shutdown_defers_fin_until_output_drains() {
    const BLOB: usize = 8 * 1024 * 1024;

    let server = spawn_server(1, |server| {
        server.set_message_callback(|conn, buffer, _at| {
            // Wait for the complete "start" trigger before responding.
            if buffer.readable_bytes() < 5 {
                return;
            }
            buffer.retrieve_all();
            conn.send(vec![0x17u8; BLOB]);
            conn.shutdown();
            // Discarded: the connection is already disconnecting.
            conn.send(b"MORE".to_vec());
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    client.write_all(b"start").expect("failed to send");

    let mut received = Vec::new();
    client
        .read_to_end(&mut received)
        .expect("failed to read until FIN");
    assert_eq!(received.len(), BLOB, "FIN arrived early or late data leaked");
    assert!(received.iter().all(|&b| b == 0x17));

    drop(client);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(server.shutdown(), 0);
}

#[test]
fn abrupt_peer_close_removes_connection() {
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));

    let server = {
        let connects = connects.clone();
        let disconnects = disconnects.clone();
        spawn_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    connects.fetch_add(1, Ordering::SeqCst);
                } else {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
            });
        })
    };

    let client = TcpStream::connect(server.addr).expect("failed to connect");
    wait_until("connect callback", || connects.load(Ordering::SeqCst) == 1);

    // SO_LINGER 0: closing sends RST instead of FIN.
    socket2::SockRef::from(&client)
        .set_linger(Some(Duration::from_secs(0)))
        .expect("failed to set SO_LINGER");
    drop(client);

    wait_until("disconnect callback", || {
        disconnects.load(Ordering::SeqCst) == 1
    });
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        server.shutdown(),
        0,
        "reset connection still in the server table"
    );
}

#[test]
fn sequential_connections_get_unique_names() {
    let names: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let server = {
        let names = names.clone();
        spawn_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    names.lock().unwrap().push(conn.name().to_string());
                }
            });
        })
    };

    let mut clients = Vec::new();
    for i in 0..3 {
        clients.push(TcpStream::connect(server.addr).expect("failed to connect"));
        let names = names.clone();
        wait_until("connection callback", move || names.lock().unwrap().len() == i + 1);
    }

    let names = names.lock().unwrap().clone();
    let expected_prefix = format!("test-{}", server.addr);
    for (i, name) in names.iter().enumerate() {
        assert_eq!(name, &format!("{}#{}", expected_prefix, i + 1));
    }

    drop(clients);
    server.shutdown();
}

#[test]
fn data_sent_after_remote_shutdown_is_discarded() {
    let slot: Arc<Mutex<Option<TcpConnection>>> = Arc::new(Mutex::new(None));
    let disconnects = Arc::new(AtomicUsize::new(0));

    let server = {
        let slot = slot.clone();
        let disconnects = disconnects.clone();
        spawn_server(1, move |server| {
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    *slot.lock().unwrap() = Some(conn.clone());
                } else {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                }
            });
        })
    };

    let client = TcpStream::connect(server.addr).expect("failed to connect");
    wait_until("connection handle", || slot.lock().unwrap().is_some());
    let conn = slot.lock().unwrap().clone().unwrap();
    assert!(conn.connected());

    drop(client);
    wait_until("disconnect callback", || {
        disconnects.load(Ordering::SeqCst) == 1
    });
    assert!(conn.disconnected());

    // Late send on a dead handle: silently dropped, no panic, no effect.
    conn.send(b"too late".to_vec());

    thread::sleep(Duration::from_millis(300));
    server.shutdown();
}

#[test]
fn client_read_error_is_clean_after_server_quits() {
    let server = spawn_server(1, |server| {
        server.set_message_callback(|conn, buffer, _at| {
            conn.send(buffer.retrieve_all_as_bytes());
        });
    });

    let mut client = TcpStream::connect(server.addr).expect("failed to connect");
    client.write_all(b"ping").expect("failed to send");
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).expect("failed to read echo");

    server.shutdown();

    // The worker loops tore the connection down on exit; the client sees
    // an orderly close or a reset, never a hang.
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut rest = Vec::new();
    match client.read_to_end(&mut rest) {
        Ok(_) => {}
        Err(err) => assert!(
            matches!(err.kind(), ErrorKind::ConnectionReset | ErrorKind::WouldBlock | ErrorKind::TimedOut),
            "unexpected error kind: {err:?}"
        ),
    }
}
