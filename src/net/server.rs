//! The server façade wiring acceptor, worker pool, and connections together.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::net::TcpStream;
use tracing::{error, info};

use crate::buffer::Buffer;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::net::acceptor::Acceptor;
use crate::net::connection::{
    CloseCallback, ConnectionCallback, ConnectionInner, MessageCallback, PendingConnection,
    TcpConnection, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::reactor::{EventLoop, EventLoopInterface, EventLoopThreadPool, ThreadInitCallback};

/// Whether the listening socket sets `SO_REUSEPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

#[derive(Default, Clone)]
struct UserCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

type ConnectionTable = Arc<Mutex<HashMap<String, TcpConnection>>>;

/// Multi-reactor TCP server.
///
/// The base loop (the one the server is created on) runs the acceptor; N
/// worker loops own the established connections, handed out round-robin.
/// With [`set_thread_num`](Self::set_thread_num) left at zero everything
/// shares the base loop.
///
/// ```no_run
/// use rustloop::{EventLoop, ServerOption, TcpServer};
///
/// let base_loop = EventLoop::new().expect("failed to create event loop");
/// let mut server = TcpServer::new(
///     &base_loop,
///     "127.0.0.1:9000".parse().unwrap(),
///     "echo",
///     ServerOption::NoReusePort,
/// )
/// .expect("failed to create server");
/// server.set_thread_num(4);
/// server.set_message_callback(|conn, buffer, _at| {
///     conn.send(buffer.retrieve_all_as_bytes());
/// });
/// server.start().expect("failed to start server");
/// base_loop.run();
/// ```
pub struct TcpServer {
    base_loop: EventLoopInterface,
    name: String,
    local_addr: SocketAddr,
    acceptor: Rc<RefCell<Acceptor>>,
    pool: Rc<RefCell<EventLoopThreadPool>>,
    connections: ConnectionTable,
    callbacks: Rc<RefCell<UserCallbacks>>,
    thread_init_cb: Option<ThreadInitCallback>,
    high_water_mark: Rc<Cell<usize>>,
    started: Cell<bool>,
}

impl TcpServer {
    /// Creates a server listening on `listen_addr`, attached to the base
    /// loop of the calling thread. Must be called on that loop's thread.
    ///
    /// The socket is created and bound here (binding `port 0` resolves the
    /// ephemeral port immediately); listening starts with
    /// [`start`](Self::start).
    pub fn new(
        base_loop: &Rc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> Result<TcpServer, Error> {
        base_loop.assert_in_loop_thread();
        let name = name.into();
        let acceptor = Acceptor::new(listen_addr, option == ServerOption::ReusePort)?;
        let local_addr = acceptor.borrow().local_addr();
        let pool = Rc::new(RefCell::new(EventLoopThreadPool::new(
            base_loop.interface(),
            name.clone(),
        )));
        let connections: ConnectionTable = Arc::new(Mutex::new(HashMap::new()));
        let callbacks = Rc::new(RefCell::new(UserCallbacks::default()));
        let high_water_mark = Rc::new(Cell::new(DEFAULT_HIGH_WATER_MARK));

        let new_connection_cb = {
            let pool = pool.clone();
            let connections = connections.clone();
            let callbacks = callbacks.clone();
            let high_water_mark = high_water_mark.clone();
            let base_loop = base_loop.interface();
            let name = name.clone();
            let ip_port = local_addr.to_string();
            let mut next_conn_id: u64 = 1;
            move |_event_loop: &EventLoop, socket: TcpStream, peer_addr: SocketAddr| {
                let io_loop = pool.borrow_mut().get_next_loop();
                let conn_name = format!("{name}-{ip_port}#{next_conn_id}");
                next_conn_id += 1;
                info!(server = %name, connection = %conn_name, %peer_addr, "new connection");

                let local_addr = socket.local_addr().unwrap_or_else(|err| {
                    error!(?err, "failed to read accepted socket's local address");
                    SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
                });
                let handle = TcpConnection::new(
                    conn_name.clone(),
                    local_addr,
                    peer_addr,
                    socket.as_raw_fd(),
                    io_loop.clone(),
                );
                connections
                    .lock()
                    .expect("connection table poisoned")
                    .insert(conn_name, handle.clone());

                let user = callbacks.borrow().clone();
                let close_cb: CloseCallback = {
                    let base_loop = base_loop.clone();
                    let connections = connections.clone();
                    Arc::new(move |conn: &TcpConnection| {
                        TcpServer::remove_connection(&base_loop, &connections, conn);
                    })
                };
                let pending = PendingConnection {
                    handle,
                    socket,
                    connection_cb: user.connection,
                    message_cb: user.message,
                    write_complete_cb: user.write_complete,
                    close_cb,
                    high_water_mark: high_water_mark.get(),
                };
                io_loop.run_in_loop(move |event_loop| {
                    ConnectionInner::connect_established(event_loop, pending);
                });
            }
        };
        acceptor
            .borrow_mut()
            .set_new_connection_callback(Box::new(new_connection_cb));

        Ok(TcpServer {
            base_loop: base_loop.interface(),
            name,
            local_addr,
            acceptor,
            pool,
            connections,
            callbacks,
            thread_init_cb: None,
            high_water_mark,
            started: Cell::new(false),
        })
    }

    /// Like [`new`](Self::new), with `threads`, `reuse_port`, and
    /// `high_water_mark` read from `config` under the server's name (see
    /// [`ServerConfig`]).
    pub fn with_config(
        base_loop: &Rc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        config: &::config::Config,
    ) -> Result<TcpServer, Error> {
        let name = name.into();
        let server_config = ServerConfig::from_config(config, &name);
        let option = if server_config.reuse_port.unwrap_or(false) {
            ServerOption::ReusePort
        } else {
            ServerOption::NoReusePort
        };
        let mut server = TcpServer::new(base_loop, listen_addr, name, option)?;
        if let Some(threads) = server_config.threads {
            server.set_thread_num(threads);
        }
        if let Some(high_water_mark) = server_config.high_water_mark {
            server.set_high_water_mark(high_water_mark);
        }
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound listen address (with the real port when `:0` was asked).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections in the server's table.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connection table poisoned")
            .len()
    }

    /// Number of worker loops; zero (the default) means single-reactor.
    /// Must be called before [`start`](Self::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.pool.borrow_mut().set_thread_num(num_threads);
    }

    /// Callback run once on each worker loop (on its own thread) before it
    /// starts serving.
    pub fn set_thread_init_callback(
        &mut self,
        cb: impl Fn(&EventLoop) + Send + Sync + 'static,
    ) {
        self.thread_init_cb = Some(Arc::new(cb));
    }

    /// Callback for connection establishment and disconnection.
    pub fn set_connection_callback(&mut self, cb: impl Fn(&TcpConnection) + Send + Sync + 'static) {
        self.callbacks.borrow_mut().connection = Some(Arc::new(cb));
    }

    /// Callback for inbound data.
    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.callbacks.borrow_mut().message = Some(Arc::new(cb));
    }

    /// Callback for the output buffer draining completely.
    pub fn set_write_complete_callback(
        &mut self,
        cb: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) {
        self.callbacks.borrow_mut().write_complete = Some(Arc::new(cb));
    }

    /// Default backpressure threshold for new connections.
    pub fn set_high_water_mark(&mut self, bytes: usize) {
        self.high_water_mark.set(bytes);
    }

    /// Starts the worker pool and begins listening. Idempotent; must be
    /// called on the base loop's thread.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started.replace(true) {
            return Ok(());
        }
        let event_loop = EventLoop::current().expect("start() must run on the base loop's thread");
        assert!(
            event_loop.interface().same_loop(&self.base_loop),
            "start() must run on the base loop's thread"
        );
        self.pool.borrow_mut().start(self.thread_init_cb.clone());
        Acceptor::listen(&self.acceptor, &event_loop)?;
        info!(server = %self.name, addr = %self.local_addr, "server started");
        Ok(())
    }

    /// Erases the connection from the table (on the base loop) and queues
    /// the final teardown back onto the connection's worker loop.
    fn remove_connection(
        base_loop: &EventLoopInterface,
        connections: &ConnectionTable,
        conn: &TcpConnection,
    ) {
        let connections = connections.clone();
        let conn = conn.clone();
        base_loop.run_in_loop(move |_event_loop| {
            info!(connection = %conn.name(), "removing connection");
            connections
                .lock()
                .expect("connection table poisoned")
                .remove(conn.name());
            let io_loop = conn.owner_loop().clone();
            io_loop.queue_in_loop(move |event_loop| {
                ConnectionInner::connect_destroyed(event_loop, &conn);
            });
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!(server = %self.name, "server shutting down");
        let connections: Vec<TcpConnection> = self
            .connections
            .lock()
            .expect("connection table poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_in_loop(move |event_loop| {
                ConnectionInner::connect_destroyed(event_loop, &conn);
            });
        }
        if self.base_loop.is_in_loop_thread() {
            if let Some(event_loop) = EventLoop::current() {
                if event_loop.interface().same_loop(&self.base_loop)
                    && self.acceptor.borrow().listening()
                {
                    Acceptor::teardown(&self.acceptor, &event_loop);
                }
            }
        }
        // Dropping the pool quits every worker loop and joins its thread;
        // the teardown tasks queued above run before the loops exit.
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("started", &self.started.get())
            .finish_non_exhaustive()
    }
}
