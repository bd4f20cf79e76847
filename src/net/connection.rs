//! Per-connection state machine, send path, and teardown.
//!
//! A connection is split in two, which is how the thread-affinity rule
//! becomes a compile-time property instead of a comment:
//!
//! - [`TcpConnection`] is the public handle: cheap to clone, `Send + Sync`,
//!   safe to use from any thread. It carries the connection's identity and
//!   state, and posts all real work to the owning worker loop.
//! - [`ConnectionInner`] is the loop-owned half: the socket, the channel,
//!   and both buffers. It lives in a registry local to the owner loop's
//!   thread and is only ever touched there.
//!
//! Registry entries are keyed by descriptor and verified against the
//! handle's identity on every lookup, so a handle that outlives its
//! connection can never reach a recycled descriptor.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::net::sockets;
use crate::reactor::{Channel, EventLoop, EventLoopInterface};

/// Output-buffer size at which the high-water-mark callback fires, unless
/// overridden.
pub(crate) const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Invoked when a connection is established and again when it disconnects;
/// distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Invoked on the owner loop with the input buffer after every successful
/// read. Consume what you can and leave the rest buffered.
pub type MessageCallback = Arc<dyn Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync>;

/// Invoked once each time the output buffer fully drains.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Invoked with the would-be output-buffer size when a send crosses the
/// high-water mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnection, usize) + Send + Sync>;

/// Wired by the server to drop the connection from its table.
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnection) + Send + Sync>;

/// Lifecycle of a connection. Only the owning worker loop moves a
/// connection forward; other threads merely observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepted but not yet handed to its worker loop.
    Connecting = 0,
    /// Live; reads are enabled and sends are accepted.
    Connected = 1,
    /// Shutdown requested; pending output still drains, then FIN.
    Disconnecting = 2,
    /// Fully torn down.
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

struct ConnectionShared {
    name: String,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    fd: RawFd,
    state: AtomicU8,
    event_loop: EventLoopInterface,
}

impl ConnectionShared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Handle to one established TCP connection.
///
/// Handed to every user callback; clones may be stashed and used from any
/// thread. [`send`](Self::send) and [`shutdown`](Self::shutdown) are safe
/// cross-thread: work is forwarded to the owning worker loop, in FIFO
/// order per loop.
#[derive(Clone)]
pub struct TcpConnection {
    shared: Arc<ConnectionShared>,
}

impl TcpConnection {
    pub(crate) fn new(
        name: String,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        fd: RawFd,
        event_loop: EventLoopInterface,
    ) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                name,
                local_addr,
                peer_addr,
                fd,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                event_loop,
            }),
        }
    }

    /// The server-assigned name, `"<server>-<ip:port>#<seq>"`.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_address(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    /// The worker loop this connection lives on.
    pub fn owner_loop(&self) -> &EventLoopInterface {
        &self.shared.event_loop
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Sends `data`, from any thread.
    ///
    /// On the owner loop this writes directly to the socket and buffers any
    /// remainder; from other threads the write is posted to the owner loop.
    /// Data sent after [`shutdown`](Self::shutdown) is discarded.
    pub fn send(&self, data: impl Into<Vec<u8>>) {
        if !self.connected() {
            debug!(name = %self.name(), "send on a connection that is not connected");
            return;
        }
        let data = data.into();
        let handle = self.clone();
        self.shared.event_loop.run_in_loop(move |event_loop| {
            with_connection(&handle, |inner| {
                ConnectionInner::send_in_loop(inner, event_loop, &data);
            });
        });
    }

    /// Closes the write half once pending output has drained.
    ///
    /// The FIN is deferred until the output buffer empties; reads stay
    /// enabled so the peer's close is still observed.
    pub fn shutdown(&self) {
        let transitioned = self.shared.state.compare_exchange(
            ConnectionState::Connected as u8,
            ConnectionState::Disconnecting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if transitioned.is_ok() {
            let handle = self.clone();
            self.shared.event_loop.run_in_loop(move |event_loop| {
                with_connection(&handle, |inner| {
                    ConnectionInner::shutdown_in_loop(inner, event_loop);
                });
            });
        }
    }

    /// Installs the backpressure callback and its threshold.
    ///
    /// The callback fires once per crossing: when a send pushes the output
    /// buffer from below `threshold` to at or above it.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnection, usize) + Send + Sync + 'static,
        threshold: usize,
    ) {
        let cb: HighWaterMarkCallback = Arc::new(cb);
        let handle = self.clone();
        self.shared.event_loop.run_in_loop(move |_event_loop| {
            with_connection(&handle, |inner| {
                let mut inner = inner.borrow_mut();
                inner.high_water_mark = threshold;
                inner.high_water_mark_cb = Some(cb);
            });
        });
    }

    fn same_connection(&self, other: &TcpConnection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.shared.name)
            .field("peer", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything a new connection needs before its first event, shippable
/// across threads to the worker loop.
pub(crate) struct PendingConnection {
    pub handle: TcpConnection,
    pub socket: TcpStream,
    pub connection_cb: Option<ConnectionCallback>,
    pub message_cb: Option<MessageCallback>,
    pub write_complete_cb: Option<WriteCompleteCallback>,
    pub close_cb: CloseCallback,
    pub high_water_mark: usize,
}

thread_local! {
    /// Connections owned by this thread's loop, keyed by descriptor. One
    /// loop per thread makes thread-local exactly loop-local.
    static CONNECTIONS: RefCell<HashMap<RawFd, Rc<RefCell<ConnectionInner>>>> =
        RefCell::new(HashMap::new());
}

fn lookup_connection(handle: &TcpConnection) -> Option<Rc<RefCell<ConnectionInner>>> {
    let inner = CONNECTIONS.with(|table| table.borrow().get(&handle.shared.fd).cloned());
    inner.filter(|inner| inner.borrow().handle.same_connection(handle))
}

fn with_connection(handle: &TcpConnection, f: impl FnOnce(&Rc<RefCell<ConnectionInner>>)) {
    match lookup_connection(handle) {
        Some(inner) => f(&inner),
        None => debug!(name = %handle.name(), "connection no longer owned by this loop"),
    }
}

/// The loop-owned half of a connection.
pub(crate) struct ConnectionInner {
    handle: TcpConnection,
    socket: TcpStream,
    channel: Rc<RefCell<Channel>>,
    input_buffer: Buffer,
    output_buffer: Buffer,
    high_water_mark: usize,
    connection_cb: Option<ConnectionCallback>,
    message_cb: Option<MessageCallback>,
    write_complete_cb: Option<WriteCompleteCallback>,
    high_water_mark_cb: Option<HighWaterMarkCallback>,
    close_cb: Option<CloseCallback>,
}

impl ConnectionInner {
    /// Builds the loop-owned half on the worker thread, registers it, and
    /// delivers the connection callback. Posted by the server right after
    /// accept.
    pub fn connect_established(event_loop: &EventLoop, pending: PendingConnection) {
        event_loop.assert_in_loop_thread();
        assert_eq!(
            pending.handle.state(),
            ConnectionState::Connecting,
            "connection established twice"
        );

        let fd = pending.socket.as_raw_fd();
        sockets::set_keepalive(&pending.socket, true);
        if let Err(err) = pending.socket.set_nodelay(true) {
            warn!(?err, "failed to set TCP_NODELAY");
        }

        let channel = Rc::new(RefCell::new(Channel::new(fd)));
        let handle = pending.handle.clone();
        let inner = Rc::new(RefCell::new(ConnectionInner {
            handle: handle.clone(),
            socket: pending.socket,
            channel: channel.clone(),
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
            high_water_mark: pending.high_water_mark,
            connection_cb: pending.connection_cb,
            message_cb: pending.message_cb,
            write_complete_cb: pending.write_complete_cb,
            high_water_mark_cb: None,
            close_cb: Some(pending.close_cb),
        }));

        {
            let mut ch = channel.borrow_mut();
            let weak = Rc::downgrade(&inner);
            ch.set_read_callback({
                let weak = weak.clone();
                Box::new(move |event_loop, at| {
                    if let Some(inner) = weak.upgrade() {
                        ConnectionInner::handle_read(&inner, event_loop, at);
                    }
                })
            });
            ch.set_write_callback({
                let weak = weak.clone();
                Box::new(move |event_loop| {
                    if let Some(inner) = weak.upgrade() {
                        ConnectionInner::handle_write(&inner, event_loop);
                    }
                })
            });
            ch.set_close_callback({
                let weak = weak.clone();
                Box::new(move |event_loop| {
                    if let Some(inner) = weak.upgrade() {
                        ConnectionInner::handle_close(&inner, event_loop);
                    }
                })
            });
            ch.set_error_callback(Box::new(move |_event_loop| {
                if let Some(inner) = weak.upgrade() {
                    ConnectionInner::handle_error(&inner);
                }
            }));
            // The tie keeps the connection alive for the span of a dispatch
            // even if teardown races it.
            let owner: Rc<dyn Any> = inner.clone();
            ch.tie(Rc::downgrade(&owner));
        }

        let previous = CONNECTIONS.with(|table| table.borrow_mut().insert(fd, inner.clone()));
        debug_assert!(previous.is_none(), "descriptor already registered");

        handle.shared.set_state(ConnectionState::Connected);
        info!(name = %handle.name(), peer = %handle.peer_address(), "connection established");
        Channel::enable_reading(&channel, event_loop);

        let connection_cb = inner.borrow().connection_cb.clone();
        if let Some(cb) = connection_cb {
            cb(&handle);
        }
    }

    /// Final teardown on the owner loop. Posted by the server after the
    /// connection left its table, and by server drop for every survivor.
    pub fn connect_destroyed(event_loop: &EventLoop, handle: &TcpConnection) {
        event_loop.assert_in_loop_thread();
        let inner = CONNECTIONS.with(|table| {
            let mut table = table.borrow_mut();
            let matches = table
                .get(&handle.shared.fd)
                .map(|inner| inner.borrow().handle.same_connection(handle))
                .unwrap_or(false);
            if matches {
                table.remove(&handle.shared.fd)
            } else {
                None
            }
        });
        let Some(inner) = inner else {
            debug!(name = %handle.name(), "connection already destroyed");
            return;
        };

        if handle.state() == ConnectionState::Connected {
            // Forced teardown without a prior close event.
            handle.shared.set_state(ConnectionState::Disconnected);
            let channel = inner.borrow().channel.clone();
            Channel::disable_all(&channel, event_loop);
            let connection_cb = inner.borrow().connection_cb.clone();
            if let Some(cb) = connection_cb {
                cb(handle);
            }
        }
        let channel = inner.borrow().channel.clone();
        Channel::remove(&channel, event_loop);
        debug_assert!(!event_loop.has_channel(&channel));
        info!(name = %handle.name(), "connection destroyed");
        // Dropping the last owner closes the socket.
    }

    fn handle_read(inner: &Rc<RefCell<ConnectionInner>>, event_loop: &EventLoop, at: Instant) {
        // Edge-triggered backend: drain the socket completely, then deliver
        // everything that arrived as one message callback.
        let mut total = 0;
        let mut eof = false;
        let mut failed = false;
        loop {
            let result = {
                let inner = &mut *inner.borrow_mut();
                inner.input_buffer.read_from(&mut inner.socket)
            };
            match result {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    trace!(n, "read from connection");
                    total += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(name = %inner.borrow().handle.name(), ?err, "read failed");
                    failed = true;
                    break;
                }
            }
        }

        if total > 0 {
            let (cb, handle) = {
                let inner = inner.borrow();
                (inner.message_cb.clone(), inner.handle.clone())
            };
            match cb {
                Some(cb) => {
                    // The buffer is moved out for the callback so user code
                    // can call send()/shutdown() on this same connection
                    // without hitting an outstanding borrow.
                    let mut input = std::mem::take(&mut inner.borrow_mut().input_buffer);
                    cb(&handle, &mut input, at);
                    inner.borrow_mut().input_buffer = input;
                }
                None => inner.borrow_mut().input_buffer.retrieve_all(),
            }
        }

        if eof {
            Self::handle_close(inner, event_loop);
        } else if failed {
            Self::handle_error(inner);
            Self::handle_close(inner, event_loop);
        }
    }

    /// Sends on the owner loop: direct write when the pipe is idle, then
    /// buffer the remainder and lease write interest until it drains.
    fn send_in_loop(inner: &Rc<RefCell<ConnectionInner>>, event_loop: &EventLoop, data: &[u8]) {
        let inner = &mut *inner.borrow_mut();
        if inner.handle.state() == ConnectionState::Disconnected {
            warn!(name = %inner.handle.name(), "disconnected, give up writing");
            return;
        }

        let len = data.len();
        let mut wrote = 0;
        let mut fault = false;

        // Write interest off and nothing buffered: try the socket directly.
        if !inner.channel.borrow().is_writing() && inner.output_buffer.readable_bytes() == 0 {
            match inner.socket.write(data) {
                Ok(n) => {
                    wrote = n;
                    trace!(wrote, len, "direct write");
                    if wrote == len {
                        if let Some(cb) = inner.write_complete_cb.clone() {
                            let handle = inner.handle.clone();
                            event_loop.queue_in_loop(move |_| cb(&handle));
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(name = %inner.handle.name(), ?err, "direct write failed");
                    if matches!(
                        err.kind(),
                        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = len - wrote;
        if remaining > 0 && !fault {
            let old_len = inner.output_buffer.readable_bytes();
            if old_len + remaining >= inner.high_water_mark && old_len < inner.high_water_mark {
                if let Some(cb) = inner.high_water_mark_cb.clone() {
                    let handle = inner.handle.clone();
                    let total = old_len + remaining;
                    event_loop.queue_in_loop(move |_| cb(&handle, total));
                }
            }
            inner.output_buffer.append(&data[wrote..]);
            if !inner.channel.borrow().is_writing() {
                let channel = inner.channel.clone();
                Channel::enable_writing(&channel, event_loop);
            }
        }
    }

    /// Drains the output buffer when the kernel reports room. The
    /// edge-triggered backend reports writability once, so this keeps
    /// writing until the buffer empties or the socket pushes back. Write
    /// interest is dropped the moment the buffer empties, so a mostly-idle
    /// connection does not spin on writability.
    fn handle_write(inner: &Rc<RefCell<ConnectionInner>>, event_loop: &EventLoop) {
        let mut finish_shutdown = false;
        {
            let inner = &mut *inner.borrow_mut();
            if !inner.channel.borrow().is_writing() {
                trace!(name = %inner.handle.name(), "stale writable event, channel is not writing");
                return;
            }
            loop {
                match inner.output_buffer.write_to(&mut inner.socket) {
                    Ok(0) => {
                        warn!(name = %inner.handle.name(), "write returned zero with output pending");
                        break;
                    }
                    Ok(n) => {
                        trace!(n, remaining = inner.output_buffer.readable_bytes() - n, "flushed output");
                        inner.output_buffer.retrieve(n);
                        if inner.output_buffer.readable_bytes() == 0 {
                            let channel = inner.channel.clone();
                            Channel::disable_writing(&channel, event_loop);
                            if let Some(cb) = inner.write_complete_cb.clone() {
                                let handle = inner.handle.clone();
                                event_loop.queue_in_loop(move |_| cb(&handle));
                            }
                            if inner.handle.state() == ConnectionState::Disconnecting {
                                finish_shutdown = true;
                            }
                            break;
                        }
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        // The reset that caused this also surfaces as a
                        // readiness event, which tears the connection down.
                        error!(name = %inner.handle.name(), ?err, "write failed");
                        break;
                    }
                }
            }
        }
        if finish_shutdown {
            Self::shutdown_in_loop(inner, event_loop);
        }
    }

    /// Sends the FIN now if the output buffer is idle; otherwise the final
    /// flush in `handle_write` finishes the job.
    fn shutdown_in_loop(inner: &Rc<RefCell<ConnectionInner>>, event_loop: &EventLoop) {
        event_loop.assert_in_loop_thread();
        let inner = inner.borrow();
        if !inner.channel.borrow().is_writing() {
            if let Err(err) = inner.socket.shutdown(std::net::Shutdown::Write) {
                warn!(name = %inner.handle.name(), ?err, "shutdown failed");
            }
        }
    }

    fn handle_close(inner: &Rc<RefCell<ConnectionInner>>, event_loop: &EventLoop) {
        if inner.borrow().handle.state() == ConnectionState::Disconnected {
            // Error and hangup paths can both land here in one dispatch.
            return;
        }
        let (handle, channel, connection_cb, close_cb) = {
            let inner = inner.borrow();
            (
                inner.handle.clone(),
                inner.channel.clone(),
                inner.connection_cb.clone(),
                inner.close_cb.clone(),
            )
        };
        info!(name = %handle.name(), state = ?handle.state(), "connection closed by peer");
        handle.shared.set_state(ConnectionState::Disconnected);
        Channel::disable_all(&channel, event_loop);

        if let Some(cb) = connection_cb {
            cb(&handle);
        }
        // Wired to TcpServer::remove_connection; eventually posts
        // connect_destroyed back to this loop.
        if let Some(cb) = close_cb {
            cb(&handle);
        }
    }

    fn handle_error(inner: &Rc<RefCell<ConnectionInner>>) {
        let inner = inner.borrow();
        let err = inner.socket.take_error().ok().flatten();
        error!(name = %inner.handle.name(), ?err, "connection error");
    }
}
