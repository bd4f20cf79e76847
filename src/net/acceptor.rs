//! Listening socket plus its channel on the base loop.

use std::cell::RefCell;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::error::Error;
use crate::net::sockets;
use crate::reactor::{Channel, EventLoop};

/// Invoked on the base loop with each accepted stream and its peer address.
pub(crate) type NewConnectionCallback = Box<dyn FnMut(&EventLoop, TcpStream, SocketAddr)>;

/// Owns the listen descriptor and hands accepted descriptors to the
/// dispatcher.
///
/// The socket is created, configured, and bound at construction time so
/// address errors surface early; the kernel listen happens in
/// [`listen`](Acceptor::listen), on the base loop.
pub(crate) struct Acceptor {
    fd: RawFd,
    socket: Option<socket2::Socket>,
    listener: Option<TcpListener>,
    channel: Rc<RefCell<Channel>>,
    new_connection_cb: Option<NewConnectionCallback>,
    local_addr: SocketAddr,
    listening: bool,
}

impl Acceptor {
    pub fn new(addr: SocketAddr, reuse_port: bool) -> Result<Rc<RefCell<Acceptor>>, Error> {
        let socket = sockets::bind_listen_socket(addr, reuse_port)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::InvalidAddress)?;
        let fd = socket.as_raw_fd();

        let acceptor = Rc::new(RefCell::new(Acceptor {
            fd,
            socket: Some(socket),
            listener: None,
            channel: Rc::new(RefCell::new(Channel::new(fd))),
            new_connection_cb: None,
            local_addr,
            listening: false,
        }));

        let weak = Rc::downgrade(&acceptor);
        acceptor
            .borrow()
            .channel
            .borrow_mut()
            .set_read_callback(Box::new(move |event_loop, _at| {
                if let Some(acceptor) = weak.upgrade() {
                    Acceptor::handle_read(&acceptor, event_loop);
                }
            }));

        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn set_new_connection_callback(&mut self, cb: NewConnectionCallback) {
        self.new_connection_cb = Some(cb);
    }

    /// Issues the kernel listen and starts watching for connections.
    pub fn listen(this: &Rc<RefCell<Acceptor>>, event_loop: &EventLoop) -> Result<(), Error> {
        event_loop.assert_in_loop_thread();
        let channel = {
            let mut acceptor = this.borrow_mut();
            let socket = acceptor
                .socket
                .take()
                .expect("acceptor already listening");
            socket.listen(libc::SOMAXCONN)?;
            acceptor.listener = Some(TcpListener::from_std(socket.into()));
            acceptor.listening = true;
            info!(local_addr = %acceptor.local_addr, "listening for connections");
            acceptor.channel.clone()
        };
        Channel::enable_reading(&channel, event_loop);
        Ok(())
    }

    /// Drains the backlog. The readiness backend is edge-triggered, so
    /// every pending connection must be accepted before returning; stopping
    /// early would strand the rest until the next inbound connection.
    fn handle_read(this: &Rc<RefCell<Acceptor>>, event_loop: &EventLoop) {
        loop {
            let accepted = {
                let acceptor = this.borrow();
                let listener = acceptor
                    .listener
                    .as_ref()
                    .expect("readable acceptor without listener");
                listener.accept()
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let cb = this.borrow_mut().new_connection_cb.take();
                    match cb {
                        Some(mut cb) => {
                            cb(event_loop, stream, peer_addr);
                            let mut acceptor = this.borrow_mut();
                            if acceptor.new_connection_cb.is_none() {
                                acceptor.new_connection_cb = Some(cb);
                            }
                        }
                        // Nobody to hand the descriptor to; dropping closes it.
                        None => drop(stream),
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == ErrorKind::ConnectionAborted
                        || err.kind() == ErrorKind::ConnectionReset =>
                {
                    // The peer gave up while queued; skip it.
                    warn!(?err, "transient accept error");
                    continue;
                }
                Err(err) => {
                    error!(fd = this.borrow().fd, ?err, "accept failed");
                    if err.raw_os_error() == Some(libc::EMFILE) {
                        error!("file descriptor limit reached while accepting");
                    }
                    break;
                }
            }
        }
    }

    /// Stops watching and forgets the listen channel. Must run on the base
    /// loop's thread.
    pub fn teardown(this: &Rc<RefCell<Acceptor>>, event_loop: &EventLoop) {
        let channel = this.borrow().channel.clone();
        Channel::disable_all(&channel, event_loop);
        Channel::remove(&channel, event_loop);
        this.borrow_mut().listening = false;
    }
}
