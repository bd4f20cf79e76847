//! Binding between one file descriptor and its event callbacks.
//!
//! A [`Channel`] records which readiness events a descriptor is interested
//! in, which events the poller last reported for it, and the callbacks that
//! turn those events into work. Channels never perform I/O themselves; the
//! owning object (acceptor, connection, or user code) installs closures and
//! the owning [`EventLoop`] invokes [`Channel::handle_event`] after each
//! poll cycle.
//!
//! A channel must only ever be touched from its owner loop's thread. The
//! interest mutators go through the loop, which asserts exactly that.

use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Instant;

use mio::Interest;
use tracing::trace;

use crate::reactor::event_loop::EventLoop;

/// Readiness bits reported by the poller for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    const READABLE: u8 = 0b0000_0001;
    const WRITABLE: u8 = 0b0000_0010;
    const ERROR: u8 = 0b0000_0100;
    const HUP: u8 = 0b0000_1000;
    const PRIORITY: u8 = 0b0001_0000;

    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        let mut bits = 0;
        if event.is_readable() {
            bits |= Self::READABLE;
        }
        if event.is_writable() {
            bits |= Self::WRITABLE;
        }
        if event.is_error() {
            bits |= Self::ERROR;
        }
        // Plain EPOLLHUP surfaces in mio as both halves closed. A read-only
        // FIN (EPOLLRDHUP) must not count: pending input still gets drained
        // first and the read callback observes EOF naturally.
        if event.is_read_closed() && event.is_write_closed() {
            bits |= Self::HUP;
        }
        if event.is_priority() {
            bits |= Self::PRIORITY;
        }
        Ready(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & Self::HUP != 0
    }

    pub fn is_priority(self) -> bool {
        self.0 & Self::PRIORITY != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Membership state of a channel inside the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollerState {
    /// Never registered with the readiness backend.
    New,
    /// Currently registered.
    Added,
    /// Known to the poller map but deregistered from the backend.
    Deleted,
}

pub(crate) type ReadCallback = Box<dyn FnMut(&EventLoop, Instant)>;
pub(crate) type EventCallback = Box<dyn FnMut(&EventLoop)>;

/// One watched descriptor: interest mask, last ready mask, and callbacks.
pub struct Channel {
    fd: RawFd,
    interest: Option<Interest>,
    ready: Ready,
    state: PollerState,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
    tie: Option<Weak<dyn Any>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .field("ready", &self.ready)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Creates an unregistered channel for `fd`.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            interest: None,
            ready: Ready::default(),
            state: PollerState::New,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
            tie: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub(crate) fn state(&self) -> PollerState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: PollerState) {
        self.state = state;
    }

    pub(crate) fn set_ready(&mut self, ready: Ready) {
        self.ready = ready;
    }

    /// Whether the channel currently asks for write readiness.
    pub fn is_writing(&self) -> bool {
        self.interest.map_or(false, |i| i.is_writable())
    }

    /// Whether the channel currently asks for read readiness.
    pub fn is_reading(&self) -> bool {
        self.interest.map_or(false, |i| i.is_readable())
    }

    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.read_cb = Some(cb);
    }

    pub fn set_write_callback(&mut self, cb: EventCallback) {
        self.write_cb = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: EventCallback) {
        self.close_cb = Some(cb);
    }

    pub fn set_error_callback(&mut self, cb: EventCallback) {
        self.error_cb = Some(cb);
    }

    /// Ties the channel to the object that owns it.
    ///
    /// The weak reference is promoted for the duration of each dispatch so
    /// the owner cannot be destroyed while one of its callbacks is running.
    /// If the owner is already gone the event is dropped.
    pub fn tie(&mut self, owner: Weak<dyn Any>) {
        self.tie = Some(owner);
    }

    /// Adds read interest and syncs the poller.
    pub fn enable_reading(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        Self::set_interest(this, event_loop, |i| {
            Some(i.map_or(Interest::READABLE, |i| i | Interest::READABLE))
        });
    }

    /// Drops read interest and syncs the poller.
    pub fn disable_reading(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        Self::set_interest(this, event_loop, |i| {
            i.and_then(|i| i.remove(Interest::READABLE))
        });
    }

    /// Adds write interest and syncs the poller.
    pub fn enable_writing(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        Self::set_interest(this, event_loop, |i| {
            Some(i.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE))
        });
    }

    /// Drops write interest and syncs the poller.
    pub fn disable_writing(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        Self::set_interest(this, event_loop, |i| {
            i.and_then(|i| i.remove(Interest::WRITABLE))
        });
    }

    /// Drops all interest and syncs the poller.
    pub fn disable_all(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        Self::set_interest(this, event_loop, |_| None);
    }

    fn set_interest(
        this: &Rc<RefCell<Channel>>,
        event_loop: &EventLoop,
        f: impl FnOnce(Option<Interest>) -> Option<Interest>,
    ) {
        {
            let mut ch = this.borrow_mut();
            ch.interest = f(ch.interest);
        }
        event_loop.update_channel(this);
    }

    /// Removes the channel from its loop's poller entirely.
    pub fn remove(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop) {
        event_loop.remove_channel(this);
    }

    /// Dispatches the last ready mask to the installed callbacks.
    ///
    /// Invoked only by the owner loop, after the poller has stored the
    /// ready mask. Each callback is moved out of its slot while it runs, so
    /// callbacks may re-enter the channel (disable interest, replace a
    /// callback) without tripping over an outstanding borrow.
    pub(crate) fn handle_event(this: &Rc<RefCell<Channel>>, event_loop: &EventLoop, at: Instant) {
        let (ready, tie) = {
            let ch = this.borrow();
            (ch.ready, ch.tie.clone())
        };
        let _guard = match tie {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                // Owner destroyed between poll and dispatch; stale event.
                None => return,
            },
            None => None,
        };
        trace!(fd = this.borrow().fd, ?ready, "channel event");

        if ready.is_hup() && !ready.is_readable() {
            Self::invoke(this, event_loop, |ch| &mut ch.close_cb);
        }
        if ready.is_error() {
            Self::invoke(this, event_loop, |ch| &mut ch.error_cb);
        }
        if ready.is_readable() || ready.is_priority() {
            let cb = this.borrow_mut().read_cb.take();
            if let Some(mut cb) = cb {
                cb(event_loop, at);
                let mut ch = this.borrow_mut();
                if ch.read_cb.is_none() {
                    ch.read_cb = Some(cb);
                }
            }
        }
        if ready.is_writable() {
            Self::invoke(this, event_loop, |ch| &mut ch.write_cb);
        }
    }

    fn invoke(
        this: &Rc<RefCell<Channel>>,
        event_loop: &EventLoop,
        slot: fn(&mut Channel) -> &mut Option<EventCallback>,
    ) {
        let cb = slot(&mut *this.borrow_mut()).take();
        if let Some(mut cb) = cb {
            cb(event_loop);
            let mut ch = this.borrow_mut();
            let slot = slot(&mut *ch);
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }
}
