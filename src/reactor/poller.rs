//! Readiness demultiplexer backing one event loop.
//!
//! Wraps a `mio::Poll` (epoll on Linux) plus the map of registered
//! channels. The poller keeps each channel's kernel registration in sync
//! with its interest mask through the New/Added/Deleted state machine and
//! fills the loop's active-channel list on every poll cycle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token};
use tracing::{error, trace, warn};

use crate::reactor::channel::{Channel, PollerState, Ready};

/// Token reserved for the loop's wakeup descriptor; never a valid fd token.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Initial capacity of the ready-event buffer; doubles when it comes back
/// full.
const INITIAL_EVENT_CAPACITY: usize = 64;

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Rc<RefCell<Channel>>>,
}

impl Poller {
    /// Creates the default readiness backend for this platform.
    ///
    /// Setting `RUSTLOOP_USE_POLL` requests a poll(2)-based backend, which
    /// this core does not ship; the request is logged and the default
    /// backend is used instead.
    pub fn new_default() -> io::Result<Self> {
        if std::env::var_os("RUSTLOOP_USE_POLL").is_some() {
            warn!("RUSTLOOP_USE_POLL is set but the poll(2) backend is not compiled in; using the default backend");
        }
        Self::new()
    }

    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
            channels: HashMap::new(),
        })
    }

    /// Registry handle, used by the loop to create its waker.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Waits for readiness and appends every ready channel to `active`.
    ///
    /// Each ready channel gets its ready mask stored before being pushed.
    /// Interrupted waits return an empty active list; other poll failures
    /// are logged and treated the same so the loop keeps running. The
    /// returned timestamp is sampled once per call.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<Rc<RefCell<Channel>>>,
    ) -> Instant {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Instant::now(),
            Err(err) => {
                error!(?err, "poll failed");
                return Instant::now();
            }
        }
        let now = Instant::now();

        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            if event.token() == WAKER_TOKEN {
                // The wakeup counter was already consumed by the backend;
                // the only observable effect is that poll returned.
                continue;
            }
            let fd = event.token().0 as RawFd;
            if let Some(channel) = self.channels.get(&fd) {
                channel.borrow_mut().set_ready(Ready::from_event(event));
                active.push(channel.clone());
            } else {
                warn!(fd, "readiness event for unknown channel");
            }
        }
        trace!(count, "poll returned");

        if count > 0 && count == self.events.capacity() {
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }
        now
    }

    /// Syncs one channel's kernel registration with its interest mask.
    ///
    /// New or Deleted channels with interest are (re-)added; an Added
    /// channel with an empty mask is deregistered and marked Deleted so the
    /// backend never watches a descriptor nobody cares about.
    pub fn update_channel(&mut self, channel: &Rc<RefCell<Channel>>) {
        let (fd, interest, state) = {
            let ch = channel.borrow();
            (ch.fd(), ch.interest(), ch.state())
        };
        trace!(fd, ?interest, ?state, "update channel");

        match state {
            PollerState::New | PollerState::Deleted => {
                if state == PollerState::New {
                    self.channels.insert(fd, channel.clone());
                }
                match interest {
                    Some(interest) => {
                        self.poll
                            .registry()
                            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
                            .expect("failed to register channel");
                        channel.borrow_mut().set_state(PollerState::Added);
                    }
                    // Nothing to watch yet; stays known but unregistered.
                    None => channel.borrow_mut().set_state(PollerState::Deleted),
                }
            }
            PollerState::Added => match interest {
                Some(interest) => {
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
                        .expect("failed to reregister channel");
                }
                None => {
                    if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                        warn!(fd, ?err, "failed to deregister channel");
                    }
                    channel.borrow_mut().set_state(PollerState::Deleted);
                }
            },
        }
    }

    /// Forgets a channel, deregistering it if still registered.
    pub fn remove_channel(&mut self, channel: &Rc<RefCell<Channel>>) {
        let (fd, state) = {
            let ch = channel.borrow();
            (ch.fd(), ch.state())
        };
        trace!(fd, "remove channel");
        self.channels.remove(&fd);
        if state == PollerState::Added {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                warn!(fd, ?err, "failed to deregister channel");
            }
        }
        channel.borrow_mut().set_state(PollerState::New);
    }

    /// Whether this exact channel is registered in the map.
    pub fn has_channel(&self, channel: &Rc<RefCell<Channel>>) -> bool {
        let fd = channel.borrow().fd();
        self.channels
            .get(&fd)
            .map_or(false, |ch| Rc::ptr_eq(ch, channel))
    }
}
