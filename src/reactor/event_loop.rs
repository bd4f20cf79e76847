//! The per-thread event loop.
//!
//! One [`EventLoop`] runs per OS thread and owns everything that thread
//! multiplexes: the poller, the registered channels, and a queue of tasks
//! posted by other threads. The loop itself is deliberately not shareable
//! across threads; the only thing that crosses a thread boundary is the
//! task-posting [`EventLoopInterface`], which pairs the queue with a
//! [`mio::Waker`] so a blocked poll returns promptly when work arrives.
//!
//! ```no_run
//! use rustloop::EventLoop;
//!
//! let event_loop = EventLoop::new().expect("failed to create event loop");
//! let handle = event_loop.interface();
//! std::thread::spawn(move || {
//!     handle.run_in_loop(|_loop| println!("runs on the loop thread"));
//! });
//! event_loop.run();
//! ```

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::Waker;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::reactor::channel::Channel;
use crate::reactor::poller::{Poller, WAKER_TOKEN};

/// Ceiling on one poll wait, so an idle loop still makes progress on
/// pending tasks.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A closure executed on the loop's thread.
pub(crate) type Task = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = const { RefCell::new(None) };
}

/// State reachable from other threads: the task queue, the wakeup
/// descriptor, and the quit latch.
struct Shared {
    thread_id: ThreadId,
    pending: Mutex<Vec<Task>>,
    waker: Waker,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

impl Shared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn queue(&self, task: Task) {
        self.pending
            .lock()
            .expect("event loop task queue poisoned")
            .push(task);
        // A task queued from the loop thread outside the pending phase is
        // picked up at the end of the current iteration without a wakeup.
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(?err, "failed to wake event loop");
        }
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }
}

/// Single-threaded readiness dispatcher; one per thread, at most.
pub struct EventLoop {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    looping: Cell<bool>,
}

impl EventLoop {
    /// Creates an event loop bound to the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already hosts an event loop.
    pub fn new() -> Result<Rc<EventLoop>, Error> {
        let poller = Poller::new_default()?;
        let waker = Waker::new(poller.registry(), WAKER_TOKEN)?;
        let event_loop = Rc::new(EventLoop {
            shared: Arc::new(Shared {
                thread_id: thread::current().id(),
                pending: Mutex::new(Vec::new()),
                waker,
                quit: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
            }),
            poller: RefCell::new(poller),
            looping: Cell::new(false),
        });

        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().and_then(Weak::upgrade).is_some() {
                error!(thread = ?thread::current().id(), "another event loop already exists on this thread");
                panic!("attempted to create a second event loop on one thread");
            }
            *current = Some(Rc::downgrade(&event_loop));
        });

        debug!(thread = ?thread::current().id(), "event loop created");
        Ok(event_loop)
    }

    /// The event loop bound to the calling thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// A cloneable, thread-safe handle for posting work to this loop.
    pub fn interface(&self) -> EventLoopInterface {
        EventLoopInterface {
            shared: self.shared.clone(),
        }
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Panics unless called on the owner thread.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            error!(
                owner = ?self.shared.thread_id,
                caller = ?thread::current().id(),
                "event loop accessed off its owner thread"
            );
            panic!("event loop accessed off its owner thread");
        }
    }

    /// Runs the loop until [`quit`](Self::quit) is called.
    ///
    /// Each iteration waits for readiness (bounded by a 10 s timeout),
    /// dispatches every ready channel, then executes the tasks queued up to
    /// that point.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.set(true);
        self.shared.quit.store(false, Ordering::Release);
        info!("event loop started");

        let mut active: Vec<Rc<RefCell<Channel>>> = Vec::new();
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            let now = self
                .poller
                .borrow_mut()
                .poll(Some(POLL_TIMEOUT), &mut active);
            for channel in &active {
                Channel::handle_event(channel, self, now);
            }
            self.do_pending_tasks();
        }

        info!("event loop stopped");
        self.looping.set(false);
    }

    /// Asks the loop to exit at the top of its next iteration.
    ///
    /// Safe to call from any thread through a clone of the loop's
    /// [`EventLoopInterface`]; cross-thread callers also wake the poll so
    /// the exit is prompt.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Runs `task` on the loop thread: synchronously when already there,
    /// queued otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            task(self);
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` for the end of the current (or next) loop iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Forces the poller to return before its timeout.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    pub(crate) fn update_channel(&self, channel: &Rc<RefCell<Channel>>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<RefCell<Channel>>) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    /// Whether `channel` is registered with this loop's poller.
    pub(crate) fn has_channel(&self, channel: &Rc<RefCell<Channel>>) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    /// Swaps the queued tasks out under the lock, then runs them without
    /// holding it, so a task can queue follow-up work without deadlocking.
    /// Work queued during this phase triggers a wakeup and lands in the
    /// next iteration.
    fn do_pending_tasks(&self) {
        self.shared.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(
            &mut *self
                .shared
                .pending
                .lock()
                .expect("event loop task queue poisoned"),
        );
        debug!(count = tasks.len(), "running pending tasks");
        for task in tasks {
            task(self);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            // Only clear our own registration: a partially constructed
            // duplicate must not evict the thread's live loop on unwind.
            let is_self = current
                .as_ref()
                .map_or(false, |weak| std::ptr::eq(weak.as_ptr(), self));
            if is_self {
                *current = None;
            }
        });
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.shared.thread_id)
            .field("looping", &self.looping.get())
            .finish_non_exhaustive()
    }
}

/// Thread-safe handle to an [`EventLoop`].
///
/// Obtained from [`EventLoop::interface`]. Clones freely; every clone posts
/// to the same loop. The handle stays valid after the loop exits — posting
/// to a finished loop is a no-op beyond queueing.
#[derive(Clone)]
pub struct EventLoopInterface {
    shared: Arc<Shared>,
}

impl EventLoopInterface {
    /// Whether the calling thread owns the target loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Runs `task` on the owner loop: synchronously when called from its
    /// thread, queued (with wakeup) otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            if let Some(event_loop) = EventLoop::current() {
                // Guard against a recycled thread hosting a newer loop.
                if Arc::ptr_eq(&event_loop.shared, &self.shared) {
                    task(&event_loop);
                    return;
                }
            }
        }
        self.queue_in_loop(task);
    }

    /// Queues `task` onto the owner loop.
    pub fn queue_in_loop(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.shared.queue(Box::new(task));
    }

    /// Forces the owner loop's poll to return before its timeout.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Asks the owner loop to exit; wakes it when called cross-thread.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Whether two handles target the same loop.
    pub fn same_loop(&self, other: &EventLoopInterface) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl PartialEq for EventLoopInterface {
    fn eq(&self, other: &Self) -> bool {
        self.same_loop(other)
    }
}

impl Eq for EventLoopInterface {}

impl std::fmt::Debug for EventLoopInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopInterface")
            .field("thread", &self.shared.thread_id)
            .finish_non_exhaustive()
    }
}
