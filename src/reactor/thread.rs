//! Worker threads hosting event loops, and the round-robin pool.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use crate::reactor::event_loop::{EventLoop, EventLoopInterface};

/// Callback invoked on a freshly constructed loop, on its own thread,
/// before the loop starts running.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync + 'static>;

/// One OS thread hosting one event loop.
///
/// The loop is constructed inside the worker thread and its task-posting
/// handle is published back through a mutex/condvar pair, so
/// [`start_loop`](Self::start_loop) returns a handle that is immediately
/// usable. Dropping the thread object quits the loop and joins.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    interface: Option<EventLoopInterface>,
}

impl EventLoopThread {
    pub fn new(name: impl Into<String>, init: Option<ThreadInitCallback>) -> Self {
        Self {
            name: name.into(),
            init,
            thread: None,
            interface: None,
        }
    }

    /// Spawns the worker, waits until its loop is constructed, and returns
    /// the loop's handle.
    ///
    /// A worker that cannot construct its loop (readiness backend or wakeup
    /// descriptor creation failed) aborts the process: every subsequent
    /// dispatch decision would be built on a loop that does not exist.
    pub fn start_loop(&mut self) -> EventLoopInterface {
        assert!(self.thread.is_none(), "event loop thread already started");

        let rendezvous = Arc::new((Mutex::new(None::<EventLoopInterface>), Condvar::new()));
        let published = rendezvous.clone();
        let init = self.init.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        error!(?err, "failed to create event loop on worker thread");
                        std::process::abort();
                    }
                };
                if let Some(init) = init {
                    init(&event_loop);
                }
                {
                    let (slot, ready) = &*published;
                    *slot.lock().expect("loop rendezvous poisoned") =
                        Some(event_loop.interface());
                    ready.notify_one();
                }
                event_loop.run();
                debug!("event loop thread exiting");
            })
            .expect("failed to spawn event loop thread");
        self.thread = Some(thread);

        let (slot, ready) = &*rendezvous;
        let mut guard = slot.lock().expect("loop rendezvous poisoned");
        while guard.is_none() {
            guard = ready.wait(guard).expect("loop rendezvous poisoned");
        }
        let interface = guard.take().expect("loop handle published empty");
        self.interface = Some(interface.clone());
        interface
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(interface) = &self.interface {
            interface.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopThread")
            .field("name", &self.name)
            .field("started", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

/// The worker reactors behind a server: N loops, one thread each, handed
/// out round-robin.
///
/// With zero workers the pool degenerates to the base loop, i.e. a
/// single-reactor server where accepting and connection I/O share one
/// thread.
pub struct EventLoopThreadPool {
    base: EventLoopInterface,
    name: String,
    started: bool,
    num_threads: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<EventLoopInterface>,
}

impl EventLoopThreadPool {
    pub fn new(base: EventLoopInterface, name: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
            started: false,
            num_threads: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Number of worker loops to spawn; must be set before [`start`](Self::start).
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started, "thread pool already started");
        self.num_threads = num_threads;
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns all workers, running `init` once on each new loop. With zero
    /// workers `init` runs once on the base loop instead.
    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "thread pool already started");
        self.started = true;
        info!(name = %self.name, threads = self.num_threads, "starting event loop thread pool");

        for i in 0..self.num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}-worker-{}", self.name, i), init.clone());
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }

        if self.num_threads == 0 {
            if let Some(init) = init {
                self.base.run_in_loop(move |event_loop| init(event_loop));
            }
        }
    }

    /// The next worker loop, strictly round-robin; the base loop when the
    /// pool has no workers.
    pub fn get_next_loop(&mut self) -> EventLoopInterface {
        if self.loops.is_empty() {
            return self.base.clone();
        }
        let interface = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        interface
    }

    /// Every loop in the pool; just the base loop when there are no workers.
    pub fn get_all_loops(&self) -> Vec<EventLoopInterface> {
        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }
}

impl std::fmt::Debug for EventLoopThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopThreadPool")
            .field("name", &self.name)
            .field("num_threads", &self.num_threads)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
