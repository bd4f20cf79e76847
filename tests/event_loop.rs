use rustloop::EventLoop;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn run_in_loop_is_synchronous_on_owner_thread() {
    let event_loop = EventLoop::new().expect("failed to create event loop");
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    event_loop.run_in_loop(move |_| flag.store(true, Ordering::SeqCst));

    // No run() call needed: same-thread tasks execute before returning.
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn interface_is_synchronous_on_owner_thread_too() {
    let event_loop = EventLoop::new().expect("failed to create event loop");
    let ran = Arc::new(AtomicBool::new(false));

    let flag = ran.clone();
    event_loop
        .interface()
        .run_in_loop(move |_| flag.store(true, Ordering::SeqCst));

    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn cross_thread_task_runs_on_owner_thread() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let (result_tx, result_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create event loop");
        handle_tx
            .send((event_loop.interface(), thread::current().id()))
            .expect("failed to publish loop handle");
        event_loop.run();
    });

    let (interface, loop_thread) = handle_rx.recv().expect("worker died before publishing");
    assert!(!interface.is_in_loop_thread());

    interface.run_in_loop(move |_| {
        result_tx
            .send(thread::current().id())
            .expect("failed to report task thread");
    });

    let task_thread = result_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("task never ran");
    assert_eq!(task_thread, loop_thread);

    interface.quit();
    worker.join().expect("worker panicked");
}

#[test]
fn tasks_run_in_fifo_order() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create event loop");
        handle_tx
            .send(event_loop.interface())
            .expect("failed to publish loop handle");
        event_loop.run();
    });

    let interface = handle_rx.recv().expect("worker died before publishing");
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let order = order.clone();
        interface.queue_in_loop(move |_| order.lock().unwrap().push(i));
    }
    interface.queue_in_loop(move |_| done_tx.send(()).expect("failed to signal completion"));

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("tasks never ran");
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..100).collect::<Vec<_>>());

    interface.quit();
    worker.join().expect("worker panicked");
}

#[test]
fn task_queued_from_a_task_runs_next_iteration() {
    let (handle_tx, handle_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create event loop");
        handle_tx
            .send(event_loop.interface())
            .expect("failed to publish loop handle");
        event_loop.run();
    });

    let interface = handle_rx.recv().expect("worker died before publishing");
    let counter = Arc::new(AtomicUsize::new(0));

    let inner_counter = counter.clone();
    interface.queue_in_loop(move |event_loop| {
        inner_counter.fetch_add(1, Ordering::SeqCst);
        let inner_counter = inner_counter.clone();
        // Queued while the pending phase is running: must trigger a wakeup
        // and execute promptly on the next iteration, not after the 10 s
        // poll timeout.
        event_loop.queue_in_loop(move |_| {
            inner_counter.fetch_add(1, Ordering::SeqCst);
            done_tx.send(()).expect("failed to signal completion");
        });
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("follow-up task never ran; wakeup from pending phase is broken");
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    interface.quit();
    worker.join().expect("worker panicked");
}

#[test]
fn quit_from_another_thread_unblocks_poll() {
    let (handle_tx, handle_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("failed to create event loop");
        handle_tx
            .send(event_loop.interface())
            .expect("failed to publish loop handle");
        event_loop.run();
    });

    let interface = handle_rx.recv().expect("worker died before publishing");
    // Give the loop time to block inside poll.
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    interface.quit();
    worker.join().expect("worker panicked");

    // Must return well before the 10 s poll ceiling.
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "quit took {:?}, loop did not wake",
        started.elapsed()
    );
}

#[test]
#[should_panic(expected = "second event loop")]
fn second_loop_on_one_thread_panics() {
    let _first = EventLoop::new().expect("failed to create first event loop");
    let _second = EventLoop::new().unwrap();
}

#[test]
fn current_returns_this_threads_loop() {
    assert!(EventLoop::current().is_none());
    let event_loop = EventLoop::new().expect("failed to create event loop");
    let current = EventLoop::current().expect("current loop missing");
    assert!(current.interface().same_loop(&event_loop.interface()));
    drop(current);
    drop(event_loop);
    assert!(EventLoop::current().is_none());
}
