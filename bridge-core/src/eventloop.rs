//! Event Loop Contract (§6): the cooperative, single-threaded scheduler the
//! bridge assumes ownership of every JS-visible value from (§5 "Scheduling
//! model"). The loop itself is an external collaborator (§1); what this
//! module ships is the contract (`EventLoop`) plus [`LocalLoop`], the one
//! concrete reference implementation -- a dedicated OS thread running a
//! `tokio::task::LocalSet`, so the crate has something to dispatch onto and
//! test against standalone (the same reasoning that justifies shipping
//! `InProcessTransport` alongside the abstract `Transport`).
//!
//! `NewPromise` in the spec's wording is a JS-engine primitive (an actual
//! `Promise`/`resolve`/`reject` triple); this crate has no JS engine, so the
//! Rust-level equivalent is an ordinary `Future` -- `bridge-quickjs` is where
//! a `LocalLoop`-scheduled future gets wrapped into a real `rquickjs`
//! `Promise`. What *does* belong here is `Submit` and `IsLoopThread`, since
//! those are what the in-process `Transport` needs to hop a transport-thread
//! completion back onto the loop before anything JS-observable is touched
//! (§5 "Cross-thread boundary").

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;

/// A unit of work queued onto the loop. Boxed rather than generic so
/// `LoopHandle` stays a plain, clonable, object-safe handle; `'static` and
/// `!Send` because the whole point of posting through here is that it may
/// touch JS-engine values that only exist on the loop thread (§5).
pub type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

/// Constructing the boxed task itself touches no loop-owned state, so the
/// *constructor* can cross threads even though the task it builds cannot.
/// The in-process `Transport`'s background tasks use this to hand a
/// completion back to the loop: build the `LocalTask` lazily, inside the
/// thunk, once we're already running on the loop thread.
pub type TaskThunk = Box<dyn FnOnce() -> LocalTask + Send>;

/// `Submit`/`IsLoopThread` (§6 Event Loop Contract). Implemented once, by
/// [`LocalLoop`]; kept as a trait so `bridge-quickjs` can swap in whatever
/// scheduler its embedding actually runs (e.g. one already driven by an
/// enclosing application event loop) without bridge-core depending on it.
pub trait EventLoop: Send + Sync {
    /// Schedule `task` to run on the loop thread. Safe to call from any
    /// thread, including transport goroutine-equivalents; the loop drains
    /// its queue on its own thread only.
    fn submit(&self, task: TaskThunk);

    /// §6: "used for the detection of off-loop access" (P10).
    fn is_loop_thread(&self) -> bool;
}

/// Raised when a diagnostic build catches JS-observable state (a
/// [`crate::message::MessageHandle`], [`crate::metadata::MetadataBag`],
/// [`crate::call_context::CallContext`], ...) being touched from a thread
/// other than the one [`LocalLoop`] owns (§5, P10).
#[derive(Debug)]
pub struct OffLoopAccess {
    pub operation: &'static str,
}

impl fmt::Display for OffLoopAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "off-loop access detected: {} must run on the loop thread", self.operation)
    }
}

impl std::error::Error for OffLoopAccess {}

/// Panics if called from off the loop thread; the bridge's documented
/// response to a thread-affinity violation is to fail loudly rather than
/// silently corrupt JS-owned state (§5, §7 "it does not recover from
/// contract violations").
pub fn assert_on_loop(loop_ref: &dyn EventLoop, operation: &'static str) {
    if !loop_ref.is_loop_thread() {
        panic!("{}", OffLoopAccess { operation });
    }
}

/// The one concrete [`EventLoop`]: a dedicated thread running a
/// single-threaded tokio runtime plus a `LocalSet`, so `!Send` futures
/// (anything touching a JS engine's non-thread-safe values) can be spawned
/// and polled without ever leaving that thread. [`LoopHandle`] is the
/// `Send + Clone` half other threads (the in-process `Transport`'s
/// background tasks) hold to post work back.
pub struct LocalLoop {
    thread_id: ThreadId,
    handle: LoopHandle,
    join: Option<thread::JoinHandle<()>>,
}

/// The cross-thread-safe handle to a running [`LocalLoop`]. Cloning shares
/// the same submission queue.
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<TaskThunk>,
}

impl LoopHandle {
    pub fn submit(&self, thunk: TaskThunk) {
        // A closed channel means the loop has shut down (§5 "Resource
        // lifecycle"); the submitter has no further use for the task, so
        // dropping it silently is correct -- there is nothing left to
        // deliver a result to.
        let _ = self.tx.send(thunk);
    }
}

impl LocalLoop {
    /// Spawns the dedicated thread and blocks until its runtime is ready to
    /// accept submissions.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskThunk>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<ThreadId>();

        let join = thread::Builder::new()
            .name("bridge-loop".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build single-threaded loop runtime");
                let local = tokio::task::LocalSet::new();

                let _ = ready_tx.send(thread::current().id());

                local.block_on(&runtime, async move {
                    while let Some(thunk) = rx.recv().await {
                        tokio::task::spawn_local(thunk());
                    }
                });
            })
            .expect("failed to spawn bridge-loop thread");

        let thread_id = ready_rx.recv().expect("loop thread died before signalling readiness");

        LocalLoop {
            thread_id,
            handle: LoopHandle { tx },
            join: Some(join),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl EventLoop for LocalLoop {
    fn submit(&self, task: TaskThunk) {
        self.handle.submit(task);
    }

    fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for LocalLoop {
    /// §5 "Resource lifecycle": "At shutdown all pending calls transition to
    /// cancelled and all pending promises reject." Dropping the sender side
    /// of the channel ends the loop's `while let Some(...)` drain; any task
    /// already queued but unreceived is simply dropped, which is observably
    /// the same as never having been submitted (its submitter, if still
    /// listening, will see a dropped channel rather than a result).
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn submitted_task_runs_on_the_loop_thread() {
        let loop_ = LocalLoop::spawn();
        let ran = Arc::new(AtomicBool::new(false));
        let handle = loop_.handle();

        let ran_clone = ran.clone();
        let loop_thread_id = {
            // capture via a second submit that reports back its thread id
            let (tx, rx) = std::sync::mpsc::channel();
            handle.submit(Box::new(move || {
                Box::pin(async move {
                    let _ = tx.send(thread::current().id());
                })
            }));
            rx.recv().unwrap()
        };

        handle.submit(Box::new(move || {
            Box::pin(async move {
                ran_clone.store(true, Ordering::SeqCst);
            })
        }));

        // give the loop thread a moment to drain its queue
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(loop_thread_id, loop_.thread_id);
    }

    #[test]
    fn is_loop_thread_false_from_spawning_thread() {
        let loop_ = LocalLoop::spawn();
        assert!(!loop_.is_loop_thread());
    }
}
