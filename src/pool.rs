//! A fixed-but-growable thread pool consuming opaque tasks from a
//! [`MsgQueue`].
//!
//! The pool never keeps a `Vec` of its workers' join handles. Instead each
//! worker hands its own [`JoinHandle`] to whichever worker departs next,
//! forming a join chain: the thread that drives the shared worker count to
//! zero is the one a caller (or a self-destructing worker) finally joins.

use crate::queue::MsgQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroUsize;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// An opaque, independently schedulable unit of work.
///
/// This is the Rust replacement for a C-style `(routine, context)` pair: the
/// closure captures whatever context it needs and is invoked exactly once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Called once per task still queued at shutdown time, in place of running
/// it, so the caller gets a chance to clean up anything the task's context
/// owns.
pub type PendingHook = Box<dyn FnMut(Task) + Send>;

pub type PoolResult<T> = Result<T, PoolError>;

/// Failure modes for [`ThreadPool::new`], [`ThreadPool::increase`] and
/// [`ThreadPool::schedule`].
#[derive(Debug)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    Spawn(std::io::Error),
    /// [`ThreadPool::schedule`] was called after [`ThreadPool::destroy`] had
    /// already begun.
    ScheduledDuringShutdown,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(cause) => write!(f, "failed to spawn worker thread: {cause}"),
            Self::ScheduledDuringShutdown => {
                write!(f, "task was scheduled while the pool was shutting down")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(cause) => Some(cause),
            Self::ScheduledDuringShutdown => None,
        }
    }
}

/// ID identifying a worker thread within its pool, used only for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct WorkerId(u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A one-shot cell used to hand a freshly spawned thread its own
/// [`JoinHandle`].
///
/// A thread cannot obtain a `JoinHandle` to itself from `std::thread`, so the
/// spawning thread publishes the handle here immediately after `spawn`
/// returns, and the worker retrieves it (blocking briefly if it gets there
/// first) only when it is about to exit and needs to hand itself off to the
/// join chain.
struct SelfHandle {
    cell: Mutex<Option<JoinHandle<()>>>,
    published: Condvar,
}

impl SelfHandle {
    fn new() -> Self {
        Self {
            cell: Mutex::new(None),
            published: Condvar::new(),
        }
    }

    fn publish(&self, handle: JoinHandle<()>) {
        let mut slot = self.cell.lock();
        *slot = Some(handle);
        self.published.notify_all();
    }

    fn take(&self) -> JoinHandle<()> {
        let mut slot = self.cell.lock();
        loop {
            if let Some(handle) = slot.take() {
                return handle;
            }
            self.published.wait(&mut slot);
        }
    }
}

/// State guarded by the pool mutex: the worker count, the join-chain
/// predecessor, and the shutdown flag.
struct PoolState {
    nthreads: usize,
    last_exiter: Option<JoinHandle<()>>,
    shutting_down: bool,
}

struct PoolInner {
    queue: MsgQueue<Task>,
    stack_size: Option<usize>,
    next_worker_id: AtomicU64,
    state: Mutex<PoolState>,
    /// Signaled whenever a worker's exit drives `nthreads` to zero. Its mere
    /// existence is the shutdown rendezvous point; there is nothing to wait
    /// on it for outside of a `destroy` in progress.
    terminate: Condvar,
}

thread_local! {
    /// Set once, at worker startup, to the pool the calling thread belongs
    /// to. Read under no lock: it is written exactly once by the owning
    /// thread and never touched by any other thread.
    static CURRENT_POOL: RefCell<Option<Arc<PoolInner>>> = const { RefCell::new(None) };

    /// Set by a worker that called `destroy` on its own pool from inside a
    /// task, so the worker loop skips the normal exit protocol (already run
    /// by `destroy`) instead of running it twice.
    static SELF_DESTRUCTED: Cell<bool> = const { Cell::new(false) };
}

/// A set of worker threads consuming [`Task`]s from a shared queue.
///
/// Cloning a `ThreadPool` is cheap and yields another handle to the same
/// pool; the pool is torn down only when [`ThreadPool::destroy`] is called
/// and the last worker has exited.
///
/// # Examples
/// ```
/// # use taskpool::pool::ThreadPool;
/// # use std::{num::NonZeroUsize, sync::{Arc, atomic::{AtomicUsize, Ordering}}};
/// let pool = ThreadPool::new(NonZeroUsize::new(4).unwrap(), None).unwrap();
///
/// let count = Arc::new(AtomicUsize::new(0));
/// for _ in 0..100 {
///     let count = Arc::clone(&count);
///     pool.schedule(move || {
///         count.fetch_add(1, Ordering::SeqCst);
///     })
///     .unwrap();
/// }
///
/// pool.destroy(None);
/// assert_eq!(count.load(Ordering::SeqCst), 100);
/// ```
#[derive(Clone)]
pub struct ThreadPool(Arc<PoolInner>);

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("ThreadPool")
            .field("nthreads", &state.nthreads)
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl ThreadPool {
    /// Creates a pool of `nthreads` workers, each with a stack of `stacksize`
    /// bytes (`None` for the platform default), and starts them immediately.
    ///
    /// If a worker fails to spawn after some others already started, the
    /// ones that did start are reaped through the normal shutdown protocol
    /// before the error is returned; no thread is leaked.
    pub fn new(nthreads: NonZeroUsize, stacksize: Option<usize>) -> PoolResult<Self> {
        let inner = Arc::new(PoolInner {
            queue: MsgQueue::new(0),
            stack_size: stacksize,
            next_worker_id: AtomicU64::new(0),
            state: Mutex::new(PoolState {
                nthreads: 0,
                last_exiter: None,
                shutting_down: false,
            }),
            terminate: Condvar::new(),
        });

        for _ in 0..nthreads.get() {
            if let Err(err) = spawn_worker(&inner) {
                let partial = Self(inner);
                partial.destroy(None);
                return Err(err);
            }
            inner.state.lock().nthreads += 1;
        }

        Ok(Self(inner))
    }

    /// Returns the number of workers currently owned by the pool.
    pub fn worker_count(&self) -> usize {
        self.0.state.lock().nthreads
    }

    /// Enqueues `task` for execution by the first available worker.
    ///
    /// # Errors
    /// Returns [`PoolError::ScheduledDuringShutdown`] if `destroy` has
    /// already been called.
    pub fn schedule<F>(&self, task: F) -> PoolResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.0.state.lock().shutting_down {
            return Err(PoolError::ScheduledDuringShutdown);
        }
        self.0.queue.put(Box::new(task));
        Ok(())
    }

    /// Spawns one additional worker under the pool mutex, so a concurrent
    /// shutdown can never observe a stale worker count.
    pub fn increase(&self) -> PoolResult<()> {
        let mut state = self.0.state.lock();
        spawn_worker(&self.0)?;
        state.nthreads += 1;
        Ok(())
    }

    /// Returns `true` if the calling thread is currently executing inside a
    /// worker of this pool.
    pub fn in_pool(&self) -> bool {
        CURRENT_POOL.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|owner| Arc::ptr_eq(owner, &self.0))
        })
    }

    /// Shuts the pool down.
    ///
    /// The queue is switched to nonblock mode and left to drain; once every
    /// worker has exited, `pending` (if given) is called once for each task
    /// that was still queued, in place of running it. May be called from
    /// outside the pool or, as a self-destruct, from inside one of its own
    /// tasks.
    pub fn destroy(self, pending: Option<PendingHook>) {
        if self.in_pool() {
            destroy_from_worker(self.0, pending);
        } else {
            destroy_external(self.0, pending);
        }
    }
}

/// External shutdown: the caller is not itself a worker of this pool.
fn destroy_external(inner: Arc<PoolInner>, pending: Option<PendingHook>) {
    inner.state.lock().shutting_down = true;
    inner.queue.set_nonblock();

    {
        let mut state = inner.state.lock();
        while state.nthreads != 0 {
            inner.terminate.wait(&mut state);
        }
    }

    let last_exiter = inner.state.lock().last_exiter.take();
    if let Some(handle) = last_exiter {
        join_worker(handle);
    }

    drain_and_run_pending(&inner.queue, pending);
}

/// Self-destruct shutdown: called from inside a task running on one of the
/// pool's own workers. That worker detaches its own join handle (nobody else
/// needs to wait on it) and stands in for its own exit-protocol decrement,
/// since it will never reach the normal break-out-of-the-loop path.
fn destroy_from_worker(inner: Arc<PoolInner>, pending: Option<PendingHook>) {
    SELF_DESTRUCTED.with(|flag| flag.set(true));

    inner.state.lock().shutting_down = true;
    inner.queue.set_nonblock();

    // Detach: take our own handle out of circulation so no one waits on it.
    let self_handle = CURRENT_SELF_HANDLE.with(|cell| {
        cell.borrow_mut()
            .take()
            .expect("a worker always has a self-handle installed")
    });
    drop(self_handle.take());

    {
        let mut state = inner.state.lock();
        state.nthreads -= 1;
        if state.nthreads == 0 {
            inner.terminate.notify_all();
        }
        while state.nthreads != 0 {
            inner.terminate.wait(&mut state);
        }
    }

    let last_exiter = inner.state.lock().last_exiter.take();
    if let Some(handle) = last_exiter {
        join_worker(handle);
    }

    drain_and_run_pending(&inner.queue, pending);
}

fn join_worker(handle: JoinHandle<()>) {
    if let Err(cause) = handle.join() {
        log::error!("worker thread panicked while being joined: {cause:?}");
    }
}

fn drain_and_run_pending(queue: &MsgQueue<Task>, pending: Option<PendingHook>) {
    let leftover = queue.drain();
    if leftover.is_empty() {
        return;
    }
    match pending {
        Some(mut hook) => {
            for task in leftover {
                hook(task);
            }
        }
        None => log::debug!("discarding {} task(s) pending at shutdown", leftover.len()),
    }
}

thread_local! {
    /// Each worker's own `SelfHandle`, so it can detach itself on
    /// self-destruction without having to thread it through every call.
    static CURRENT_SELF_HANDLE: RefCell<Option<Arc<SelfHandle>>> = const { RefCell::new(None) };
}

fn spawn_worker(inner: &Arc<PoolInner>) -> PoolResult<()> {
    let worker_id = WorkerId(inner.next_worker_id.fetch_add(1, Ordering::Relaxed));
    let self_handle = Arc::new(SelfHandle::new());

    let inner_for_worker = Arc::clone(inner);
    let self_handle_for_worker = Arc::clone(&self_handle);

    let mut builder = thread::Builder::new().name(format!("taskpool-worker-{worker_id}"));
    if let Some(size) = inner.stack_size {
        builder = builder.stack_size(size);
    }

    let handle = builder
        .spawn(move || worker_main(worker_id, inner_for_worker, self_handle_for_worker))
        .map_err(PoolError::Spawn)?;

    self_handle.publish(handle);
    Ok(())
}

fn worker_main(id: WorkerId, inner: Arc<PoolInner>, self_handle: Arc<SelfHandle>) {
    log::trace!("worker {id} starting");

    CURRENT_POOL.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&inner)));
    CURRENT_SELF_HANDLE.with(|slot| *slot.borrow_mut() = Some(Arc::clone(&self_handle)));

    loop {
        let Some(task) = inner.queue.get() else {
            break;
        };

        if let Err(cause) = panic::catch_unwind(panic::AssertUnwindSafe(task)) {
            log::error!("task on worker {id} panicked: {cause:?}");
        }

        if SELF_DESTRUCTED.with(Cell::get) {
            // `destroy` already ran the exit protocol for this worker as
            // part of the self-destruct it performed above.
            log::trace!("worker {id} exiting after self-destruct");
            return;
        }
    }

    exit_worker(id, &inner, &self_handle);
}

/// The join-chain exit protocol: record ourselves as the most recent
/// departure, decrement the worker count, and join whoever we just
/// displaced.
fn exit_worker(id: WorkerId, inner: &Arc<PoolInner>, self_handle: &Arc<SelfHandle>) {
    let my_handle = self_handle.take();

    let predecessor = {
        let mut state = inner.state.lock();
        let predecessor = state.last_exiter.replace(my_handle);
        state.nthreads -= 1;
        if state.nthreads == 0 {
            inner.terminate.notify_all();
        }
        predecessor
    };

    log::trace!("worker {id} terminating");

    if let Some(handle) = predecessor {
        join_worker(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool(nthreads: usize) -> ThreadPool {
        ThreadPool::new(NonZeroUsize::new(nthreads).unwrap(), None).unwrap()
    }

    #[test]
    fn creating_pool_starts_requested_worker_count() {
        let pool = pool(3);
        assert_eq!(pool.worker_count(), 3);
        pool.destroy(None);
    }

    #[test]
    fn fan_out_counting_runs_every_task_exactly_once() {
        let pool = pool(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10_000 {
            let counter = Arc::clone(&counter);
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.destroy(None);
        assert_eq!(counter.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn shutdown_with_backlog_accounts_for_every_task() {
        let pool = pool(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let pending_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let ran = Arc::clone(&ran);
            pool.schedule(move || {
                thread::sleep(Duration::from_millis(50));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let pending_count_for_hook = Arc::clone(&pending_count);
        pool.destroy(Some(Box::new(move |_task| {
            pending_count_for_hook.fetch_add(1, Ordering::SeqCst);
        })));

        let ran = ran.load(Ordering::SeqCst);
        let pending = pending_count.load(Ordering::SeqCst);
        assert!((1..=100).contains(&ran));
        assert_eq!(ran + pending, 100);
    }

    #[test]
    fn self_destruction_from_a_worker_tears_down_the_whole_pool() {
        let pool = pool(3);
        let pool_for_task = pool.clone();
        let (tx, rx) = mpsc::channel();

        pool.schedule(move || {
            pool_for_task.destroy(None);
            tx.send(()).unwrap();
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(5))
            .expect("self-destructing task should complete");
    }

    #[test]
    fn dynamic_growth_lets_quick_tasks_bypass_a_long_one() {
        let pool = pool(1);
        let (long_started_tx, long_started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        pool.schedule(move || {
            long_started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        })
        .unwrap();

        long_started_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap();

        for _ in 0..4 {
            pool.increase().unwrap();
        }
        assert_eq!(pool.worker_count(), 5);

        let quick_done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let quick_done = Arc::clone(&quick_done);
            pool.schedule(move || {
                quick_done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        for _ in 0..200 {
            if quick_done.load(Ordering::SeqCst) == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(quick_done.load(Ordering::SeqCst), 4);

        release_tx.send(()).unwrap();
        pool.destroy(None);
    }

    #[test]
    fn in_pool_is_true_only_on_a_worker_thread() {
        let pool = pool(1);
        assert!(!pool.in_pool());

        let pool_for_task = pool.clone();
        let (tx, rx) = mpsc::channel();
        pool.schedule(move || {
            tx.send(pool_for_task.in_pool()).unwrap();
        })
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        pool.destroy(None);
    }

    #[test]
    fn scheduling_during_shutdown_is_rejected() {
        let pool = pool(1);
        let pool_for_shutdown = pool.clone();
        pool_for_shutdown.destroy(None);

        assert!(matches!(
            pool.schedule(|| {}),
            Err(PoolError::ScheduledDuringShutdown)
        ));
    }

    #[test]
    fn a_panicking_task_does_not_wedge_the_worker() {
        let pool = pool(1);

        pool.schedule(|| panic!("intentional panic for testing"))
            .unwrap();

        let ran_after = Arc::new(AtomicUsize::new(0));
        let ran_after_clone = Arc::clone(&ran_after);
        pool.schedule(move || {
            ran_after_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.destroy(None);
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }
}
