//! Cooperative Executor
//!
//! The single logical executor every effect runs on. It owns two scheduling
//! primitives:
//!
//! - a job queue (the microtask analog): closures enqueued with
//!   [`Executor::schedule`] run in FIFO order on the driving thread
//! - a timer heap: closures enqueued with [`Executor::set_timer`] run once
//!   their deadline passes, in deadline order
//!
//! The executor itself has no thread. The thread inside
//! [`Runtime::block_on`](crate::runtime::Runtime::block_on) (or
//! `run_sync`) drains both queues. Jobs may be enqueued from any thread;
//! they always execute on the driving thread.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// A unit of queued work.
pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Monotonic tie-breaker so timers with equal deadlines fire in
/// registration order.
static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: Option<Job>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cancels a pending timer.
///
/// Cancelling an already-fired or already-cancelled timer is a no-op.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the timer's job from running.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the timer was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct ExecutorShared {
    tx: Sender<Job>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
}

/// A cloneable handle to the executor's queues.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<ExecutorShared>,
}

impl Executor {
    /// Create an executor, returning the handle and the receiving end of the
    /// job queue for the driving thread.
    pub(crate) fn new() -> (Self, Receiver<Job>) {
        let (tx, rx) = unbounded();
        let executor = Executor {
            shared: Arc::new(ExecutorShared {
                tx,
                timers: Mutex::new(BinaryHeap::new()),
            }),
        };
        (executor, rx)
    }

    /// Enqueue a job to run on the driving thread.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        // A send error means the runtime was dropped; late jobs are discarded.
        let _ = self.shared.tx.send(Box::new(job));
    }

    /// Register a job to run once `delay` has elapsed.
    pub fn set_timer(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            job: Some(Box::new(job)),
        };
        self.shared.timers.lock().push(entry);
        TimerHandle { cancelled }
    }

    /// Pop and run every timer whose deadline has passed.
    ///
    /// Returns the number of timers fired. Jobs run outside the heap lock, so
    /// they are free to register new timers.
    pub(crate) fn fire_due_timers(&self) -> usize {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.shared.timers.lock();
            while let Some(entry) = timers.peek() {
                if entry.deadline > now {
                    break;
                }
                let mut entry = match timers.pop() {
                    Some(entry) => entry,
                    None => break,
                };
                if entry.cancelled.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(job) = entry.job.take() {
                    due.push(job);
                }
            }
        }
        let count = due.len();
        for job in due {
            job();
        }
        count
    }

    /// The next live timer deadline, if any.
    ///
    /// Cancelled entries at the front of the heap are discarded on the way.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut timers = self.shared.timers.lock();
        while let Some(entry) = timers.peek() {
            if entry.cancelled.load(Ordering::SeqCst) {
                timers.pop();
                continue;
            }
            return Some(entry.deadline);
        }
        None
    }

    /// Number of pending (possibly cancelled) timers. For diagnostics.
    pub fn pending_timers(&self) -> usize {
        self.shared.timers.lock().len()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_scheduled_jobs_run_in_order() {
        let (executor, rx) = Executor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            executor.schedule(move || order.lock().push(i));
        }

        while let Ok(job) = rx.try_recv() {
            job();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_due_timer_fires() {
        let (executor, _rx) = Executor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        executor.set_timer(Duration::from_millis(0), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(executor.fire_due_timers(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let (executor, _rx) = Executor::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let handle = executor.set_timer(Duration::from_millis(0), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        handle.cancel();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(executor.fire_due_timers(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_future_timer_not_due() {
        let (executor, _rx) = Executor::new();
        executor.set_timer(Duration::from_secs(60), || {});

        assert_eq!(executor.fire_due_timers(), 0);
        assert!(executor.next_deadline().is_some());
    }

    #[test]
    fn test_equal_deadline_timers_fire_in_registration_order() {
        let (executor, _rx) = Executor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Duration::from_millis(0);

        for i in 0..3 {
            let order = order.clone();
            executor.set_timer(base, move || order.lock().push(i));
        }

        std::thread::sleep(Duration::from_millis(5));
        executor.fire_due_timers();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let (executor, _rx) = Executor::new();
        let near = executor.set_timer(Duration::from_millis(1), || {});
        executor.set_timer(Duration::from_secs(60), || {});

        near.cancel();
        let deadline = executor.next_deadline().expect("one live timer");
        assert!(deadline > Instant::now() + Duration::from_secs(30));
    }
}
