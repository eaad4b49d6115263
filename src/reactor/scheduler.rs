//! Delayed one-shot tasks for the reactor.
//!
//! A cooperating timer thread keeps a deadline heap and hands each expired
//! task back to the reactor queue, so scheduled work still runs on the
//! reactor thread like everything else.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::reactor::core::Task;

/// Cancellation handle for a scheduled task.
///
/// Cancel and fire race benignly: whichever flips first wins, the other
/// becomes a no-op.
pub struct Schedule {
    cancelled: Arc<AtomicBool>,
}

impl Schedule {
    /// Prevents the task from firing if it has not fired yet.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

// The heap orders by deadline only; seq breaks ties FIFO.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse for earliest-deadline-first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    running: bool,
}

struct TimerShared {
    state: Mutex<State>,
    cv: Condvar,
}

/// The timer facility: one thread, a deadline heap, a condvar.
#[derive(Clone)]
pub(crate) struct Scheduler {
    shared: Arc<TimerShared>,
    thread: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl Scheduler {
    /// Starts the timer thread. `forward` posts an expired task to the
    /// reactor queue and wakes the poll.
    pub(crate) fn start<F>(forward: F) -> Self
    where
        F: Fn(Task) + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(State {
                entries: BinaryHeap::new(),
                next_seq: 0,
                running: true,
            }),
            cv: Condvar::new(),
        });

        let timer_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("netvice-timer".to_owned())
            .spawn(move || run_timer(timer_shared, forward))
            .map_err(|e| error!(error = %e, "failed to spawn timer thread"))
            .ok();

        Self {
            shared,
            thread: Arc::new(Mutex::new(thread)),
        }
    }

    pub(crate) fn schedule(&self, delay: Duration, task: Task) -> Schedule {
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut state = self.shared.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            at: Instant::now() + delay,
            seq,
            cancelled: Arc::clone(&cancelled),
            task,
        });
        drop(state);
        self.shared.cv.notify_one();

        Schedule { cancelled }
    }

    pub(crate) fn stop(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
            state.entries.clear();
        }
        self.shared.cv.notify_one();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn run_timer<F>(shared: Arc<TimerShared>, forward: F)
where
    F: Fn(Task),
{
    let mut state = shared.state.lock().unwrap();

    while state.running {
        let now = Instant::now();
        let next_due = state.entries.peek().map(|head| head.at);

        match next_due {
            Some(at) if at <= now => {
                let entry = state.entries.pop().expect("peeked entry");
                if entry.cancelled.load(Ordering::Acquire) {
                    trace!(seq = entry.seq, "scheduled task cancelled");
                    continue;
                }
                // Forward outside the lock so the reactor queue push never
                // contends with schedule().
                drop(state);
                forward(entry.task);
                state = shared.state.lock().unwrap();
            }
            Some(at) => {
                let wait = at - now;
                state = shared.cv.wait_timeout(state, wait).unwrap().0;
            }
            None => {
                state = shared.cv.wait(state).unwrap();
            }
        }
    }
}
