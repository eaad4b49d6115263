//! The readiness loop and its cross-thread handle.
//!
//! One dedicated thread owns a [`mio::Poll`] instance and a registry of
//! event handlers keyed by [`Token`]. The loop blocks until the OS signals
//! readiness (or another thread wakes it), drains the task queue, then
//! invokes the handler registered for each ready token. All handler state
//! is therefore single-threaded by construction; nothing on the hot path
//! takes a lock.
//!
//! Other threads talk to the loop through [`Handle`]: they enqueue boxed
//! closures on a lock-free queue and wake the poll with a [`mio::Waker`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, trace, warn};

use crate::error::CrusherError;
use crate::reactor::scheduler::{Schedule, Scheduler};
use crate::tcp::PairInfo;

const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// A unit of work executed on the reactor thread.
pub type Task = Box<dyn FnOnce(&mut Core) + Send>;

/// Control operations routed to a handler from the facade side.
///
/// Facades cannot hold references into the loop thread's state, so
/// lifecycle changes travel as messages that the owning handler interprets
/// on the reactor thread.
#[derive(Debug)]
pub enum ControlOp {
    /// Clear all interest bits; sockets and buffers stay intact.
    Freeze,
    /// Restore READ interest, and WRITE wherever output is pending.
    Unfreeze,
    /// Tear down everything the handler owns and unregister it.
    Shutdown,
    /// Close all live sessions but keep the listening socket.
    CloseSessions,
    /// Close the single session keyed by this client address.
    CloseSession(std::net::SocketAddr),
    /// The outbound connect deadline has passed.
    ConnectTimeout,
    /// Report a snapshot of live sessions.
    Snapshot(mpsc::Sender<Vec<PairInfo>>),
    /// Report the number of live sessions.
    SessionCount(mpsc::Sender<usize>),
}

/// A callback target registered with the reactor.
///
/// Handlers run only on the reactor thread. An `Err` return is logged and
/// contained: the loop never exits because a handler failed. Handlers that
/// need cleanup on failure must do it themselves before returning.
pub trait EventHandler {
    /// One or more requested readiness events fired for `token`.
    fn on_ready(&mut self, core: &mut Core, token: Token, event: &Event) -> io::Result<()>;

    /// A control operation was posted from the facade side.
    fn on_control(&mut self, core: &mut Core, op: ControlOp) -> io::Result<()>;
}

/// Thread-confined state owned by the reactor loop.
///
/// Tasks and handler callbacks receive `&mut Core` so they can register
/// sockets, adjust interest sets, and attach or detach handlers.
pub struct Core {
    poll: Poll,
    handlers: HashMap<Token, Rc<RefCell<dyn EventHandler>>>,
    next_token: usize,
    running: bool,
}

impl Core {
    fn new(poll: Poll) -> Self {
        Self {
            poll,
            handlers: HashMap::new(),
            next_token: 0,
            running: true,
        }
    }

    /// Allocates a fresh registration token.
    pub fn next_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if token != WAKER_TOKEN && !self.handlers.contains_key(&token) {
                return token;
            }
        }
    }

    /// Registers a socket with the OS poller under `token`.
    pub fn register_io(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Changes the interest set of an already registered socket.
    pub fn reregister_io(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Removes a socket from the OS poller. The handler entry stays.
    pub fn deregister_io(&mut self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Reconciles the OS registration of `source` with `desired`.
    ///
    /// `current` tracks what the OS has seen so far; `None` means the
    /// socket is not registered. mio has no empty interest set, so "no
    /// interest" maps to deregistration, and re-enabling re-registers
    /// (which re-arms delivery for an already ready socket).
    pub fn set_interest(
        &mut self,
        source: &mut dyn Source,
        token: Token,
        current: &mut Option<Interest>,
        desired: Option<Interest>,
    ) -> io::Result<()> {
        match (*current, desired) {
            (None, Some(interest)) => self.register_io(source, token, interest)?,
            (Some(_), None) => self.deregister_io(source)?,
            (Some(old), Some(interest)) if old != interest => {
                self.reregister_io(source, token, interest)?
            }
            _ => return Ok(()),
        }
        *current = desired;
        Ok(())
    }

    /// Attaches a handler under `token`. One handler may own several
    /// tokens (a TCP pair registers both of its sockets on one handler).
    pub fn insert_handler(&mut self, token: Token, handler: Rc<RefCell<dyn EventHandler>>) {
        self.handlers.insert(token, handler);
    }

    /// Detaches the handler under `token`, if any.
    pub fn remove_handler(&mut self, token: Token) {
        self.handlers.remove(&token);
    }

    /// Looks up the handler under `token`.
    pub fn handler(&self, token: Token) -> Option<Rc<RefCell<dyn EventHandler>>> {
        self.handlers.get(&token).cloned()
    }

    /// Asks the loop to exit after the current iteration.
    pub fn shutdown(&mut self) {
        self.running = false;
    }
}

struct Shared {
    tasks: SegQueue<Task>,
    waker: Waker,
    live: AtomicBool,
}

/// Cheap clonable capability for talking to the reactor from any thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
    scheduler: Scheduler,
}

impl Handle {
    /// Enqueues `f` to run on the reactor thread, FIFO, and wakes the poll.
    pub fn execute<F>(&self, f: F) -> Result<(), CrusherError>
    where
        F: FnOnce(&mut Core) + Send + 'static,
    {
        if !self.shared.live.load(Ordering::Acquire) {
            return Err(CrusherError::ReactorGone);
        }
        self.shared.tasks.push(Box::new(f));
        self.wakeup();
        Ok(())
    }

    /// Runs `f` on the reactor thread and blocks for its result.
    ///
    /// Must not be called from the reactor thread itself (it would wait on
    /// the thread it is blocking); facade operations are documented
    /// accordingly.
    pub fn call<R, F>(&self, f: F) -> Result<R, CrusherError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Core) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.execute(move |core| {
            let _ = tx.send(f(core));
        })?;
        rx.recv().map_err(|_| CrusherError::ReactorGone)
    }

    /// Schedules `f` to run on the reactor thread after `delay`, one shot.
    ///
    /// The returned [`Schedule`] cancels the task if it has not fired yet;
    /// cancellation after firing is a no-op.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Schedule
    where
        F: FnOnce(&mut Core) + Send + 'static,
    {
        self.scheduler.schedule(delay, Box::new(f))
    }

    /// Forces the poll out of its blocking wait.
    pub fn wakeup(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!(error = %e, "reactor wakeup failed");
        }
    }
}

/// Owns the reactor loop thread and the timer thread.
///
/// A single reactor serves any number of crushers. Dropping it (or calling
/// [`Reactor::close`]) stops both threads; sockets still registered are
/// closed as the loop state is dropped.
pub struct Reactor {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Reactor {
    /// Creates the reactor and starts its loop and timer threads.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(Shared {
            tasks: SegQueue::new(),
            waker,
            live: AtomicBool::new(true),
        });

        let scheduler = Scheduler::start({
            let shared = Arc::clone(&shared);
            move |task| {
                if shared.live.load(Ordering::Acquire) {
                    shared.tasks.push(task);
                    if let Err(e) = shared.waker.wake() {
                        warn!(error = %e, "reactor wakeup failed");
                    }
                }
            }
        });

        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("netvice-reactor".to_owned())
            .spawn(move || run_loop(poll, loop_shared))?;

        Ok(Self {
            handle: Handle { shared, scheduler },
            thread: Some(thread),
        })
    }

    /// Returns a cross-thread handle to this reactor.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stops the loop and timer threads and waits for them to exit.
    ///
    /// Idempotent. Registered sockets are closed when the loop state is
    /// dropped.
    pub fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.handle.execute(|core| core.shutdown());
            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
            self.handle.scheduler.stop();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_loop(poll: Poll, shared: Arc<Shared>) {
    let mut core = Core::new(poll);
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    debug!("reactor loop started");

    while core.running {
        // Block here until the OS signals readiness or a handle wakes us.
        if let Err(e) = core.poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %e, "reactor poll failed");
            break;
        }

        // Tasks run before event dispatch so a registration posted from
        // another thread is in place before its first event is delivered.
        while let Some(task) = shared.tasks.pop() {
            task(&mut core);
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }

            // Clone the handler out of the map so it may register or
            // deregister entries (including itself) while running.
            let Some(handler) = core.handler(token) else {
                trace!(token = token.0, "event for a vanished registration");
                continue;
            };

            let result = handler.borrow_mut().on_ready(&mut core, token, event);
            if let Err(e) = result {
                // Contained: the flow that failed has cleaned itself up.
                warn!(token = token.0, error = %e, "handler error");
            }
        }
    }

    shared.live.store(false, Ordering::Release);

    // Unblock callers whose tasks will never run.
    while let Some(task) = shared.tasks.pop() {
        drop(task);
    }

    debug!("reactor loop stopped");
}
