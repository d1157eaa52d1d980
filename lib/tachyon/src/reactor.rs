//! Single-threaded cooperative event loop driving all pipeline components.
//!
//! Every pipeline instance is owned by exactly one reactor and all of its
//! state must be mutated from the reactor thread. The reactor provides
//! descriptor readiness dispatch, absolute-deadline timers, a zero-delay
//! deferred task queue used to break producer/consumer recursion, and a
//! cross-thread execution queue.

use hashbrown::HashSet;
use indexmap::IndexMap;
use quark::logging;
use quark::IoResult;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAKE_TOKEN: mio::Token = mio::Token(0);
const EVENTS_CAPACITY: usize = 1024;

/// Receiver of descriptor readiness events.
pub trait IoHandler {
    fn ready(&self, ready: mio::Ready);
}

/// Identifies a scheduled timer so it can be cancelled.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

type Task = Box<dyn FnOnce()>;
type SendTask = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    id: u64,
    task: Option<Task>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        // Reversed so the binary heap yields the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct SchedulerState {
    handlers: IndexMap<usize, Rc<dyn IoHandler>>,
    timers: BinaryHeap<TimerEntry>,
    cancelled: HashSet<u64>,
}

struct SchedulerInner {
    poll: mio::Poll,
    state: RefCell<SchedulerState>,
    tasks: RefCell<VecDeque<Task>>,
    next_token: Cell<usize>,
    next_timer: Cell<u64>,
    stopped: Cell<bool>,
    log: logging::Logger,
}

/// Cloneable handle to the reactor's scheduling services.
///
/// Only valid on the reactor thread; the cross-thread surface is
/// [`RemoteHandle`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    /// Registers an I/O source and its readiness handler, returning the
    /// assigned poll token.
    pub fn register<E: mio::event::Evented>(
        &self,
        io: &E,
        interest: mio::Ready,
        handler: Rc<dyn IoHandler>,
    ) -> IoResult<mio::Token> {
        let token = mio::Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);

        self.inner
            .poll
            .register(io, token, interest, mio::PollOpt::edge())?;
        self.inner.state.borrow_mut().handlers.insert(token.0, handler);

        logging::trace!(self.inner.log, "handler registered"; "token" => token.0);
        Ok(token)
    }

    /// Updates the interest set of a registered I/O source.
    pub fn reregister<E: mio::event::Evented>(
        &self,
        io: &E,
        token: mio::Token,
        interest: mio::Ready,
    ) -> IoResult<()> {
        self.inner
            .poll
            .reregister(io, token, interest, mio::PollOpt::edge())
            .map_err(Into::into)
    }

    /// Deregisters an I/O source and drops its handler.
    pub fn deregister<E: mio::event::Evented>(&self, io: &E, token: mio::Token) -> IoResult<()> {
        let result = self.inner.poll.deregister(io).map_err(Into::into);
        self.inner.state.borrow_mut().handlers.swap_remove(&token.0);
        logging::trace!(self.inner.log, "handler deregistered"; "token" => token.0);
        result
    }

    /// Queues a task for execution on the next reactor turn.
    ///
    /// This is the zero-delay trampoline which bounds the stack depth of
    /// producer/consumer notification chains.
    pub fn defer<F: FnOnce() + 'static>(&self, task: F) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules a task to run after the given delay.
    pub fn schedule<F: FnOnce() + 'static>(&self, delay: Duration, task: F) -> TimerId {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Schedules a task to run at an absolute deadline.
    pub fn schedule_at<F: FnOnce() + 'static>(&self, deadline: Instant, task: F) -> TimerId {
        let id = self.inner.next_timer.get();
        self.inner.next_timer.set(id + 1);

        self.inner.state.borrow_mut().timers.push(TimerEntry {
            deadline,
            id,
            task: Some(Box::new(task)),
        });

        TimerId(id)
    }

    /// Cancels a scheduled timer. Cancelling an already fired timer is a no-op.
    pub fn cancel(&self, timer: TimerId) {
        self.inner.state.borrow_mut().cancelled.insert(timer.0);
    }

    /// Requests the reactor to stop after the current turn.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
    }

    /// The reactor's logger.
    pub fn log(&self) -> &logging::Logger {
        &self.inner.log
    }
}

struct RemoteShared {
    tasks: Mutex<Vec<SendTask>>,
    stopped: AtomicBool,
}

/// Thread-safe handle for injecting work into the reactor.
#[derive(Clone)]
pub struct RemoteHandle {
    shared: Arc<RemoteShared>,
    readiness: mio::SetReadiness,
}

impl RemoteHandle {
    /// Queues a task for execution on the reactor thread and wakes the
    /// reactor. The caller does not observe completion.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, task: F) {
        {
            let mut tasks = self.shared.tasks.lock().expect("Remote queue poisoned");
            tasks.push(Box::new(task));
        }
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }

    /// Requests reactor shutdown from any thread.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, AtomicOrdering::Release);
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }

    /// Wakes the reactor without queueing work.
    pub fn wake(&self) {
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }
}

/// The event loop. See module documentation.
pub struct Reactor {
    scheduler: Scheduler,
    events: mio::Events,
    remote: Arc<RemoteShared>,
    remote_readiness: mio::SetReadiness,
    // Keeps the wakeup descriptor registered for the reactor's lifetime.
    _registration: mio::Registration,
}

impl Reactor {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> IoResult<Reactor> {
        let poll = mio::Poll::new()?;
        let (registration, readiness) = mio::Registration::new2();
        poll.register(
            &registration,
            WAKE_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        let scheduler = Scheduler {
            inner: Rc::new(SchedulerInner {
                poll,
                state: RefCell::new(SchedulerState {
                    handlers: IndexMap::new(),
                    timers: BinaryHeap::new(),
                    cancelled: HashSet::new(),
                }),
                tasks: RefCell::new(VecDeque::new()),
                next_token: Cell::new(WAKE_TOKEN.0 + 1),
                next_timer: Cell::new(0),
                stopped: Cell::new(false),
                log: logging::child_or_discard(log),
            }),
        };

        Ok(Reactor {
            scheduler,
            events: mio::Events::with_capacity(EVENTS_CAPACITY),
            remote: Arc::new(RemoteShared {
                tasks: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
            }),
            remote_readiness: readiness,
            _registration: registration,
        })
    }

    /// Scheduling services handle for constructing components on this reactor.
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Thread-safe handle for cross-thread task injection and shutdown.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            shared: self.remote.clone(),
            readiness: self.remote_readiness.clone(),
        }
    }

    fn stopped(&self) -> bool {
        self.scheduler.inner.stopped.get()
            || self.remote.stopped.load(AtomicOrdering::Acquire)
    }

    /// Runs one reactor turn: remote tasks, deferred tasks, due timers, then
    /// a single poll bounded by `max_wait`.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> IoResult<()> {
        // Cross-thread injected work
        let remote_tasks: Vec<SendTask> = {
            let mut tasks = self.remote.tasks.lock().expect("Remote queue poisoned");
            tasks.drain(..).collect()
        };
        for task in remote_tasks {
            task();
        }

        // Deferred trampoline tasks queued before this turn. Tasks queued
        // while draining run on the next turn, which is what bounds
        // producer/consumer notification recursion.
        let deferred: VecDeque<Task> = {
            let mut tasks = self.scheduler.inner.tasks.borrow_mut();
            std::mem::take(&mut *tasks)
        };
        for task in deferred {
            task();
        }

        // Fire due timers
        let now = Instant::now();
        loop {
            let due = {
                let state = self.scheduler.inner.state.borrow();
                match state.timers.peek() {
                    Some(entry) => entry.deadline <= now,
                    None => false,
                }
            };
            if !due {
                break;
            }

            let task = {
                let mut state = self.scheduler.inner.state.borrow_mut();
                let mut entry = state.timers.pop().expect("Timer heap out of sync");
                if state.cancelled.remove(&entry.id) {
                    None
                } else {
                    entry.task.take()
                }
            };
            if let Some(task) = task {
                task();
            }
        }

        // Poll descriptors, waiting no longer than the nearest timer
        let timeout = self.poll_timeout(max_wait);
        self.scheduler.inner.poll.poll(&mut self.events, timeout)?;

        let tokens: Vec<(mio::Token, mio::Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        for (token, ready) in tokens {
            if token == WAKE_TOKEN {
                drop(self.remote_readiness.set_readiness(mio::Ready::empty()));
                continue;
            }
            let handler = {
                let state = self.scheduler.inner.state.borrow();
                state.handlers.get(&token.0).cloned()
            };
            if let Some(handler) = handler {
                handler.ready(ready);
            }
        }

        Ok(())
    }

    fn poll_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        if !self.scheduler.inner.tasks.borrow().is_empty() {
            return Some(Duration::from_secs(0));
        }

        let now = Instant::now();
        let next_timer = {
            let state = self.scheduler.inner.state.borrow();
            state.timers.peek().map(|entry| {
                if entry.deadline > now {
                    entry.deadline - now
                } else {
                    Duration::from_secs(0)
                }
            })
        };

        match (next_timer, max_wait) {
            (Some(timer), Some(cap)) => Some(timer.min(cap)),
            (Some(timer), None) => Some(timer),
            (None, cap) => cap,
        }
    }

    /// Runs until `stop` or `shutdown` is requested.
    pub fn run(&mut self) -> IoResult<()> {
        logging::debug!(self.scheduler.inner.log, "reactor running");
        while !self.stopped() {
            self.turn(Some(Duration::from_millis(500)))?;
        }
        logging::debug!(self.scheduler.inner.log, "reactor stopped");
        Ok(())
    }

    /// Runs until the predicate holds or the timeout elapses. Returns the
    /// final predicate value. Intended for tests and synchronous drivers.
    pub fn run_until<F: FnMut() -> bool>(&mut self, timeout: Duration, mut pred: F) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.stopped() {
                return pred();
            }
            let wait = (deadline - now).min(Duration::from_millis(10));
            if self.turn(Some(wait)).is_err() {
                return pred();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defer_runs_next_turn() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let fired = Rc::new(Cell::new(0));
        let inner = fired.clone();
        let sched2 = sched.clone();
        sched.defer(move || {
            inner.set(inner.get() + 1);
            let inner2 = inner.clone();
            // Task queued while draining must not run within the same turn.
            sched2.defer(move || inner2.set(inner2.get() + 1));
        });

        reactor.turn(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(fired.get(), 1);
        reactor.turn(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn test_timer_fires_in_order() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        sched.schedule(Duration::from_millis(20), move || o1.borrow_mut().push(2));
        sched.schedule(Duration::from_millis(5), move || o2.borrow_mut().push(1));

        let done = order.clone();
        assert!(reactor.run_until(Duration::from_secs(2), || done.borrow().len() == 2));
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_timer_cancel() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let fired = Rc::new(Cell::new(false));
        let inner = fired.clone();
        let timer = sched.schedule(Duration::from_millis(5), move || inner.set(true));
        sched.cancel(timer);

        reactor.run_until(Duration::from_millis(50), || false);
        assert!(!fired.get());
    }

    #[test]
    fn test_remote_execute_wakes_reactor() {
        let mut reactor = Reactor::new(None).unwrap();
        let remote = reactor.remote();

        let hit = Arc::new(AtomicBool::new(false));
        let hit_inner = hit.clone();
        let handle = std::thread::spawn(move || {
            remote.execute(move || hit_inner.store(true, AtomicOrdering::Release));
        });

        let hit_check = hit.clone();
        assert!(reactor.run_until(Duration::from_secs(2), move || {
            hit_check.load(AtomicOrdering::Acquire)
        }));
        handle.join().unwrap();
    }

    #[test]
    fn test_remote_shutdown_stops_run() {
        let mut reactor = Reactor::new(None).unwrap();
        let remote = reactor.remote();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.shutdown();
        });

        reactor.run().unwrap();
        handle.join().unwrap();
    }
}
