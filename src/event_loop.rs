//! The task queue deferred reactions run on.
//!
//! Reactions are never run while a deferred is being settled or chained.
//! They are handed to a [`Scheduler`] instead, and [`EventLoop`] is the
//! FIFO scheduler the crate ships with.
//!
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::config::{EventLoopConfig, RejectionPolicy};
use crate::deferred::{Deferred, DeferredId, IntoResolution, Resolver};
use crate::{combinators, Error};

pub type Task = Box<dyn FnOnce()>;

pub type SchedulerRef = Rc<dyn Scheduler>;

/// Where deferreds queue their reactions.
///
/// `schedule` must not run the task before returning. The rejection hooks
/// are told about rejections that have no reaction yet, and about such a
/// rejection getting one later.
pub trait Scheduler {
    fn schedule(&self, task: Task);

    fn track_rejection(&self, _id: DeferredId, _reason: String) {}

    fn untrack_rejection(&self, _id: DeferredId) {}
}

/// A rejection nobody registered a reaction for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhandledRejection {
    pub id: DeferredId,
    /// `Debug` rendering of the reason.
    pub reason: String,
    reported: bool,
}

struct Queue {
    config: EventLoopConfig,
    tasks: RefCell<VecDeque<Task>>,
    // Keyed by id, so iteration runs oldest deferred first.
    unhandled: RefCell<BTreeMap<DeferredId, UnhandledRejection>>,
    running: Cell<bool>,
    turns: Cell<u64>,
}

impl Scheduler for Queue {
    fn schedule(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    fn track_rejection(&self, id: DeferredId, reason: String) {
        trace!(id = %id, "tracking rejection");
        self.unhandled.borrow_mut().insert(
            id,
            UnhandledRejection {
                id,
                reason,
                reported: false,
            },
        );
    }

    fn untrack_rejection(&self, id: DeferredId) {
        if let Some(rejection) = self.unhandled.borrow_mut().remove(&id) {
            if rejection.reported {
                debug!(id = %id, "rejection handled after being reported");
            }
        }
    }
}

/// Clears the running flag even if a task panics.
struct Running<'a>(&'a Cell<bool>);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Single-threaded FIFO event loop. Clones are handles to the same queue.
///
/// # Examples
///
/// ```
/// use deferred::EventLoop;
///
/// let event_loop = EventLoop::new();
/// let first = event_loop.resolved::<&str, ()>("first");
/// let chained = first.then(|s| Ok(s.len()));
/// assert_eq!(event_loop.pending_tasks(), 1);
///
/// assert_eq!(event_loop.run_until_idle(), Ok(1));
/// assert_eq!(chained.value(), Some(5));
/// ```
#[derive(Clone)]
pub struct EventLoop {
    queue: Rc<Queue>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("config", &self.queue.config)
            .field("pending_tasks", &self.pending_tasks())
            .field("turns", &self.turns())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::from_valid_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: EventLoopConfig) -> Self {
        EventLoop {
            queue: Rc::new(Queue {
                config,
                tasks: RefCell::new(VecDeque::new()),
                unhandled: RefCell::new(BTreeMap::new()),
                running: Cell::new(false),
                turns: Cell::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.queue.config
    }

    pub fn scheduler(&self) -> SchedulerRef {
        self.queue.clone()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.tasks.borrow().len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0
    }

    /// Tasks run over the lifetime of this loop.
    pub fn turns(&self) -> u64 {
        self.queue.turns.get()
    }

    fn enter(&self) -> Result<Running<'_>, Error> {
        if self.queue.running.replace(true) {
            return Err(Error::Reentrant);
        }
        Ok(Running(&self.queue.running))
    }

    fn run_task(&self, task: Task) {
        let turn = self.queue.turns.get() + 1;
        self.queue.turns.set(turn);
        trace!(turn, "running task");
        task();
    }

    /// Run the oldest queued task. `Ok(false)` when there was none.
    pub fn run_once(&self) -> Result<bool, Error> {
        let _running = self.enter()?;
        let task = self.queue.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                self.run_task(task);
                Ok(true)
            }
            None => {
                self.report_unhandled();
                Ok(false)
            }
        }
    }

    /// Run tasks, including the ones they schedule, until the queue is
    /// empty. Returns how many ran.
    ///
    /// Unhandled rejections left once idle are reported according to the
    /// configured [`RejectionPolicy`].
    pub fn run_until_idle(&self) -> Result<usize, Error> {
        let _running = self.enter()?;
        let mut ran = 0;
        loop {
            if let Some(limit) = self.queue.config.max_turns {
                if ran >= limit && !self.queue.tasks.borrow().is_empty() {
                    warn!(limit, pending = self.pending_tasks(), "turn limit reached");
                    return Err(Error::TurnLimitExceeded { limit });
                }
            }
            let task = self.queue.tasks.borrow_mut().pop_front();
            let Some(task) = task else { break };
            self.run_task(task);
            ran += 1;
        }
        debug!(ran, "event loop idle");
        self.report_unhandled();
        Ok(ran)
    }

    /// Drive the loop until idle and return the outcome of `deferred`.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{Error, EventLoop};
    ///
    /// let event_loop = EventLoop::new();
    /// let sum = event_loop.all(vec![Ok::<i32, String>(1), Ok(2)]).then(|v| Ok(v.iter().sum::<i32>()));
    /// assert_eq!(event_loop.block_on(&sum), Ok(Ok(3)));
    ///
    /// let (never, _resolver) = event_loop.pending::<i32, String>();
    /// assert_eq!(event_loop.block_on(&never), Err(Error::Stalled(never.id())));
    /// ```
    pub fn block_on<T, E>(&self, deferred: &Deferred<T, E>) -> Result<Result<T, E>, Error>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
    {
        self.run_until_idle()?;
        deferred.outcome().ok_or(Error::Stalled(deferred.id()))
    }

    /// Hand over every retained rejection still lacking a reaction, oldest
    /// first.
    pub fn take_unhandled_rejections(&self) -> Vec<UnhandledRejection> {
        std::mem::take(&mut *self.queue.unhandled.borrow_mut())
            .into_values()
            .collect()
    }

    fn report_unhandled(&self) {
        let policy = self.queue.config.unhandled_rejections;
        let mut unhandled = self.queue.unhandled.borrow_mut();
        for rejection in unhandled.values_mut() {
            if rejection.reported {
                continue;
            }
            rejection.reported = true;
            if policy == RejectionPolicy::Warn {
                warn!(id = %rejection.id, reason = %rejection.reason, "unhandled rejection");
            }
        }
        let Some(max) = self.queue.config.max_retained_rejections else {
            return;
        };
        let excess = unhandled.len().saturating_sub(max);
        if excess == 0 {
            return;
        }
        let evicted: Vec<DeferredId> = unhandled
            .values()
            .filter(|rejection| rejection.reported)
            .map(|rejection| rejection.id)
            .take(excess)
            .collect();
        for id in &evicted {
            unhandled.remove(id);
        }
        debug!(evicted = evicted.len(), retained = unhandled.len(), "dropped old unhandled rejections");
    }

    pub fn deferred<T, E, F>(&self, setup: F) -> Deferred<T, E>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
        F: FnOnce(&Resolver<T, E>) -> Result<(), E>,
    {
        Deferred::new(&self.scheduler(), setup)
    }

    pub fn pending<T, E>(&self) -> (Deferred<T, E>, Resolver<T, E>)
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
    {
        Deferred::pending(&self.scheduler())
    }

    pub fn resolved<T, E>(&self, value: T) -> Deferred<T, E>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
    {
        Deferred::resolved(&self.scheduler(), value)
    }

    pub fn rejected<T, E>(&self, reason: E) -> Deferred<T, E>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
    {
        Deferred::rejected(&self.scheduler(), reason)
    }

    pub fn all<T, E, I>(&self, inputs: I) -> Deferred<Vec<T>, E>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
        I: IntoIterator,
        I::Item: IntoResolution<T, E>,
    {
        combinators::all(&self.scheduler(), inputs)
    }

    pub fn race<T, E, I>(&self, inputs: I) -> Deferred<T, E>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
        I: IntoIterator,
        I::Item: IntoResolution<T, E>,
    {
        combinators::race(&self.scheduler(), inputs)
    }

    pub fn all_settled<T, E, I>(&self, inputs: I) -> Deferred<Vec<Result<T, E>>, E>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
        I: IntoIterator,
        I::Item: IntoResolution<T, E>,
    {
        combinators::all_settled(&self.scheduler(), inputs)
    }

    pub fn any<T, E, I>(&self, inputs: I) -> Deferred<T, Vec<E>>
    where
        T: Clone + 'static,
        E: Clone + Debug + 'static,
        I: IntoIterator,
        I::Item: IntoResolution<T, E>,
    {
        combinators::any(&self.scheduler(), inputs)
    }
}

#[cfg(test)]
mod tests {
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::{EventLoop, Scheduler, SchedulerRef, Task};
use crate::{Deferred, Error, EventLoopConfig, RejectionPolicy};

#[test]
fn test_event_loop_starts_idle() {
    let event_loop = EventLoop::new();
    assert!(event_loop.is_idle());
    assert_eq!(event_loop.run_until_idle(), Ok(0));
    assert_eq!(event_loop.run_once(), Ok(false));
    assert_eq!(event_loop.turns(), 0);
}

#[test]
fn test_tasks_run_fifo() {
    let event_loop = EventLoop::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let scheduler = event_loop.scheduler();
    for n in 0..3 {
        let log = log.clone();
        scheduler.schedule(Box::new(move || log.borrow_mut().push(n)));
    }
    assert_eq!(event_loop.run_once(), Ok(true));
    assert_eq!(*log.borrow(), vec![0]);
    assert_eq!(event_loop.run_until_idle(), Ok(2));
    assert_eq!(*log.borrow(), vec![0, 1, 2]);
    assert_eq!(event_loop.turns(), 3);
}

#[test]
fn test_tasks_scheduled_while_running_run_later() {
    let event_loop = EventLoop::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let scheduler = event_loop.scheduler();
    let inner_log = log.clone();
    let inner_scheduler = scheduler.clone();
    scheduler.schedule(Box::new(move || {
        let nested_log = inner_log.clone();
        inner_scheduler.schedule(Box::new(move || nested_log.borrow_mut().push("nested")));
        inner_log.borrow_mut().push("outer");
    }));
    let second = log.clone();
    scheduler.schedule(Box::new(move || second.borrow_mut().push("second")));
    assert_eq!(event_loop.run_until_idle(), Ok(3));
    assert_eq!(*log.borrow(), vec!["outer", "second", "nested"]);
}

#[test]
fn test_reentrant_run_fails() {
    let event_loop = EventLoop::new();
    let seen = Rc::new(RefCell::new(None));
    let inner_loop = event_loop.clone();
    let inner_seen = seen.clone();
    event_loop
        .scheduler()
        .schedule(Box::new(move || *inner_seen.borrow_mut() = Some(inner_loop.run_until_idle())));
    assert_eq!(event_loop.run_until_idle(), Ok(1));
    assert_eq!(*seen.borrow(), Some(Err(Error::Reentrant)));
}

#[test]
fn test_turn_limit() {
    let config = EventLoopConfig::default().with_max_turns(2);
    let event_loop = EventLoop::with_config(config).unwrap();
    let scheduler = event_loop.scheduler();
    for _ in 0..3 {
        scheduler.schedule(Box::new(|| {}));
    }
    assert_eq!(
        event_loop.run_until_idle(),
        Err(Error::TurnLimitExceeded { limit: 2 })
    );
    assert_eq!(event_loop.pending_tasks(), 1);
    assert_eq!(event_loop.run_until_idle(), Ok(1));
}

#[test]
fn test_invalid_config() {
    let config = EventLoopConfig::default().with_max_turns(0);
    assert!(matches!(
        EventLoop::with_config(config),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_unhandled_rejection_is_collected() {
    let event_loop = EventLoop::new();
    let rejected = event_loop.rejected::<i32, String>("lost".into());
    event_loop.run_until_idle().unwrap();
    let unhandled = event_loop.take_unhandled_rejections();
    assert_eq!(unhandled.len(), 1);
    assert_eq!(unhandled[0].id, rejected.id());
    assert_eq!(unhandled[0].reason, "\"lost\"");
    assert!(event_loop.take_unhandled_rejections().is_empty());
}

#[test]
fn test_handled_rejection_is_not_collected() {
    let event_loop = EventLoop::new();
    let rejected = event_loop.rejected::<i32, String>("caught".into());
    rejected.catch(|_| Ok(0));
    event_loop.run_until_idle().unwrap();
    assert!(event_loop.take_unhandled_rejections().is_empty());
}

#[test]
fn test_rejection_handled_after_report() {
    let config = EventLoopConfig::default().with_rejection_policy(RejectionPolicy::Ignore);
    let event_loop = EventLoop::with_config(config).unwrap();
    let rejected = event_loop.rejected::<i32, String>("late".into());
    event_loop.run_until_idle().unwrap();
    rejected.catch(|_| Ok(1));
    event_loop.run_until_idle().unwrap();
    assert!(event_loop.take_unhandled_rejections().is_empty());
}

#[test]
fn test_block_on_stalled() {
    let event_loop = EventLoop::new();
    let (deferred, _resolver) = event_loop.pending::<(), ()>();
    assert_eq!(
        event_loop.block_on(&deferred),
        Err(Error::Stalled(deferred.id()))
    );
}

struct Lifo(RefCell<Vec<Task>>);

impl Scheduler for Lifo {
    fn schedule(&self, task: Task) {
        self.0.borrow_mut().push(task);
    }
}

#[test]
fn test_custom_scheduler() {
    let lifo = Rc::new(Lifo(RefCell::new(Vec::new())));
    let scheduler: SchedulerRef = lifo.clone();
    let source = Deferred::<i32, ()>::resolved(&scheduler, 1);
    let log = Rc::new(RefCell::new(Vec::new()));
    for name in ["a", "b"] {
        let log = log.clone();
        source.then(move |_| {
            log.borrow_mut().push(name);
            Ok(())
        });
    }
    loop {
        let task = lifo.0.borrow_mut().pop();
        match task {
            Some(task) => task(),
            None => break,
        }
    }
    assert_eq!(*log.borrow(), vec!["b", "a"]);
}

#[test]
fn test_retained_rejections_are_bounded() {
    let config = EventLoopConfig::default()
        .with_rejection_policy(RejectionPolicy::Ignore)
        .with_max_retained_rejections(Some(3));
    let event_loop = EventLoop::with_config(config).unwrap();
    let mut ids = Vec::new();
    for n in 0..10_000 {
        ids.push(event_loop.rejected::<(), i32>(n).id());
        event_loop.run_until_idle().unwrap();
    }
    let retained: Vec<_> = event_loop
        .take_unhandled_rejections()
        .into_iter()
        .map(|rejection| rejection.id)
        .collect();
    assert_eq!(retained, ids[ids.len() - 3..].to_vec());
}

#[test]
fn test_unreported_rejections_are_not_evicted() {
    let config = EventLoopConfig::default().with_max_retained_rejections(Some(1));
    let event_loop = EventLoop::with_config(config).unwrap();
    event_loop.rejected::<(), &str>("a");
    event_loop.rejected::<(), &str>("b");
    // Both are tracked but not reported until the loop goes idle.
    assert_eq!(event_loop.take_unhandled_rejections().len(), 2);
}

struct DropFlag(Rc<Cell<bool>>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn test_dropping_loop_frees_queued_reactions() {
    let event_loop = EventLoop::new();
    let source = event_loop.resolved::<i32, ()>(1);
    let dropped = Rc::new(Cell::new(false));
    let flag = DropFlag(dropped.clone());
    let next = source.then(move |n| {
        drop(flag);
        Ok(n)
    });
    assert_eq!(event_loop.pending_tasks(), 1);

    drop(event_loop);
    assert!(dropped.get());
    assert!(source.scheduler().is_none());

    // Chaining on an orphaned deferred is a quiet no-op.
    let orphan = next.then(|n| Ok(n + 1));
    assert!(orphan.is_pending());
}
}
