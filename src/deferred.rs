//! The deferred value state machine and its chaining methods.
//!
use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::event_loop::{Scheduler, SchedulerRef};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Deferred`], used in logs and in
/// unhandled rejection reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeferredId(u64);

impl DeferredId {
    fn next() -> Self {
        DeferredId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeferredId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

/// What a [`Deferred`] is settled with.
///
/// `Adopt` is the flattening case: the target takes on the eventual outcome
/// of the given deferred instead of treating it as a value.
pub enum Resolution<T, E> {
    Fulfill(T),
    Reject(E),
    Adopt(Deferred<T, E>),
}

impl<T: Debug, E: Debug> Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Fulfill(value) => f.debug_tuple("Fulfill").field(value).finish(),
            Resolution::Reject(reason) => f.debug_tuple("Reject").field(reason).finish(),
            Resolution::Adopt(deferred) => f.debug_tuple("Adopt").field(deferred).finish(),
        }
    }
}

/// Conversion from handler results into a [`Resolution`].
///
/// A handler returning `Ok(v)` fulfills, `Err(e)` rejects and a returned
/// [`Deferred`] is adopted. Foreign promise-like types can join in by
/// implementing this trait.
pub trait IntoResolution<T, E> {
    fn into_resolution(self) -> Resolution<T, E>;
}

impl<T, E> IntoResolution<T, E> for Resolution<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        self
    }
}

impl<T, E> IntoResolution<T, E> for Result<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        match self {
            Ok(value) => Resolution::Fulfill(value),
            Err(reason) => Resolution::Reject(reason),
        }
    }
}

impl<T, E> IntoResolution<T, E> for Deferred<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Adopt(self)
    }
}

impl<T, E> IntoResolution<T, E> for &Deferred<T, E> {
    fn into_resolution(self) -> Resolution<T, E> {
        Resolution::Adopt(self.clone())
    }
}

type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>)>;

enum Slot<T, E> {
    Pending(Vec<Reaction<T, E>>),
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Slot<T, E> {
    fn state(&self) -> State {
        match self {
            Slot::Pending(_) => State::Pending,
            Slot::Fulfilled(_) => State::Fulfilled,
            Slot::Rejected(_) => State::Rejected,
        }
    }
}

struct Inner<T, E> {
    id: DeferredId,
    slot: Slot<T, E>,
    // The resolver accepted a settlement, possibly an adoption still in flight.
    locked: bool,
    // A reaction was registered at some point.
    handled: bool,
    // Weak so queued reactions do not keep their own queue alive.
    scheduler: Weak<dyn Scheduler>,
}

/// A value that becomes available, or fails, at most once.
///
/// `Deferred` is a cheap handle: clones share the same state.
///
/// # Examples
///
/// ```
/// use deferred::{EventLoop, State};
///
/// let event_loop = EventLoop::new();
/// let number = event_loop.deferred::<f64, String, _>(|resolver| {
///     resolver.resolve(std::f64::consts::PI);
///     resolver.reject("nothing happens".into());
///     resolver.resolve(-1.0);
///     Ok(())
/// });
///
/// assert_eq!(number.state(), State::Fulfilled);
/// assert_eq!(number.value(), Some(std::f64::consts::PI));
/// ```
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Deferred")
                .field("id", &inner.id)
                .field("state", &inner.slot.state())
                .finish(),
            Err(_) => f.debug_struct("Deferred").finish_non_exhaustive(),
        }
    }
}

/// The exclusive settlement capability of one [`Deferred`].
///
/// Clones may be handed to several producers; only the first settlement
/// counts, the rest are ignored.
pub struct Resolver<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Resolver")
                .field("id", &inner.id)
                .field("locked", &inner.locked)
                .finish(),
            Err(_) => f.debug_struct("Resolver").finish_non_exhaustive(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    pub fn resolve(&self, value: T) {
        self.settle(Resolution::Fulfill(value))
    }

    pub fn reject(&self, reason: E) {
        self.settle(Resolution::Reject(reason))
    }

    /// Settle with the eventual outcome of `source`.
    pub fn adopt(&self, source: &Deferred<T, E>) {
        self.settle(Resolution::Adopt(source.clone()))
    }

    /// Settle with anything convertible into a [`Resolution`]. Ignored once
    /// this resolver (or a clone of it) already settled.
    pub fn settle(&self, resolution: impl IntoResolution<T, E>) {
        let id = {
            let mut inner = self.inner.borrow_mut();
            if inner.locked {
                trace!(id = %inner.id, "ignoring repeated settlement");
                return;
            }
            inner.locked = true;
            inner.id
        };
        match resolution.into_resolution() {
            Resolution::Fulfill(value) => complete(&self.inner, Ok(value)),
            Resolution::Reject(reason) => complete(&self.inner, Err(reason)),
            Resolution::Adopt(source) => {
                if Rc::ptr_eq(&source.inner, &self.inner) {
                    warn!(id = %id, "deferred adopting itself, it will never settle");
                    return;
                }
                trace!(id = %id, source = %source.id(), "adopting");
                let target = self.inner.clone();
                source.subscribe(move |outcome| complete(&target, outcome));
            }
        }
    }

    /// Whether a settlement was already accepted.
    pub fn is_locked(&self) -> bool {
        self.inner.borrow().locked
    }
}

/// Moves a pending deferred into its terminal state and queues its reactions.
fn complete<T, E>(inner: &Rc<RefCell<Inner<T, E>>>, outcome: Result<T, E>)
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    let (id, reactions, scheduler, unhandled) = {
        let mut guard = inner.borrow_mut();
        let reactions = match &mut guard.slot {
            Slot::Pending(reactions) => std::mem::take(reactions),
            _ => return,
        };
        guard.slot = match &outcome {
            Ok(value) => Slot::Fulfilled(value.clone()),
            Err(reason) => Slot::Rejected(reason.clone()),
        };
        let unhandled = outcome.is_err() && !guard.handled;
        (guard.id, reactions, guard.scheduler.upgrade(), unhandled)
    };
    trace!(
        id = %id,
        fulfilled = outcome.is_ok(),
        reactions = reactions.len(),
        "settled"
    );
    let Some(scheduler) = scheduler else {
        debug!(id = %id, reactions = reactions.len(), "scheduler gone, dropping reactions");
        return;
    };
    if unhandled {
        if let Err(reason) = &outcome {
            scheduler.track_rejection(id, format!("{reason:?}"));
        }
    }
    for reaction in reactions {
        let outcome = outcome.clone();
        scheduler.schedule(Box::new(move || reaction(outcome)));
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Create a pending deferred and hand its resolver to `setup` right away.
    ///
    /// An `Err` returned from `setup` rejects the deferred, unless `setup`
    /// settled it first.
    /// A panic in `setup` is not turned into a rejection, it unwinds out of
    /// this call.
    ///
    /// # Examples
    ///
    /// ```
    /// use deferred::{Deferred, EventLoop, State};
    ///
    /// let event_loop = EventLoop::new();
    /// let failed: Deferred<(), String> =
    ///     Deferred::new(&event_loop.scheduler(), |_resolver| Err("unexpected problem".into()));
    ///
    /// assert_eq!(failed.state(), State::Rejected);
    /// assert_eq!(failed.reason(), Some("unexpected problem".to_string()));
    /// ```
    pub fn new<F>(scheduler: &SchedulerRef, setup: F) -> Self
    where
        F: FnOnce(&Resolver<T, E>) -> Result<(), E>,
    {
        let (deferred, resolver) = Self::pending(scheduler);
        if let Err(reason) = setup(&resolver) {
            debug!(id = %deferred.id(), "setup failed");
            resolver.reject(reason);
        }
        deferred
    }

    /// A pending deferred together with its resolver.
    pub fn pending(scheduler: &SchedulerRef) -> (Self, Resolver<T, E>) {
        Self::pending_on(Rc::downgrade(scheduler))
    }

    fn pending_on(scheduler: Weak<dyn Scheduler>) -> (Self, Resolver<T, E>) {
        let inner = Rc::new(RefCell::new(Inner {
            id: DeferredId::next(),
            slot: Slot::Pending(Vec::new()),
            locked: false,
            handled: false,
            scheduler,
        }));
        (
            Deferred {
                inner: inner.clone(),
            },
            Resolver { inner },
        )
    }

    pub fn resolved(scheduler: &SchedulerRef, value: T) -> Self {
        Self::from_resolution(scheduler, Resolution::Fulfill(value))
    }

    pub fn rejected(scheduler: &SchedulerRef, reason: E) -> Self {
        Self::from_resolution(scheduler, Resolution::Reject(reason))
    }

    /// A deferred settled with `resolution`. A deferred is returned as is.
    pub fn from_resolution(scheduler: &SchedulerRef, resolution: impl IntoResolution<T, E>) -> Self {
        match resolution.into_resolution() {
            Resolution::Adopt(deferred) => deferred,
            other => {
                let (deferred, resolver) = Self::pending(scheduler);
                resolver.settle(other);
                deferred
            }
        }
    }

    pub fn id(&self) -> DeferredId {
        self.inner.borrow().id
    }

    pub fn state(&self) -> State {
        self.inner.borrow().slot.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn value(&self) -> Option<T> {
        match &self.inner.borrow().slot {
            Slot::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<E> {
        match &self.inner.borrow().slot {
            Slot::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    /// `None` while pending.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().slot {
            Slot::Pending(_) => None,
            Slot::Fulfilled(value) => Some(Ok(value.clone())),
            Slot::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// `None` once the scheduler this deferred was created on is gone.
    pub fn scheduler(&self) -> Option<SchedulerRef> {
        self.inner.borrow().scheduler.upgrade()
    }

    /// Chain a fulfillment handler. Rejections pass through untouched.
    ///
    /// The handler result goes through [`IntoResolution`]: `Ok` fulfills the
    /// returned deferred, `Err` rejects it and a [`Deferred`] is adopted.
    ///
    /// Panics are not converted: a panicking handler unwinds out of the
    /// event loop run that called it and the returned deferred stays pending.
    pub fn then<U, F, R>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> R + 'static,
        R: IntoResolution<U, E>,
    {
        self.chain(move |outcome, next| match outcome {
            Ok(value) => next.settle(on_fulfilled(value)),
            Err(reason) => next.reject(reason),
        })
    }

    /// Chain handlers for both outcomes.
    pub fn then_or<U, F, G, R, S>(&self, on_fulfilled: F, on_rejected: G) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> R + 'static,
        G: FnOnce(E) -> S + 'static,
        R: IntoResolution<U, E>,
        S: IntoResolution<U, E>,
    {
        self.chain(move |outcome, next| match outcome {
            Ok(value) => next.settle(on_fulfilled(value)),
            Err(reason) => next.settle(on_rejected(reason)),
        })
    }

    /// Chain a rejection handler. Returning `Ok` ends the propagation.
    pub fn catch<F, R>(&self, on_rejected: F) -> Deferred<T, E>
    where
        F: FnOnce(E) -> R + 'static,
        R: IntoResolution<T, E>,
    {
        self.chain(move |outcome, next| match outcome {
            Ok(value) => next.resolve(value),
            Err(reason) => next.settle(on_rejected(reason)),
        })
    }

    /// Chain without handlers: the returned deferred mirrors this one.
    pub fn passthrough(&self) -> Deferred<T, E> {
        self.chain(|outcome, next| next.settle(outcome))
    }

    /// Run `f` whatever the outcome, then pass the outcome on.
    pub fn finally<F>(&self, f: F) -> Deferred<T, E>
    where
        F: FnOnce() + 'static,
    {
        self.chain(move |outcome, next| {
            f();
            next.settle(outcome)
        })
    }

    fn chain<U, E2, H>(&self, handler: H) -> Deferred<U, E2>
    where
        U: Clone + 'static,
        E2: Clone + Debug + 'static,
        H: FnOnce(Result<T, E>, &Resolver<U, E2>) + 'static,
    {
        let scheduler = self.inner.borrow().scheduler.clone();
        let (next, resolver) = Deferred::pending_on(scheduler);
        self.subscribe(move |outcome| handler(outcome, &resolver));
        next
    }

    /// Register a raw reaction. It runs on a later turn, exactly once.
    pub(crate) fn subscribe<F>(&self, reaction: F)
    where
        F: FnOnce(Result<T, E>) + 'static,
    {
        let (id, ready, scheduler, was_unhandled) = {
            let mut inner = self.inner.borrow_mut();
            let was_unhandled = !inner.handled;
            inner.handled = true;
            let ready = match &mut inner.slot {
                Slot::Pending(reactions) => {
                    reactions.push(Box::new(reaction));
                    return;
                }
                Slot::Fulfilled(value) => Ok(value.clone()),
                Slot::Rejected(reason) => Err(reason.clone()),
            };
            (inner.id, ready, inner.scheduler.upgrade(), was_unhandled)
        };
        let Some(scheduler) = scheduler else {
            debug!(id = %id, "scheduler gone, dropping reaction");
            return;
        };
        if was_unhandled && ready.is_err() {
            scheduler.untrack_rejection(id);
        }
        scheduler.schedule(Box::new(move || reaction(ready)));
    }
}
