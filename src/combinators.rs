//! Aggregating several deferreds into one.
//!
//! Inputs are anything [`IntoResolution`]: deferreds are watched, plain
//! `Ok`/`Err` values count as already settled. Results always follow input
//! order, never completion order.
//!
use std::cell::{Cell, RefCell};
use std::fmt::Debug;
use std::rc::Rc;

use crate::deferred::{Deferred, IntoResolution};
use crate::event_loop::SchedulerRef;

fn collect<T, E, I>(scheduler: &SchedulerRef, inputs: I) -> Vec<Deferred<T, E>>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator,
    I::Item: IntoResolution<T, E>,
{
    inputs
        .into_iter()
        .map(|input| Deferred::from_resolution(scheduler, input))
        .collect()
}

/// Slots filled by index, handed out once every one is filled.
struct Gather<V> {
    slots: RefCell<Vec<Option<V>>>,
    remaining: Cell<usize>,
}

impl<V> Gather<V> {
    fn new(len: usize) -> Rc<Self> {
        Rc::new(Gather {
            slots: RefCell::new((0..len).map(|_| None).collect()),
            remaining: Cell::new(len),
        })
    }

    /// Returns every value once the last slot is filled.
    fn fill(&self, index: usize, value: V) -> Option<Vec<V>> {
        self.slots.borrow_mut()[index] = Some(value);
        self.remaining.set(self.remaining.get() - 1);
        if self.remaining.get() > 0 {
            return None;
        }
        Some(self.slots.borrow_mut().drain(..).flatten().collect())
    }
}

/// Fulfills with every value once all inputs fulfilled, or rejects with
/// the first rejection. No inputs fulfills right away with an empty `Vec`.
///
/// # Examples
///
/// ```
/// use deferred::{combinators, EventLoop, Resolution};
///
/// let event_loop = EventLoop::new();
/// let (savings, resolver) = event_loop.pending::<u32, String>();
/// let balances = combinators::all(
///     &event_loop.scheduler(),
///     vec![Resolution::Fulfill(120), Resolution::Adopt(savings)],
/// );
///
/// resolver.resolve(80);
/// event_loop.run_until_idle().unwrap();
/// assert_eq!(balances.value(), Some(vec![120, 80]));
/// ```
pub fn all<T, E, I>(scheduler: &SchedulerRef, inputs: I) -> Deferred<Vec<T>, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator,
    I::Item: IntoResolution<T, E>,
{
    let inputs = collect(scheduler, inputs);
    let (combined, resolver) = Deferred::pending(scheduler);
    if inputs.is_empty() {
        resolver.resolve(Vec::new());
        return combined;
    }
    let gather = Gather::new(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let gather = gather.clone();
        let resolver = resolver.clone();
        input.subscribe(move |outcome| match outcome {
            Ok(value) => {
                if let Some(values) = gather.fill(index, value) {
                    resolver.resolve(values);
                }
            }
            Err(reason) => resolver.reject(reason),
        });
    }
    combined
}

/// Settles like the first input to settle. No inputs never settles.
pub fn race<T, E, I>(scheduler: &SchedulerRef, inputs: I) -> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator,
    I::Item: IntoResolution<T, E>,
{
    let (winner, resolver) = Deferred::pending(scheduler);
    for input in collect(scheduler, inputs) {
        let resolver = resolver.clone();
        input.subscribe(move |outcome| resolver.settle(outcome));
    }
    winner
}

/// Fulfills with every outcome once all inputs settled. Never rejects.
pub fn all_settled<T, E, I>(scheduler: &SchedulerRef, inputs: I) -> Deferred<Vec<Result<T, E>>, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator,
    I::Item: IntoResolution<T, E>,
{
    let inputs = collect(scheduler, inputs);
    let (combined, resolver) = Deferred::pending(scheduler);
    if inputs.is_empty() {
        resolver.resolve(Vec::new());
        return combined;
    }
    let gather = Gather::new(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let gather = gather.clone();
        let resolver = resolver.clone();
        input.subscribe(move |outcome| {
            if let Some(outcomes) = gather.fill(index, outcome) {
                resolver.resolve(outcomes);
            }
        });
    }
    combined
}

/// Fulfills with the first fulfillment, or rejects with every reason once
/// all inputs rejected. No inputs rejects right away with an empty `Vec`.
pub fn any<T, E, I>(scheduler: &SchedulerRef, inputs: I) -> Deferred<T, Vec<E>>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
    I: IntoIterator,
    I::Item: IntoResolution<T, E>,
{
    let inputs = collect(scheduler, inputs);
    let (first, resolver) = Deferred::pending(scheduler);
    if inputs.is_empty() {
        resolver.reject(Vec::new());
        return first;
    }
    let gather = Gather::new(inputs.len());
    for (index, input) in inputs.iter().enumerate() {
        let gather = gather.clone();
        let resolver = resolver.clone();
        input.subscribe(move |outcome| match outcome {
            Ok(value) => resolver.resolve(value),
            Err(reason) => {
                if let Some(reasons) = gather.fill(index, reason) {
                    resolver.reject(reasons);
                }
            }
        });
    }
    first
}
