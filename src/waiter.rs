use std::cell::RefCell;
use std::fmt::Debug;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::Deferred;

/// A `Future` over the outcome of a [`Deferred`].
///
/// The waiter only completes once the event loop ran the reaction it
/// registered, so whoever polls it must also keep the loop turning.
///
/// # Examples
///
/// ```
/// use deferred::EventLoop;
/// use futures::FutureExt;
///
/// let event_loop = EventLoop::new();
/// let (deferred, resolver) = event_loop.pending::<String, ()>();
/// let mut waiter = deferred.waiter();
/// assert_eq!((&mut waiter).now_or_never(), None);
///
/// resolver.resolve("🍓".into());
/// event_loop.run_until_idle().unwrap();
/// assert_eq!(waiter.now_or_never(), Some(Ok("🍓".to_string())));
/// ```
#[derive(Debug)]
pub struct Waiter<T, E> {
    promise: Rc<RefCell<Inner<T, E>>>,
}

#[derive(Debug)]
struct Inner<T, E> {
    value: Option<Result<T, E>>,
    waker: Option<Waker>,
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    /// Wait on this deferred from async code. Counts as handling a rejection.
    pub fn waiter(&self) -> Waiter<T, E> {
        let promise = Rc::new(RefCell::new(Inner {
            value: None,
            waker: None,
        }));
        let slot = promise.clone();
        self.subscribe(move |outcome| {
            let waker = {
                let mut inner = slot.borrow_mut();
                inner.value = Some(outcome);
                inner.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake()
            }
        });
        Waiter { promise }
    }
}

impl<T, E> IntoFuture for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + Debug + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Waiter<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.waiter()
    }
}

impl<T, E> Future for Waiter<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut promise = self.promise.borrow_mut();
        match promise.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                promise.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
use std::cell::RefCell;
use std::rc::Rc;

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use futures::FutureExt;

use crate::EventLoop;

#[test]
fn test_waiter_resolve() {
    let event_loop = EventLoop::new();
    let (deferred, resolver) = event_loop.pending::<i32, String>();
    let waiter = deferred.then(|n| Ok(n * 3)).waiter();
    resolver.resolve(14);
    event_loop.run_until_idle().unwrap();
    assert_eq!(waiter.now_or_never(), Some(Ok(42)));
}

#[test]
fn test_waiter_reject_is_handled() {
    let event_loop = EventLoop::new();
    let waiter = event_loop.rejected::<(), String>("reject!!".into()).waiter();
    event_loop.run_until_idle().unwrap();
    assert_eq!(waiter.now_or_never(), Some(Err("reject!!".to_string())));
    assert!(event_loop.take_unhandled_rejections().is_empty());
}

#[test]
fn test_await_deferred() {
    let event_loop = EventLoop::new();
    let mut pool = LocalPool::new();
    let (deferred, resolver) = event_loop.pending::<String, ()>();
    let received = Rc::new(RefCell::new(None));
    let slot = received.clone();
    pool.spawner()
        .spawn_local(async move {
            *slot.borrow_mut() = Some(deferred.await);
        })
        .unwrap();

    pool.run_until_stalled();
    assert!(received.borrow().is_none());

    resolver.resolve("🍓".into());
    event_loop.run_until_idle().unwrap();
    pool.run_until_stalled();
    assert_eq!(*received.borrow(), Some(Ok("🍓".to_string())));
}
}
