//! Single-value deferred computations (promises) driven by an explicit,
//! single-threaded event loop.
//!
//! A [`Deferred`] starts out pending and is settled at most once through its
//! [`Resolver`]. Handlers registered with [`Deferred::then`] and friends never
//! run synchronously; they are queued on a [`Scheduler`] and run when the
//! [`EventLoop`] is driven.
//!
//! # Examples
//!
//! ```
//! use deferred::EventLoop;
//!
//! let event_loop = EventLoop::new();
//! let doubled = event_loop
//!     .deferred::<i32, String, _>(|resolver| {
//!         resolver.resolve(21);
//!         Ok(())
//!     })
//!     .then(|n| Ok(n * 2));
//!
//! // Nothing ran yet, handlers wait for the next turn.
//! assert!(doubled.is_pending());
//!
//! event_loop.run_until_idle().unwrap();
//! assert_eq!(doubled.value(), Some(42));
//! ```
//!
//! Rejections skip every handler without a rejection branch:
//!
//! ```
//! use deferred::EventLoop;
//!
//! let event_loop = EventLoop::new();
//! let recovered = event_loop
//!     .rejected::<i32, String>("bad news".into())
//!     .then(|n| Ok(n + 1))
//!     .then(|n| Ok(n + 2))
//!     .catch(|reason| Ok(reason.len() as i32));
//!
//! event_loop.run_until_idle().unwrap();
//! assert_eq!(recovered.value(), Some(8));
//! ```
pub mod combinators;
pub mod config;
pub mod deferred;
pub mod event_loop;
pub mod waiter;

pub use config::{EventLoopConfig, RejectionPolicy};
pub use deferred::{Deferred, DeferredId, IntoResolution, Resolution, Resolver, State};
pub use event_loop::{EventLoop, Scheduler, SchedulerRef, Task, UnhandledRejection};
pub use waiter::Waiter;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("deferred {0} is still pending after the event loop went idle")]
    Stalled(DeferredId),
    #[error("event loop ran {limit} turns without going idle")]
    TurnLimitExceeded { limit: usize },
    #[error("event loop is already running")]
    Reentrant,
    #[error("invalid event loop config: {0}")]
    InvalidConfig(&'static str),
}
