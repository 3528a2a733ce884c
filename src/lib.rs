//! Deferred values for a single-threaded, cooperative host.
//!
//! A [`Deferred`] holds a result that is not known yet. The producer that
//! creates it gets a [`Resolver`] and settles it exactly once; consumers chain
//! continuations with [`Deferred::then`] before or after that happens.
//! Continuations never run on the caller's stack: they are handed to a
//! [`Scheduler`], by default the thread's [`MicrotaskQueue`].
//!
//! # Examples
//!
//! ```
//! use deferred::{Deferred, MicrotaskQueue, Settle};
//!
//! let queue = MicrotaskQueue::current();
//! let (deferred, resolver) = Deferred::<i32, String>::pending();
//! let doubled = deferred
//!     .and_then(|v| Settle::Adopt(Deferred::fulfilled(v * 2)))
//!     .and_then(|v| Settle::Fulfill(v + 1));
//!
//! resolver.fulfill(5);
//! assert_eq!(queue.run_until(&doubled), Ok(Ok(11)));
//! ```
use thiserror::Error;

pub mod deferred;
pub mod microtask;
pub mod options;
pub mod settle;
pub mod settled;

pub use deferred::{Deferred, Resolver, State};
pub use microtask::{MicrotaskQueue, Scheduler, Task};
pub use options::Options;
pub use settle::{Settle, Thenable};
pub use settled::Settled;

/// Failures of the microtask queue itself. Failures of a computation are
/// the `E` of its [`Deferred`] and never show up here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("microtask queue is already being drained")]
    Reentrant,
    #[error("microtask queue ran dry before the deferred settled")]
    Stalled,
    #[error("task budget exhausted after {ran} tasks")]
    BudgetExhausted { ran: usize },
}
