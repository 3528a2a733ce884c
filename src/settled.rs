use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::Deferred;

/// Future over the outcome of a [`Deferred`].
///
/// The outcome is delivered through the deferred's scheduler, so the queue
/// has to be drained before this future can complete.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, MicrotaskQueue};
/// use futures::executor::block_on;
///
/// let queue = MicrotaskQueue::current();
/// let (deferred, resolver) = Deferred::<String, ()>::pending();
/// let settled = deferred.settled();
/// resolver.fulfill("🍓".into());
/// queue.run_until_stalled().unwrap();
/// assert_eq!(block_on(settled), Ok("🍓".to_string()));
/// ```
pub struct Settled<T, E> {
    promise: Rc<RefCell<Inner<T, E>>>,
}

struct Inner<T, E> {
    value: Option<Result<T, E>>,
    waker: Option<Waker>,
}

impl<T, E> Settled<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub(crate) fn new(deferred: &Deferred<T, E>) -> Self {
        let promise = Rc::new(RefCell::new(Inner {
            value: None,
            waker: None,
        }));
        let fulfilled = promise.clone();
        let rejected = promise.clone();
        deferred.observe(
            Box::new(move |value| deliver(&fulfilled, Ok(value))),
            Box::new(move |reason| deliver(&rejected, Err(reason))),
        );
        Settled { promise }
    }
}

fn deliver<T, E>(promise: &RefCell<Inner<T, E>>, value: Result<T, E>) {
    let waker = {
        let mut promise = promise.borrow_mut();
        promise.value = Some(value);
        promise.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake()
    }
}

impl<T, E> Future for Settled<T, E> {
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

impl<T, E> fmt::Debug for Settled<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settled")
            .field("ready", &self.promise.borrow().value.is_some())
            .finish()
    }
}
