use std::fmt;

use crate::Deferred;

/// What a continuation hands back to the deferred it feeds.
///
/// The tuple constructors double as the identity continuations:
/// `Settle::Fulfill` passes a value through, `Settle::Reject` re-raises a
/// reason.
pub enum Settle<T, E> {
    Fulfill(T),
    Reject(E),
    /// Take on the eventual outcome of another deferred.
    Adopt(Deferred<T, E>),
    /// Take on the eventual outcome of a foreign [`Thenable`].
    Thenable(Box<dyn Thenable<T, E>>),
}

impl<T, E> Settle<T, E> {
    pub fn thenable<N>(thenable: N) -> Settle<T, E>
    where
        N: Thenable<T, E> + 'static,
    {
        Settle::Thenable(Box::new(thenable))
    }
}

impl<T, E> From<Result<T, E>> for Settle<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Settle::Fulfill(value),
            Err(reason) => Settle::Reject(reason),
        }
    }
}

impl<T, E> From<Deferred<T, E>> for Settle<T, E> {
    fn from(deferred: Deferred<T, E>) -> Self {
        Settle::Adopt(deferred)
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Settle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Settle::Fulfill(value) => f.debug_tuple("Fulfill").field(value).finish(),
            Settle::Reject(reason) => f.debug_tuple("Reject").field(reason).finish(),
            Settle::Adopt(deferred) => f.debug_tuple("Adopt").field(deferred).finish(),
            Settle::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Anything that can report a single outcome through a pair of callbacks.
///
/// Implementors may call one callback, both, or neither, at any time; the
/// adopting deferred only honours the first call.
pub trait Thenable<T, E> {
    fn subscribe(self: Box<Self>, on_fulfilled: Box<dyn FnOnce(T)>, on_rejected: Box<dyn FnOnce(E)>);

    /// The deferred behind this thenable, if it is one. Adoption then
    /// follows it directly instead of subscribing.
    fn as_deferred(&self) -> Option<Deferred<T, E>> {
        None
    }
}
