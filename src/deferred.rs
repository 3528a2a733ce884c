use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::IntoFuture;
use std::rc::Rc;

use log::{trace, warn};

use crate::microtask::{MicrotaskQueue, Scheduler};
use crate::settle::{Settle, Thenable};
use crate::settled::Settled;

pub(crate) type Observer<V> = Box<dyn FnOnce(V)>;

/// How an observer is delivered once its deferred settles.
enum Hook<V> {
    /// Handed to this deferred's scheduler.
    Defer(Observer<V>),
    /// Called inline; only used for forwarding that re-defers on the
    /// adopting deferred's own scheduler.
    Relay(Observer<V>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

enum Slot<T, E> {
    Pending {
        on_fulfill: Vec<Hook<T>>,
        on_reject: Vec<Hook<E>>,
        /// Resolved with another deferred or thenable; external settlement
        /// is locked out until that one settles.
        adopted: bool,
    },
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    slot: RefCell<Slot<T, E>>,
    scheduler: Rc<dyn Scheduler>,
}

/// A result that becomes available later, settled exactly once.
///
/// Cloning a `Deferred` clones the handle, not the result.
///
/// # Examples
///
/// ```
/// use deferred::{Deferred, MicrotaskQueue, Settle};
///
/// let queue = MicrotaskQueue::current();
/// let failed = Deferred::<i32, String>::new(|_| Err("boom".into()))
///     .and_then(|v| Settle::Fulfill(v + 1))
///     .catch(|reason| Settle::<i32, ()>::Fulfill(reason.len() as i32));
/// assert_eq!(queue.run_until(&failed), Ok(Ok(4)));
/// ```
pub struct Deferred<T, E> {
    inner: Rc<Inner<T, E>>,
}

/// The settlement capability handed to a producer.
///
/// Only the first `fulfill`, `reject` or `resolve` has an effect.
pub struct Resolver<T, E> {
    inner: Rc<Inner<T, E>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> Inner<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn accepts_settlement(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Pending { adopted: false, .. })
    }

    fn lock_adopted(&self) {
        if let Slot::Pending { adopted, .. } = &mut *self.slot.borrow_mut() {
            *adopted = true;
        }
    }

    fn settle(&self, outcome: Result<T, E>) {
        let mut slot = self.slot.borrow_mut();
        let next = match (&*slot, &outcome) {
            (Slot::Pending { .. }, Ok(value)) => Slot::Fulfilled(value.clone()),
            (Slot::Pending { .. }, Err(reason)) => Slot::Rejected(reason.clone()),
            _ => {
                trace!("ignoring settlement of an already settled deferred");
                return;
            }
        };
        let Slot::Pending { on_fulfill, on_reject, .. } = std::mem::replace(&mut *slot, next) else {
            return;
        };
        drop(slot);

        // The losing side's observers are dropped with this frame.
        match outcome {
            Ok(value) => {
                trace!("deferred fulfilled, dispatching {} observers", on_fulfill.len());
                self.dispatch(on_fulfill, value);
            }
            Err(reason) => {
                trace!("deferred rejected, dispatching {} observers", on_reject.len());
                self.dispatch(on_reject, reason);
            }
        }
    }

    fn settle_later(self: Rc<Self>, outcome: Result<T, E>) {
        let scheduler = self.scheduler.clone();
        scheduler.defer(Box::new(move || self.settle(outcome)));
    }

    fn dispatch<V: Clone + 'static>(&self, hooks: Vec<Hook<V>>, value: V) {
        for hook in hooks {
            self.fire(hook, value.clone());
        }
    }

    fn fire<V: 'static>(&self, hook: Hook<V>, value: V) {
        match hook {
            Hook::Defer(observer) => self.scheduler.defer(Box::new(move || observer(value))),
            Hook::Relay(observer) => observer(value),
        }
    }

    fn observe(&self, on_fulfill: Observer<T>, on_reject: Observer<E>) {
        self.hook(Hook::Defer(on_fulfill), Hook::Defer(on_reject));
    }

    fn relay(&self, on_fulfill: Observer<T>, on_reject: Observer<E>) {
        self.hook(Hook::Relay(on_fulfill), Hook::Relay(on_reject));
    }

    fn hook(&self, on_fulfill: Hook<T>, on_reject: Hook<E>) {
        let mut slot = self.slot.borrow_mut();
        let ready = match &mut *slot {
            Slot::Pending {
                on_fulfill: fulfills,
                on_reject: rejects,
                ..
            } => {
                fulfills.push(on_fulfill);
                rejects.push(on_reject);
                return;
            }
            Slot::Fulfilled(value) => Ok(value.clone()),
            Slot::Rejected(reason) => Err(reason.clone()),
        };
        drop(slot);
        match ready {
            Ok(value) => self.fire(on_fulfill, value),
            Err(reason) => self.fire(on_reject, reason),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    pub fn fulfill(&self, value: T) {
        self.resolve(Settle::Fulfill(value));
    }

    pub fn reject(&self, reason: E) {
        self.resolve(Settle::Reject(reason));
    }

    /// Settles with a value, a reason, or the eventual outcome of another
    /// deferred or thenable.
    pub fn resolve(&self, settle: Settle<T, E>) {
        if !self.inner.accepts_settlement() {
            trace!("ignoring settlement of a deferred that is no longer open");
            return;
        }
        match settle {
            Settle::Fulfill(value) => self.inner.settle(Ok(value)),
            Settle::Reject(reason) => self.inner.settle(Err(reason)),
            Settle::Adopt(source) => self.adopt(source),
            Settle::Thenable(thenable) => match thenable.as_deferred() {
                Some(source) => self.adopt(source),
                None => self.adopt_thenable(thenable),
            },
        }
    }

    /// Whether a call to `fulfill`, `reject` or `resolve` would still count.
    pub fn is_open(&self) -> bool {
        self.inner.accepts_settlement()
    }

    fn adopt(&self, source: Deferred<T, E>) {
        if Rc::ptr_eq(&self.inner, &source.inner) {
            warn!("deferred resolved with itself; it will stay pending");
            return;
        }
        self.inner.lock_adopted();
        let fulfilled = self.inner.clone();
        let rejected = self.inner.clone();
        // Delivery goes through this deferred's scheduler, whatever queue
        // the source lives on.
        source.inner.relay(
            Box::new(move |value| fulfilled.settle_later(Ok(value))),
            Box::new(move |reason| rejected.settle_later(Err(reason))),
        );
    }

    fn adopt_thenable(&self, thenable: Box<dyn Thenable<T, E>>) {
        self.inner.lock_adopted();
        let fulfilled = self.inner.clone();
        let rejected = self.inner.clone();
        // Foreign code is never entered on the resolving stack.
        self.inner.scheduler.defer(Box::new(move || {
            thenable.subscribe(
                Box::new(move |value| fulfilled.settle(Ok(value))),
                Box::new(move |reason| rejected.settle(Err(reason))),
            )
        }));
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Runs `producer` right away on the thread's [`MicrotaskQueue`]. An
    /// `Err` returned by `producer` rejects the deferred.
    pub fn new<P>(producer: P) -> Self
    where
        P: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        Self::new_in(MicrotaskQueue::current(), producer)
    }

    pub fn new_in<S, P>(scheduler: Rc<S>, producer: P) -> Self
    where
        S: Scheduler + 'static,
        P: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (deferred, resolver) = Self::pending_in(scheduler);
        if let Err(reason) = producer(resolver.clone()) {
            resolver.reject(reason);
        }
        deferred
    }

    /// A pending deferred and the resolver that settles it.
    pub fn pending() -> (Self, Resolver<T, E>) {
        Self::pending_in(MicrotaskQueue::current())
    }

    pub fn pending_in<S>(scheduler: Rc<S>) -> (Self, Resolver<T, E>)
    where
        S: Scheduler + 'static,
    {
        Self::with_scheduler(scheduler)
    }

    fn with_scheduler(scheduler: Rc<dyn Scheduler>) -> (Self, Resolver<T, E>) {
        let inner = Rc::new(Inner {
            slot: RefCell::new(Slot::Pending {
                on_fulfill: Vec::new(),
                on_reject: Vec::new(),
                adopted: false,
            }),
            scheduler,
        });
        (Deferred { inner: inner.clone() }, Resolver { inner })
    }

    pub fn fulfilled(value: T) -> Self {
        Self::fulfilled_in(MicrotaskQueue::current(), value)
    }

    pub fn fulfilled_in<S>(scheduler: Rc<S>, value: T) -> Self
    where
        S: Scheduler + 'static,
    {
        let (deferred, resolver) = Self::pending_in(scheduler);
        resolver.fulfill(value);
        deferred
    }

    /// Always a plain rejection; `reason` is never adopted.
    pub fn rejected(reason: E) -> Self {
        Self::rejected_in(MicrotaskQueue::current(), reason)
    }

    pub fn rejected_in<S>(scheduler: Rc<S>, reason: E) -> Self
    where
        S: Scheduler + 'static,
    {
        let (deferred, resolver) = Self::pending_in(scheduler);
        resolver.reject(reason);
        deferred
    }

    /// Wraps `settle` in a deferred. A deferred passed in is returned as is.
    pub fn resolve(settle: Settle<T, E>) -> Self {
        match settle {
            Settle::Adopt(deferred) => deferred,
            settle => Self::resolve_in(MicrotaskQueue::current(), settle),
        }
    }

    /// Like [`resolve`](Self::resolve), but the result always lives on
    /// `scheduler`; a deferred passed in is followed, not returned.
    pub fn resolve_in<S>(scheduler: Rc<S>, settle: Settle<T, E>) -> Self
    where
        S: Scheduler + 'static,
    {
        let (deferred, resolver) = Self::pending_in(scheduler);
        resolver.resolve(settle);
        deferred
    }

    pub fn state(&self) -> State {
        match *self.inner.slot.borrow() {
            Slot::Pending { .. } => State::Pending,
            Slot::Fulfilled(_) => State::Fulfilled,
            Slot::Rejected(_) => State::Rejected,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// A copy of the result, once settled.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        match &*self.inner.slot.borrow() {
            Slot::Pending { .. } => None,
            Slot::Fulfilled(value) => Some(Ok(value.clone())),
            Slot::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    /// Chains a continuation for each outcome and returns the deferred they
    /// settle.
    ///
    /// Whichever continuation applies runs through the scheduler, never
    /// inside this call, even when `self` is already settled. Pass
    /// `Settle::Fulfill` or `Settle::Reject` to forward an outcome untouched.
    pub fn then<T2, E2, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<T2, E2>
    where
        T2: Clone + 'static,
        E2: Clone + 'static,
        F: FnOnce(T) -> Settle<T2, E2> + 'static,
        R: FnOnce(E) -> Settle<T2, E2> + 'static,
    {
        let (next, resolver) = Deferred::with_scheduler(self.inner.scheduler.clone());
        let rejecting = resolver.clone();
        self.inner.observe(
            Box::new(move |value| resolver.resolve(on_fulfilled(value))),
            Box::new(move |reason| rejecting.resolve(on_rejected(reason))),
        );
        next
    }

    /// A new deferred that settles exactly like this one.
    pub fn chain(&self) -> Self {
        self.then(Settle::Fulfill, Settle::Reject)
    }

    /// Continues on fulfillment; a rejection propagates unchanged.
    pub fn and_then<T2, F>(&self, on_fulfilled: F) -> Deferred<T2, E>
    where
        T2: Clone + 'static,
        F: FnOnce(T) -> Settle<T2, E> + 'static,
    {
        self.then(on_fulfilled, Settle::Reject)
    }

    /// Continues on rejection; a value propagates unchanged.
    pub fn catch<E2, R>(&self, on_rejected: R) -> Deferred<T, E2>
    where
        E2: Clone + 'static,
        R: FnOnce(E) -> Settle<T, E2> + 'static,
    {
        self.then(Settle::Fulfill, on_rejected)
    }

    /// Runs `on_settled` on either outcome and forwards the outcome as is,
    /// unless `on_settled` fails, in which case its error rejects instead.
    pub fn finally<F>(&self, on_settled: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + 'static,
    {
        let on_fulfilled = Rc::new(Cell::new(Some(on_settled)));
        let on_rejected = on_fulfilled.clone();
        self.then(
            move |value| match on_fulfilled.take().map_or(Ok(()), |on_settled| on_settled()) {
                Ok(()) => Settle::Fulfill(value),
                Err(failure) => Settle::Reject(failure),
            },
            move |reason| match on_rejected.take().map_or(Ok(()), |on_settled| on_settled()) {
                Ok(()) => Settle::Reject(reason),
                Err(failure) => Settle::Reject(failure),
            },
        )
    }

    /// A future resolving to this deferred's outcome.
    pub fn settled(&self) -> Settled<T, E> {
        Settled::new(self)
    }

    pub(crate) fn observe(&self, on_fulfill: Observer<T>, on_reject: Observer<E>) {
        self.inner.observe(on_fulfill, on_reject);
    }
}

impl<T, E> Thenable<T, E> for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn subscribe(self: Box<Self>, on_fulfilled: Box<dyn FnOnce(T)>, on_rejected: Box<dyn FnOnce(E)>) {
        self.observe(on_fulfilled, on_rejected);
    }

    fn as_deferred(&self) -> Option<Deferred<T, E>> {
        Some(self.clone())
    }
}

impl<T, E> From<Settle<T, E>> for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn from(settle: Settle<T, E>) -> Self {
        Deferred::resolve(settle)
    }
}

impl<T, E> IntoFuture for Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled()
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner.slot.borrow() {
            Slot::Pending { on_fulfill, adopted, .. } => f
                .debug_struct("Deferred")
                .field("state", &State::Pending)
                .field("observers", &on_fulfill.len())
                .field("adopted", adopted)
                .finish(),
            Slot::Fulfilled(value) => f.debug_struct("Deferred").field("fulfilled", value).finish(),
            Slot::Rejected(reason) => f.debug_struct("Deferred").field("rejected", reason).finish(),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Rc<RefCell<Vec<String>>>;

    fn push(log: &Log, entry: impl Into<String>) {
        log.borrow_mut().push(entry.into());
    }

    #[test]
    fn first_settlement_wins() {
        let queue = MicrotaskQueue::new();
        let (deferred, resolver) = Deferred::<&str, &str>::pending_in(queue.clone());
        resolver.fulfill("a");
        resolver.fulfill("b");
        resolver.reject("c");
        assert_eq!(deferred.outcome(), Some(Ok("a")));
        assert!(!resolver.is_open());
    }

    #[test]
    fn producer_error_rejects() {
        let queue = MicrotaskQueue::new();
        let deferred = Deferred::<u8, String>::new_in(queue, |_| Err("bad input".into()));
        assert_eq!(deferred.outcome(), Some(Err("bad input".into())));
    }

    #[test]
    fn producer_error_after_fulfill_is_ignored() {
        let queue = MicrotaskQueue::new();
        let deferred = Deferred::<u8, String>::new_in(queue, |resolver| {
            resolver.fulfill(1);
            Err("too late".into())
        });
        assert_eq!(deferred.state(), State::Fulfilled);
    }

    #[test]
    fn observers_run_in_registration_order() {
        let queue = MicrotaskQueue::new();
        let log: Log = Rc::default();
        let (deferred, resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        for name in ["f1", "f2", "f3"] {
            let log = log.clone();
            deferred.and_then(move |v| {
                push(&log, format!("{name}:{v}"));
                Settle::Fulfill(())
            });
        }
        resolver.fulfill(9);
        assert!(log.borrow().is_empty());
        queue.run_until_stalled().unwrap();
        assert_eq!(*log.borrow(), vec!["f1:9", "f2:9", "f3:9"]);
    }

    #[test]
    fn continuation_on_settled_source_waits_for_the_queue() {
        let queue = MicrotaskQueue::new();
        let log: Log = Rc::default();
        let (deferred, resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        resolver.fulfill(1);

        let inner = log.clone();
        deferred.and_then(move |_| {
            push(&inner, "callback");
            Settle::Fulfill(())
        });
        push(&log, "after then");
        queue.run_until_stalled().unwrap();
        assert_eq!(*log.borrow(), vec!["after then", "callback"]);
    }

    #[test]
    fn missing_reject_handler_propagates() {
        let queue = MicrotaskQueue::new();
        let (deferred, resolver) = Deferred::<u32, &str>::pending_in(queue.clone());
        let chained = deferred.chain().and_then(|v| Settle::Fulfill(v + 1));
        resolver.reject("x");
        assert_eq!(queue.run_until(&chained), Ok(Err("x")));
    }

    #[test]
    fn reject_handler_plain_reason_rejects() {
        let queue = MicrotaskQueue::new();
        let (deferred, resolver) = Deferred::<u32, &str>::pending_in(queue.clone());
        let chained = deferred.then(Settle::Fulfill, |e: &str| Settle::<u32, usize>::Reject(e.len()));
        resolver.reject("four");
        assert_eq!(queue.run_until(&chained), Ok(Err(4)));
    }

    #[test]
    fn nested_adoption_flattens() {
        let queue = MicrotaskQueue::new();
        let inner_queue = queue.clone();
        let (deferred, resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        let flattened = deferred.and_then(move |v| {
            let (outer, outer_resolver) = Deferred::pending_in(inner_queue.clone());
            let (innermost, innermost_resolver) = Deferred::pending_in(inner_queue);
            outer_resolver.resolve(Settle::Adopt(innermost));
            innermost_resolver.fulfill(v * 3);
            Settle::Adopt(outer)
        });
        resolver.fulfill(2);
        assert_eq!(queue.run_until(&flattened), Ok(Ok(6)));
    }

    #[test]
    fn adoption_locks_out_direct_settlement() {
        let queue = MicrotaskQueue::new();
        let (source, source_resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        let (target, resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        resolver.resolve(Settle::Adopt(source));
        assert!(!resolver.is_open());
        resolver.fulfill(1);
        assert!(target.is_pending());

        source_resolver.fulfill(2);
        assert_eq!(queue.run_until(&target), Ok(Ok(2)));
    }

    #[test]
    fn self_adoption_stays_pending() {
        let queue = MicrotaskQueue::new();
        let (deferred, resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        resolver.resolve(Settle::Adopt(deferred.clone()));
        assert!(resolver.is_open());
        queue.run_until_stalled().unwrap();
        assert!(deferred.is_pending());
    }

    #[test]
    fn finally_runs_once_and_forwards() {
        let queue = MicrotaskQueue::new();
        let calls = Rc::new(Cell::new(0));
        let counted = calls.clone();
        let (deferred, resolver) = Deferred::<u32, &str>::pending_in(queue.clone());
        let after = deferred.finally(move || {
            counted.set(counted.get() + 1);
            Ok(())
        });
        resolver.reject("e");
        assert_eq!(queue.run_until(&after), Ok(Err("e")));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn failing_finally_rejects_on_both_paths() {
        let queue = MicrotaskQueue::new();
        let (fulfilled, fulfill) = Deferred::<u32, &str>::pending_in(queue.clone());
        let (rejected, reject) = Deferred::<u32, &str>::pending_in(queue.clone());
        let after_fulfilled = fulfilled.finally(|| Err("cleanup failed"));
        let after_rejected = rejected.finally(|| Err("cleanup failed"));
        fulfill.fulfill(7);
        reject.reject("original");
        assert_eq!(queue.run_until(&after_fulfilled), Ok(Err("cleanup failed")));
        assert_eq!(queue.run_until(&after_rejected), Ok(Err("cleanup failed")));
    }

    #[test]
    fn self_adoption_through_thenable_stays_open() {
        let queue = MicrotaskQueue::new();
        let (deferred, resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        resolver.resolve(Settle::thenable(deferred.clone()));
        assert!(resolver.is_open());
        queue.run_until_stalled().unwrap();
        assert!(deferred.is_pending());

        resolver.fulfill(3);
        assert_eq!(deferred.outcome(), Some(Ok(3)));
    }

    #[test]
    fn adoption_is_delivered_on_the_adopters_queue() {
        let foreign = MicrotaskQueue::new();
        let local = MicrotaskQueue::new();
        let (source, source_resolver) = Deferred::<u32, ()>::pending_in(foreign.clone());
        let (target, resolver) = Deferred::<u32, ()>::pending_in(local.clone());
        resolver.resolve(Settle::Adopt(source));
        source_resolver.fulfill(5);
        assert!(foreign.is_empty());
        assert_eq!(local.run_until(&target), Ok(Ok(5)));
    }

    #[test]
    fn never_settled_deferred_runs_nothing() {
        let queue = MicrotaskQueue::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let deferred = Deferred::<u32, ()>::new_in(queue.clone(), |_| Ok(()));
        deferred.then(
            move |_| {
                flag.set(true);
                Settle::<(), ()>::Fulfill(())
            },
            Settle::Reject,
        );
        assert_eq!(queue.run_until_stalled(), Ok(0));
        assert!(!ran.get());
        assert!(deferred.is_pending());
    }

    #[test]
    fn resolve_returns_given_deferred() {
        let (deferred, _resolver) = Deferred::<u32, ()>::pending();
        let same = Deferred::resolve(Settle::Adopt(deferred.clone()));
        assert!(Rc::ptr_eq(&same.inner, &deferred.inner));
    }
}
