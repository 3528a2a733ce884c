//! The defer primitive continuations are dispatched through.
//!
//! [`Scheduler`] is what a host event loop implements. [`MicrotaskQueue`] is
//! the bundled FIFO implementation: tasks run in the order they were
//! deferred, and only when someone drains the queue.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::{debug, trace};

use crate::{Deferred, Error, Options};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Runs a task after the current synchronous execution unwinds.
///
/// Implementations must preserve the order tasks were deferred in and must
/// not run `task` inside `defer`.
pub trait Scheduler {
    fn defer(&self, task: Task);
}

thread_local! {
    static CURRENT: Rc<MicrotaskQueue> = MicrotaskQueue::with_options(Options::new());
}

pub struct MicrotaskQueue {
    tasks: RefCell<VecDeque<Task>>,
    draining: Cell<bool>,
    options: Options,
}

/// Clears the draining flag even if a task unwinds.
struct Draining<'a>(&'a Cell<bool>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl MicrotaskQueue {
    pub fn new() -> Rc<MicrotaskQueue> {
        MicrotaskQueue::with_options(Options::new())
    }

    pub fn with_options(options: Options) -> Rc<MicrotaskQueue> {
        Rc::new(MicrotaskQueue {
            tasks: RefCell::new(VecDeque::new()),
            draining: Cell::new(false),
            options,
        })
    }

    /// The queue [`Deferred::new`] and friends use on this thread.
    pub fn current() -> Rc<MicrotaskQueue> {
        CURRENT.with(Rc::clone)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Runs tasks until the queue is empty, including tasks deferred while
    /// draining. Returns how many ran.
    pub fn run_until_stalled(&self) -> Result<usize, Error> {
        self.drain(|| false)
    }

    /// Runs tasks until `deferred` settles and returns its outcome.
    ///
    /// Fails with [`Error::Stalled`] if the queue empties first.
    pub fn run_until<T, E>(&self, deferred: &Deferred<T, E>) -> Result<Result<T, E>, Error>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        self.drain(|| !deferred.is_pending())?;
        deferred.outcome().ok_or(Error::Stalled)
    }

    fn drain(&self, mut done: impl FnMut() -> bool) -> Result<usize, Error> {
        if self.draining.replace(true) {
            return Err(Error::Reentrant);
        }
        let _draining = Draining(&self.draining);

        let mut ran = 0;
        while !done() {
            let spent = self.options.budget.is_some_and(|budget| ran >= budget);
            if spent && !self.is_empty() {
                debug!("queue {}: budget spent after {} tasks", self.options.label(), ran);
                return Err(Error::BudgetExhausted { ran });
            }
            // The borrow must end before the task runs; tasks defer more tasks.
            let next = self.tasks.borrow_mut().pop_front();
            let Some(task) = next else { break };
            task();
            ran += 1;
        }
        debug!("queue {}: drained {} tasks", self.options.label(), ran);
        Ok(ran)
    }
}

impl Scheduler for MicrotaskQueue {
    fn defer(&self, task: Task) {
        let mut tasks = self.tasks.borrow_mut();
        tasks.push_back(task);
        trace!("queue {}: deferred task, {} queued", self.options.label(), tasks.len());
    }
}

impl fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("queued", &self.len())
            .field("draining", &self.draining.get())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(log: &Rc<RefCell<Vec<u32>>>, n: u32) -> Task {
        let log = log.clone();
        Box::new(move || log.borrow_mut().push(n))
    }

    #[test]
    fn runs_tasks_in_defer_order() {
        let queue = MicrotaskQueue::new();
        let log = Rc::new(RefCell::new(vec![]));
        for n in 1..=3 {
            queue.defer(record(&log, n));
        }
        assert!(log.borrow().is_empty());
        assert_eq!(queue.run_until_stalled(), Ok(3));
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn tasks_deferred_while_draining_run_in_same_drain() {
        let queue = MicrotaskQueue::new();
        let log = Rc::new(RefCell::new(vec![]));
        let inner = queue.clone();
        let inner_log = log.clone();
        queue.defer(Box::new(move || {
            inner_log.borrow_mut().push(1);
            inner.defer(record(&inner_log, 3));
        }));
        queue.defer(record(&log, 2));
        assert_eq!(queue.run_until_stalled(), Ok(3));
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn draining_from_a_task_is_rejected() {
        let queue = MicrotaskQueue::new();
        let seen = Rc::new(RefCell::new(None));
        let inner = queue.clone();
        let inner_seen = seen.clone();
        queue.defer(Box::new(move || {
            *inner_seen.borrow_mut() = Some(inner.run_until_stalled());
        }));
        assert_eq!(queue.run_until_stalled(), Ok(1));
        assert_eq!(*seen.borrow(), Some(Err(Error::Reentrant)));
    }

    #[test]
    fn budget_stops_a_runaway_drain() {
        let queue = MicrotaskQueue::with_options(Options::new().budget(2).clone());
        let log = Rc::new(RefCell::new(vec![]));
        for n in 1..=3 {
            queue.defer(record(&log, n));
        }
        assert_eq!(queue.run_until_stalled(), Err(Error::BudgetExhausted { ran: 2 }));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.run_until_stalled(), Ok(1));
        assert_eq!(*log.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn budget_equal_to_work_is_not_an_error() {
        let queue = MicrotaskQueue::with_options(Options::new().budget(2).clone());
        let log = Rc::new(RefCell::new(vec![]));
        queue.defer(record(&log, 1));
        queue.defer(record(&log, 2));
        assert_eq!(queue.run_until_stalled(), Ok(2));
    }

    #[test]
    fn run_until_reports_stall() {
        let queue = MicrotaskQueue::new();
        let (deferred, _resolver) = Deferred::<u32, ()>::pending_in(queue.clone());
        assert_eq!(queue.run_until(&deferred), Err(Error::Stalled));
    }
}
