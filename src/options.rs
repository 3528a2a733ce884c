//! Knobs for a [`MicrotaskQueue`](crate::MicrotaskQueue).

/// Queue configuration, built with `&mut` setters.
///
/// ```
/// use deferred::{MicrotaskQueue, Options};
/// let queue = MicrotaskQueue::with_options(Options::new().name("ui".into()).budget(64).clone());
/// assert_eq!(queue.options().budget, Some(64));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Shown in log lines.
    pub name: Option<String>,
    /// Max tasks a single drain may run. `None` is unbounded.
    pub budget: Option<usize>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            name: None,
            budget: None,
        }
    }

    pub fn name(&mut self, name: String) -> &mut Options {
        self.name = Some(name);
        self
    }

    pub fn budget(&mut self, tasks: usize) -> &mut Options {
        self.budget = Some(tasks);
        self
    }

    pub(crate) fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new()
    }
}
