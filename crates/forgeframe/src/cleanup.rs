//! Per-instance cleanup stack.
//!
//! Resources acquired during a component's lifetime are released in reverse
//! insertion order when the instance closes. A task registered after the
//! stack has run executes immediately, so late registrations cannot leak.

use std::sync::Mutex;

use tracing::debug;

type CleanupTask = Box<dyn FnOnce() + Send>;

pub struct CleanupStack {
    // None once run.
    tasks: Mutex<Option<Vec<(String, CleanupTask)>>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a task. `label` shows up in trace logs during teardown.
    pub fn register<F>(&self, label: impl Into<String>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let label = label.into();
        let mut tasks = self.tasks.lock().expect("cleanup lock");
        match tasks.as_mut() {
            Some(list) => list.push((label, Box::new(task))),
            None => {
                debug!(%label, "cleanup already ran; executing task immediately");
                drop(tasks);
                task();
            }
        }
    }

    /// Run all tasks LIFO. Idempotent.
    pub fn run(&self) {
        let taken = self.tasks.lock().expect("cleanup lock").take();
        if let Some(list) = taken {
            for (label, task) in list.into_iter().rev() {
                debug!(%label, "running cleanup task");
                task();
            }
        }
    }

    pub fn has_run(&self) -> bool {
        self.tasks.lock().expect("cleanup lock").is_none()
    }
}

impl Default for CleanupStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[test]
    fn runs_in_reverse_order() {
        let stack = CleanupStack::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            stack.register(label, move || order.lock().unwrap().push(label));
        }

        stack.run();
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[test]
    fn run_is_idempotent() {
        let stack = CleanupStack::new();
        let count = Arc::new(StdMutex::new(0));
        let c = count.clone();
        stack.register("bump", move || *c.lock().unwrap() += 1);

        stack.run();
        stack.run();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let stack = CleanupStack::new();
        stack.run();
        assert!(stack.has_run());

        let ran = Arc::new(StdMutex::new(false));
        let r = ran.clone();
        stack.register("late", move || *r.lock().unwrap() = true);
        assert!(*ran.lock().unwrap());
    }
}
