use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

type Task = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    open: bool,
    draining: bool,
}

/// Holds work back until a gate opens, then runs it in submission order.
/// Once open, submitted tasks run immediately on the caller's thread.
#[derive(Default)]
pub struct DeferredTasks {
    queue: Mutex<Queue>,
}

impl DeferredTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the task was deferred.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.lock();
            if !queue.open {
                queue.tasks.push_back(Box::new(task));
                return true;
            }
        }
        task();
        false
    }

    /// Open the gate and run everything deferred so far, including tasks
    /// submitted while draining. Returns how many tasks were drained.
    pub fn open(&self) -> usize {
        {
            let mut queue = self.lock();
            if queue.open || queue.draining {
                return 0;
            }
            queue.draining = true;
        }
        let mut drained = 0;
        loop {
            let next = {
                let mut queue = self.lock();
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.open = true;
                        queue.draining = false;
                        break;
                    }
                }
            };
            next();
            drained += 1;
        }
        if drained > 0 {
            tracing::debug!("ran {} deferred tasks", drained);
        }
        drained
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn pending(&self) -> usize {
        self.lock().tasks.len()
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
