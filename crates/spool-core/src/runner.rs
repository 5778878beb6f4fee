//! The single-threaded task runner the service lives on.
//!
//! Every piece of service state is mutated from tasks posted here, which is
//! what makes the core methods synchronous and the effects totally ordered
//! from a consumer's point of view. Two backings exist:
//!
//! - [`TaskRunner::spawn`]: tasks drain on a tokio task; delayed tasks go
//!   through `tokio::time::sleep`. This is the production mode.
//! - [`TaskRunner::new_manual`]: tasks queue until the test pumps them with
//!   [`TaskRunner::run_until_idle`] / [`TaskRunner::advance`], with a
//!   virtual clock for delayed tasks. Fully deterministic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct DelayedTask {
    deadline: Duration,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct ManualQueue {
    now: Duration,
    ready: VecDeque<Task>,
    delayed: Vec<DelayedTask>,
    next_seq: u64,
}

enum Backing {
    Spawned {
        tx: mpsc::UnboundedSender<Task>,
        handle: tokio::runtime::Handle,
    },
    Manual(Mutex<ManualQueue>),
}

/// Clonable handle to the service task runner.
#[derive(Clone)]
pub struct TaskRunner {
    backing: Arc<Backing>,
}

impl TaskRunner {
    /// Starts a runner draining on the current tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Self {
            backing: Arc::new(Backing::Spawned {
                tx,
                handle: tokio::runtime::Handle::current(),
            }),
        }
    }

    /// A runner whose queue is pumped explicitly by the test.
    pub fn new_manual() -> Self {
        Self {
            backing: Arc::new(Backing::Manual(Mutex::new(ManualQueue::default()))),
        }
    }

    /// Posts a task to run after all currently queued tasks.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        match &*self.backing {
            Backing::Spawned { tx, .. } => {
                // The drain loop only stops when every sender is dropped, so
                // a failed send means the process is shutting down.
                let _ = tx.send(Box::new(task));
            }
            Backing::Manual(queue) => queue.lock().ready.push_back(Box::new(task)),
        }
    }

    /// Posts a task to run no earlier than `delay` from now.
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        match &*self.backing {
            Backing::Spawned { tx, handle } => {
                let tx = tx.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Box::new(task));
                });
            }
            Backing::Manual(queue) => {
                let mut queue = queue.lock();
                let deadline = queue.now + delay;
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.delayed.push(DelayedTask {
                    deadline,
                    seq,
                    task: Box::new(task),
                });
            }
        }
    }

    /// Manual mode: runs queued tasks (including ones they post) until the
    /// ready queue is empty. Delayed tasks are untouched.
    ///
    /// # Panics
    ///
    /// Panics on a spawned runner.
    pub fn run_until_idle(&self) {
        let queue = self.manual();
        loop {
            let Some(task) = queue.lock().ready.pop_front() else {
                return;
            };
            task();
        }
    }

    /// Manual mode: advances the virtual clock, promoting due delayed tasks
    /// in deadline order, then drains the ready queue.
    pub fn advance(&self, by: Duration) {
        let queue = self.manual();
        {
            let mut guard = queue.lock();
            let q = &mut *guard;
            q.now += by;
            let now = q.now;
            q.delayed.sort_by_key(|t| (t.deadline, t.seq));
            let mut remaining = Vec::new();
            for t in q.delayed.drain(..) {
                if t.deadline <= now {
                    q.ready.push_back(t.task);
                } else {
                    remaining.push(t);
                }
            }
            q.delayed = remaining;
        }
        self.run_until_idle();
    }

    fn manual(&self) -> &Mutex<ManualQueue> {
        match &*self.backing {
            Backing::Manual(queue) => queue,
            Backing::Spawned { .. } => panic!("run_until_idle/advance require a manual runner"),
        }
    }
}
