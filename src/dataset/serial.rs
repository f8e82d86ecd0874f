use std::sync::Arc;
use std::sync::OnceLock;
use std::thread::{JoinHandle, ThreadId};

use crossbeam::channel::{Sender, bounded, unbounded};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Named single-threaded executor. One instance plays the "serial" role
/// (all dataset mutations run here) and another the "merge" role (one
/// in-flight segment merge or chunk save at a time).
pub struct TaskExecutor {
    name: String,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    worker_id: Arc<OnceLock<ThreadId>>,
}

impl TaskExecutor {
    pub fn new(name: &str) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let worker_id = Arc::new(OnceLock::new());
        let id_slot = Arc::clone(&worker_id);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = id_slot.set(std::thread::current().id());
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .expect("failed to spawn executor thread");

        TaskExecutor {
            name: name.to_string(),
            sender: Some(sender),
            worker: Some(worker),
            worker_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from this executor's own thread
    pub fn is_current(&self) -> bool {
        self.worker_id.get() == Some(&std::thread::current().id())
    }

    /// Enqueue fire-and-forget work
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Run `job` on the executor and wait for its result. Calls made from
    /// the executor thread itself run inline, which lets completions
    /// re-enter without deadlocking.
    pub fn run<R: Send + 'static>(&self, job: impl FnOnce() -> R + Send + 'static) -> R {
        if self.is_current() {
            return job();
        }
        let (tx, rx) = bounded(1);
        self.spawn(move || {
            let _ = tx.send(job());
        });
        rx.recv().expect("executor thread died")
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit. If the
        // drop happens to run on the worker itself (last reference held
        // by a queued job), the thread is detached instead of joined.
        self.sender.take();
        if let Some(worker) = self.worker.take()
            && !self.is_current()
        {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run_in_submission_order() {
        let executor = TaskExecutor::new("test-serial");
        let counter = Arc::new(AtomicUsize::new(0));
        for expected in 0..100 {
            let counter = Arc::clone(&counter);
            executor.spawn(move || {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, expected);
            });
        }
        assert_eq!(executor.run(|| 42), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_reentrant_run_does_not_deadlock() {
        let executor = Arc::new(TaskExecutor::new("test-reentrant"));
        let inner = Arc::clone(&executor);
        let result = executor.run(move || inner.run(|| 7));
        assert_eq!(result, 7);
    }
}
