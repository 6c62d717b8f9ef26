//! Single background worker.
//!
//! Tasks are executed one at a time, strictly in submission order, on a
//! dedicated thread driving a current-thread tokio runtime. Every submission
//! returns a [`TaskHandle`] that resolves to the task's result. Failures are
//! also logged and kept until someone calls [`Scheduler::take_failure`].

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};

use crate::{error::Result, Error};

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
}

/// Work that runs on the background worker
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

struct Job {
    task: Arc<dyn BackgroundTask>,
    run_id: u64,
    done: oneshot::Sender<Result<()>>,
}

/// A background failure that has not been reported to the caller yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub task: &'static str,
    pub message: String,
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::Background {
            task: failure.task,
            message: failure.message,
        }
    }
}

/// Completion signal of one submitted task.
pub struct TaskHandle {
    task: &'static str,
    run_id: u64,
    rx: oneshot::Receiver<Result<()>>,
}

impl TaskHandle {
    pub fn task(&self) -> &'static str {
        self.task
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Blocks until the task has run. Must not be called from async code.
    pub fn wait(self) -> Result<()> {
        let task = self.task;
        self.rx.blocking_recv().unwrap_or_else(|_| Err(abandoned(task)))
    }

    /// Async variant of [`TaskHandle::wait`].
    pub async fn join(self) -> Result<()> {
        let task = self.task;
        self.rx.await.unwrap_or_else(|_| Err(abandoned(task)))
    }
}

fn abandoned(task: &'static str) -> Error {
    Error::InvalidState(format!("Task {} was dropped before it completed", task))
}

/// Owns the worker thread and its mailbox.
pub struct Scheduler {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_run_id: AtomicU64,
    failure: Arc<Mutex<Option<Failure>>>,
}

impl Scheduler {
    /// Spawns the worker thread under the given name.
    pub fn start(name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let failure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);

        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    // Ends once every sender is gone and the queue is drained
                    while let Some(job) = rx.recv().await {
                        run_job(job, &worker_failure).await;
                    }
                });
                tracing::debug!("Background worker stopped");
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            next_run_id: AtomicU64::new(0),
            failure,
        })
    }

    /// Queues a task behind everything submitted before it.
    pub fn submit<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<TaskHandle> {
        let tx = self.tx.lock()?;
        let tx = tx.as_ref().ok_or(Error::Closed)?;

        let (done, rx) = oneshot::channel();
        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = task.name();
        tx.send(Job { task, run_id, done })
            .map_err(|_| Error::Closed)?;

        tracing::debug!(task = name, run_id, "Task submitted");
        Ok(TaskHandle {
            task: name,
            run_id,
            rx,
        })
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_some()).unwrap_or(false)
    }

    /// Returns and clears the oldest unreported failure.
    pub fn take_failure(&self) -> Result<Option<Failure>> {
        Ok(self.failure.lock()?.take())
    }

    /// Stops accepting tasks, lets the worker drain its queue, and joins it.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        drop(self.tx.lock()?.take());

        let worker = self.worker.lock()?.take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| Error::InvalidState("Background worker panicked".to_string()))?;
        }
        Ok(())
    }
}

async fn run_job(job: Job, failure: &Mutex<Option<Failure>>) {
    let Job { task, run_id, done } = job;
    let ctx = Context {
        task_name: task.name(),
        run_id,
    };

    let result = task.execute(ctx).await;
    if let Err(e) = &result {
        tracing::error!(task = task.name(), run_id, error = %e, "Task execution failed");
        if let Ok(mut slot) = failure.lock() {
            slot.get_or_insert_with(|| Failure {
                task: task.name(),
                message: e.to_string(),
            });
        }
    }

    // Nobody may be waiting on the handle
    let _ = done.send(result);
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "Background worker did not shut down cleanly");
        }
    }
}
