//! Background task runner.
//!
//! Database work runs on one dedicated worker thread, one task at a time, in
//! submission order. Outcomes are never delivered from the worker: each
//! completion callback is handed to a [`UiDispatcher`], which runs it on the
//! UI thread.
use crate::core::{ClientError, Result};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// A zero-argument callback bound for the UI thread.
pub type UiCallback = Box<dyn FnOnce() + Send>;

/// Runs callbacks later on the UI's single thread.
pub trait UiDispatcher: Send + Sync {
    fn dispatch(&self, callback: UiCallback);
}

/// Channel-backed dispatcher; the UI loop drains it with [`UiQueue::pump`].
pub struct UiQueue {
    sender: Mutex<Sender<UiCallback>>,
    receiver: Mutex<Receiver<UiCallback>>,
}

impl Default for UiQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::channel();
        UiQueue {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }
}

impl UiQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every queued callback on the calling thread. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(callback) = self.next(None) {
            callback();
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for one callback and runs it.
    pub fn pump(&self, timeout: Duration) -> bool {
        match self.next(Some(timeout)) {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    fn next(&self, timeout: Option<Duration>) -> Option<UiCallback> {
        let receiver = self.receiver.lock().ok()?;
        match timeout {
            None => receiver.try_recv().ok(),
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(callback) => Some(callback),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        }
    }
}

impl UiDispatcher for UiQueue {
    fn dispatch(&self, callback: UiCallback) {
        match self.sender.lock() {
            Ok(sender) => {
                if sender.send(callback).is_err() {
                    error!("UI queue closed, dropping callback");
                }
            }
            Err(_) => error!("UI queue lock poisoned, dropping callback"),
        }
    }
}

/// Cooperative cancellation flag shared between a task and its handle.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with `ClientError::Interrupted` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ClientError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Submitted,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Interrupted
        )
    }
}

/// The single outcome delivered for a task.
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(ClientError),
    Interrupted,
}

impl<T> TaskOutcome<T> {
    fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Interrupted => TaskState::Interrupted,
        }
    }
}

impl<T> fmt::Debug for TaskOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Completed(_) => f.write_str("Completed(..)"),
            TaskOutcome::Failed(e) => write!(f, "Failed({})", e),
            TaskOutcome::Interrupted => f.write_str("Interrupted"),
        }
    }
}

/// Caller's view of a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    name: String,
    token: CancellationToken,
    state: Arc<Mutex<TaskState>>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(TaskState::Failed)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Moves Submitted to Running unless cancellation came first.
    fn begin(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.token.is_cancelled() {
            *state = TaskState::Interrupted;
            false
        } else {
            *state = TaskState::Running;
            true
        }
    }

    fn finish(&self, terminal: TaskState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        *state = terminal;
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Single-worker task queue.
pub struct TaskRunner {
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    dispatcher: Arc<dyn UiDispatcher>,
    next_id: AtomicU64,
}

impl TaskRunner {
    /// Starts the worker thread.
    pub fn new(dispatcher: Arc<dyn UiDispatcher>) -> Result<Self> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("termsql-worker".to_string())
            .spawn(move || {
                for job in queue {
                    job();
                }
                debug!("Worker thread exiting");
            })?;
        Ok(TaskRunner {
            jobs: Some(jobs),
            worker: Some(worker),
            dispatcher,
            next_id: AtomicU64::new(1),
        })
    }

    /// Queues `work` and returns immediately.
    ///
    /// `on_outcome` runs exactly once, on the UI thread. A `work` result of
    /// `Err(ClientError::Interrupted)` is reported as `TaskOutcome::Interrupted`.
    pub fn start<T, W, D>(&self, name: &str, work: W, on_outcome: D) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
        D: FnOnce(TaskOutcome<T>) + Send + 'static,
    {
        let handle = TaskHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            token: CancellationToken::new(),
            state: Arc::new(Mutex::new(TaskState::Submitted)),
        };

        // Taken exactly once: by the job, or by the submit failure below.
        let deliver = Arc::new(Mutex::new(Some(on_outcome)));

        let task = handle.clone();
        let dispatcher = self.dispatcher.clone();
        let job_deliver = deliver.clone();
        let job: Job = Box::new(move || {
            let outcome = if task.begin() {
                debug!("Task {} ({}) running", task.id, task.name);
                match panic::catch_unwind(AssertUnwindSafe(|| work(&task.token))) {
                    Ok(Ok(value)) => TaskOutcome::Completed(value),
                    Ok(Err(ClientError::Interrupted)) => TaskOutcome::Interrupted,
                    Ok(Err(e)) => TaskOutcome::Failed(e),
                    Err(payload) => TaskOutcome::Failed(ClientError::Task(panic_message(&payload))),
                }
            } else {
                TaskOutcome::Interrupted
            };
            task.finish(outcome.state());
            info!("Task {} ({}) finished: {:?}", task.id, task.name, outcome);
            deliver_outcome(dispatcher.as_ref(), &job_deliver, outcome);
        });

        match &self.jobs {
            Some(jobs) if jobs.send(job).is_ok() => {
                debug!("Task {} ({}) submitted", handle.id, handle.name);
            }
            _ => {
                error!("Worker is gone, task {} ({}) not started", handle.id, handle.name);
                handle.finish(TaskState::Failed);
                deliver_outcome(
                    self.dispatcher.as_ref(),
                    &deliver,
                    TaskOutcome::Failed(ClientError::Task("worker thread is not running".to_string())),
                );
            }
        }
        handle
    }

    /// Requests cooperative cancellation. Returns false if the task had
    /// already finished, in which case nothing changes.
    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        let state = match handle.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.is_terminal() {
            return false;
        }
        handle.token.cancel();
        info!("Cancellation requested for task {} ({})", handle.id, handle.name);
        true
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        // Closing the queue ends the worker loop once queued jobs are done.
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

fn deliver_outcome<T, D>(dispatcher: &dyn UiDispatcher, slot: &Mutex<Option<D>>, outcome: TaskOutcome<T>)
where
    T: Send + 'static,
    D: FnOnce(TaskOutcome<T>) + Send + 'static,
{
    let callback = match slot.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(on_outcome) = callback {
        dispatcher.dispatch(Box::new(move || on_outcome(outcome)));
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
