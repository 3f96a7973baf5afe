//! Single worker thread running the periodic poll and ad-hoc tasks.
//!
//! Every protocol exchange happens on the worker, strictly one at a time and in
//! submission order. A reschedule replaces the periodic job without touching a
//! tick that is already running; it takes effect once that tick returns.

use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::client::TransportError;
use crate::services::devices::{DeviceService, MnetError};

/// Lower bound for the periodic poll.
pub const MIN_POLL_PERIOD: Duration = Duration::from_secs(30);
/// How long `shutdown` waits for the running task.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const WORKER_NAME: &str = "climate-tray-worker";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// `shutdown` was called; no new work is accepted.
    ShutDown,
    /// The worker thread is gone.
    WorkerGone,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::ShutDown => write!(f, "scheduler is shut down"),
            SchedulerError::WorkerGone => write!(f, "worker thread is not running"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Why an ad-hoc task did not produce a value.
#[derive(Debug, Clone)]
pub enum TaskError {
    Mnet(MnetError),
    Failed(String),
    Panicked(String),
    /// The worker stopped before the task ran.
    Dropped,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Mnet(e) => write!(f, "{}", e),
            TaskError::Failed(e) => write!(f, "{}", e),
            TaskError::Panicked(e) => write!(f, "task panicked: {}", e),
            TaskError::Dropped => write!(f, "task was dropped before it ran"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<MnetError> for TaskError {
    fn from(value: MnetError) -> Self {
        TaskError::Mnet(value)
    }
}

impl From<TransportError> for TaskError {
    fn from(value: TransportError) -> Self {
        TaskError::Mnet(value.into())
    }
}

impl From<String> for TaskError {
    fn from(value: String) -> Self {
        TaskError::Failed(value)
    }
}

type Job = Box<dyn FnOnce(&DeviceService) + Send>;

enum Message {
    Run(Job),
    Schedule(Duration),
    Cancel,
    Shutdown,
}

struct Envelope {
    /// Submission time; orders work against ticks that fall due meanwhile.
    at: Instant,
    message: Message,
}

/// Optional callbacks run on the worker after a task completes.
///
/// Without an error callback, a failed task is logged. Either way the result is
/// also delivered through the task's `TaskHandle`.
pub struct Callbacks<T> {
    on_success: Option<Box<dyn FnOnce(&T) + Send>>,
    on_error: Option<Box<dyn FnOnce(&TaskError) + Send>>,
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Callbacks {
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> Callbacks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&TaskError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Result of a submitted task.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run.
    pub fn wait(self) -> Result<T, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Dropped))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(TaskError::Dropped)),
        }
    }
}

pub struct Scheduler {
    tx: Sender<Envelope>,
    accepting: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the worker, which takes ownership of `service`.
    pub fn start(service: DeviceService) -> Result<Self, String> {
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let abort = Arc::new(AtomicBool::new(false));
        let worker_abort = Arc::clone(&abort);

        let worker = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || {
                run_worker(&service, &rx, &worker_abort);
                let _ = done_tx.send(());
            })
            .map_err(|e| format!("failed to spawn worker thread: {}", e))?;

        Ok(Scheduler {
            tx,
            accepting: Arc::new(AtomicBool::new(true)),
            abort,
            done_rx,
            worker: Some(worker),
        })
    }

    fn send(&self, message: Message) -> Result<(), SchedulerError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShutDown);
        }
        self.tx
            .send(Envelope {
                at: Instant::now(),
                message,
            })
            .map_err(|_| SchedulerError::WorkerGone)
    }

    /// Replaces any periodic poll with one firing now and then every `period` (at least 30 s).
    /// Returns the effective period.
    pub fn schedule_recurring_poll(&self, period: Duration) -> Result<Duration, SchedulerError> {
        let period = period.max(MIN_POLL_PERIOD);
        self.send(Message::Schedule(period))?;
        Ok(period)
    }

    pub fn cancel_recurring_poll(&self) -> Result<(), SchedulerError> {
        self.send(Message::Cancel)
    }

    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceService) -> Result<T, TaskError> + Send + 'static,
    {
        self.submit_with(task, Callbacks::default())
    }

    pub fn submit_with<T, F>(&self, task: F, callbacks: Callbacks<T>) -> Result<TaskHandle<T>, SchedulerError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceService) -> Result<T, TaskError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let Callbacks { on_success, on_error } = callbacks;

        let job: Job = Box::new(move |service: &DeviceService| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| task(service)))
                .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
            match &result {
                Ok(value) => {
                    if let Some(f) = on_success {
                        f(value);
                    }
                }
                Err(e) => match on_error {
                    Some(f) => f(e),
                    None => error!("Unhandled error in task: {}", e),
                },
            }
            // the submitter may have dropped its handle
            let _ = tx.send(result);
        });

        self.send(Message::Run(job))?;
        Ok(TaskHandle { rx })
    }

    /// Stops accepting work and waits up to `SHUTDOWN_GRACE` for the worker.
    pub fn shutdown(&mut self) -> bool {
        self.shutdown_within(SHUTDOWN_GRACE)
    }

    /// Tasks queued before the call still run if the worker finishes in time;
    /// otherwise the rest of the queue is abandoned. Returns whether the worker stopped.
    pub fn shutdown_within(&mut self, grace: Duration) -> bool {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return self.worker.is_none();
        }
        info!("Shutting down worker");
        let _ = self.tx.send(Envelope {
            at: Instant::now(),
            message: Message::Shutdown,
        });

        match self.done_rx.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Shutdown of worker timed out after {:?}, abandoning queued work", grace);
                self.abort.store(true, Ordering::SeqCst);
                // detach; the running task is not interruptible
                self.worker.take();
                false
            }
        }
    }

    /// Blocks until the worker thread exits.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.accepting.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

struct Periodic {
    period: Duration,
    next: Instant,
}

fn run_worker(service: &DeviceService, rx: &Receiver<Envelope>, abort: &AtomicBool) {
    debug!("Worker started");
    let mut periodic: Option<Periodic> = None;
    let mut backlog: VecDeque<Envelope> = VecDeque::new();

    loop {
        if abort.load(Ordering::SeqCst) {
            break;
        }
        while let Ok(envelope) = rx.try_recv() {
            backlog.push_back(envelope);
        }

        // a due tick goes ahead of work submitted after it became due
        if let Some(p) = periodic.as_mut()
            && Instant::now() >= p.next
            && backlog.front().is_none_or(|e| e.at >= p.next)
        {
            run_tick(service);
            // fixed delay between the end of one tick and the start of the next
            p.next = Instant::now() + p.period;
            continue;
        }

        let envelope = match backlog.pop_front() {
            Some(e) => e,
            None => {
                let received = match &periodic {
                    Some(p) => rx.recv_timeout(p.next.saturating_duration_since(Instant::now())),
                    None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                };
                match received {
                    Ok(e) => e,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };
        if abort.load(Ordering::SeqCst) {
            break;
        }

        match envelope.message {
            Message::Run(job) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job(service))) {
                    error!("Task panicked: {}", panic_message(payload.as_ref()));
                }
            }
            Message::Schedule(period) => {
                if periodic.take().is_some() {
                    debug!("Canceling existing update process");
                }
                let superseded = backlog
                    .iter()
                    .any(|e| matches!(e.message, Message::Schedule(_) | Message::Cancel));
                if superseded {
                    debug!("Schedule replaced before its first update");
                } else {
                    info!("Scheduling update every {} seconds", period.as_secs());
                    periodic = Some(Periodic {
                        period,
                        next: envelope.at,
                    });
                }
            }
            Message::Cancel => {
                if periodic.take().is_some() {
                    info!("Recurring update canceled");
                }
            }
            Message::Shutdown => break,
        }
    }
    debug!("Worker stopped");
}

fn run_tick(service: &DeviceService) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| service.update())) {
        error!("Update panicked: {}", panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
