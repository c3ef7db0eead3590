//! FIFO queue of named one-shot tasks with per-task timeouts.
//!
//! A queue run executes tasks in order on a driver worker. Each task races
//! its runner against its timeout; a timed-out runner is orphaned, never
//! forcibly cancelled. Between tasks the driver checks the same
//! pause/continue/stop control channel the scheduler uses. Every run keeps
//! a full history keyed by its start epoch, and `start()` hands the caller
//! a completion channel that fires exactly once with `"done"`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::http::HttpServer;
use crate::schedule::Signal;

type TaskRunner = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    New,
    Running,
    Done,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    New,
    Running,
    Paused,
    Done,
}

/// A named one-shot unit of work.
pub struct Task {
    name: String,
    timeout: Duration,
    runner: TaskRunner,
    status: TaskStatus,
}

impl Task {
    pub fn new<F, Fut>(name: &str, timeout: Duration, runner: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Task {
            name: name.to_string(),
            timeout,
            runner: Arc::new(move || Box::pin(runner())),
            status: TaskStatus::New,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Drive the task to a terminal status: the runner races its timeout.
    /// `tokio::spawn` isolates runner panics, which classify as `Error`.
    async fn run(&mut self) -> TaskStatus {
        self.status = TaskStatus::Running;
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move { runner().await });

        self.status = tokio::select! {
            joined = handle => match joined {
                Ok(Ok(())) => TaskStatus::Done,
                Ok(Err(err)) => {
                    warn!(task = %self.name, %err, "task failed");
                    TaskStatus::Error
                }
                Err(join_err) => {
                    error!(task = %self.name, %join_err, "task panicked");
                    TaskStatus::Error
                }
            },
            _ = tokio::time::sleep(self.timeout) => {
                // the runner keeps going; only the bookkeeping gives up
                warn!(task = %self.name, timeout_ms = self.timeout.as_millis() as u64, "task timed out");
                TaskStatus::Timeout
            }
        };
        self.status
    }
}

/// One history record per executed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistoryRecord {
    #[serde(rename = "serialId")]
    pub serial_id: u64,
    pub span: usize,
    pub name: String,
    pub outcome: TaskStatus,
    #[serde(rename = "startEpoch")]
    pub start_epoch: i64,
    #[serde(rename = "endEpoch")]
    pub end_epoch: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMeta {
    pub name: String,
    #[serde(rename = "timeoutSeconds")]
    pub timeout_seconds: f64,
}

/// Observable snapshot of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    #[serde(rename = "queueLength")]
    pub queue_length: usize,
    pub tasks: Vec<TaskMeta>,
    pub done: Vec<String>,
    pub errors: Vec<String>,
    #[serde(rename = "startEpoch")]
    pub start_epoch: i64,
    #[serde(rename = "endEpoch")]
    pub end_epoch: i64,
    pub running: Option<String>,
    #[serde(rename = "runCounter")]
    pub run_counter: u64,
    pub status: QueueStatus,
}

struct QueueState {
    queue: VecDeque<Task>,
    status: QueueStatus,
    done: Vec<String>,
    errors: Vec<String>,
    run_counter: u64,
    start_epoch: i64,
    end_epoch: i64,
    running: Option<String>,
    history: HashMap<i64, Vec<TaskHistoryRecord>>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    control_tx: mpsc::Sender<Signal>,
    // the driver is the single consumer per run
    control_rx: tokio::sync::Mutex<mpsc::Receiver<Signal>>,
}

#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        TaskQueue::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        TaskQueue {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    status: QueueStatus::New,
                    done: Vec::new(),
                    errors: Vec::new(),
                    run_counter: 0,
                    start_epoch: 0,
                    end_epoch: 0,
                    running: None,
                    history: HashMap::new(),
                }),
                control_tx: tx,
                control_rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Append a task to the queue. Enqueueing is allowed at any time,
    /// including mid-run.
    pub fn add_task<F, Fut>(&self, name: &str, timeout: Duration, runner: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.lock_state().queue.push_back(Task::new(name, timeout, runner));
    }

    /// Launch a run. Refused unless the queue is `New` or `Done`. Returns
    /// the completion channel, fired exactly once with `"done"`.
    pub fn start(&self) -> Result<oneshot::Receiver<&'static str>> {
        let start_epoch;
        {
            let mut state = self.lock_state();
            if !matches!(state.status, QueueStatus::New | QueueStatus::Done) {
                return Err(Error::QueueRunning);
            }
            state.status = QueueStatus::Running;
            state.done.clear();
            state.errors.clear();
            state.run_counter += 1;
            state.start_epoch = chrono::Utc::now().timestamp_millis();
            state.end_epoch = 0;
            start_epoch = state.start_epoch;
            state.history.insert(start_epoch, Vec::new());
        }

        let (done_tx, done_rx) = oneshot::channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            drive(inner, start_epoch).await;
            let _ = done_tx.send("done");
        });
        Ok(done_rx)
    }

    pub fn pause(&self) {
        self.signal(Signal::Pause);
    }

    pub fn continue_run(&self) {
        self.signal(Signal::Continue);
    }

    pub fn stop(&self) {
        self.signal(Signal::Stop);
    }

    fn signal(&self, signal: Signal) {
        let tx = self.inner.control_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(signal).await;
        });
    }

    pub fn status(&self) -> QueueStatus {
        self.lock_state().status
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock_state();
        QueueSnapshot {
            queue_length: state.queue.len(),
            tasks: state
                .queue
                .iter()
                .map(|t| TaskMeta {
                    name: t.name.clone(),
                    timeout_seconds: t.timeout.as_secs_f64(),
                })
                .collect(),
            done: state.done.clone(),
            errors: state.errors.clone(),
            start_epoch: state.start_epoch,
            end_epoch: state.end_epoch,
            running: state.running.clone(),
            run_counter: state.run_counter,
            status: state.status,
        }
    }

    /// History of one run, keyed by the run's start epoch.
    pub fn history(&self, start_epoch: i64) -> Option<Vec<TaskHistoryRecord>> {
        self.lock_state().history.get(&start_epoch).cloned()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_state(inner: &QueueInner) -> std::sync::MutexGuard<'_, QueueState> {
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drive(inner: Arc<QueueInner>, start_epoch: i64) {
    let serial_id = lock_state(&inner).run_counter;
    let mut span = 0usize;
    let mut rx = inner.control_rx.lock().await;

    loop {
        // Non-blocking control check between tasks.
        match rx.try_recv() {
            Ok(Signal::Pause) => {
                lock_state(&inner).status = QueueStatus::Paused;
                info!("task queue paused");
                loop {
                    match rx.recv().await {
                        Some(Signal::Continue) => break,
                        Some(_) => continue,
                        None => {
                            finish(&inner);
                            return;
                        }
                    }
                }
                lock_state(&inner).status = QueueStatus::Running;
                info!("task queue resumed");
            }
            Ok(Signal::Continue) => {}
            Ok(Signal::Stop) => {
                info!("task queue stopped");
                finish(&inner);
                return;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => {
                finish(&inner);
                return;
            }
        }

        let next = {
            let mut state = lock_state(&inner);
            let task = state.queue.pop_front();
            if let Some(task) = &task {
                state.running = Some(task.name().to_string());
            }
            task
        };
        let Some(mut task) = next else {
            finish(&inner);
            return;
        };

        let task_start = chrono::Utc::now().timestamp_millis();
        let outcome = task.run().await;
        let task_end = chrono::Utc::now().timestamp_millis();

        let mut state = lock_state(&inner);
        state.running = None;
        state.done.push(task.name().to_string());
        if matches!(outcome, TaskStatus::Error | TaskStatus::Timeout) {
            state.errors.push(task.name().to_string());
        }
        if let Some(records) = state.history.get_mut(&start_epoch) {
            records.push(TaskHistoryRecord {
                serial_id,
                span,
                name: task.name().to_string(),
                outcome,
                start_epoch: task_start,
                end_epoch: task_end,
            });
        }
        span += 1;
    }
}

fn finish(inner: &QueueInner) {
    let mut state = lock_state(inner);
    state.status = QueueStatus::Done;
    state.end_epoch = chrono::Utc::now().timestamp_millis();
    state.running = None;
}

/// Expose one queue over HTTP: `GET {prefix}` returns the snapshot,
/// `POST {prefix}/start|pause|continue|stop` controls the run.
pub fn register_queue_service(server: &HttpServer, queue: &TaskQueue, prefix: &str) {
    let prefix = prefix.trim_end_matches('/').to_string();

    let observed = queue.clone();
    server.register_handler(&prefix, move |ctx| {
        let observed = observed.clone();
        async move {
            let _ = ctx.api_response(0, "", observed.snapshot());
        }
    });

    for action in ["start", "pause", "continue", "stop"] {
        let queue = queue.clone();
        server.register_handler(&format!("{prefix}/{action}"), move |ctx| {
            let queue = queue.clone();
            async move {
                match action {
                    "start" => {
                        if let Err(err) = queue.start() {
                            let _ = ctx.fail(err.to_string());
                            return;
                        }
                    }
                    "pause" => queue.pause(),
                    "continue" => queue.continue_run(),
                    _ => queue.stop(),
                }
                let _ = ctx.api_response(0, "", serde_json::Value::Null);
            }
        });
    }
}
