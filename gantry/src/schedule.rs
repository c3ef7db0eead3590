//! Named periodic tasks with pause/continue/stop control.
//!
//! Each scheduled task owns a background worker and a one-slot control
//! channel. The worker checks the channel non-blockingly between ticks:
//! `pause` parks it until `continue` arrives, `stop` makes it leave its
//! loop. The tick counter increments before every invocation, and a runner
//! panic ends the worker without restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::http::HttpServer;

type Runner = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Control signals understood by scheduled workers and queue drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Pause,
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Running,
    Paused,
    Stopped,
}

const STATE_RUNNING: u8 = 0;
const STATE_PAUSED: u8 = 1;
const STATE_STOPPED: u8 = 2;

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn set(&self, status: ScheduleStatus) {
        let raw = match status {
            ScheduleStatus::Running => STATE_RUNNING,
            ScheduleStatus::Paused => STATE_PAUSED,
            ScheduleStatus::Stopped => STATE_STOPPED,
        };
        self.0.store(raw, Ordering::SeqCst);
    }

    fn get(&self) -> ScheduleStatus {
        match self.0.load(Ordering::SeqCst) {
            STATE_PAUSED => ScheduleStatus::Paused,
            STATE_STOPPED => ScheduleStatus::Stopped,
            _ => ScheduleStatus::Running,
        }
    }
}

struct ScheduledTask {
    name: String,
    period: Duration,
    status: Arc<StateCell>,
    counter: Arc<AtomicU64>,
    control: mpsc::Sender<Signal>,
}

/// Observable snapshot of one scheduled task.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTaskInfo {
    pub name: String,
    #[serde(rename = "periodSeconds")]
    pub period_seconds: u64,
    pub status: ScheduleStatus,
    pub counter: u64,
}

/// Process-wide mapping from task name to its live worker.
#[derive(Clone, Default)]
pub struct ScheduleRegistry {
    tasks: Arc<DashMap<String, ScheduledTask>>,
}

impl ScheduleRegistry {
    pub fn new() -> Self {
        ScheduleRegistry::default()
    }

    /// Register a named periodic task and launch its worker. A name maps to
    /// at most one live task: scheduling an existing name stops the old
    /// worker and replaces it.
    pub fn schedule<F, Fut>(&self, name: &str, period: Duration, initial_delay: Option<Duration>, runner: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let runner: Runner = Arc::new(move || Box::pin(runner()));
        let (tx, mut rx) = mpsc::channel::<Signal>(1);
        let status = Arc::new(StateCell::default());
        let counter = Arc::new(AtomicU64::new(0));

        if let Some(previous) = self.tasks.insert(
            name.to_string(),
            ScheduledTask {
                name: name.to_string(),
                period,
                status: status.clone(),
                counter: counter.clone(),
                control: tx,
            },
        ) {
            info!(name, "replacing scheduled task");
            tokio::spawn(async move {
                let _ = previous.control.send(Signal::Stop).await;
            });
        }

        info!(name, period_secs = period.as_secs_f64(), "registered scheduled task");

        let task_name = name.to_string();
        tokio::spawn(async move {
            if let Some(delay) = initial_delay {
                tokio::time::sleep(delay).await;
            }
            loop {
                match rx.try_recv() {
                    Ok(Signal::Pause) => {
                        status.set(ScheduleStatus::Paused);
                        info!(name = %task_name, "scheduled task paused");
                        // Park until continue; other signals are ignored in
                        // this window.
                        loop {
                            match rx.recv().await {
                                Some(Signal::Continue) => break,
                                Some(_) => continue,
                                None => {
                                    status.set(ScheduleStatus::Stopped);
                                    return;
                                }
                            }
                        }
                        status.set(ScheduleStatus::Running);
                        info!(name = %task_name, "scheduled task resumed");
                    }
                    Ok(Signal::Continue) => {}
                    Ok(Signal::Stop) => {
                        status.set(ScheduleStatus::Stopped);
                        info!(name = %task_name, "scheduled task stopped");
                        return;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => {}
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        status.set(ScheduleStatus::Stopped);
                        return;
                    }
                }

                counter.fetch_add(1, Ordering::SeqCst);
                if std::panic::AssertUnwindSafe(runner()).catch_unwind().await.is_err() {
                    error!(name = %task_name, "scheduled task panicked, worker exiting");
                    status.set(ScheduleStatus::Stopped);
                    return;
                }

                tokio::time::sleep(period).await;
            }
        });
    }

    pub fn pause(&self, name: &str) {
        self.signal(name, Signal::Pause);
    }

    pub fn continue_task(&self, name: &str) {
        self.signal(name, Signal::Continue);
    }

    pub fn stop(&self, name: &str) {
        self.signal(name, Signal::Stop);
    }

    /// Sends are detached so callers never block behind a worker that is
    /// busy inside its runner.
    fn signal(&self, name: &str, signal: Signal) {
        let Some(task) = self.tasks.get(name) else {
            return;
        };
        let control = task.control.clone();
        drop(task);
        tokio::spawn(async move {
            let _ = control.send(signal).await;
        });
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        self.tasks.get(name).map(|t| t.counter.load(Ordering::SeqCst))
    }

    pub fn status(&self, name: &str) -> Option<ScheduleStatus> {
        self.tasks.get(name).map(|t| t.status.get())
    }

    /// Snapshot of every registered task.
    pub fn snapshot(&self) -> Vec<ScheduledTaskInfo> {
        let mut infos: Vec<ScheduledTaskInfo> = self
            .tasks
            .iter()
            .map(|entry| ScheduledTaskInfo {
                name: entry.name.clone(),
                period_seconds: entry.period.as_secs(),
                status: entry.status.get(),
                counter: entry.counter.load(Ordering::SeqCst),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

/// Expose the scheduler over HTTP: `GET {prefix}` lists tasks and
/// `POST {prefix}/pause|continue|stop` with body `{"name": "…"}` controls
/// them.
pub fn register_schedule_service(server: &HttpServer, registry: &ScheduleRegistry, prefix: &str) {
    let prefix = prefix.trim_end_matches('/').to_string();

    let listing = registry.clone();
    server.register_handler(&prefix, move |ctx| {
        let listing = listing.clone();
        async move {
            let _ = ctx.api_response(0, "", listing.snapshot());
        }
    });

    for action in ["pause", "continue", "stop"] {
        let registry = registry.clone();
        server.register_handler(&format!("{prefix}/{action}"), move |ctx| {
            let registry = registry.clone();
            async move {
                let params = match ctx.json().await {
                    Ok(params) => params,
                    Err(err) => {
                        let _ = ctx.fail(err.to_string());
                        return;
                    }
                };
                let Some(name) = params.get("name").and_then(|v| v.as_str()) else {
                    let _ = ctx.fail("no name");
                    return;
                };
                match action {
                    "pause" => registry.pause(name),
                    "continue" => registry.continue_task(name),
                    _ => registry.stop(name),
                }
                let _ = ctx.api_response(0, "", serde_json::Value::Null);
            }
        });
    }
}
