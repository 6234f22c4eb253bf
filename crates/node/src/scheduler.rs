//! # Job Scheduler
//!
//! Runs every registered job on its own task and timer.
//!
//! ## Per-job loop
//!
//! ```text
//! start ─▶ run handler ─▶ Ok ───────────────┐
//!              │                             ▼
//!              ├─▶ Err ─▶ on_error ─▶ Continue ─▶ sleep(interval) ─▶ run handler ...
//!              │                   └─▶ Halt ─▶ task ends
//!              └─▶ panic ─▶ panic hook (default: abort the process)
//! ```
//!
//! - The first run happens immediately on `start`.
//! - The timer is re-armed only after the handler returns, so a job never
//!   overlaps with itself; jobs do run concurrently with each other.
//! - `stop` raises the shutdown signal and waits for every task. A handler
//!   that is running is allowed to finish; sleeping tasks wake and exit.
//!   `start` may be called again afterwards.
//!
//! ## Panics
//!
//! Handlers only panic on invariant violations, such as a ledger row whose
//! numeric fields no longer parse. A spawned task would otherwise swallow
//! the panic into its `JoinHandle` and leave the node running without that
//! job, so the scheduler catches it and calls the panic hook. The default
//! hook logs the panic and aborts the process.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Handler = Arc<dyn Fn() -> JobFuture + Send + Sync>;
type ErrorPolicy = Arc<dyn Fn(&anyhow::Error) -> JobAction + Send + Sync>;
pub type PanicHook = Arc<dyn Fn(&JobPanic) + Send + Sync>;

/// What happens to a job after its handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Log and run again on the next tick.
    Continue,
    /// Stop rescheduling this job.
    Halt,
}

/// A handler that panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPanic {
    pub job: String,
    pub message: String,
}

fn abort_process(p: &JobPanic) {
    error!(job = %p.job, panic = %p.message, "job panicked, aborting");
    std::process::abort();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A named, periodically executed handler.
#[derive(Clone)]
pub struct Job {
    name: String,
    interval: Duration,
    handler: Handler,
    on_error: ErrorPolicy,
}

impl Job {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            handler: Arc::new(move || -> JobFuture { Box::pin(handler()) }),
            on_error: Arc::new(|_: &anyhow::Error| JobAction::Continue),
        }
    }

    /// Replaces the default (always continue) error policy.
    pub fn on_error<P>(mut self, policy: P) -> Self
    where
        P: Fn(&anyhow::Error) -> JobAction + Send + Sync + 'static,
    {
        self.on_error = Arc::new(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, on_panic: PanicHook) {
        info!(job = %self.name, interval_secs = self.interval.as_secs(), "job started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            debug!(job = %self.name, "running");
            let result = match AssertUnwindSafe((self.handler)()).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    on_panic(&JobPanic {
                        job: self.name.clone(),
                        message: panic_message(payload.as_ref()),
                    });
                    return;
                }
            };
            if let Err(e) = result {
                match (self.on_error)(&e) {
                    JobAction::Continue => {
                        warn!(job = %self.name, error = %e, "job failed, retrying next tick");
                    }
                    JobAction::Halt => {
                        error!(job = %self.name, error = %e, "job failed, halting");
                        return;
                    }
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(job = %self.name, "job stopped");
    }
}

/// Owns the job tasks.
pub struct Scheduler {
    jobs: Vec<Job>,
    handles: Vec<(String, JoinHandle<()>)>,
    shutdown: watch::Sender<bool>,
    on_panic: PanicHook,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            handles: Vec::new(),
            shutdown,
            on_panic: Arc::new(abort_process),
        }
    }

    /// Replaces the default (abort the process) panic hook.
    pub fn on_panic<H>(mut self, hook: H) -> Self
    where
        H: Fn(&JobPanic) + Send + Sync + 'static,
    {
        self.on_panic = Arc::new(hook);
        self
    }

    pub fn register_jobs(&mut self, jobs: impl IntoIterator<Item = Job>) {
        self.jobs.extend(jobs);
    }

    /// Number of running job tasks.
    pub fn running(&self) -> usize {
        self.handles.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Spawns every registered job that has no task yet.
    pub fn start(&mut self) {
        self.shutdown.send_replace(false);
        for job in self.jobs.iter().skip(self.handles.len()).cloned() {
            let name = job.name.clone();
            let rx = self.shutdown.subscribe();
            let handle = tokio::spawn(job.run(rx, self.on_panic.clone()));
            self.handles.push((name, handle));
        }
    }

    /// Signals every job to stop and waits for in-flight handlers.
    pub async fn stop(&mut self) {
        self.shutdown.send_replace(true);
        for (name, handle) in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(job = %name, error = %e, "job task failed");
            }
        }
        info!("scheduler stopped");
    }
}
