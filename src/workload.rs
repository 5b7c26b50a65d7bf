use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::cron_schedule::CronSchedule;
use crate::error::{Error, Result};
use crate::execution::ExecutionData;
use crate::job::JobData;
use crate::runner::JobRunner;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Recurring,
    /// Holds the id of the execution the workload runs.
    OneShot(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub job: String,
    pub kind: WorkloadKind,
}

impl WorkloadKey {
    pub fn recurring(job: &str) -> Self {
        Self {
            job: job.to_string(),
            kind: WorkloadKind::Recurring,
        }
    }

    pub fn one_shot(job: &str, execution: &str) -> Self {
        Self {
            job: job.to_string(),
            kind: WorkloadKind::OneShot(execution.to_string()),
        }
    }
}

pub type Registry = Arc<Mutex<HashMap<WorkloadKey, Workload>>>;

/// State shared between a [`Workload`] and its thread.
#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    next_run: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn set_next_run(&self, value: Option<DateTime<Utc>>) {
        if let Ok(mut next_run) = self.next_run.lock() {
            *next_run = value;
        }
    }
}

/// Drives the executions of one job on a dedicated OS thread: either a
/// cron loop (recurring) or a single run (one-shot).
#[derive(Debug)]
pub struct Workload {
    key: WorkloadKey,
    name: String,
    job: JobData,
    execution: Option<ExecutionData>,
    ctx: Context,
    runner: Arc<dyn JobRunner>,
    registry: Weak<Mutex<HashMap<WorkloadKey, Workload>>>,
    stop: CancellationToken,
    shared: Arc<Shared>,
    started: bool,
    done: Option<Receiver<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Workload {
    pub fn new(
        ctx: &Context,
        runner: Arc<dyn JobRunner>,
        registry: Weak<Mutex<HashMap<WorkloadKey, Workload>>>,
        job: JobData,
        execution: Option<ExecutionData>,
        number: u64,
    ) -> Self {
        let key: WorkloadKey = match &execution {
            Some(execution) => WorkloadKey::one_shot(&job.id, &execution.id),
            None => WorkloadKey::recurring(&job.id),
        };
        Self {
            key,
            name: format!("workload-{}", number),
            job,
            execution,
            ctx: ctx.clone(),
            runner,
            registry,
            stop: CancellationToken::new(),
            shared: Arc::new(Shared::default()),
            started: false,
            done: None,
            handle: None,
        }
    }

    pub fn key(&self) -> &WorkloadKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn job(&self) -> &JobData {
        &self.job
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self.key.kind, WorkloadKind::OneShot(_))
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Set once the thread exited or [`Workload::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.shared.next_run.lock().ok().and_then(|next_run| *next_run)
    }

    /// Spawns the workload thread. Does nothing when already started or stopped.
    pub fn start(&mut self) -> Result<()> {
        if self.started || self.is_stopped() {
            return Ok(());
        }
        let (done_tx, done_rx): (Sender<()>, Receiver<()>) = bounded(1);
        let body = WorkloadBody {
            key: self.key.clone(),
            name: self.name.clone(),
            job: self.job.clone(),
            execution: self.execution.clone(),
            ctx: self.ctx.clone(),
            runner: self.runner.clone(),
            registry: self.registry.clone(),
            stop: self.stop.clone(),
            shared: self.shared.clone(),
        };
        let handle: JoinHandle<()> = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _done: Sender<()> = done_tx;
                body.run();
            })
            .map_err(|error| Error::os(format!("unable to spawn thread {}: {}", self.name, error)))?;
        self.started = true;
        self.done = Some(done_rx);
        self.handle = Some(handle);
        debug!(workload = %self.name, job = %self.job.id, "started");
        Ok(())
    }

    /// Signals the thread and waits up to `timeout` for it to exit.
    /// A thread that does not exit in time is abandoned. Returns whether it was joined.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        info!(workload = %self.name, job = %self.job.id, "stopping '{}'", self.job.name);
        self.stop.cancel();
        self.shared.stopped.store(true, Ordering::SeqCst);
        let Some(done) = self.done.take() else {
            return true;
        };
        if thread::current().name() == Some(self.name.as_str()) {
            return false;
        }
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        warn!(workload = %self.name, "thread panicked");
                    }
                }
                debug!(workload = %self.name, "stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(workload = %self.name, job = %self.job.id, "unable to join thread within {:?}, abandoning it", timeout);
                self.handle = None;
                false
            }
        }
    }
}

/// What the workload thread owns.
struct WorkloadBody {
    key: WorkloadKey,
    name: String,
    job: JobData,
    execution: Option<ExecutionData>,
    ctx: Context,
    runner: Arc<dyn JobRunner>,
    registry: Weak<Mutex<HashMap<WorkloadKey, Workload>>>,
    stop: CancellationToken,
    shared: Arc<Shared>,
}

impl WorkloadBody {
    fn run(self) {
        let runtime = self.ctx.runtime.clone();
        match self.execution.clone() {
            Some(execution) => runtime.block_on(self.run_once(execution)),
            None => runtime.block_on(self.run_recurring()),
        }
        self.shared.set_next_run(None);
        self.shared.stopped.store(true, Ordering::SeqCst);
        if matches!(self.key.kind, WorkloadKind::OneShot(_)) {
            if let Some(registry) = self.registry.upgrade() {
                if let Ok(mut workloads) = registry.lock() {
                    workloads.remove(&self.key);
                }
            }
        }
        debug!(workload = %self.name, job = %self.job.id, "exiting thread");
    }

    async fn run_once(&self, execution: ExecutionData) {
        info!(workload = %self.name, job = %self.job.id, execution = %execution.id, "starting job '{}'", self.job.name);
        if let Err(error) = self.invoke(Some(execution)).await {
            error!(workload = %self.name, job = %self.job.id, "execution of job '{}' failed: {}", self.job.name, error);
        }
    }

    async fn run_recurring(&self) {
        let max: u32 = self.ctx.config.max_config_invalid;
        let mut failures: u32 = 0;
        loop {
            match self.cycle().await {
                Ok(false) => break,
                Ok(true) => failures = 0,
                Err(error) => {
                    failures += 1;
                    let reason: &str = if error.is_config_class() {
                        "got invalid config/environment"
                    } else {
                        "got unexpected error"
                    };
                    error!(
                        workload = %self.name,
                        job = %self.job.id,
                        "{} for job '{}' ({}/{}): {}",
                        reason,
                        self.job.name,
                        failures,
                        max,
                        error
                    );
                    if failures >= max {
                        self.disable_job().await;
                        break;
                    }
                    if !self.sleep(self.ctx.config.fail_sleep()).await {
                        break;
                    }
                }
            }
        }
    }

    /// Waits for the next trigger and runs the job once. `Ok(false)` when stopped while waiting.
    async fn cycle(&self) -> Result<bool> {
        if self.stop.is_cancelled() {
            return Ok(false);
        }
        let schedule: &str = self.job.schedule.as_deref().unwrap_or_default();
        let cron: CronSchedule = CronSchedule::parse(schedule)?;
        let tz = self.ctx.config.tz()?;
        let next_run: DateTime<Utc> = cron.next_run(tz)?;
        self.shared.set_next_run(Some(next_run));
        debug!(
            workload = %self.name,
            job = %self.job.id,
            "next execution of '{}' ({}) at {}",
            self.job.name,
            cron.expression(),
            next_run
        );

        let wait: Duration = (next_run - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !self.sleep(wait).await {
            return Ok(false);
        }
        info!(workload = %self.name, job = %self.job.id, "starting job '{}'", self.job.name);
        self.invoke(None).await?;
        Ok(true)
    }

    /// Runs the job, turning a panic into an error.
    async fn invoke(&self, execution: Option<ExecutionData>) -> Result<()> {
        match AssertUnwindSafe(self.runner.run(&self.job, execution)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message: String = panic
                    .downcast_ref::<&str>()
                    .map(|message| message.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    workload = %self.name,
                    job = %self.job.id,
                    "got unexpected error while executing job '{}': {}\n{}",
                    self.job.name,
                    message,
                    Backtrace::force_capture()
                );
                Err(Error::Internal(format!("panic: {}", message)))
            }
        }
    }

    /// Interruptible sleep. Returns false when the stop signal arrived first.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn disable_job(&self) {
        error!(
            workload = %self.name,
            job = %self.job.id,
            "disabling job '{}' because of invalid config, please fix it",
            self.job.name
        );
        if let Err(error) = self.ctx.jobs().set_enabled(&self.job.id, false).await {
            error!(job = %self.job.id, "unable to disable job: {}", error);
        }
    }
}
