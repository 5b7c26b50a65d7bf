use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, instrument, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::execution::{ExecutionData, ExecutionStatus};
use crate::job::JobData;
use crate::manager::ThreadManager;
use crate::runner::JobRunner;
use crate::Command;

const WAIT_TIME: Duration = Duration::from_secs(1);

/// Difference between configured jobs and running workloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub added: Vec<JobData>,
    pub removed: Vec<JobData>,
    pub changed: Vec<JobData>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Computes which recurring workloads to add, remove and replace.
///
/// A running job that is no longer configured, or no longer schedulable
/// (disabled, schedule removed or invalid), is removed. A running job whose
/// watched fields changed is replaced.
pub fn plan_reconciliation(configured: &[JobData], running: &[JobData]) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    for job in configured {
        match running.iter().find(|run_job| run_job.id == job.id) {
            None => {
                if !job.has_schedule() {
                    debug!(job = %job.id, "ignoring job '{}' because it has no schedule", job.name);
                } else if !job.enabled {
                    debug!(job = %job.id, "ignoring job '{}' because it is disabled", job.name);
                } else if !job.is_schedulable() {
                    info!(job = %job.id, "got invalid job schedule '{}'", job.schedule.as_deref().unwrap_or_default());
                } else {
                    plan.added.push(job.clone());
                }
            }
            Some(run_job) => {
                if !job.is_schedulable() {
                    debug!(job = %job.id, "job '{}' was disabled or lost its schedule", job.name);
                    plan.removed.push(job.clone());
                } else {
                    let changed: Vec<&str> = run_job.changed_fields(job);
                    if !changed.is_empty() {
                        debug!(job = %job.id, "job '{}' config changed: {:?}", job.name, changed);
                        plan.changed.push(job.clone());
                    }
                }
            }
        }
    }
    for run_job in running {
        if !configured.iter().any(|job| job.id == run_job.id) {
            plan.removed.push(run_job.clone());
        }
    }
    plan
}

/// Resets the reload flag when a reconciliation pass ends.
struct ReloadGuard<'a>(&'a AtomicBool);

impl Drop for ReloadGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the control loop: periodic reconciliation of configured jobs against
/// running workloads and draining of the job queue.
#[derive(Debug)]
pub struct Scheduler {
    ctx: Context,
    manager: ThreadManager,
    rx: Receiver<Command>,
    stopping: AtomicBool,
    reloading: AtomicBool,
}

impl Scheduler {
    pub fn new(ctx: &Context, runner: Arc<dyn JobRunner>, rx: Receiver<Command>) -> Self {
        Self {
            ctx: ctx.clone(),
            manager: ThreadManager::new(ctx, runner),
            rx,
            stopping: AtomicBool::new(false),
            reloading: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &ThreadManager {
        &self.manager
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Runs the control loop on its own thread. The thread returns the process exit code.
    pub fn start(self) -> Result<JoinHandle<i32>> {
        thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || self.run())
            .map_err(|error| Error::os(format!("unable to spawn scheduler thread: {}", error)))
    }

    /// Control loop. Returns once stopped, with `0` or `1` after an error.
    #[instrument(skip_all)]
    pub fn run(&self) -> i32 {
        info!("starting scheduler");
        if let Err(error) = self.reload() {
            error!("unable to load jobs: {}", error);
            return self.stop(true);
        }
        let mut time_last_check: Instant = Instant::now();
        let mut time_last_reload: Instant = Instant::now();
        loop {
            match self.rx.recv_timeout(WAIT_TIME) {
                Ok(Command::Stop) => return self.stop(false),
                Ok(Command::Reload) => {
                    info!("reloading");
                    if let Err(error) = self.reload() {
                        error!("got unexpected error: {}", error);
                        return self.stop(true);
                    }
                    time_last_reload = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("command channel closed");
                    return self.stop(false);
                }
            }
            if self.is_stopping() {
                return 0;
            }
            if time_last_check.elapsed() >= self.ctx.config.interval_check() {
                if let Err(error) = self.check() {
                    error!("got unexpected error: {}", error);
                    return self.stop(true);
                }
                time_last_check = Instant::now();
            }
            if time_last_reload.elapsed() >= self.ctx.config.interval_reload() {
                if let Err(error) = self.reload() {
                    error!("got unexpected error: {}", error);
                    return self.stop(true);
                }
                time_last_reload = Instant::now();
            }
        }
    }

    /// Drains the job queue, starting a one-shot workload per entry. Returns how many were started.
    pub fn check(&self) -> Result<usize> {
        debug!("checking for queued jobs");
        let jobs = self.ctx.jobs();
        let executions = self.ctx.executions();
        let queue = self.ctx.queue();
        let mut started: usize = 0;
        while let Some(entry) = self.ctx.runtime.block_on(queue.pop())? {
            let Some(job) = self.ctx.runtime.block_on(jobs.get(&entry.job))? else {
                warn!(job = %entry.job, "skipping queued run of deleted job");
                continue;
            };
            info!(
                job = %job.id,
                "adding workload for queued job '{}' (triggered by user '{}')",
                job.name,
                entry.user.as_deref().unwrap_or("scheduled")
            );
            let execution: ExecutionData = self.ctx.runtime.block_on(executions.create(ExecutionData {
                job: job.id.clone(),
                user: entry.user.clone(),
                comment: Some("Triggered".to_string()),
                status: ExecutionStatus::Waiting,
                ..Default::default()
            }))?;
            self.manager.add(job, Some(execution), true)?;
            started += 1;
        }
        Ok(started)
    }

    /// Reconciles configured jobs with the running workloads. `None` when
    /// another pass is in progress or the scheduler is stopping.
    pub fn reload(&self) -> Result<Option<ReconcilePlan>> {
        if self.is_stopping() || self.reloading.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let _guard = ReloadGuard(&self.reloading);
        let configured: Vec<JobData> = self.ctx.runtime.block_on(self.ctx.jobs().list())?;
        let running: Vec<JobData> = self.manager.list()?;
        let plan: ReconcilePlan = plan_reconciliation(&configured, &running);
        self.apply(&plan)?;
        self.manager.sweep()?;
        Ok(Some(plan))
    }

    fn apply(&self, plan: &ReconcilePlan) -> Result<()> {
        if !plan.added.is_empty() {
            info!("adding workloads: {:?}", names(&plan.added));
            for job in &plan.added {
                self.manager.add(job.clone(), None, true)?;
            }
        }
        if !plan.removed.is_empty() {
            info!("removing workloads: {:?}", names(&plan.removed));
            for job in &plan.removed {
                self.manager.stop_job(&job.id)?;
            }
        }
        if !plan.changed.is_empty() {
            info!("replacing workloads: {:?}", names(&plan.changed));
            for job in &plan.changed {
                self.manager.replace(job.clone())?;
            }
        }
        if !plan.is_empty() {
            info!("running workloads: {:?}", self.manager.status()?);
        }
        Ok(())
    }

    /// Stops every workload and waits the shutdown grace period. Returns the exit code.
    pub fn stop(&self, error: bool) -> i32 {
        let code: i32 = if error { 1 } else { 0 };
        if self.stopping.swap(true, Ordering::SeqCst) {
            return code;
        }
        info!("stopping scheduler");
        self.manager.stop_all();
        thread::sleep(self.ctx.config.shutdown_wait());
        info!("scheduler stopped");
        code
    }
}

fn names(jobs: &[JobData]) -> Vec<&str> {
    jobs.iter().map(|job| job.name.as_str()).collect()
}
