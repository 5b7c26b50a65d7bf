use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::execution::ExecutionData;
use crate::job::JobData;
use crate::runner::JobRunner;
use crate::workload::{Registry, Workload, WorkloadKey};

/// Registry of live workloads.
///
/// The registry lock is never held while a workload is being joined, so a
/// finishing one-shot workload can always deregister itself.
#[derive(Debug)]
pub struct ThreadManager {
    ctx: Context,
    runner: Arc<dyn JobRunner>,
    workloads: Registry,
    counter: AtomicU64,
    stopping: AtomicBool,
}

impl ThreadManager {
    pub fn new(ctx: &Context, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            ctx: ctx.clone(),
            runner,
            workloads: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<WorkloadKey, Workload>>> {
        self.workloads
            .lock()
            .map_err(|error| Error::Internal(format!("workload registry poisoned: {}", error)))
    }

    /// Registers a workload for `job`: one-shot when `execution` is given, recurring otherwise.
    /// A recurring workload that already exists for the job is kept as it is.
    pub fn add(&self, job: JobData, execution: Option<ExecutionData>, start: bool) -> Result<WorkloadKey> {
        let number: u64 = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let schedule: String = job
            .schedule
            .as_deref()
            .map(|schedule| format!(" with schedule \"{}\"", schedule))
            .unwrap_or_default();
        debug!(job = %job.id, "adding workload for '{}'{}", job.name, schedule);
        let workload: Workload = Workload::new(
            &self.ctx,
            self.runner.clone(),
            Arc::downgrade(&self.workloads),
            job,
            execution,
            number,
        );
        let key: WorkloadKey = workload.key().clone();
        let mut workloads = self.lock()?;
        if workloads.contains_key(&key) {
            warn!(job = %key.job, "workload already registered");
            return Ok(key);
        }
        workloads.insert(key.clone(), workload);
        if start {
            if let Some(workload) = workloads.get_mut(&key) {
                workload.start()?;
            }
        }
        Ok(key)
    }

    pub fn start(&self, key: &WorkloadKey) -> Result<bool> {
        let mut workloads = self.lock()?;
        match workloads.get_mut(key) {
            Some(workload) if !workload.is_started() && !workload.is_stopped() => {
                workload.start()?;
                info!(job = %key.job, "workload '{}' started", workload.job().name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Deregisters the workload, then signals and joins it.
    pub fn stop(&self, key: &WorkloadKey) -> Result<bool> {
        let removed: Option<Workload> = self.lock()?.remove(key);
        match removed {
            Some(mut workload) => {
                workload.stop(self.ctx.config.thread_join_timeout());
                info!(job = %key.job, workload = %workload.name(), "workload '{}' stopped", workload.job().name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stops the recurring workload of `job`.
    pub fn stop_job(&self, job: &str) -> Result<bool> {
        self.stop(&WorkloadKey::recurring(job))
    }

    pub fn stop_all(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("stopping all workloads");
        let drained: Vec<Workload> = match self.lock() {
            Ok(mut workloads) => workloads.drain().map(|(_, workload)| workload).collect(),
            Err(error) => {
                warn!("{}", error);
                Vec::new()
            }
        };
        for mut workload in drained {
            workload.stop(self.ctx.config.thread_join_timeout());
        }
        info!("all workloads stopped");
        true
    }

    /// Stops the recurring workload of the job and starts one with its new configuration.
    pub fn replace(&self, job: JobData) -> Result<WorkloadKey> {
        info!(job = %job.id, "replacing workload for '{}'", job.name);
        self.stop_job(&job.id)?;
        self.add(job, None, true)
    }

    /// Jobs with a recurring workload.
    pub fn list(&self) -> Result<Vec<JobData>> {
        Ok(self
            .lock()?
            .values()
            .filter(|workload| !workload.is_one_shot())
            .map(|workload| workload.job().clone())
            .collect())
    }

    pub fn status(&self) -> Result<Vec<String>> {
        let mut pretty: Vec<String> = self
            .lock()?
            .values()
            .map(|workload| {
                let next_run: String = workload
                    .next_run()
                    .map(|next_run| next_run.to_rfc3339())
                    .unwrap_or_else(|| "None".to_string());
                format!("{} next run at {}", workload.job().name, next_run)
            })
            .collect();
        pretty.sort();
        Ok(pretty)
    }

    /// Purges workloads whose thread already exited. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let mut workloads = self.lock()?;
        let before: usize = workloads.len();
        workloads.retain(|_, workload| !workload.is_stopped());
        Ok(before - workloads.len())
    }

    pub fn contains(&self, key: &WorkloadKey) -> bool {
        self.lock().map(|workloads| workloads.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|workloads| workloads.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_run(&self, job: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.lock()
            .ok()
            .and_then(|workloads| workloads.get(&WorkloadKey::recurring(job)).and_then(|workload| workload.next_run()))
    }
}
