use core::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::database::{bindings, new_id, Db};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Waiting,
    Starting,
    Running,
    Failed,
    Finished,
    Stopping,
    Stopped,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Failed => write!(f, "Failed"),
            Self::Finished => write!(f, "Finished"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Stopped)
    }

    /// States from which `self` may be entered.
    pub fn predecessors(&self) -> &'static [ExecutionStatus] {
        use ExecutionStatus::*;
        match self {
            Waiting => &[],
            Starting => &[Waiting],
            Running => &[Starting],
            Stopping => &[Starting, Running],
            Stopped => &[Stopping],
            Finished => &[Running],
            Failed => &[Waiting, Starting, Running, Stopping],
        }
    }

    pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
        to.predecessors().contains(&from)
    }
}

/// One run attempt of a job. `user` is `None` for scheduled runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionData {
    #[serde(rename = "uid")]
    pub id: String,
    pub job: String,
    pub user: Option<String>,
    pub status: ExecutionStatus,
    pub comment: Option<String>,
    pub limit: Option<String>,
    pub verbosity: u8,
    pub tags: Option<String>,
    pub tags_skip: Option<String>,
    pub mode_check: bool,
    pub mode_diff: bool,
    pub environment_vars: Option<String>,
    pub cmd_args: Option<String>,
    pub credential_global: Option<String>,
    pub credential_user: Option<String>,
    pub command: Option<String>,
    pub log_stdout: Option<String>,
    pub log_stderr: Option<String>,
    pub log_stdout_repo: Option<String>,
    pub log_stderr_repo: Option<String>,
    pub result: Option<String>,
    pub created: DateTime<Utc>,
}

impl Default for ExecutionData {
    fn default() -> Self {
        Self {
            id: String::new(),
            job: String::new(),
            user: None,
            status: ExecutionStatus::Waiting,
            comment: None,
            limit: None,
            verbosity: 0,
            tags: None,
            tags_skip: None,
            mode_check: false,
            mode_diff: false,
            environment_vars: None,
            cmd_args: None,
            credential_global: None,
            credential_user: None,
            command: None,
            log_stdout: None,
            log_stderr: None,
            log_stdout_repo: None,
            log_stderr_repo: None,
            result: None,
            created: Utc::now(),
        }
    }
}

impl ExecutionData {
    pub fn log_files(&self) -> Vec<&str> {
        [&self.log_stdout, &self.log_stderr, &self.log_stdout_repo, &self.log_stderr_repo]
            .into_iter()
            .filter_map(|path| path.as_deref())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultData {
    #[serde(rename = "uid")]
    pub id: String,
    pub time_start: DateTime<Utc>,
    pub time_fin: Option<DateTime<Utc>>,
    pub failed: bool,
    pub error: Option<String>,
}

impl Default for ResultData {
    fn default() -> Self {
        Self {
            id: String::new(),
            time_start: Utc::now(),
            time_fin: None,
            failed: false,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultHostData {
    #[serde(rename = "uid")]
    pub id: String,
    pub result: String,
    pub hostname: String,
    pub unreachable: bool,
    pub tasks_ok: u32,
    pub tasks_changed: u32,
    pub tasks_failed: u32,
    pub tasks_skipped: u32,
    pub tasks_ignored: u32,
    pub tasks_rescued: u32,
}

impl ResultHostData {
    pub fn is_failed(&self) -> bool {
        self.unreachable || self.tasks_failed > 0
    }
}

pub const ERROR_SHORT_MAX: usize = 100;
pub const ERROR_MED_MAX: usize = 1024;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorData {
    #[serde(rename = "uid")]
    pub id: String,
    pub short: String,
    pub med: String,
}

impl ErrorData {
    pub fn new(short: &str, med: &str) -> Self {
        Self {
            id: new_id(),
            short: truncate(short, ERROR_SHORT_MAX),
            med: truncate(med, ERROR_MED_MAX),
        }
    }
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Store of executions together with their results, per-host statistics and errors.
#[derive(Debug, Clone)]
pub struct Execution {
    db: Arc<Db>,
    pub table: String,
    pub table_result: String,
    pub table_result_host: String,
    pub table_error: String,
}

impl Execution {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            table: "job_execution".to_string(),
            table_result: "job_execution_result".to_string(),
            table_result_host: "job_execution_result_host".to_string(),
            table_error: "job_error".to_string(),
        }
    }

    pub async fn create(&self, mut data: ExecutionData) -> Result<ExecutionData> {
        if data.id.is_empty() {
            data.id = new_id();
        }
        self.db.create(&self.table, &data.id, &data).await?;
        Ok(data)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ExecutionData>> {
        self.db.get(&self.table, id).await
    }

    /// Executions of `job`, oldest first.
    pub async fn list(&self, job: &str) -> Result<Vec<ExecutionData>> {
        self.db
            .select(
                &self.table,
                vec!["job = $job".to_string()],
                bindings([("job", Value::String(job.to_string()))]),
                Some("created ASC"),
                None,
            )
            .await
    }

    /// Writes the non-status fields of `data`. The status is owned by [`Execution::update_status`].
    pub async fn save(&self, data: &ExecutionData) -> Result<()> {
        let mut patch: Value = json!(data);
        if let Some(fields) = patch.as_object_mut() {
            fields.remove("status");
        }
        if !self.db.merge(&self.table, &data.id, patch).await? {
            return Err(Error::not_found("execution", data.id.clone()));
        }
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<ExecutionStatus> {
        match self.get(id).await? {
            Some(record) => Ok(record.status),
            None => Err(Error::not_found("execution", id)),
        }
    }

    /// Atomically moves the execution to `to` when its stored status is a legal predecessor.
    #[instrument(skip(self))]
    pub async fn update_status(&self, id: &str, to: ExecutionStatus) -> Result<()> {
        let allowed: Vec<Value> = to.predecessors().iter().map(|status| Value::String(status.to_string())).collect();
        if self
            .db
            .compare_and_set(&self.table, id, "status", Value::String(to.to_string()), allowed)
            .await?
        {
            debug!(execution = %id, "status -> {}", to);
            return Ok(());
        }
        let from: ExecutionStatus = self.status(id).await?;
        Err(Error::Transition {
            record: format!("execution {}", id),
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// External cancel request.
    pub async fn request_stop(&self, id: &str) -> Result<()> {
        self.update_status(id, ExecutionStatus::Stopping).await
    }

    pub async fn create_result(&self, mut data: ResultData) -> Result<ResultData> {
        if data.id.is_empty() {
            data.id = new_id();
        }
        self.db.create(&self.table_result, &data.id, &data).await?;
        Ok(data)
    }

    pub async fn get_result(&self, id: &str) -> Result<Option<ResultData>> {
        self.db.get(&self.table_result, id).await
    }

    pub async fn update_result(&self, data: &ResultData) -> Result<()> {
        if !self.db.merge(&self.table_result, &data.id, json!(data)).await? {
            return Err(Error::not_found("execution result", data.id.clone()));
        }
        Ok(())
    }

    pub async fn add_result_host(&self, mut data: ResultHostData) -> Result<ResultHostData> {
        if data.id.is_empty() {
            data.id = new_id();
        }
        self.db.create(&self.table_result_host, &data.id, &data).await?;
        Ok(data)
    }

    pub async fn list_result_hosts(&self, result: &str) -> Result<Vec<ResultHostData>> {
        self.db
            .select(
                &self.table_result_host,
                vec!["result = $result".to_string()],
                bindings([("result", Value::String(result.to_string()))]),
                Some("hostname ASC"),
                None,
            )
            .await
    }

    pub async fn create_error(&self, data: ErrorData) -> Result<ErrorData> {
        self.db.create(&self.table_error, &data.id, &data).await?;
        Ok(data)
    }

    pub async fn get_error(&self, id: &str) -> Result<Option<ErrorData>> {
        self.db.get(&self.table_error, id).await
    }
}
