use core::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::database::{new_id, Db};
use crate::error::{Error, Result};
use crate::execution::ExecutionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepositoryKind {
    #[default]
    Static,
    Git,
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static => write!(f, "Static"),
            Self::Git => write!(f, "Git"),
        }
    }
}

/// Source of a job's project directory.
///
/// Hook and override fields hold comma-separated shell commands.
/// `git_credentials` references a [`crate::credential::CredentialData`] whose
/// `connect_user`/`connect_pass`/`ssh_key` are used to reach the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryData {
    #[serde(rename = "uid")]
    pub id: String,
    pub name: String,
    pub kind: RepositoryKind,
    pub static_path: Option<PathBuf>,
    pub git_origin: Option<String>,
    pub git_branch: Option<String>,
    pub git_limit_depth: Option<u32>,
    pub git_lfs: bool,
    pub git_isolate: bool,
    pub git_hook_pre: Option<String>,
    pub git_hook_post: Option<String>,
    pub git_override_initialize: Option<String>,
    pub git_override_update: Option<String>,
    pub git_credentials: Option<String>,
    pub git_playbook_base: Option<String>,
    pub status: ExecutionStatus,
    pub log_stdout: Option<String>,
    pub log_stderr: Option<String>,
    pub time_update: Option<DateTime<Utc>>,
}

impl Default for RepositoryData {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            kind: RepositoryKind::Static,
            static_path: None,
            git_origin: None,
            git_branch: None,
            git_limit_depth: None,
            git_lfs: false,
            git_isolate: false,
            git_hook_pre: None,
            git_hook_post: None,
            git_override_initialize: None,
            git_override_update: None,
            git_credentials: None,
            git_playbook_base: None,
            status: ExecutionStatus::Waiting,
            log_stdout: None,
            log_stderr: None,
            time_update: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Repository {
    db: Arc<Db>,
    pub table: String,
}

impl Repository {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            table: "repository".to_string(),
        }
    }

    pub async fn create(&self, mut data: RepositoryData) -> Result<RepositoryData> {
        if data.id.is_empty() {
            data.id = new_id();
        }
        self.db.create(&self.table, &data.id, &data).await?;
        Ok(data)
    }

    pub async fn get(&self, id: &str) -> Result<Option<RepositoryData>> {
        self.db.get(&self.table, id).await
    }

    pub async fn update(&self, data: &RepositoryData) -> Result<()> {
        self.patch(&data.id, json!(data)).await
    }

    /// Repository status has no terminal guard: shared working copies are synchronized again on every run.
    pub async fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        self.patch(id, json!({ "status": status })).await
    }

    pub async fn set_logs(&self, id: &str, log_stdout: Option<&str>, log_stderr: Option<&str>) -> Result<()> {
        self.patch(id, json!({ "log_stdout": log_stdout, "log_stderr": log_stderr })).await
    }

    pub async fn set_time_update(&self, id: &str, time_update: DateTime<Utc>) -> Result<()> {
        self.patch(id, json!({ "time_update": time_update })).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.db.remove(&self.table, id).await
    }

    async fn patch(&self, id: &str, patch: Value) -> Result<()> {
        if !self.db.merge(&self.table, id, patch).await? {
            return Err(Error::not_found("repository", id));
        }
        Ok(())
    }
}
