use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::cron_schedule::validate_cron;
use crate::database::{new_id, Db};
use crate::error::{Error, Result};

/// Flags that make ansible-playbook wait for input on a terminal.
const PROMPT_FLAGS: [&str; 5] = ["--step", "--ask-vault-password", "--ask-vault-pass", "-k", "--ask-pass"];

/// Fields compared between the running and the stored job to detect drift.
pub const CHANGE_FIELDS: [&str; 17] = [
    "name",
    "playbook_file",
    "inventory_file",
    "repository",
    "schedule",
    "enabled",
    "limit",
    "verbosity",
    "mode_diff",
    "mode_check",
    "tags",
    "tags_skip",
    "comment",
    "environment_vars",
    "cmd_args",
    "credentials_default",
    "credentials_needed",
];

/// A persisted definition of an ansible-playbook run.
///
/// - `inventory_file`: comma-separated list of inventories, relative to the project directory.
/// - `repository`: id of the [`crate::repository::RepositoryData`] providing the project directory.
/// - `schedule`: cron expression; jobs without one only run when triggered.
/// - `environment_vars`: `key=value` pairs separated by commas.
/// - `credentials_default`: id of a global credential used when the execution names none.
/// - `credentials_needed`: fail before launch when no credential resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobData {
    #[serde(rename = "uid")]
    pub id: String,
    pub name: String,
    pub playbook_file: String,
    pub inventory_file: Option<String>,
    pub repository: Option<String>,
    pub schedule: Option<String>,
    pub enabled: bool,
    pub limit: Option<String>,
    pub verbosity: u8,
    pub comment: Option<String>,
    pub mode_check: bool,
    pub mode_diff: bool,
    pub environment_vars: Option<String>,
    pub tags: Option<String>,
    pub tags_skip: Option<String>,
    pub cmd_args: Option<String>,
    pub credentials_default: Option<String>,
    pub credentials_needed: bool,
    pub created: DateTime<Utc>,
}

impl Default for JobData {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            playbook_file: String::new(),
            inventory_file: None,
            repository: None,
            schedule: None,
            enabled: true,
            limit: None,
            verbosity: 0,
            comment: None,
            mode_check: false,
            mode_diff: false,
            environment_vars: None,
            tags: None,
            tags_skip: None,
            cmd_args: None,
            credentials_default: None,
            credentials_needed: false,
            created: Utc::now(),
        }
    }
}

impl JobData {
    pub fn has_schedule(&self) -> bool {
        self.schedule.as_deref().map(|value| !value.trim().is_empty()).unwrap_or(false)
    }

    /// Enabled, scheduled and carrying a cron expression that parses.
    pub fn is_schedulable(&self) -> bool {
        self.enabled
            && match self.schedule.as_deref() {
                Some(schedule) if !schedule.trim().is_empty() => validate_cron(schedule).is_ok(),
                _ => false,
            }
    }

    /// Names of the watched fields whose value differs between `self` and `other`.
    pub fn changed_fields(&self, other: &JobData) -> Vec<&'static str> {
        let current: Value = json!(self);
        let updated: Value = json!(other);
        CHANGE_FIELDS
            .iter()
            .filter(|field| current.get(**field) != updated.get(**field))
            .copied()
            .collect()
    }

    pub fn inventories(&self) -> Vec<String> {
        split_list(self.inventory_file.as_deref())
    }

    /// Save-time validation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("job name must not be empty"));
        }
        if self.playbook_file.trim().is_empty() {
            return Err(Error::config(format!("job '{}' has no playbook", self.name)));
        }
        if let Some(schedule) = self.schedule.as_deref() {
            if !schedule.trim().is_empty() {
                validate_cron(schedule)?;
            }
        }
        if self.verbosity > 6 {
            return Err(Error::config(format!("verbosity must be between 0 and 6, got {}", self.verbosity)));
        }
        if let Some(cmd_args) = self.cmd_args.as_deref() {
            if let Some(flag) = cmd_args.split_whitespace().find(|arg| PROMPT_FLAGS.contains(arg)) {
                return Err(Error::config(format!("job argument '{}' would prompt for input", flag)));
            }
        }
        Ok(())
    }
}

/// Splits a comma-separated list, dropping empty items.
pub fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Job {
    db: Arc<Db>,
    pub table: String,
}

impl Job {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            table: "job".to_string(),
        }
    }

    pub async fn list(&self) -> Result<Vec<JobData>> {
        self.db.select(&self.table, Vec::new(), Default::default(), Some("created ASC"), None).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobData>> {
        self.db.get(&self.table, id).await
    }

    #[instrument(skip_all)]
    pub async fn create(&self, mut data: JobData) -> Result<JobData> {
        data.validate()?;
        if data.id.is_empty() {
            data.id = new_id();
        }
        self.db.create(&self.table, &data.id, &data).await?;
        info!(job = %data.id, "created job '{}'", data.name);
        Ok(data)
    }

    pub async fn update(&self, data: &JobData) -> Result<()> {
        data.validate()?;
        if !self.db.merge(&self.table, &data.id, json!(data)).await? {
            return Err(Error::not_found("job", data.id.clone()));
        }
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        if !self.db.merge(&self.table, id, json!({ "enabled": enabled })).await? {
            return Err(Error::not_found("job", id));
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.db.remove(&self.table, id).await
    }
}
