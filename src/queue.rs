use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::database::{new_id, Db};
use crate::error::Result;

/// An ad-hoc trigger request of `job` by `user`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueData {
    #[serde(rename = "uid")]
    pub id: String,
    pub job: String,
    pub user: Option<String>,
    #[serde(with = "chrono::serde::ts_nanoseconds")]
    pub created: DateTime<Utc>,
}

/// Table-backed FIFO of ad-hoc executions.
#[derive(Debug, Clone)]
pub struct JobQueue {
    db: Arc<Db>,
    pub table: String,
}

impl JobQueue {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            table: "job_queue".to_string(),
        }
    }

    #[instrument(skip(self))]
    pub async fn push(&self, job: &str, user: Option<&str>) -> Result<QueueData> {
        let data = QueueData {
            id: new_id(),
            job: job.to_string(),
            user: user.map(|value| value.to_string()),
            created: Utc::now(),
        };
        self.db.create(&self.table, &data.id, &data).await?;
        info!(job = %job, "job added to execution queue");
        Ok(data)
    }

    /// Removes and returns the oldest entry. Concurrent pops never return the same entry.
    pub async fn pop(&self) -> Result<Option<QueueData>> {
        let entry: Option<QueueData> = self.db.take_first(&self.table, "created ASC").await?;
        if let Some(entry) = &entry {
            debug!(job = %entry.job, "took entry {} from execution queue", entry.id);
        }
        Ok(entry)
    }

    pub async fn list(&self, limit: Option<u64>) -> Result<Vec<QueueData>> {
        self.db
            .select(&self.table, Vec::new(), Default::default(), Some("created ASC"), limit)
            .await
    }

    pub async fn purge(&self) -> Result<()> {
        self.db.purge(&self.table).await
    }
}
