use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::Config;
use crate::credential::{Credential, PlainCodec, SecretCodec};
use crate::database::Db;
use crate::execution::Execution;
use crate::job::Job;
use crate::queue::JobQueue;
use crate::repository::Repository;

/// Everything the scheduler, workloads and runner share: configuration,
/// store, secret codec and the runtime driving their async work.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub codec: Arc<dyn SecretCodec>,
    pub runtime: Handle,
}

impl Context {
    pub fn new(config: Config, db: Db, runtime: Handle) -> Self {
        Self {
            config: Arc::new(config),
            db: Arc::new(db),
            codec: Arc::new(PlainCodec),
            runtime,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn SecretCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn jobs(&self) -> Job {
        Job::new(self.db.clone())
    }

    pub fn executions(&self) -> Execution {
        Execution::new(self.db.clone())
    }

    pub fn credentials(&self) -> Credential {
        Credential::new(self.db.clone())
    }

    pub fn repositories(&self) -> Repository {
        Repository::new(self.db.clone())
    }

    pub fn queue(&self) -> JobQueue {
        JobQueue::new(self.db.clone())
    }
}
