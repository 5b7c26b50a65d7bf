#[cfg(test)]
mod test_workload {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{Datelike, Utc};
    use fake::faker::name::en::Name;
    use fake::Fake;

    use crate::execution::{ErrorData, ExecutionData, ExecutionStatus, ResultData};
    use crate::job::JobData;
    use crate::runner::ExecutionRunner;
    use crate::tests::test_helper::{wait_until, FakeMode, FakeRunner, TestEnv};
    use crate::workload::{Registry, Workload, WorkloadKey};

    fn job(schedule: &str) -> JobData {
        JobData {
            id: "job-1".to_string(),
            name: Name().fake::<String>(),
            playbook_file: "site.yml".to_string(),
            schedule: Some(schedule.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_recurring_waits_for_next_run() {
        let env = TestEnv::new();
        let runner = Arc::new(FakeRunner::new(FakeMode::Succeed));
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let mut workload = Workload::new(&env.ctx, runner.clone(), Arc::downgrade(&registry), job("0 0 1 1 *"), None, 1);
        assert_eq!(workload.name(), "workload-1");
        assert_eq!(workload.key(), &WorkloadKey::recurring("job-1"));
        assert!(!workload.is_one_shot());

        let result = workload.start();
        assert!(result.is_ok(), "{:?}", result.unwrap_err());
        assert!(workload.is_started());
        assert!(wait_until(Duration::from_secs(5), || workload.next_run().is_some()));
        let next_run = workload.next_run().unwrap();
        assert_eq!((next_run.month(), next_run.day()), (1, 1));
        assert!(next_run > Utc::now());

        assert!(workload.stop(Duration::from_secs(5)));
        assert!(workload.is_stopped());
        assert_eq!(runner.calls(), 0);
        // stopped workloads are not started again
        assert!(workload.start().is_ok());
        assert_eq!(runner.calls(), 0);
    }

    #[test]
    fn test_one_shot_deregisters() {
        let env = TestEnv::new();
        let runner = Arc::new(FakeRunner::new(FakeMode::Succeed));
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let execution = ExecutionData {
            id: "execution-1".to_string(),
            job: "job-1".to_string(),
            ..Default::default()
        };
        let workload = Workload::new(&env.ctx, runner.clone(), Arc::downgrade(&registry), job("0 0 1 1 *"), Some(execution), 2);
        let key: WorkloadKey = workload.key().clone();
        assert_eq!(key, WorkloadKey::one_shot("job-1", "execution-1"));
        assert!(workload.is_one_shot());

        registry.lock().unwrap().insert(key.clone(), workload);
        registry.lock().unwrap().get_mut(&key).unwrap().start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || !registry.lock().unwrap().contains_key(&key)));
        assert_eq!(runner.calls(), 1);
    }

    #[test]
    fn test_one_shot_failure_is_not_retried() {
        let env = TestEnv::new();
        let runner = Arc::new(FakeRunner::new(FakeMode::Fail));
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let execution = ExecutionData {
            id: "execution-1".to_string(),
            job: "job-1".to_string(),
            ..Default::default()
        };
        let mut workload = Workload::new(&env.ctx, runner.clone(), Arc::downgrade(&registry), job("* * * * * *"), Some(execution), 3);
        workload.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || workload.is_stopped()));
        assert!(workload.stop(Duration::from_secs(5)));
        assert_eq!(runner.calls(), 1);
    }

    fn assert_disabled_after_failures(mode: FakeMode) {
        let env = TestEnv::new();
        let stored: JobData = env.block_on(env.ctx.jobs().create(job("* * * * * *"))).unwrap();
        let runner = Arc::new(FakeRunner::new(mode));
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let mut workload = Workload::new(&env.ctx, runner.clone(), Arc::downgrade(&registry), stored.clone(), None, 4);
        workload.start().unwrap();

        let disabled: bool = wait_until(Duration::from_secs(15), || {
            env.block_on(env.ctx.jobs().get(&stored.id))
                .unwrap()
                .map(|job| !job.enabled)
                .unwrap_or(false)
        });
        assert!(disabled, "job was not disabled after {} runs", runner.calls());
        assert!(wait_until(Duration::from_secs(5), || workload.is_stopped()));
        assert_eq!(runner.calls(), env.ctx.config.max_config_invalid as usize);
        assert!(workload.stop(Duration::from_secs(5)));
    }

    #[test]
    fn test_disabled_after_repeated_errors() {
        assert_disabled_after_failures(FakeMode::Fail);
    }

    #[test]
    fn test_disabled_after_repeated_panics() {
        assert_disabled_after_failures(FakeMode::Panic);
    }

    #[test]
    fn test_disabled_when_credentials_missing() {
        let env = TestEnv::new();
        let stored: JobData = env
            .block_on(env.ctx.jobs().create(JobData {
                credentials_needed: true,
                ..job("* * * * * *")
            }))
            .unwrap();
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let runner = Arc::new(ExecutionRunner::new(&env.ctx));
        let mut workload = Workload::new(&env.ctx, runner, Arc::downgrade(&registry), stored.clone(), None, 5);
        workload.start().unwrap();

        assert!(wait_until(Duration::from_secs(20), || workload.is_stopped()));
        let job: JobData = env.block_on(env.ctx.jobs().get(&stored.id)).unwrap().unwrap();
        assert!(!job.enabled);

        let executions: Vec<ExecutionData> = env.block_on(env.ctx.executions().list(&stored.id)).unwrap();
        assert_eq!(executions.len(), env.ctx.config.max_config_invalid as usize);
        for execution in executions {
            assert_eq!(execution.status, ExecutionStatus::Failed);
            let result: ResultData = env
                .block_on(env.ctx.executions().get_result(execution.result.as_deref().unwrap()))
                .unwrap()
                .unwrap();
            assert!(result.failed);
            let error: ErrorData = env
                .block_on(env.ctx.executions().get_error(result.error.as_deref().unwrap()))
                .unwrap()
                .unwrap();
            assert!(error.short.starts_with("[ConfigError]"), "{}", error.short);
        }
        assert!(workload.stop(Duration::from_secs(5)));
    }
}
