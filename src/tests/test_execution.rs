#[cfg(test)]
mod test_execution {
    use std::sync::Arc;

    use fake::faker::internet::en::Username;
    use fake::Fake;

    use crate::database::Db;
    use crate::error::Error;
    use crate::execution::{
        ErrorData, Execution, ExecutionData, ExecutionStatus, ResultData, ResultHostData, ERROR_MED_MAX, ERROR_SHORT_MAX,
    };
    use crate::tests::test_helper::memory_db;

    use ExecutionStatus::*;

    const ALL: [ExecutionStatus; 7] = [Waiting, Starting, Running, Failed, Finished, Stopping, Stopped];

    #[test]
    fn test_transition_table() {
        let legal = [
            (Waiting, Starting),
            (Starting, Running),
            (Starting, Stopping),
            (Running, Stopping),
            (Stopping, Stopped),
            (Running, Finished),
            (Waiting, Failed),
            (Starting, Failed),
            (Running, Failed),
            (Stopping, Failed),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    ExecutionStatus::can_transition(from, to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
        for terminal in [Failed, Finished, Stopped] {
            assert!(terminal.is_terminal());
            assert!(ALL.iter().all(|to| !ExecutionStatus::can_transition(terminal, *to)));
        }
        assert!(!Running.is_terminal());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_updates() {
        let db: Arc<Db> = Arc::new(memory_db().await);
        let executions: Execution = Execution::new(db);
        let result = executions
            .create(ExecutionData {
                job: "job-1".to_string(),
                user: Some(Username().fake::<String>()),
                ..Default::default()
            })
            .await;
        assert!(result.is_ok(), "{:?}", result.unwrap_err());
        let execution: ExecutionData = result.unwrap();
        assert_eq!(executions.status(&execution.id).await.unwrap(), Waiting);

        // a stop can only be requested once the run started
        assert!(matches!(
            executions.request_stop(&execution.id).await,
            Err(Error::Transition { .. })
        ));
        for status in [Starting, Running, Finished] {
            let result = executions.update_status(&execution.id, status).await;
            assert!(result.is_ok(), "{:?}", result.unwrap_err());
        }
        for status in [Running, Failed, Stopped, Waiting] {
            let result = executions.update_status(&execution.id, status).await;
            assert!(matches!(result, Err(Error::Transition { .. })), "{:?}", result);
        }
        assert_eq!(executions.status(&execution.id).await.unwrap(), Finished);

        assert!(matches!(
            executions.update_status("missing", Starting).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_request() {
        let db: Arc<Db> = Arc::new(memory_db().await);
        let executions: Execution = Execution::new(db);
        let execution: ExecutionData = executions.create(ExecutionData::default()).await.unwrap();
        executions.update_status(&execution.id, Starting).await.unwrap();
        executions.update_status(&execution.id, Running).await.unwrap();
        executions.request_stop(&execution.id).await.unwrap();
        assert!(executions.update_status(&execution.id, Finished).await.is_err());
        executions.update_status(&execution.id, Stopped).await.unwrap();
        assert_eq!(executions.status(&execution.id).await.unwrap(), Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_save_keeps_status() {
        let db: Arc<Db> = Arc::new(memory_db().await);
        let executions: Execution = Execution::new(db);
        let mut execution: ExecutionData = executions
            .create(ExecutionData {
                job: "job-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        executions.update_status(&execution.id, Starting).await.unwrap();

        execution.command = Some("ansible-playbook site.yml".to_string());
        execution.status = Finished;
        executions.save(&execution).await.unwrap();

        let stored: ExecutionData = executions.get(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Starting);
        assert_eq!(stored.command.as_deref(), Some("ansible-playbook site.yml"));
        assert_eq!(executions.list("job-1").await.unwrap().len(), 1);
        assert!(executions.list("job-2").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_results_and_errors() {
        let db: Arc<Db> = Arc::new(memory_db().await);
        let executions: Execution = Execution::new(db);
        let mut result: ResultData = executions.create_result(ResultData::default()).await.unwrap();
        for hostname in ["web2", "web1"] {
            executions
                .add_result_host(ResultHostData {
                    result: result.id.clone(),
                    hostname: hostname.to_string(),
                    tasks_ok: 3,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let hosts: Vec<ResultHostData> = executions.list_result_hosts(&result.id).await.unwrap();
        assert_eq!(hosts.iter().map(|host| host.hostname.as_str()).collect::<Vec<&str>>(), vec!["web1", "web2"]);

        let error: ErrorData = executions
            .create_error(ErrorData::new(&"x".repeat(500), &"y".repeat(5000)))
            .await
            .unwrap();
        assert_eq!(error.short.len(), ERROR_SHORT_MAX);
        assert_eq!(error.med.len(), ERROR_MED_MAX);

        result.failed = true;
        result.error = Some(error.id.clone());
        executions.update_result(&result).await.unwrap();
        let stored: ResultData = executions.get_result(&result.id).await.unwrap().unwrap();
        assert!(stored.failed);
        assert_eq!(executions.get_error(stored.error.as_deref().unwrap()).await.unwrap(), Some(error));
    }

    #[test]
    fn test_host_failed() {
        let host = ResultHostData {
            hostname: "web1".to_string(),
            tasks_ok: 4,
            ..Default::default()
        };
        assert!(!host.is_failed());
        assert!(ResultHostData { tasks_failed: 1, ..host.clone() }.is_failed());
        assert!(ResultHostData { unreachable: true, ..host }.is_failed());
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::config("missing inventory").is_config_class());
        assert!(Error::repository("git exited 128").is_config_class());
        assert!(Error::os("permission denied").is_config_class());
        assert!(!Error::Database("connection reset".to_string()).is_config_class());
        assert!(!Error::not_found("job", "job:1").is_config_class());
        assert_eq!(Error::config("x").kind(), "ConfigError");
    }
}
