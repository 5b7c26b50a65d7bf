#[cfg(test)]
mod test_runner {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    use chrono::{TimeZone, Utc};
    use fake::faker::name::en::Name;
    use fake::Fake;
    use tokio::runtime::Handle;

    use crate::config::Config;
    use crate::context::Context;
    use crate::credential::{CredentialData, SecretAttr};
    use crate::error::Error;
    use crate::execution::{ErrorData, ExecutionData, ExecutionStatus, ResultData, ResultHostData};
    use crate::job::JobData;
    use crate::runner::{
        build_command, commandline_arguments, environment, log_paths, parse_env_vars, ExecutionRunner, JobRunner, LogFiles,
    };
    use crate::tests::test_helper::{async_context, memory_db, test_config};

    fn sample_job(environment_vars: Option<&str>) -> JobData {
        JobData {
            name: Name().fake::<String>(),
            playbook_file: "site.yml".to_string(),
            inventory_file: Some("hosts.ini".to_string()),
            environment_vars: environment_vars.map(|vars| vars.to_string()),
            ..Default::default()
        }
    }

    async fn only_execution(ctx: &Context, job: &JobData) -> ExecutionData {
        let mut executions: Vec<ExecutionData> = ctx.executions().list(&job.id).await.unwrap();
        assert_eq!(executions.len(), 1);
        executions.remove(0)
    }

    async fn result_of(ctx: &Context, execution: &ExecutionData) -> ResultData {
        ctx.executions()
            .get_result(execution.result.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap()
    }

    fn secret_files(root: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = Vec::new();
        let Ok(entries) = fs::read_dir(root) else {
            return found;
        };
        for entry in entries.flatten() {
            let path: PathBuf = entry.path();
            if path.is_dir() {
                found.extend(secret_files(&path));
            } else if entry.file_name().to_string_lossy().starts_with(".secret_") {
                found.push(path);
            }
        }
        found
    }

    fn run_dirs(config: &Config) -> usize {
        fs::read_dir(&config.path_run).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduled_run_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let job: JobData = ctx.jobs().create(sample_job(Some("TEST_VAR=from-job"))).await.unwrap();

        let runner = ExecutionRunner::new(&ctx);
        let result = runner.run(&job, None).await;
        assert!(result.is_ok(), "{:?}", result.unwrap_err());

        let execution: ExecutionData = only_execution(&ctx, &job).await;
        assert_eq!(execution.status, ExecutionStatus::Finished);
        assert_eq!(execution.comment.as_deref(), Some("Scheduled"));
        assert!(execution.user.is_none());
        assert!(execution.command.as_deref().unwrap().contains("site.yml -i hosts.ini"));

        let result: ResultData = result_of(&ctx, &execution).await;
        assert!(!result.failed);
        assert!(result.time_fin.is_some());
        assert!(result.error.is_none());
        let hosts: Vec<ResultHostData> = ctx.executions().list_result_hosts(&result.id).await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].hostname, "web1");
        assert_eq!((hosts[0].tasks_ok, hosts[0].tasks_changed), (3, 1));
        assert_eq!(hosts[1].tasks_skipped, 1);

        let stdout: String = fs::read_to_string(execution.log_stdout.as_deref().unwrap()).unwrap();
        assert!(stdout.contains("TEST_VAR: from-job"), "{}", stdout);
        assert!(stdout.contains("PLAY RECAP"), "{}", stdout);
        let stderr: String = fs::read_to_string(execution.log_stderr.as_deref().unwrap()).unwrap();
        assert!(stderr.contains("some warning"));
        assert!(execution.log_stdout.as_deref().unwrap().ends_with("_scheduled_stdout.log"));
        // nothing was written for the repository
        assert!(!Path::new(execution.log_stdout_repo.as_deref().unwrap()).exists());
        assert_eq!(run_dirs(&ctx.config), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_hosts_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let runner = ExecutionRunner::new(&ctx);

        let failing: JobData = ctx.jobs().create(sample_job(Some("FAKE_FAILED=1"))).await.unwrap();
        assert!(runner.run(&failing, None).await.is_ok());
        let execution: ExecutionData = only_execution(&ctx, &failing).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(result_of(&ctx, &execution).await.failed);

        let exit_code: JobData = ctx.jobs().create(sample_job(Some("FAKE_RC=4"))).await.unwrap();
        assert!(runner.run(&exit_code, None).await.is_ok());
        let execution: ExecutionData = only_execution(&ctx, &exit_code).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_playbook() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let job: JobData = ctx
            .jobs()
            .create(JobData {
                playbook_file: "missing.yml".to_string(),
                ..sample_job(None)
            })
            .await
            .unwrap();
        let execution: ExecutionData = ctx
            .executions()
            .create(ExecutionData {
                job: job.id.clone(),
                user: Some("john.doe".to_string()),
                comment: Some("Triggered".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let runner = ExecutionRunner::new(&ctx);
        let result = runner.run(&job, Some(execution.clone())).await;
        assert!(matches!(result, Err(Error::Config(_))), "{:?}", result);

        let stored: ExecutionData = ctx.executions().get(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        let result: ResultData = result_of(&ctx, &stored).await;
        assert!(result.failed);
        let error: ErrorData = ctx
            .executions()
            .get_error(result.error.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(error.short.starts_with("[ConfigError]"), "{}", error.short);
        assert!(error.med.contains("missing.yml"));
        assert_eq!(run_dirs(&ctx.config), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_secrets_removed_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let mut credential = CredentialData {
            name: "ops".to_string(),
            connect_user: Some("deploy".to_string()),
            ..Default::default()
        };
        credential.conceal(SecretAttr::BecomePass, "s3cret", ctx.codec.as_ref()).unwrap();
        let credential: CredentialData = ctx.credentials().create(credential).await.unwrap();
        let job: JobData = ctx
            .jobs()
            .create(JobData {
                credentials_default: Some(credential.id.clone()),
                ..sample_job(None)
            })
            .await
            .unwrap();

        let runner = ExecutionRunner::new(&ctx);
        let result = runner.run(&job, None).await;
        assert!(result.is_ok(), "{:?}", result.unwrap_err());
        let execution: ExecutionData = only_execution(&ctx, &job).await;
        assert_eq!(execution.status, ExecutionStatus::Finished);
        assert_eq!(execution.credential_global, Some(credential.id.clone()));
        let stdout: String = fs::read_to_string(execution.log_stdout.as_deref().unwrap()).unwrap();
        assert!(stdout.contains("BECOME: s3cret"), "{}", stdout);
        assert!(stdout.contains("--user deploy"), "{}", stdout);
        assert!(secret_files(&ctx.config.path_run).is_empty());

        // invalid variables fail the run after the secrets were written
        let broken: JobData = ctx
            .jobs()
            .create(JobData {
                credentials_default: Some(credential.id.clone()),
                ..sample_job(Some("not-a-pair"))
            })
            .await
            .unwrap();
        let result = runner.run(&broken, None).await;
        assert!(matches!(result, Err(Error::Config(_))), "{:?}", result);
        assert_eq!(only_execution(&ctx, &broken).await.status, ExecutionStatus::Failed);
        assert!(secret_files(&ctx.config.path_run).is_empty());
        assert_eq!(run_dirs(&ctx.config), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_request() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let job: JobData = ctx.jobs().create(sample_job(Some("FAKE_SLEEP=8"))).await.unwrap();
        let execution: ExecutionData = ctx
            .executions()
            .create(ExecutionData {
                job: job.id.clone(),
                user: Some("alice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let runner = ExecutionRunner::new(&ctx);
        let task = tokio::spawn({
            let job: JobData = job.clone();
            let execution: ExecutionData = execution.clone();
            async move { runner.run(&job, Some(execution)).await }
        });

        let started: Instant = Instant::now();
        while ctx.executions().status(&execution.id).await.unwrap() != ExecutionStatus::Running {
            assert!(started.elapsed() < Duration::from_secs(10), "execution never started");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let result = ctx.executions().request_stop(&execution.id).await;
        assert!(result.is_ok(), "{:?}", result.unwrap_err());
        let stopped: Instant = Instant::now();

        let result = task.await.unwrap();
        // the playbook's own children are killed as well
        assert!(stopped.elapsed() < Duration::from_secs(4), "{:?}", stopped.elapsed());
        assert!(result.is_ok(), "{:?}", result.unwrap_err());
        let stored: ExecutionData = ctx.executions().get(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Stopped);
        assert!(!result_of(&ctx, &stored).await.failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config: Config = test_config(dir.path());
        config.run_timeout = 1;
        let ctx: Context = Context::new(config, memory_db().await, Handle::current());
        let job: JobData = ctx.jobs().create(sample_job(Some("FAKE_SLEEP=8"))).await.unwrap();

        let runner = ExecutionRunner::new(&ctx);
        let started: Instant = Instant::now();
        assert!(runner.run(&job, None).await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
        let execution: ExecutionData = only_execution(&ctx, &job).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(result_of(&ctx, &execution).await.failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_background_process_keeps_output_open() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let job: JobData = ctx.jobs().create(sample_job(Some("FAKE_BACKGROUND=30"))).await.unwrap();

        let runner = ExecutionRunner::new(&ctx);
        let started: Instant = Instant::now();
        assert!(runner.run(&job, None).await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(15), "{:?}", started.elapsed());

        let execution: ExecutionData = only_execution(&ctx, &job).await;
        assert_eq!(execution.status, ExecutionStatus::Finished);
        let result: ResultData = result_of(&ctx, &execution).await;
        assert_eq!(ctx.executions().list_result_hosts(&result.id).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_output_with_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let job: JobData = ctx.jobs().create(sample_job(Some("FAKE_LATIN1=1"))).await.unwrap();

        let runner = ExecutionRunner::new(&ctx);
        assert!(runner.run(&job, None).await.is_ok());
        let execution: ExecutionData = only_execution(&ctx, &job).await;
        assert_eq!(execution.status, ExecutionStatus::Finished);
        let result: ResultData = result_of(&ctx, &execution).await;
        assert!(!result.failed);
        assert_eq!(ctx.executions().list_result_hosts(&result.id).await.unwrap().len(), 2);

        let stdout: String = fs::read_to_string(execution.log_stdout.as_deref().unwrap()).unwrap();
        assert!(stdout.contains("caf\u{FFFD} \u{FFFD}"), "{}", stdout);
        assert!(stdout.contains("PLAY RECAP"), "{}", stdout);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_coloured_recap() {
        let dir = tempfile::tempdir().unwrap();
        let ctx: Context = async_context(dir.path()).await;
        let job: JobData = ctx.jobs().create(sample_job(Some("FAKE_COLOR=1"))).await.unwrap();

        let runner = ExecutionRunner::new(&ctx);
        assert!(runner.run(&job, None).await.is_ok());
        let execution: ExecutionData = only_execution(&ctx, &job).await;
        let result: ResultData = result_of(&ctx, &execution).await;
        let hosts: Vec<ResultHostData> = ctx.executions().list_result_hosts(&result.id).await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].hostname, "web1");
        assert_eq!((hosts[0].tasks_ok, hosts[0].tasks_changed), (3, 1));
    }

    #[test]
    fn test_environment() {
        let config = Config {
            global_environment_vars: Some("A=global,B=global".to_string()),
            ..Default::default()
        };
        let job = JobData {
            environment_vars: Some("B=job,C=job".to_string()),
            ..sample_job(None)
        };
        let execution = ExecutionData {
            environment_vars: Some("C=execution,D=a=b".to_string()),
            ..Default::default()
        };
        let vars = environment(&config, &job, &execution).unwrap();
        assert_eq!(vars.len(), 4);
        assert_eq!(vars["A"], "global");
        assert_eq!(vars["B"], "job");
        assert_eq!(vars["C"], "execution");
        assert_eq!(vars["D"], "a=b");

        assert!(matches!(parse_env_vars("A=1,oops", "Job"), Err(Error::Config(_))));
        assert!(matches!(parse_env_vars("=1", "Job"), Err(Error::Config(_))));
        assert!(parse_env_vars("", "Job").unwrap().is_empty());
    }

    #[test]
    fn test_environment_with_ara() {
        let config = Config {
            ara_server: Some("http://ara.local:8000".to_string()),
            ara_callback_plugins: Some(PathBuf::from("/opt/ara/plugins/callback")),
            global_environment_vars: Some("ARA_API_CLIENT=offline".to_string()),
            ..Default::default()
        };
        let vars = environment(&config, &sample_job(None), &ExecutionData::default()).unwrap();
        assert_eq!(vars["ANSIBLE_CALLBACK_PLUGINS"], "/opt/ara/plugins/callback");
        assert_eq!(vars["ARA_API_SERVER"], "http://ara.local:8000");
        // global variables take precedence
        assert_eq!(vars["ARA_API_CLIENT"], "offline");

        let without_plugins = Config {
            ara_server: Some("http://ara.local:8000".to_string()),
            ..Default::default()
        };
        let vars = environment(&without_plugins, &sample_job(None), &ExecutionData::default()).unwrap();
        assert!(vars.is_empty(), "{:?}", vars);
    }

    #[test]
    fn test_build_command() {
        let config = Config {
            ansible_playbook: "ansible-playbook".to_string(),
            ..Default::default()
        };
        let job = JobData {
            playbook_file: "site.yml".to_string(),
            inventory_file: Some("hosts.ini, staging/hosts.ini".to_string()),
            limit: Some("web".to_string()),
            tags: Some("deploy".to_string()),
            verbosity: 2,
            ..Default::default()
        };
        let execution = ExecutionData {
            limit: Some("web1".to_string()),
            tags_skip: Some("slow tasks".to_string()),
            ..Default::default()
        };
        assert_eq!(
            build_command(&config, &job, &execution, "--check"),
            "ansible-playbook site.yml -i hosts.ini -i staging/hosts.ini --limit web1 --tags deploy --skip-tags 'slow tasks' -vv --check"
        );
        let execution = ExecutionData {
            verbosity: 4,
            ..Default::default()
        };
        assert_eq!(
            build_command(&config, &job, &execution, ""),
            "ansible-playbook site.yml -i hosts.ini -i staging/hosts.ini --limit web --tags deploy -vvvv"
        );
    }

    #[test]
    fn test_commandline_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts: PathBuf = dir.path().join("known_hosts");
        fs::write(&known_hosts, "").unwrap();
        let config = Config {
            path_ssh_known_hosts: Some(known_hosts.clone()),
            ..Default::default()
        };
        let job = JobData {
            cmd_args: Some("--forks 5".to_string()),
            mode_diff: true,
            ..Default::default()
        };
        let execution = ExecutionData {
            cmd_args: Some("-e foo=bar".to_string()),
            mode_check: true,
            ..Default::default()
        };
        assert_eq!(
            commandline_arguments(&config, &job, &execution, vec!["--user deploy".to_string()]),
            format!(
                "--forks 5 -e foo=bar --check --diff --user deploy -e \"ansible_ssh_extra_args='-o UserKnownHostsFile={}'\"",
                known_hosts.display()
            )
        );

        let own_ssh_args = ExecutionData {
            cmd_args: Some("-e ansible_ssh_extra_args=-4".to_string()),
            ..Default::default()
        };
        assert_eq!(
            commandline_arguments(&config, &JobData::default(), &own_ssh_args, Vec::new()),
            "-e ansible_ssh_extra_args=-4"
        );

        let missing = Config {
            path_ssh_known_hosts: Some(dir.path().join("absent")),
            ..Default::default()
        };
        assert_eq!(commandline_arguments(&missing, &JobData::default(), &ExecutionData::default(), Vec::new()), "");
    }

    #[test]
    fn test_log_paths() {
        let time = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 5).unwrap();
        let logs: LogFiles = log_paths(Path::new("/var/log/playcron"), "Deploy web/app", Some("john.doe"), time);
        assert_eq!(
            logs.stdout,
            PathBuf::from("/var/log/playcron/Deploywebapp_2026-10-19_08-30-05_john_doe_stdout.log")
        );
        assert_eq!(
            logs.stderr_repo,
            PathBuf::from("/var/log/playcron/Deploywebapp_2026-10-19_08-30-05_john_doe_stderr_repo.log")
        );
        let scheduled: LogFiles = log_paths(Path::new("/logs"), "backup", None, time);
        assert_eq!(scheduled.stderr, PathBuf::from("/logs/backup_2026-10-19_08-30-05_scheduled_stderr.log"));
    }
}
