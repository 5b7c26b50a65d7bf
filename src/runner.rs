use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{kill_group, safe_name, shell_quote, ShellCommand};
use crate::config::Config;
use crate::context::Context;
use crate::credentials::CredentialResolver;
use crate::error::{Error, Result};
use crate::execution::{ErrorData, Execution, ExecutionData, ExecutionStatus, ResultData, ResultHostData};
use crate::job::{split_list, JobData};
use crate::recap::RecapParser;
use crate::repository::RepositoryData;
use crate::repository_sync::RepositorySync;
use crate::secrets::{create_dirs, SecretFiles};

const FILE_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
/// How long output readers may run on once ansible-playbook exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one execution of a job.
///
/// `execution` is `None` for scheduled runs; the runner then creates the
/// execution record itself. Errors returned are the ones raised before the
/// subprocess was launched; subprocess failures only show in the execution status.
#[async_trait]
pub trait JobRunner: Send + Sync + Debug {
    async fn run(&self, job: &JobData, execution: Option<ExecutionData>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogFiles {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub stdout_repo: PathBuf,
    pub stderr_repo: PathBuf,
}

/// `<path_log>/<job>_<time>_<user|scheduled>_<stream>.log`
pub fn log_paths(path_log: &Path, job_name: &str, user: Option<&str>, time: DateTime<Utc>) -> LogFiles {
    let user: String = match user {
        Some(user) => safe_name(&user.replace('.', "_")),
        None => "scheduled".to_string(),
    };
    let prefix: String = format!("{}_{}_{}", safe_name(job_name), time.format(FILE_TIME_FORMAT), user);
    let file = |stream: &str| path_log.join(format!("{}_{}.log", prefix, stream));
    LogFiles {
        stdout: file("stdout"),
        stderr: file("stderr"),
        stdout_repo: file("stdout_repo"),
        stderr_repo: file("stderr_repo"),
    }
}

/// Unique temporary directory of one run, below `path_run`.
pub fn new_path_run(config: &Config) -> PathBuf {
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    config
        .path_run
        .join(format!("{}{:05}", Utc::now().format(FILE_TIME_FORMAT), suffix))
}

/// Parses `key1=val1,key2=val2`.
pub fn parse_env_vars(csv: &str, src: &str) -> Result<HashMap<String, String>> {
    let mut vars: HashMap<String, String> = HashMap::new();
    for pair in split_list(Some(csv)) {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                vars.insert(key.trim().to_string(), value.to_string());
            }
            _ => {
                return Err(Error::config(format!(
                    "environment variables of {} are not in a valid format (comma-separated key-value pairs). Example: 'key1=val1,key2=val2'",
                    src
                )))
            }
        }
    }
    Ok(vars)
}

/// ARA callback settings, then global, job and execution variables; the
/// more specific source wins.
pub fn environment(config: &Config, job: &JobData, execution: &ExecutionData) -> Result<HashMap<String, String>> {
    let mut vars: HashMap<String, String> = HashMap::new();
    if let Some(server) = config.ara_server.as_deref().filter(|server| !server.trim().is_empty()) {
        match &config.ara_callback_plugins {
            Some(plugins) => {
                vars.insert("ANSIBLE_CALLBACK_PLUGINS".to_string(), plugins.to_string_lossy().into_owned());
                vars.insert("ARA_API_CLIENT".to_string(), "http".to_string());
                vars.insert("ARA_API_SERVER".to_string(), server.trim().to_string());
            }
            None => warn!(execution = %execution.id, "ignoring 'ara_server' because 'ara_callback_plugins' is not set"),
        }
    }
    let sources = [
        (config.global_environment_vars.as_deref(), "Global"),
        (job.environment_vars.as_deref(), "Job"),
        (execution.environment_vars.as_deref(), "Execution"),
    ];
    for (csv, src) in sources {
        if let Some(csv) = csv.filter(|csv| !csv.trim().is_empty()) {
            vars.extend(parse_env_vars(csv, src)?);
        }
    }
    Ok(vars)
}

fn execution_or_job<'a>(execution: &'a Option<String>, job: &'a Option<String>) -> Option<&'a str> {
    let set = |value: &'a Option<String>| value.as_deref().map(str::trim).filter(|value| !value.is_empty());
    set(execution).or_else(|| set(job))
}

/// Free-form arguments, mode flags, credential flags and the known-hosts override.
pub fn commandline_arguments(config: &Config, job: &JobData, execution: &ExecutionData, credential_args: Vec<String>) -> String {
    let mut args: Vec<String> = Vec::new();
    for extra in [&job.cmd_args, &execution.cmd_args] {
        if let Some(extra) = extra.as_deref().filter(|extra| !extra.trim().is_empty()) {
            args.push(extra.trim().to_string());
        }
    }
    if execution.mode_check || job.mode_check {
        args.push("--check".to_string());
    }
    if execution.mode_diff || job.mode_diff {
        args.push("--diff".to_string());
    }
    args.extend(credential_args);

    if let Some(known_hosts) = &config.path_ssh_known_hosts {
        if args.join(" ").contains("ansible_ssh_extra_args") {
            debug!("ssh extra args already set, not adding known_hosts file");
        } else if known_hosts.is_file() {
            args.push(format!(
                "-e \"ansible_ssh_extra_args='-o UserKnownHostsFile={}'\"",
                known_hosts.display()
            ));
        } else {
            info!("ignoring known_hosts file '{}' because it does not exist", known_hosts.display());
        }
    }
    args.join(" ")
}

/// The ansible-playbook command line run through `sh -c`.
pub fn build_command(config: &Config, job: &JobData, execution: &ExecutionData, cmdline: &str) -> String {
    let mut parts: Vec<String> = vec![config.ansible_playbook.clone(), shell_quote(job.playbook_file.trim())];
    for inventory in job.inventories() {
        parts.push("-i".to_string());
        parts.push(shell_quote(&inventory));
    }
    let options = [
        ("--limit", execution_or_job(&execution.limit, &job.limit)),
        ("--tags", execution_or_job(&execution.tags, &job.tags)),
        ("--skip-tags", execution_or_job(&execution.tags_skip, &job.tags_skip)),
    ];
    for (flag, value) in options {
        if let Some(value) = value {
            parts.push(flag.to_string());
            parts.push(shell_quote(value));
        }
    }
    let verbosity: u8 = if execution.verbosity != 0 { execution.verbosity } else { job.verbosity };
    if verbosity > 0 {
        parts.push(format!("-{}", "v".repeat(verbosity.min(6) as usize)));
    }
    if !cmdline.is_empty() {
        parts.push(cmdline.to_string());
    }
    parts.join(" ")
}

/// Everything needed to launch the subprocess.
#[derive(Debug)]
struct Launch {
    command: String,
    env: HashMap<String, String>,
    project_dir: PathBuf,
}

#[derive(Debug, Default)]
struct Outcome {
    rc: Option<i32>,
    errored: bool,
    timed_out: bool,
    canceled: bool,
    hosts: Vec<ResultHostData>,
}

/// Runs ansible-playbook for an execution and records its outcome.
#[derive(Debug, Clone)]
pub struct ExecutionRunner {
    ctx: Context,
    executions: Execution,
}

impl ExecutionRunner {
    pub fn new(ctx: &Context) -> Self {
        Self {
            ctx: ctx.clone(),
            executions: ctx.executions(),
        }
    }

    async fn repository(&self, job: &JobData) -> Result<Option<RepositoryData>> {
        match job.repository.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => match self.ctx.repositories().get(id).await? {
                Some(repository) => Ok(Some(repository)),
                None => Err(Error::config(format!("repository '{}' of job '{}' does not exist", id, job.name))),
            },
            None => Ok(None),
        }
    }

    /// Synchronizes the repository, checks the project files, writes the
    /// secrets and assembles the command. `None` when a stop was requested first.
    async fn prepare(
        &self,
        job: &JobData,
        execution: &mut ExecutionData,
        sync: &mut RepositorySync,
        path_run: &Path,
        logs: &LogFiles,
        secrets: &mut SecretFiles,
    ) -> Result<Option<Launch>> {
        let config: &Config = &self.ctx.config;
        sync.sync(Some(&logs.stdout_repo), Some(&logs.stderr_repo)).await?;
        let project_dir: PathBuf = sync.project_dir()?;
        self.executions.update_status(&execution.id, ExecutionStatus::Starting).await?;

        let playbook: PathBuf = project_dir.join(job.playbook_file.trim());
        if !playbook.is_file() {
            return Err(Error::config(format!("configured playbook not found: '{}'", playbook.display())));
        }
        for inventory in job.inventories() {
            let inventory: PathBuf = project_dir.join(inventory);
            if !inventory.exists() {
                return Err(Error::config(format!("configured inventory not found: '{}'", inventory.display())));
            }
        }
        create_dirs(path_run, "run")?;
        create_dirs(&config.path_log, "log")?;

        let resolver: CredentialResolver = CredentialResolver::new(self.ctx.credentials(), self.ctx.codec.clone());
        let credential_args: Vec<String> = match resolver.resolve(job, execution).await? {
            Some(credential) => {
                if credential.is_global() {
                    execution.credential_global = Some(credential.id.clone());
                } else {
                    execution.credential_user = Some(credential.id.clone());
                }
                resolver.materialize(&credential, path_run, secrets)?
            }
            None => Vec::new(),
        };
        let env: HashMap<String, String> = environment(config, job, execution)?;
        let cmdline: String = commandline_arguments(config, job, execution, credential_args);
        let command: String = build_command(config, job, execution, &cmdline);
        execution.command = Some(command.clone());
        self.executions.save(execution).await?;

        if self.executions.status(&execution.id).await? == ExecutionStatus::Stopping {
            return Ok(None);
        }
        self.executions.update_status(&execution.id, ExecutionStatus::Running).await?;
        Ok(Some(Launch {
            command,
            env,
            project_dir,
        }))
    }

    /// Polls the persisted status and fires `cancel` once a stop was requested.
    fn watch_status(&self, id: String, cancel: CancellationToken, done: CancellationToken) -> JoinHandle<()> {
        let executions: Execution = self.executions.clone();
        let interval = self.ctx.config.cancel_poll_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = done.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match executions.status(&id).await {
                            Ok(ExecutionStatus::Stopping) => {
                                info!(execution = %id, "stop requested");
                                cancel.cancel();
                                break;
                            }
                            Ok(_) => {}
                            Err(error) => warn!(execution = %id, "unable to read execution status: {}", error),
                        }
                    }
                }
            }
        })
    }

    #[instrument(skip_all, fields(execution = %execution.id))]
    async fn launch(&self, execution: &ExecutionData, launch: Launch, logs: &LogFiles) -> Outcome {
        let mut outcome = Outcome::default();
        let stdout_log = match open_log(&logs.stdout).await {
            Ok(file) => file,
            Err(error) => {
                error!("unable to open log file: {}", error);
                outcome.errored = true;
                return outcome;
            }
        };
        let mut stderr_log = match open_log(&logs.stderr).await {
            Ok(file) => file,
            Err(error) => {
                error!("unable to open log file: {}", error);
                outcome.errored = true;
                return outcome;
            }
        };

        info!("running '{}'", launch.command);
        let mut child = match ShellCommand::new()
            .working_dir(&launch.project_dir)
            .envs(launch.env)
            .build(&launch.command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                error!("unable to start ansible-playbook: {}", error);
                let _ = stderr_log.write_all(format!("{}\n", error).as_bytes()).await;
                outcome.errored = true;
                return outcome;
            }
        };

        let pid: Option<u32> = child.id();
        let parser: Arc<Mutex<RecapParser>> = Arc::new(Mutex::new(RecapParser::new()));
        let stdout_task: Option<JoinHandle<()>> = child.stdout.take().map(|stdout| {
            let parser: Arc<Mutex<RecapParser>> = parser.clone();
            tokio::spawn(async move {
                stream_lines(stdout, stdout_log, |line| {
                    if let Ok(mut parser) = parser.lock() {
                        parser.feed(line);
                    }
                })
                .await
            })
        });
        let stderr_task: Option<JoinHandle<()>> = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(async move { stream_lines(stderr, stderr_log, |_| {}).await }));

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let watcher: JoinHandle<()> = self.watch_status(execution.id.clone(), cancel.clone(), done.clone());

        let status: std::io::Result<ExitStatus> = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                outcome.canceled = true;
                terminate(&mut child, pid);
                child.wait().await
            }
            _ = tokio::time::sleep(self.ctx.config.run_timeout()) => {
                warn!("ansible-playbook timed out after {:?}", self.ctx.config.run_timeout());
                outcome.timed_out = true;
                terminate(&mut child, pid);
                child.wait().await
            }
        };
        done.cancel();
        let _ = watcher.await;

        match status {
            Ok(status) => outcome.rc = status.code(),
            Err(error) => {
                error!("unable to wait for ansible-playbook: {}", error);
                outcome.errored = true;
            }
        }
        for (stream, task) in [("stdout", stdout_task), ("stderr", stderr_task)] {
            let Some(mut task) = task else {
                continue;
            };
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut task).await.is_err() {
                // leftover processes of the group still hold the pipe
                warn!("{} still open {:?} after ansible-playbook exited, killing its process group", stream, OUTPUT_DRAIN_TIMEOUT);
                if let Some(pid) = pid {
                    kill_group(pid);
                }
                task.abort();
            }
        }
        if let Ok(mut parser) = parser.lock() {
            outcome.hosts = std::mem::take(&mut *parser).into_hosts();
        }
        outcome
    }

    async fn finalize(&self, execution: &ExecutionData, result: &mut ResultData, outcome: Outcome) -> Result<ExecutionStatus> {
        let mut any_failed: bool = false;
        for host in outcome.hosts {
            any_failed |= host.is_failed();
            self.executions
                .add_result_host(ResultHostData {
                    result: result.id.clone(),
                    ..host
                })
                .await?;
        }
        let stopping: bool = self.executions.status(&execution.id).await? == ExecutionStatus::Stopping;
        let status: ExecutionStatus = if outcome.errored || outcome.timed_out || any_failed {
            ExecutionStatus::Failed
        } else if outcome.canceled || stopping {
            ExecutionStatus::Stopped
        } else if outcome.rc != Some(0) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Finished
        };
        result.time_fin = Some(Utc::now());
        result.failed = status == ExecutionStatus::Failed;
        self.executions.update_result(result).await?;
        self.set_final_status(&execution.id, status).await?;
        Ok(status)
    }

    /// A stop requested after the last status read turns `Finished` into `Stopped`.
    async fn set_final_status(&self, id: &str, status: ExecutionStatus) -> Result<()> {
        match self.executions.update_status(id, status).await {
            Err(error @ Error::Transition { .. }) => {
                if self.executions.status(id).await? == ExecutionStatus::Stopping {
                    self.executions.update_status(id, ExecutionStatus::Stopped).await
                } else {
                    Err(error)
                }
            }
            other => other,
        }
    }

    /// Records a pre-launch error on the execution.
    async fn failure(&self, execution: &ExecutionData, result: &mut ResultData, error: &Error) -> Result<()> {
        let short: String = format!("[{}] {}", error.kind(), error);
        let med: String = format!("{}\n{}", error, Backtrace::force_capture());
        let job_error: ErrorData = self.executions.create_error(ErrorData::new(&short, &med)).await?;
        result.time_fin = Some(Utc::now());
        result.failed = true;
        result.error = Some(job_error.id);
        self.executions.update_result(result).await?;
        if let Err(error) = self.executions.update_status(&execution.id, ExecutionStatus::Failed).await {
            warn!(execution = %execution.id, "unable to mark execution failed: {}", error);
        }
        self.executions.save(execution).await
    }

    fn cleanup(&self, execution: &ExecutionData, path_run: &Path, secrets: &mut SecretFiles, sync: &mut RepositorySync) {
        if !secrets.paths().is_empty() {
            debug!(execution = %execution.id, "removing {} secret files", secrets.paths().len());
        }
        secrets.cleanup();
        sync.cleanup();
        for log in execution.log_files() {
            if let Ok(metadata) = fs::metadata(log) {
                if metadata.len() == 0 {
                    let _ = fs::remove_file(log);
                }
            }
        }
        if path_run.exists() {
            if let Err(error) = fs::remove_dir_all(path_run) {
                warn!("unable to remove run directory '{}': {}", path_run.display(), error);
            }
        }
    }
}

#[async_trait]
impl JobRunner for ExecutionRunner {
    #[instrument(skip_all, fields(job = %job.id))]
    async fn run(&self, job: &JobData, execution: Option<ExecutionData>) -> Result<()> {
        let time_start: DateTime<Utc> = Utc::now();
        let path_run: PathBuf = new_path_run(&self.ctx.config);
        let mut execution: ExecutionData = match execution {
            Some(execution) => execution,
            None => {
                self.executions
                    .create(ExecutionData {
                        job: job.id.clone(),
                        comment: Some("Scheduled".to_string()),
                        ..Default::default()
                    })
                    .await?
            }
        };
        let mut result: ResultData = self
            .executions
            .create_result(ResultData {
                time_start,
                ..Default::default()
            })
            .await?;
        execution.result = Some(result.id.clone());
        let logs: LogFiles = log_paths(&self.ctx.config.path_log, &job.name, execution.user.as_deref(), time_start);
        execution.log_stdout = Some(logs.stdout.to_string_lossy().into_owned());
        execution.log_stderr = Some(logs.stderr.to_string_lossy().into_owned());
        execution.log_stdout_repo = Some(logs.stdout_repo.to_string_lossy().into_owned());
        execution.log_stderr_repo = Some(logs.stderr_repo.to_string_lossy().into_owned());
        self.executions.save(&execution).await?;

        let mut secrets: SecretFiles = SecretFiles::new();
        let repository: Option<RepositoryData> = match self.repository(job).await {
            Ok(repository) => repository,
            Err(error) => {
                let mut sync = RepositorySync::new(&self.ctx, None, Some(execution.id.clone()), path_run.clone());
                self.failure(&execution, &mut result, &error).await?;
                self.cleanup(&execution, &path_run, &mut secrets, &mut sync);
                return Err(error);
            }
        };
        let mut sync = RepositorySync::new(&self.ctx, repository, Some(execution.id.clone()), path_run.clone());

        let launch: Launch = match self
            .prepare(job, &mut execution, &mut sync, &path_run, &logs, &mut secrets)
            .await
        {
            Ok(Some(launch)) => launch,
            Ok(None) => {
                info!(execution = %execution.id, "stopped before launch");
                result.time_fin = Some(Utc::now());
                let finished: Result<()> = match self.executions.update_result(&result).await {
                    Ok(()) => self.executions.update_status(&execution.id, ExecutionStatus::Stopped).await,
                    Err(error) => Err(error),
                };
                self.cleanup(&execution, &path_run, &mut secrets, &mut sync);
                return finished;
            }
            Err(error) => {
                error!(execution = %execution.id, "{}", error);
                if let Err(store_error) = self.failure(&execution, &mut result, &error).await {
                    error!(execution = %execution.id, "unable to record failure: {}", store_error);
                }
                self.cleanup(&execution, &path_run, &mut secrets, &mut sync);
                return Err(error);
            }
        };

        let outcome: Outcome = self.launch(&execution, launch, &logs).await;
        let finished: Result<ExecutionStatus> = self.finalize(&execution, &mut result, outcome).await;
        self.cleanup(&execution, &path_run, &mut secrets, &mut sync);
        let status: ExecutionStatus = finished?;
        info!(execution = %execution.id, "job '{}' ended with status {}", job.name, status);
        Ok(())
    }
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o640)
        .open(path)
        .await
}

/// Kills the shell and every process it started.
fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_group(pid);
    }
    let _ = child.start_kill();
}

/// Copies `reader` line by line into `file`. Invalid UTF-8 is replaced, not fatal.
async fn stream_lines<R, F>(reader: R, mut file: tokio::fs::File, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line: String = String::from_utf8_lossy(&buf).trim_end_matches(['\n', '\r']).to_string();
                on_line(&line);
                if let Err(error) = file.write_all(format!("{}\n", line).as_bytes()).await {
                    warn!("unable to write log line: {}", error);
                }
            }
            Err(error) => {
                warn!("unable to read process output: {}", error);
                break;
            }
        }
    }
    let _ = file.flush().await;
}
