use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::command::{safe_name, shell_quote, CommandOutput, ShellCommand};
use crate::context::Context;
use crate::credential::SecretAttr;
use crate::credentials::{secret_file, CredentialResolver};
use crate::error::{Error, Result};
use crate::execution::ExecutionStatus;
use crate::job::split_list;
use crate::repository::{RepositoryData, RepositoryKind};
use crate::runner::{log_paths, new_path_run};
use crate::secrets::{append_file_0640, create_dirs, SecretFiles};

/// Materializes the project directory of one execution.
///
/// Static repositories are used as they are. Git repositories are cloned on
/// first use (or for every execution when isolated) and updated afterwards.
#[derive(Debug)]
pub struct RepositorySync {
    ctx: Context,
    repository: Option<RepositoryData>,
    execution: Option<String>,
    path_run: PathBuf,
    env: HashMap<String, String>,
    secrets: SecretFiles,
    /// Secret embedded in the origin, masked in logs.
    mask: Option<String>,
}

impl RepositorySync {
    pub fn new(ctx: &Context, repository: Option<RepositoryData>, execution: Option<String>, path_run: PathBuf) -> Self {
        Self {
            ctx: ctx.clone(),
            repository,
            execution,
            path_run,
            env: HashMap::new(),
            secrets: SecretFiles::new(),
            mask: None,
        }
    }

    pub fn repository(&self) -> Option<&RepositoryData> {
        self.repository.as_ref()
    }

    fn is_git(&self) -> bool {
        matches!(&self.repository, Some(repository) if repository.kind == RepositoryKind::Git)
    }

    /// Working copy of the repository.
    pub fn path_repo(&self) -> Result<PathBuf> {
        let Some(repository) = &self.repository else {
            return Ok(self.ctx.config.path_play.clone());
        };
        match repository.kind {
            RepositoryKind::Static => repository
                .static_path
                .clone()
                .ok_or_else(|| Error::config(format!("static repository '{}' has no path", repository.name))),
            RepositoryKind::Git => {
                let path: PathBuf = self.ctx.config.path_repositories().join(safe_name(&repository.name));
                match (&self.execution, repository.git_isolate) {
                    (Some(execution), true) => Ok(path.join(execution)),
                    _ => Ok(path),
                }
            }
        }
    }

    /// Directory ansible-playbook runs in.
    pub fn project_dir(&self) -> Result<PathBuf> {
        let path: PathBuf = self.path_repo()?;
        match &self.repository {
            Some(repository) if repository.kind == RepositoryKind::Git => match repository.git_playbook_base.as_deref() {
                Some(base) if !base.trim().is_empty() => Ok(path.join(base.trim())),
                _ => Ok(path),
            },
            _ => Ok(path),
        }
    }

    /// Creates or updates the working copy. Failures mark the repository
    /// `Failed` and surface as [`Error::Repository`].
    #[instrument(skip_all)]
    pub async fn sync(&mut self, log_stdout: Option<&Path>, log_stderr: Option<&Path>) -> Result<()> {
        if !self.is_git() {
            return Ok(());
        }
        let Some(repository) = self.repository.as_mut() else {
            return Ok(());
        };
        repository.log_stdout = log_stdout.map(|path| path.to_string_lossy().into_owned());
        repository.log_stderr = log_stderr.map(|path| path.to_string_lossy().into_owned());
        let id: String = repository.id.clone();
        let store = self.ctx.repositories();
        store
            .set_logs(&id, repository.log_stdout.as_deref(), repository.log_stderr.as_deref())
            .await?;
        store.set_status(&id, ExecutionStatus::Running).await?;

        match self.create_or_update().await {
            Ok(()) => {
                store.set_status(&id, ExecutionStatus::Finished).await?;
                Ok(())
            }
            Err(error) => {
                let message: String = match error {
                    Error::Repository(message) => message,
                    other => format!("got unexpected error: '{}'", other),
                };
                let message: String = self.masked(&message);
                error!(repository = %id, "{}", message);
                if let Some(path) = log_stderr {
                    if let Err(error) = append_file_0640(path, &format!("{}\n", message)) {
                        warn!("unable to write repository log '{}': {}", path.display(), error);
                    }
                }
                store.set_status(&id, ExecutionStatus::Failed).await?;
                Err(Error::repository(message))
            }
        }
    }

    async fn create_or_update(&mut self) -> Result<()> {
        let Some(repository) = self.repository.clone() else {
            return Ok(());
        };
        let path_repo: PathBuf = self.path_repo()?;
        create_dirs(&path_repo, "repository")?;
        self.env = self.git_env(&repository).await?;

        self.run_list(repository.git_hook_pre.as_deref()).await?;
        if repository.git_isolate || !path_repo.join(".git/HEAD").is_file() {
            self.initialize(&repository, &path_repo).await?;
        } else {
            self.update(&repository).await?;
        }
        self.run_list(repository.git_hook_post.as_deref()).await?;

        let now = Utc::now();
        if let Some(repository) = self.repository.as_mut() {
            repository.time_update = Some(now);
        }
        self.ctx.repositories().set_time_update(&repository.id, now).await
    }

    async fn initialize(&mut self, repository: &RepositoryData, path_repo: &Path) -> Result<()> {
        if has_value(repository.git_override_initialize.as_deref()) {
            return self.run_list(repository.git_override_initialize.as_deref()).await;
        }
        let origin: &str = repository
            .git_origin
            .as_deref()
            .filter(|origin| !origin.trim().is_empty())
            .ok_or_else(|| Error::config(format!("git repository '{}' has no origin", repository.name)))?;
        let origin: String = self.origin_with_credentials(repository, origin).await?;
        let git: &str = self.ctx.config.git_binary.as_str();

        let mut clone: Vec<String> = vec![git.to_string(), "clone".to_string()];
        if let Some(branch) = repository.git_branch.as_deref().filter(|branch| !branch.trim().is_empty()) {
            clone.push("--branch".to_string());
            clone.push(shell_quote(branch.trim()));
        }
        if let Some(depth) = repository.git_limit_depth.filter(|depth| *depth > 0) {
            clone.push("--depth".to_string());
            clone.push(depth.to_string());
        }
        clone.push(shell_quote(&origin));
        clone.push(shell_quote(&path_repo.to_string_lossy()));

        let mut commands: Vec<String> = vec![clone.join(" ")];
        if repository.git_lfs {
            commands.push(format!("{} lfs fetch", git));
            commands.push(format!("{} lfs checkout", git));
        }
        for command in commands {
            self.process(&command).await?;
        }
        Ok(())
    }

    async fn update(&mut self, repository: &RepositoryData) -> Result<()> {
        if has_value(repository.git_override_update.as_deref()) {
            return self.run_list(repository.git_override_update.as_deref()).await;
        }
        let git: &str = self.ctx.config.git_binary.as_str();
        let mut commands: Vec<String> = vec![format!("{} reset --hard", git), format!("{} pull", git)];
        if repository.git_lfs {
            commands.push(format!("{} lfs fetch", git));
            commands.push(format!("{} lfs checkout", git));
        }
        for command in commands {
            self.process(&command).await?;
        }
        Ok(())
    }

    async fn run_list(&mut self, commands: Option<&str>) -> Result<()> {
        for command in split_list(commands) {
            self.process(&command).await?;
        }
        Ok(())
    }

    async fn process(&mut self, command: &str) -> Result<()> {
        let path_repo: PathBuf = self.path_repo()?;
        let output: CommandOutput = ShellCommand::new()
            .working_dir(&path_repo)
            .envs(self.env.clone())
            .output(command)
            .await?;
        let shown: String = self.masked(command);
        debug!("repository command '{}' exited with {}", shown, output.rc);
        if let Some(path) = self.repository.as_ref().and_then(|repository| repository.log_stdout.clone()) {
            append_file_0640(Path::new(&path), &format!("COMMAND: {}\n{}\n", shown, self.masked(&output.stdout)))?;
        }
        if !output.is_success() {
            return Err(Error::repository(format!(
                "repository command failed: '{}'\ngot error: '{}'\ngot output: '{}'",
                shown,
                output.stderr.trim(),
                output.stdout.trim()
            )));
        }
        Ok(())
    }

    /// Writes the repository SSH key (if any) and exposes it through `GIT_SSH_COMMAND`.
    async fn git_env(&mut self, repository: &RepositoryData) -> Result<HashMap<String, String>> {
        let mut env: HashMap<String, String> = HashMap::new();
        let Some(id) = repository.git_credentials.as_deref() else {
            return Ok(env);
        };
        let resolver: CredentialResolver = CredentialResolver::new(self.ctx.credentials(), self.ctx.codec.clone());
        let Some(credential) = resolver.get(id).await? else {
            return Ok(env);
        };
        if let Some(key) = credential.reveal(SecretAttr::SshKey, resolver.codec())? {
            let dir: PathBuf = self.path_run_repo();
            create_dirs(&dir, "repository run")?;
            let path: PathBuf = secret_file(&dir, SecretAttr::SshKey);
            self.secrets.write(path.clone(), &key)?;
            env.insert(
                "GIT_SSH_COMMAND".to_string(),
                format!("ssh -i {}", shell_quote(&path.to_string_lossy())),
            );
        }
        Ok(env)
    }

    async fn origin_with_credentials(&mut self, repository: &RepositoryData, origin: &str) -> Result<String> {
        let Some(id) = repository.git_credentials.as_deref() else {
            return Ok(origin.to_string());
        };
        let resolver: CredentialResolver = CredentialResolver::new(self.ctx.credentials(), self.ctx.codec.clone());
        let Some(credential) = resolver.get(id).await? else {
            return Ok(origin.to_string());
        };
        let password: Option<String> = credential.reveal(SecretAttr::ConnectPass, resolver.codec())?;
        let embedded: String = embed_credentials(origin, credential.connect_user.as_deref(), password.as_deref());
        if embedded != origin {
            self.mask = password.filter(|password| !password.is_empty());
        }
        Ok(embedded)
    }

    fn path_run_repo(&self) -> PathBuf {
        self.path_run.join(".repository")
    }

    fn masked(&self, text: &str) -> String {
        match &self.mask {
            Some(secret) => text.replace(secret.as_str(), "***"),
            None => text.to_string(),
        }
    }

    /// Shreds the SSH key and removes isolated working copies.
    pub fn cleanup(&mut self) {
        if !self.is_git() {
            return;
        }
        self.secrets.cleanup();
        let isolated: bool = self.repository.as_ref().map(|repository| repository.git_isolate).unwrap_or(false);
        if isolated && self.execution.is_some() {
            if let Ok(path) = self.path_repo() {
                if let Err(error) = fs::remove_dir_all(&path) {
                    debug!("unable to remove isolated repository '{}': {}", path.display(), error);
                }
            }
        }
    }

    /// Updates a shared working copy outside of any execution.
    #[instrument(skip(ctx))]
    pub async fn refresh(ctx: &Context, repository_id: &str, user: Option<&str>) -> Result<()> {
        let repository: RepositoryData = ctx
            .repositories()
            .get(repository_id)
            .await?
            .ok_or_else(|| Error::not_found("repository", repository_id))?;
        if repository.kind == RepositoryKind::Static || repository.git_isolate {
            info!("repository '{}' has no shared working copy to refresh", repository.name);
            return Ok(());
        }
        create_dirs(&ctx.config.path_log, "log")?;
        let logs = log_paths(&ctx.config.path_log, "RepoUpdate", user, Utc::now());
        let path_run: PathBuf = new_path_run(&ctx.config);
        let mut sync: RepositorySync = RepositorySync::new(ctx, Some(repository), None, path_run.clone());
        let result: Result<()> = sync.sync(Some(&logs.stdout_repo), Some(&logs.stderr_repo)).await;
        sync.cleanup();
        if let Err(error) = fs::remove_dir_all(&path_run) {
            debug!("unable to remove run directory '{}': {}", path_run.display(), error);
        }
        result
    }
}

fn has_value(value: Option<&str>) -> bool {
    value.map(|value| !value.trim().is_empty()).unwrap_or(false)
}

/// Embeds credentials into a git origin that carries none.
///
/// HTTP(S) origins get `user:password@`, SSH origins (scp-like or `ssh://`) get `user@`.
pub fn embed_credentials(origin: &str, user: Option<&str>, password: Option<&str>) -> String {
    let user: Option<&str> = user.filter(|user| !user.is_empty());
    let password: Option<&str> = password.filter(|password| !password.is_empty());
    if origin.contains('@') {
        return origin.to_string();
    }
    match origin.split_once("://") {
        Some((proto, rest)) if proto != "ssh" => match (user, password) {
            (Some(user), Some(password)) => format!("{}://{}:{}@{}", proto, user, password, rest),
            _ => origin.to_string(),
        },
        Some((proto, rest)) => match user {
            Some(user) => format!("{}://{}@{}", proto, user, rest),
            None => origin.to_string(),
        },
        None => match user {
            Some(user) => format!("{}@{}", user, origin),
            None => origin.to_string(),
        },
    }
}
