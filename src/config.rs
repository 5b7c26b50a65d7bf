use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use crate::database::DbConnection;
use crate::error::{Error, Result};

/// Timezone in which cron expressions are evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timezone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl FromStr for Timezone {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "" | "UTC" | "utc" | "Z" => Ok(Self::Utc),
            "local" | "Local" => Ok(Self::Local),
            other => FixedOffset::from_str(other)
                .map(Self::Fixed)
                .map_err(|error| Error::config(format!("invalid timezone '{}': {}", other, error))),
        }
    }
}

/// Engine configuration, built once at startup and shared through [`crate::context::Context`].
///
/// Values come from an optional TOML file and are then overridden by
/// `PLAYCRON_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for per-run temporary directories and git working copies.
    pub path_run: PathBuf,
    /// Project directory for jobs without a repository.
    pub path_play: PathBuf,
    /// Directory receiving the execution log files.
    pub path_log: PathBuf,
    /// Upper bound of one ansible-playbook run, in seconds.
    pub run_timeout: u64,
    pub timezone: String,
    pub path_ssh_known_hosts: Option<PathBuf>,
    /// Comma-separated `key=value` pairs added to every execution.
    pub global_environment_vars: Option<String>,
    /// ARA API server receiving run statistics.
    pub ara_server: Option<String>,
    /// Directory of ARA's ansible callback plugins, required by `ara_server`.
    pub ara_callback_plugins: Option<PathBuf>,
    pub ansible_playbook: String,
    pub git_binary: String,
    pub interval_check: u64,
    pub interval_reload: u64,
    pub thread_join_timeout: u64,
    pub fail_sleep: u64,
    pub max_config_invalid: u32,
    pub shutdown_wait: u64,
    pub cancel_poll_interval_ms: u64,
    pub log_level: String,
    pub database: DbConnection,
}

impl Default for Config {
    fn default() -> Self {
        let home: PathBuf = env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"));
        Self {
            path_run: PathBuf::from("/tmp/playcron"),
            path_play: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            path_log: home.join(".local/share/playcron"),
            run_timeout: 3600,
            timezone: "UTC".to_string(),
            path_ssh_known_hosts: None,
            global_environment_vars: None,
            ara_server: None,
            ara_callback_plugins: None,
            ansible_playbook: "ansible-playbook".to_string(),
            git_binary: "git".to_string(),
            interval_check: 5,
            interval_reload: 10,
            thread_join_timeout: 3,
            fail_sleep: 5,
            max_config_invalid: 3,
            shutdown_wait: 1,
            cancel_poll_interval_ms: 1000,
            log_level: "info".to_string(),
            database: DbConnection::default(),
        }
    }
}

const ENV_PREFIX: &str = "PLAYCRON_";

impl Config {
    /// Loads the configuration file (if any) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|error| Error::config(format!("unable to read config file '{}': {}", path.display(), error)))?;
                toml::from_str(&content)
                    .map_err(|error| Error::config(format!("invalid config file '{}': {}", path.display(), error)))?
            }
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(value) = env_var("PATH_RUN") {
            self.path_run = PathBuf::from(value);
        }
        if let Some(value) = env_var("PATH_PLAY").or_else(|| env::var("ANSIBLE_PLAYBOOK_DIR").ok()) {
            self.path_play = PathBuf::from(value);
        }
        if let Some(value) = env_var("PATH_LOG") {
            self.path_log = PathBuf::from(value);
        }
        if let Some(value) = env_var("RUN_TIMEOUT") {
            self.run_timeout = value
                .parse::<u64>()
                .map_err(|_| Error::config(format!("{}RUN_TIMEOUT must be a number of seconds, got '{}'", ENV_PREFIX, value)))?;
        }
        if let Some(value) = env_var("TIMEZONE") {
            self.timezone = value;
        }
        if let Some(value) = env_var("SSH_KNOWN_HOSTS") {
            self.path_ssh_known_hosts = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var("ENVIRONMENT_VARS") {
            self.global_environment_vars = Some(value);
        }
        if let Some(value) = env_var("ARA_SERVER") {
            self.ara_server = Some(value);
        }
        if let Some(value) = env_var("ARA_CALLBACK_PLUGINS") {
            self.ara_callback_plugins = Some(PathBuf::from(value));
        }
        if let Some(value) = env_var("ANSIBLE_PLAYBOOK") {
            self.ansible_playbook = value;
        }
        if let Some(value) = env_var("GIT") {
            self.git_binary = value;
        }
        if let Some(value) = env_var("LOG_LEVEL") {
            self.log_level = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.run_timeout == 0 {
            return Err(Error::config("run_timeout must be greater than 0"));
        }
        if self.max_config_invalid == 0 {
            return Err(Error::config("max_config_invalid must be greater than 0"));
        }
        if self.ansible_playbook.trim().is_empty() {
            return Err(Error::config("ansible_playbook must not be empty"));
        }
        Ok(())
    }

    /// Parsed timezone; fails when the configured value changed to something invalid.
    pub fn tz(&self) -> Result<Timezone> {
        Timezone::from_str(&self.timezone)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout)
    }

    pub fn interval_check(&self) -> Duration {
        Duration::from_secs(self.interval_check)
    }

    pub fn interval_reload(&self) -> Duration {
        Duration::from_secs(self.interval_reload)
    }

    pub fn thread_join_timeout(&self) -> Duration {
        Duration::from_secs(self.thread_join_timeout)
    }

    pub fn fail_sleep(&self) -> Duration {
        Duration::from_secs(self.fail_sleep)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn path_repositories(&self) -> PathBuf {
        self.path_run.join("repositories")
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, name)).ok().filter(|value| !value.is_empty())
}
