use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub rc: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.rc == 0
    }
}

/// Runs command lines through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct ShellCommand {
    working_dir: Option<PathBuf>,
    env_vars: HashMap<String, String>,
}

impl ShellCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars.extend(vars);
        self
    }

    /// Builds the process without spawning it. The shell leads its own
    /// process group so [`kill_group`] reaches everything it starts.
    pub fn build(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env_vars);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Runs `command` to completion and captures its output.
    pub async fn output(&self, command: &str) -> Result<CommandOutput> {
        debug!("executing command: {}", command);
        let output = self
            .build(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|error| Error::os(format!("unable to execute '{}': {}", command, error)))?;
        let result = CommandOutput {
            rc: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.is_success() {
            warn!("command failed with exit code {}: {}", result.rc, command);
        }
        Ok(result)
    }
}

/// Sends `SIGKILL` to the process group led by `pid`.
pub fn kill_group(pid: u32) {
    // Safety: plain syscall, `pid` is the group leader spawned by `ShellCommand::build`.
    let rc: i32 = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!("unable to kill process group {}: {}", pid, std::io::Error::last_os_error());
    }
}

/// Single-quotes `value` for `sh` unless it only holds safe characters.
pub fn shell_quote(value: &str) -> String {
    let safe: bool = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | ',' | '=' | '@' | '+'));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Keeps ASCII alphanumerics, `-` and `_`.
pub fn safe_name(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}
