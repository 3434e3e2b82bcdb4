//! Capability interface over the container engine.
//!
//! The lifecycle manager only ever talks to [`ContainerDriver`]; the Docker
//! implementation lives in [`crate::docker`]. Keeping the seam here lets the
//! integration tests drive the whole state machine with an in-process fake.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Marker the exec wrapper prints as its final stdout line so the shell's
/// closing working directory survives the round trip.
pub const CWD_MARKER: &str = "__WARDEN_CWD__";

/// Longest accepted exec command, in bytes.
pub const MAX_COMMAND_BYTES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Engine name for the container (unique per sandbox).
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    /// 0 leaves the engine default in place; only storage drivers with
    /// project quotas can enforce a per-container size.
    pub disk_bytes: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_millis: 2_000,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            disk_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Dead,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

/// One row of `list_labelled`; enough for reconciliation to match records
/// against live containers.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub container_id: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    /// Shell's working directory when the command finished; `None` when the
    /// marker never made it out (killed shell, deadline hit mid-write).
    pub new_cwd: Option<String>,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(#[source] anyhow::Error),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("engine operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("container engine error: {0}")]
    Engine(#[source] anyhow::Error),
    #[error("{0}")]
    InvalidInput(String),
}

/// Thin semantic wrapper over a container engine.
///
/// Failure semantics the lifecycle manager relies on:
/// - `create` leaves no partially-created container behind on failure;
/// - `exec` re-inspects and refuses unless the engine state is running;
/// - `stop` and `remove` treat an already-gone container as success.
#[async_trait]
pub trait ContainerDriver: Send + Sync + 'static {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError>;

    /// Returns once the engine accepted the start, not once the sandbox is
    /// ready; readiness is the lifecycle manager's poll.
    async fn start(&self, container_id: &str) -> Result<(), DriverError>;

    async fn inspect(&self, container_id: &str) -> Result<ContainerStatus, DriverError>;

    /// Runs `command` under `sh -c` as the sandbox's non-privileged user with
    /// `cwd` as the working directory. `deadline` is a hard wall-clock
    /// cut-off; on expiry the call returns [`DriverError::Timeout`] and the
    /// container is left running.
    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        cwd: &str,
        deadline: Duration,
    ) -> Result<ExecOutput, DriverError>;

    /// Orderly termination signal, wait up to `timeout`, then force-kill.
    async fn stop(&self, container_id: &str, timeout: Duration) -> Result<(), DriverError>;

    /// Force-remove; idempotent.
    async fn remove(&self, container_id: &str) -> Result<(), DriverError>;

    /// Live containers carrying this deployment's management label.
    async fn list_labelled(&self) -> Result<Vec<ContainerSummary>, DriverError>;
}

/// Wraps a user command so the shell reports its final working directory.
///
/// The command body runs inside `{ ... }` after a `cd`, then a marker line
/// carrying `$PWD` is printed and the body's exit status is restored. The
/// marker is the last thing written to stdout, so [`split_cwd_marker`] can
/// peel it back off.
pub fn wrap_command(command: &str, cwd: &str) -> String {
    format!(
        "cd {dir} && {{ {command}\n}}\n__rc=$?\nprintf '\\n{CWD_MARKER}%s\\n' \"$PWD\"\nexit $__rc",
        dir = shell_quote(cwd),
    )
}

/// Splits captured stdout into the user command's own output and the
/// marker-reported working directory.
pub fn split_cwd_marker(stdout: &str) -> (String, Option<String>) {
    let needle = format!("\n{CWD_MARKER}");
    if let Some(idx) = stdout.rfind(&needle) {
        let tail = &stdout[idx + needle.len()..];
        let cwd = tail.trim_end_matches('\n');
        if !cwd.is_empty() && !cwd.contains('\n') {
            return (stdout[..idx].to_string(), Some(cwd.to_string()));
        }
    }
    (stdout.to_string(), None)
}

/// POSIX single-quoting; embedded quotes become `'\''`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_embeds_command_and_quoted_cwd() {
        let script = wrap_command("echo hi", "/home/agent");
        assert!(script.starts_with("cd '/home/agent' && { echo hi"));
        assert!(script.contains(CWD_MARKER));
        assert!(script.ends_with("exit $__rc"));
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/tmp/o'brien"), "'/tmp/o'\\''brien'");
    }

    #[test]
    fn marker_is_stripped_from_trailing_newline_output() {
        let raw = format!("hi\n\n{CWD_MARKER}/home/agent\n");
        let (stdout, cwd) = split_cwd_marker(&raw);
        assert_eq!(stdout, "hi\n");
        assert_eq!(cwd.as_deref(), Some("/home/agent"));
    }

    #[test]
    fn marker_is_stripped_when_command_prints_nothing() {
        let raw = format!("\n{CWD_MARKER}/tmp/x\n");
        let (stdout, cwd) = split_cwd_marker(&raw);
        assert_eq!(stdout, "");
        assert_eq!(cwd.as_deref(), Some("/tmp/x"));
    }

    #[test]
    fn marker_is_stripped_without_trailing_newline_output() {
        let raw = format!("partial\n{CWD_MARKER}/tmp/x\n");
        let (stdout, cwd) = split_cwd_marker(&raw);
        assert_eq!(stdout, "partial");
        assert_eq!(cwd.as_deref(), Some("/tmp/x"));
    }

    #[test]
    fn missing_marker_leaves_output_untouched() {
        let (stdout, cwd) = split_cwd_marker("killed mid-flight");
        assert_eq!(stdout, "killed mid-flight");
        assert!(cwd.is_none());
    }
}
