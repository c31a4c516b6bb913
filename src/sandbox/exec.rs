//! Execution dispatcher: runs shell commands inside a workspace.
//!
//! Commands run in order, each as an independent `sh -c` invocation rooted
//! at the workspace root. A failing command does not abort the rest of the
//! batch; every command produces an [`ExecutionRecord`] so callers can
//! inspect partial failure. Each command is bounded by a wall-clock timeout,
//! and a timed-out process is killed inside the container — a leaked
//! process in a persistent container taxes every future workspace on it.

use std::time::{Duration, Instant};

use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::sandbox::error::{engine_error, SandboxError};
use crate::sandbox::workspace::Workspace;

/// Dependency manifest that triggers the install pre-step when present at
/// the workspace root.
const REQUIREMENTS_MANIFEST: &str = "requirements.txt";

const INSTALL_COMMAND: &str = "pip install -r requirements.txt";

/// Bound on internal housekeeping commands (mkdir, rm, probes).
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome classification for a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    Failed,
    Timeout,
}

/// The result of one command execution. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub command: String,
    /// Absent when the command timed out instead of exiting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub status: CommandStatus,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionRecord {
    #[allow(clippy::cast_possible_truncation)] // millis never approach u64::MAX
    fn completed(
        command: &str,
        exit_code: Option<i64>,
        stdout: String,
        stderr: String,
        elapsed: Duration,
    ) -> Self {
        let status = match exit_code {
            Some(0) => CommandStatus::Succeeded,
            _ => CommandStatus::Failed,
        };
        Self {
            command: command.to_string(),
            exit_code,
            stdout,
            stderr,
            status,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn timed_out(command: &str, elapsed: Duration) -> Self {
        Self {
            command: command.to_string(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            status: CommandStatus::Timeout,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

struct RawOutput {
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
}

/// Runs `commands` in order inside the workspace, returning one record per
/// command (plus one for the dependency install pre-step when a manifest
/// is present). Per-command failures and timeouts are embedded in the
/// records; only engine-level failures abort the call.
pub(crate) async fn run_commands(
    docker: &Docker,
    workspace: &Workspace,
    commands: &[String],
    timeout: Duration,
) -> Result<Vec<ExecutionRecord>, SandboxError> {
    let mut records = Vec::with_capacity(commands.len() + 1);

    if manifest_present(docker, workspace, timeout).await? {
        debug!(
            workspace = %workspace.id,
            "found {REQUIREMENTS_MANIFEST}, installing dependencies"
        );
        records.push(execute(docker, workspace, INSTALL_COMMAND, timeout).await?);
    }

    for command in commands {
        records.push(execute(docker, workspace, command, timeout).await?);
    }

    Ok(records)
}

/// Runs one command and folds its outcome into an `ExecutionRecord`.
async fn execute(
    docker: &Docker,
    workspace: &Workspace,
    command: &str,
    timeout: Duration,
) -> Result<ExecutionRecord, SandboxError> {
    let started = Instant::now();
    debug!(container = %workspace.container_id, workspace = %workspace.id, %command, "exec");

    let outcome = run_single(
        docker,
        &workspace.container_id,
        Some(&workspace.root_path),
        command,
        timeout,
    )
    .await;

    match outcome {
        Ok(raw) => Ok(ExecutionRecord::completed(
            command,
            raw.exit_code,
            raw.stdout,
            raw.stderr,
            started.elapsed(),
        )),
        Err(SandboxError::ExecutionTimeout { timeout_secs }) => {
            warn!(%command, timeout_secs, "command timed out, process killed");
            Ok(ExecutionRecord::timed_out(command, started.elapsed()))
        }
        Err(other) => Err(other),
    }
}

/// Runs a short housekeeping command (mkdir, rm) in the container and
/// returns its exit code. Takes an argv rather than a shell string so
/// caller-supplied paths are never shell-interpreted. Not recorded in
/// execution results.
pub(crate) async fn run_argv(
    docker: &Docker,
    container_id: &str,
    argv: &[&str],
) -> Result<Option<i64>, SandboxError> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(argv.iter().map(ToString::to_string).collect()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| engine_error(&e, container_id))?;

    if let StartExecResults::Attached {
        output: mut stream, ..
    } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| engine_error(&e, container_id))?
    {
        let drain = async {
            while stream.next().await.is_some() {}
        };
        if tokio::time::timeout(HOUSEKEEPING_TIMEOUT, drain).await.is_err() {
            kill_exec(docker, container_id, &exec.id).await;
            return Err(SandboxError::timeout(HOUSEKEEPING_TIMEOUT));
        }
    }

    let inspect = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| engine_error(&e, container_id))?;
    Ok(inspect.exit_code)
}

async fn run_single(
    docker: &Docker,
    container_id: &str,
    working_dir: Option<&str>,
    command: &str,
    timeout: Duration,
) -> Result<RawOutput, SandboxError> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    command.to_string(),
                ]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                working_dir: working_dir.map(String::from),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| engine_error(&e, container_id))?;

    let results = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| engine_error(&e, container_id))?;

    let StartExecResults::Attached {
        output: mut stream, ..
    } = results
    else {
        return Err(SandboxError::container("exec did not attach"));
    };

    let drained = tokio::time::timeout(timeout, async {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bollard::container::LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(bollard::container::LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("error reading exec output: {e}");
                }
            }
        }
        (stdout, stderr)
    })
    .await;

    match drained {
        Ok((stdout, stderr)) => {
            let inspect = docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| engine_error(&e, container_id))?;
            Ok(RawOutput {
                exit_code: inspect.exit_code,
                stdout,
                stderr,
            })
        }
        Err(_elapsed) => {
            kill_exec(docker, container_id, &exec.id).await;
            Err(SandboxError::timeout(timeout))
        }
    }
}

/// Best-effort kill of a timed-out exec process inside the container. The
/// engine offers no direct way to cancel an exec, so we kill its pid.
async fn kill_exec(docker: &Docker, container_id: &str, exec_id: &str) {
    let pid = match docker.inspect_exec(exec_id).await {
        Ok(inspect) => inspect.pid,
        Err(e) => {
            warn!("could not inspect timed-out exec: {e}");
            return;
        }
    };

    let Some(pid) = pid.filter(|pid| *pid > 0) else {
        return;
    };

    let kill = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("kill -9 {pid} 2>/dev/null"),
                ]),
                ..Default::default()
            },
        )
        .await;

    match kill {
        Ok(exec) => {
            if let Err(e) = docker.start_exec(&exec.id, None).await {
                warn!(pid, "failed to kill timed-out process: {e}");
            } else {
                debug!(pid, "killed timed-out process");
            }
        }
        Err(e) => warn!(pid, "failed to kill timed-out process: {e}"),
    }
}

/// Checks whether the dependency manifest exists at the workspace root.
/// A probe failure is treated as "absent" rather than failing the batch.
async fn manifest_present(
    docker: &Docker,
    workspace: &Workspace,
    timeout: Duration,
) -> Result<bool, SandboxError> {
    let probe = format!("test -f {REQUIREMENTS_MANIFEST}");
    let outcome = run_single(
        docker,
        &workspace.container_id,
        Some(&workspace.root_path),
        &probe,
        timeout,
    )
    .await;
    match outcome {
        Ok(raw) => Ok(raw.exit_code == Some(0)),
        Err(SandboxError::ExecutionTimeout { .. }) => {
            warn!(workspace = %workspace.id, "manifest probe timed out, skipping install");
            Ok(false)
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_record_success() {
        let record = ExecutionRecord::completed(
            "echo hi",
            Some(0),
            "hi\n".to_string(),
            String::new(),
            Duration::from_millis(12),
        );
        assert_eq!(record.status, CommandStatus::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.stdout, "hi\n");
        assert_eq!(record.duration_ms, 12);
    }

    #[test]
    fn test_completed_record_failure() {
        let record = ExecutionRecord::completed(
            "false",
            Some(1),
            String::new(),
            String::new(),
            Duration::from_millis(5),
        );
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.exit_code, Some(1));
    }

    #[test]
    fn test_missing_exit_code_is_failure() {
        let record = ExecutionRecord::completed(
            "true",
            None,
            String::new(),
            String::new(),
            Duration::ZERO,
        );
        assert_eq!(record.status, CommandStatus::Failed);
    }

    #[test]
    fn test_timed_out_record() {
        let record = ExecutionRecord::timed_out("sleep 999", Duration::from_secs(300));
        assert_eq!(record.status, CommandStatus::Timeout);
        assert!(record.exit_code.is_none());
        assert!(record.stdout.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&CommandStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&CommandStatus::Failed).unwrap(),
            "\"failed\""
        );
        assert_eq!(
            serde_json::to_string(&CommandStatus::Timeout).unwrap(),
            "\"timeout\""
        );
    }

    #[test]
    fn test_record_omits_exit_code_on_timeout() {
        let record = ExecutionRecord::timed_out("sleep 999", Duration::from_secs(1));
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("exit_code"));
        assert!(json.contains("\"status\":\"timeout\""));
    }

    #[tokio::test]
    async fn test_run_commands_unknown_container() {
        // Gracefully skips when no Docker daemon is reachable.
        let Ok(docker) = Docker::connect_with_local_defaults() else {
            return;
        };
        if docker.ping().await.is_err() {
            return;
        }

        let workspace = Workspace::new("ws-test", "/app", "no-such-container-codebox");
        let err = run_commands(
            &docker,
            &workspace,
            &["echo hi".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(err.is_not_found());
    }
}
