//! 执行侧：取出邮箱中的命令真正运行，并把结果写回
//!
//! 通过 sh -c / cmd /C 执行，带超时；超时视为 exit -1 并附错误说明。字面命令直接运行，不做邮箱登记。

use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::core::error::AgentError;
use crate::execution::bridge::ExecutionBridge;

/// 一次命令执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// run 的返回：执行了什么、结果如何、是否写回了邮箱
#[derive(Debug, Clone)]
pub struct RunReport {
    pub exec_id: Option<String>,
    pub command: String,
    pub outcome: CommandOutcome,
}

pub struct CommandRunner {
    bridge: ExecutionBridge,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(bridge: ExecutionBridge, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }

    /// `exec_` 开头视为邮箱 ID，否则作为字面命令
    pub async fn run(&self, command_or_exec_id: &str) -> Result<RunReport, AgentError> {
        let target = command_or_exec_id.trim();
        if target.starts_with("exec_") {
            let record = self.bridge.get_status(target)?;
            self.bridge.mark_running(target)?;
            let outcome = run_shell(&record.command, self.timeout).await;
            let error = (!outcome.stderr.is_empty()).then_some(outcome.stderr.as_str());
            self.bridge
                .save_result(target, outcome.exit_code, &outcome.stdout, error)?;
            Ok(RunReport {
                exec_id: Some(target.to_string()),
                command: record.command,
                outcome,
            })
        } else {
            let outcome = run_shell(target, self.timeout).await;
            Ok(RunReport {
                exec_id: None,
                command: target.to_string(),
                outcome,
            })
        }
    }
}

/// 运行 shell 命令；启动失败或超时得到 exit -1
pub async fn run_shell(command: &str, timeout: Duration) -> CommandOutcome {
    let start = Instant::now();
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.kill_on_drop(true);

    let outcome = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) => CommandOutcome {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        },
        Ok(Err(e)) => CommandOutcome {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Execution failed: {e}"),
        },
        Err(_) => CommandOutcome {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("Command timed out after {}s", timeout.as_secs()),
        },
    };

    let audit = serde_json::json!({
        "event": "command_audit",
        "command": command,
        "exit_code": outcome.exit_code,
        "duration_ms": start.elapsed().as_millis() as u64,
        "stdout_bytes": outcome.stdout.len(),
    });
    tracing::info!(audit = %audit, "runner");
    outcome
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::phase::Phase;
    use crate::execution::bridge::ExecutionStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_literal_command() {
        let out = run_shell("echo hello", Duration::from_secs(5)).await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_timeout_yields_minus_one() {
        let out = run_shell("sleep 5", Duration::from_millis(100)).await;
        assert_eq!(out.exit_code, -1);
        assert!(out.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_exec_id_posts_result() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();
        let id = bridge.submit("s1", "echo 'Nmap scan report for 10.0.0.1'; exit 3", "nmap", Phase::Recon).unwrap();

        let runner = CommandRunner::new(bridge.clone(), Duration::from_secs(5));
        let report = runner.run(&id).await.unwrap();
        assert_eq!(report.exec_id.as_deref(), Some(id.as_str()));
        assert_eq!(report.outcome.exit_code, 3);

        let rec = bridge.get_status(&id).unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert!(rec.output.unwrap().contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_unknown_exec_id() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new(ExecutionBridge::new(dir.path()).unwrap(), Duration::from_secs(1));
        assert!(matches!(runner.run("exec_000000000000").await, Err(AgentError::NotFound(_))));
    }
}
