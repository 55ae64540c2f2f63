//! 执行邮箱：编排侧与执行侧之间的持久化交接
//!
//! 目录结构：`<root>/executions/pending/<exec_id>.json` 与 `<root>/executions/complete/<exec_id>.json`。
//! 编排侧只 submit 与读取状态，从不自己执行命令；执行侧（run 子命令或人工）mark_running 后 save_result，
//! 记录从 pending 原子地迁到 complete。同进程内的完成事件另外经 broadcast 通知，等待方无需等到下一次轮询。

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::error::AgentError;
use crate::core::phase::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Complete | ExecutionStatus::Failed)
    }
}

/// 一条执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exec_id: String,
    pub session_id: String,
    pub command: String,
    pub tool: String,
    pub phase: Phase,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// 文件邮箱 + 进程内完成通知
#[derive(Debug, Clone)]
pub struct ExecutionBridge {
    pending_dir: PathBuf,
    complete_dir: PathBuf,
    completions: broadcast::Sender<String>,
}

impl ExecutionBridge {
    pub fn new(storage_root: impl AsRef<Path>) -> Result<Self, AgentError> {
        let base = storage_root.as_ref().join("executions");
        let pending_dir = base.join("pending");
        let complete_dir = base.join("complete");
        std::fs::create_dir_all(&pending_dir)?;
        std::fs::create_dir_all(&complete_dir)?;
        let (completions, _) = broadcast::channel(64);
        Ok(Self {
            pending_dir,
            complete_dir,
            completions,
        })
    }

    fn generate_exec_id() -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("exec_{}", &hex[..12])
    }

    fn pending_path(&self, exec_id: &str) -> PathBuf {
        self.pending_dir.join(format!("{exec_id}.json"))
    }

    fn complete_path(&self, exec_id: &str) -> PathBuf {
        self.complete_dir.join(format!("{exec_id}.json"))
    }

    /// 写入新的 pending 记录，立即返回 exec_id
    pub fn submit(&self, session_id: &str, command: &str, tool: &str, phase: Phase) -> Result<String, AgentError> {
        let exec_id = Self::generate_exec_id();
        let record = ExecutionRecord {
            exec_id: exec_id.clone(),
            session_id: session_id.to_string(),
            command: command.to_string(),
            tool: tool.to_string(),
            phase,
            status: ExecutionStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            output: None,
            error: None,
        };
        write_atomic(&self.pending_path(&exec_id), &record)?;
        tracing::info!(exec_id = %exec_id, session_id, tool, command, "execution submitted");
        Ok(exec_id)
    }

    pub fn mark_running(&self, exec_id: &str) -> Result<(), AgentError> {
        let path = self.pending_path(exec_id);
        let mut record = read_record(&path)?
            .ok_or_else(|| AgentError::NotFound(format!("execution {exec_id}")))?;
        record.status = ExecutionStatus::Running;
        record.started_at = Some(Utc::now());
        write_atomic(&path, &record)
    }

    /// 记录结果并把记录从 pending 迁到 complete；exit_code 为 0 记 complete，否则 failed
    pub fn save_result(
        &self,
        exec_id: &str,
        exit_code: i32,
        output: &str,
        error: Option<&str>,
    ) -> Result<ExecutionRecord, AgentError> {
        let pending = self.pending_path(exec_id);
        let mut record = read_record(&pending)?
            .ok_or_else(|| AgentError::NotFound(format!("execution {exec_id}")))?;

        record.status = if exit_code == 0 {
            ExecutionStatus::Complete
        } else {
            ExecutionStatus::Failed
        };
        record.completed_at = Some(Utc::now());
        record.exit_code = Some(exit_code);
        record.output = Some(output.to_string());
        record.error = error.map(String::from);

        write_atomic(&self.complete_path(exec_id), &record)?;
        std::fs::remove_file(&pending)?;
        tracing::info!(exec_id, exit_code, status = ?record.status, "execution completed");

        // 没有订阅者时 send 返回 Err，属正常情况
        let _ = self.completions.send(exec_id.to_string());
        Ok(record)
    }

    /// 先查 pending 再查 complete
    pub fn get_status(&self, exec_id: &str) -> Result<ExecutionRecord, AgentError> {
        if let Some(r) = read_record(&self.pending_path(exec_id))? {
            return Ok(r);
        }
        read_record(&self.complete_path(exec_id))?
            .ok_or_else(|| AgentError::NotFound(format!("execution {exec_id}")))
    }

    /// 待执行记录，可按会话过滤；按提交时间排序
    pub fn pending(&self, session_id: Option<&str>) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = list_records(&self.pending_dir)
            .into_iter()
            .filter(|r| session_id.map_or(true, |s| r.session_id == s))
            .collect();
        records.sort_by_key(|r| r.submitted_at);
        records
    }

    /// 某会话的全部记录（pending + complete），按提交时间排序
    pub fn get_session_executions(&self, session_id: &str) -> Vec<ExecutionRecord> {
        let mut records: Vec<_> = list_records(&self.pending_dir)
            .into_iter()
            .chain(list_records(&self.complete_dir))
            .filter(|r| r.session_id == session_id)
            .collect();
        records.sort_by_key(|r| r.submitted_at);
        records
    }

    /// 删除某会话的全部记录，返回删除数量
    pub fn cleanup_session(&self, session_id: &str) -> Result<usize, AgentError> {
        let mut removed = 0;
        for record in self.get_session_executions(session_id) {
            for path in [self.pending_path(&record.exec_id), self.complete_path(&record.exec_id)] {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        tracing::info!(session_id, removed, "execution records cleaned up");
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.completions.subscribe()
    }

    /// 等待记录进入终态：进程内完成通知与轮询二者先到者为准，超过 timeout 返回 None（邮箱不做任何修改）
    pub async fn wait_for_completion(
        &self,
        exec_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Option<ExecutionRecord> {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.get_status(exec_id) {
                Ok(record) if record.status.is_terminal() => return Some(record),
                Ok(_) => {}
                Err(e) => tracing::debug!(exec_id, error = %e, "status check failed, retrying"),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(exec_id, timeout_secs = timeout.as_secs(), "execution wait timed out");
                return None;
            }
            let nap = poll_interval.min(deadline - now);

            tokio::select! {
                msg = rx.recv() => {
                    if let Err(broadcast::error::RecvError::Lagged(n)) = msg {
                        tracing::debug!(skipped = n, "completion channel lagged");
                    }
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

/// 先写临时文件再 rename，读者不会看到半截 JSON
fn write_atomic(path: &Path, record: &ExecutionRecord) -> Result<(), AgentError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(record)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_record(path: &Path) -> Result<Option<ExecutionRecord>, AgentError> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn list_records(dir: &Path) -> Vec<ExecutionRecord> {
    let pattern = dir.join("*.json");
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    let Ok(paths) = glob::glob(pattern) else {
        return Vec::new();
    };
    paths
        .filter_map(|p| p.ok())
        .filter_map(|p| match read_record(&p) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "skipping unreadable execution record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_submit_then_complete_moves_record() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();

        let id = bridge.submit("s1", "nmap -sn 10.0.0.0/24", "nmap", Phase::Recon).unwrap();
        assert!(id.starts_with("exec_"));
        assert_eq!(id.len(), "exec_".len() + 12);
        assert_eq!(bridge.get_status(&id).unwrap().status, ExecutionStatus::Pending);
        assert_eq!(bridge.pending(Some("s1")).len(), 1);
        assert!(bridge.pending(Some("other")).is_empty());

        bridge.mark_running(&id).unwrap();
        let running = bridge.get_status(&id).unwrap();
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(running.started_at.is_some());

        let done = bridge.save_result(&id, 0, "Host is up", None).unwrap();
        assert_eq!(done.status, ExecutionStatus::Complete);
        assert!(!dir.path().join("executions/pending").join(format!("{id}.json")).exists());
        assert!(dir.path().join("executions/complete").join(format!("{id}.json")).exists());
        assert_eq!(bridge.get_status(&id).unwrap().output.as_deref(), Some("Host is up"));
        assert!(bridge.pending(None).is_empty());
    }

    #[test]
    fn test_nonzero_exit_is_failed() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();
        let id = bridge.submit("s1", "nmap -sn x", "nmap", Phase::Recon).unwrap();
        let rec = bridge.save_result(&id, 1, "", Some("bad target")).unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.error.as_deref(), Some("bad target"));
    }

    #[test]
    fn test_unknown_exec_id() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();
        assert!(matches!(bridge.mark_running("exec_nope"), Err(AgentError::NotFound(_))));
        assert!(matches!(bridge.save_result("exec_nope", 0, "", None), Err(AgentError::NotFound(_))));
        assert!(matches!(bridge.get_status("exec_nope"), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_session_listing_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();
        let a = bridge.submit("s1", "cmd a", "nmap", Phase::Recon).unwrap();
        let b = bridge.submit("s1", "cmd b", "curl", Phase::Recon).unwrap();
        bridge.submit("s2", "cmd c", "nmap", Phase::Recon).unwrap();
        bridge.save_result(&a, 0, "ok", None).unwrap();

        let all = bridge.get_session_executions("s1");
        let ids: Vec<_> = all.iter().map(|r| r.exec_id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a) && ids.contains(&b));
        assert!(all[0].submitted_at <= all[1].submitted_at);

        assert_eq!(bridge.cleanup_session("s1").unwrap(), 2);
        assert!(bridge.get_session_executions("s1").is_empty());
        assert_eq!(bridge.get_session_executions("s2").len(), 1);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_completion() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();
        let id = bridge.submit("s1", "nmap -sn x", "nmap", Phase::Recon).unwrap();

        let executor = bridge.clone();
        let exec_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            executor.save_result(&exec_id, 0, "done", None).unwrap();
        });

        // 轮询间隔远大于完成时间，靠通知唤醒
        let rec = bridge
            .wait_for_completion(&id, Duration::from_secs(30), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(rec.output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_pending() {
        let dir = TempDir::new().unwrap();
        let bridge = ExecutionBridge::new(dir.path()).unwrap();
        let id = bridge.submit("s1", "nmap -sn x", "nmap", Phase::Recon).unwrap();

        let rec = bridge
            .wait_for_completion(&id, Duration::from_millis(10), Duration::from_millis(50))
            .await;
        assert!(rec.is_none());
        assert_eq!(bridge.get_status(&id).unwrap().status, ExecutionStatus::Pending);
    }
}
