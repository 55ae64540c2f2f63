//! 会话持久化
//!
//! 每个会话一份完整 JSON 文档：`<root>/agents/<session_id>/state.json`，每次 save 整体覆盖。
//! 文件不存在时 load 返回 NotFound；内容损坏时直接返回 Json 错误，由 RecoveryManager 负责兜底。

use std::path::{Path, PathBuf};

use crate::core::error::AgentError;
use crate::core::state::AgentState;

const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone)]
pub struct PersistenceManager {
    root: PathBuf,
}

impl PersistenceManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    /// 会话目录（备份等附属文件也放在这里）
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.agents_dir().join(session_id)
    }

    pub fn state_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(STATE_FILE)
    }

    /// 整体写入；父目录不存在时自动创建
    pub fn save(&self, state: &AgentState) -> Result<(), AgentError> {
        let path = self.state_path(&state.session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
        tracing::debug!(session_id = %state.session_id, path = %path.display(), "state saved");
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<AgentState, AgentError> {
        let path = self.state_path(session_id);
        if !path.exists() {
            return Err(AgentError::NotFound(format!("session {session_id}")));
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 所有已知会话 ID（按名称排序）
    pub fn list_sessions(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.agents_dir()) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        ids.sort();
        ids
    }

    pub fn session_exists(&self, session_id: &str) -> bool {
        self.state_path(session_id).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phase::Phase;
    use crate::knowledge::{FactBatch, FactMerger, TargetUpdate};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());

        let mut state = AgentState::new("s1", "map the lab");
        state.transition_phase(Phase::Enumeration, "hosts found");
        let batch = FactBatch {
            hosts: vec!["10.0.0.1".into()],
            targets: vec![TargetUpdate::new("10.0.0.1").with_port(22, Some("ssh"))],
            ..FactBatch::default()
        };
        FactMerger::merge_into(&mut state.facts, &batch);
        state.add_failure("rm -rf /", "unsafe");

        pm.save(&state).unwrap();
        assert!(pm.session_exists("s1"));
        let loaded = pm.load("s1").unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.phase(), Phase::Enumeration);
    }

    #[test]
    fn test_missing_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());
        assert!(!pm.session_exists("nope"));
        assert!(matches!(pm.load("nope"), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_malformed_state_is_not_swallowed() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());
        let path = pm.state_path("bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(pm.load("bad"), Err(AgentError::Json(_))));
    }

    #[test]
    fn test_list_sessions() {
        let dir = TempDir::new().unwrap();
        let pm = PersistenceManager::new(dir.path());
        assert!(pm.list_sessions().is_empty());
        pm.save(&AgentState::new("b", "g")).unwrap();
        pm.save(&AgentState::new("a", "g")).unwrap();
        assert_eq!(pm.list_sessions(), vec!["a".to_string(), "b".to_string()]);
    }
}
