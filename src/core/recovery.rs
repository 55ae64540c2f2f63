//! 状态恢复：备份、校验与三级恢复链
//!
//! 备份位于 `<root>/agents/<session_id>/backups/{session_id}_{label}_{timestamp}.json`，
//! 每个会话只保留最近 max_backups 份（按修改时间，时间相同时按文件名）。
//! recover_or_create 的顺序：主存储 → 最近备份 → 新建会话。

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::Utc;

use crate::core::error::AgentError;
use crate::core::state::AgentState;
use crate::storage::PersistenceManager;

/// recover_or_create 的状态来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    Primary,
    Backup(String),
    Fresh,
}

#[derive(Debug, Clone)]
pub struct RecoveryManager {
    persistence: PersistenceManager,
    max_backups: usize,
}

impl RecoveryManager {
    pub fn new(persistence: PersistenceManager, max_backups: usize) -> Self {
        Self {
            persistence,
            max_backups: max_backups.max(1),
        }
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.persistence
    }

    fn backup_dir(&self, session_id: &str) -> PathBuf {
        self.persistence.session_dir(session_id).join("backups")
    }

    /// 写入带标签的时间戳快照，然后裁剪旧备份；返回备份文件名
    pub fn create_backup(&self, state: &AgentState, label: &str) -> Result<String, AgentError> {
        let dir = self.backup_dir(&state.session_id);
        std::fs::create_dir_all(&dir)?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.6f");
        let name = format!("{}_{}_{}.json", state.session_id, label, timestamp);
        std::fs::write(dir.join(&name), serde_json::to_string_pretty(state)?)
            .map_err(|e| AgentError::Persistence(format!("backup {name}: {e}")))?;

        let removed = self.prune_backups(&state.session_id);
        tracing::debug!(session_id = %state.session_id, backup = %name, removed, "backup created");
        Ok(name)
    }

    /// 会话的全部备份，最新在前
    pub fn list_backups(&self, session_id: &str) -> Vec<PathBuf> {
        let dir = self.backup_dir(session_id);
        let pattern = format!(
            "{}/{}_*.json",
            glob::Pattern::escape(&dir.to_string_lossy()),
            glob::Pattern::escape(session_id)
        );
        let Ok(paths) = glob::glob(&pattern) else {
            return Vec::new();
        };

        // 文件系统时间戳精度有限，同一 mtime 下按文件名中的时间戳排序
        let mut entries: Vec<(SystemTime, String, PathBuf)> = paths
            .filter_map(|p| p.ok())
            .map(|p| {
                let mtime = std::fs::metadata(&p)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let stamp = p
                    .file_stem()
                    .map(|n| n.to_string_lossy().into_owned())
                    .and_then(|n| n.rsplit_once('_').map(|(_, ts)| ts.to_string()))
                    .unwrap_or_default();
                (mtime, stamp, p)
            })
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)).then_with(|| b.2.cmp(&a.2)));
        entries.into_iter().map(|(_, _, p)| p).collect()
    }

    fn prune_backups(&self, session_id: &str) -> usize {
        let mut removed = 0;
        for old in self.list_backups(session_id).into_iter().skip(self.max_backups) {
            match std::fs::remove_file(&old) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %old.display(), error = %e, "failed to prune backup"),
            }
        }
        if removed > 0 {
            tracing::info!(session_id, removed, keep = self.max_backups, "old backups pruned");
        }
        removed
    }

    /// 恢复指定备份，未指定时取最新一份
    pub fn restore_from_backup(&self, session_id: &str, backup_name: Option<&str>) -> Result<AgentState, AgentError> {
        let path = match backup_name {
            Some(name) => {
                let p = self.backup_dir(session_id).join(name);
                if !p.is_file() {
                    return Err(AgentError::NotFound(format!("backup {name}")));
                }
                p
            }
            None => self
                .list_backups(session_id)
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::NotFound(format!("backups for session {session_id}")))?,
        };

        let data = std::fs::read_to_string(&path)?;
        let state: AgentState = serde_json::from_str(&data)
            .map_err(|e| AgentError::StateCorruption(format!("{}: {e}", path.display())))?;
        tracing::info!(session_id, backup = %path.display(), "restored from backup");
        Ok(state)
    }

    /// 结构校验：身份字段非空、阶段历史首尾相接、步数不少于命令数。只返回结果，不报错
    pub fn validate_state(&self, state: &AgentState) -> bool {
        match integrity_problem(state) {
            None => true,
            Some(problem) => {
                tracing::warn!(session_id = %state.session_id, problem = %problem, "state validation failed");
                false
            }
        }
    }

    /// 先备份（失败只记日志）再整体保存
    pub fn auto_save(&self, state: &AgentState) -> Result<(), AgentError> {
        if let Err(e) = self.create_backup(state, "auto") {
            tracing::warn!(session_id = %state.session_id, error = %e, "backup failed, saving anyway");
        }
        self.persistence.save(state)
    }

    /// 主存储 → 最近备份 → 新建会话
    pub fn recover_or_create(&self, session_id: &str, goal: Option<&str>) -> (AgentState, RecoverySource) {
        match self.persistence.load(session_id) {
            Ok(state) if self.validate_state(&state) => {
                tracing::info!(session_id, "recovered session from primary store");
                return (state, RecoverySource::Primary);
            }
            Ok(_) => tracing::warn!(session_id, "state corrupted, attempting backup restore"),
            Err(AgentError::NotFound(_)) => tracing::info!(session_id, "no existing session found"),
            Err(e) => tracing::warn!(session_id, error = %e, "state load failed, attempting backup restore"),
        }

        match self.restore_from_backup(session_id, None) {
            Ok(state) if self.validate_state(&state) => {
                let name = self
                    .list_backups(session_id)
                    .first()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return (state, RecoverySource::Backup(name));
            }
            Ok(_) => tracing::warn!(session_id, "latest backup failed validation"),
            Err(e) => tracing::debug!(session_id, error = %e, "backup restore unavailable"),
        }

        tracing::info!(session_id, "creating new session");
        (
            AgentState::new(session_id, goal.unwrap_or("New session")),
            RecoverySource::Fresh,
        )
    }
}

fn integrity_problem(state: &AgentState) -> Option<String> {
    if state.session_id.trim().is_empty() {
        return Some("missing session_id".into());
    }
    if state.goal.trim().is_empty() {
        return Some("missing goal".into());
    }
    let history = state.phase_history();
    for pair in history.windows(2) {
        if pair[0].to_phase != pair[1].from_phase {
            return Some(format!(
                "phase history broken: {} -> {} followed by {} -> {}",
                pair[0].from_phase, pair[0].to_phase, pair[1].from_phase, pair[1].to_phase
            ));
        }
    }
    if let Some(last) = history.last() {
        if last.to_phase != state.phase() {
            return Some(format!("current phase {} does not match history ({})", state.phase(), last.to_phase));
        }
    }
    if (state.total_steps as usize) < state.commands().len() {
        return Some(format!(
            "total_steps {} below command count {}",
            state.total_steps,
            state.commands().len()
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phase::Phase;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> RecoveryManager {
        RecoveryManager::new(PersistenceManager::new(dir.path()), 10)
    }

    #[test]
    fn test_backups_pruned_to_limit() {
        let dir = TempDir::new().unwrap();
        let rm = manager(&dir);
        let mut state = AgentState::new("s1", "g");
        let mut names = Vec::new();
        for i in 0..12 {
            state.current_objective = Some(format!("step {i}"));
            names.push(rm.create_backup(&state, "auto").unwrap());
        }
        let backups = rm.list_backups("s1");
        assert_eq!(backups.len(), 10);

        // 最早的两份被删除
        let kept: Vec<String> = backups
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(!kept.contains(&names[0]));
        assert!(!kept.contains(&names[1]));
        assert_eq!(kept[0], names[11]);
    }

    #[test]
    fn test_restore_latest_and_named() {
        let dir = TempDir::new().unwrap();
        let rm = manager(&dir);
        let mut state = AgentState::new("s1", "g");
        let first = rm.create_backup(&state, "manual").unwrap();
        state.transition_phase(Phase::Enumeration, "hosts up");
        rm.create_backup(&state, "auto").unwrap();

        assert_eq!(rm.restore_from_backup("s1", None).unwrap().phase(), Phase::Enumeration);
        assert_eq!(rm.restore_from_backup("s1", Some(&first)).unwrap().phase(), Phase::Recon);
        assert!(matches!(rm.restore_from_backup("none", None), Err(AgentError::NotFound(_))));
    }

    #[test]
    fn test_validate_state() {
        let dir = TempDir::new().unwrap();
        let rm = manager(&dir);
        let mut state = AgentState::new("s1", "g");
        state.transition_phase(Phase::Enumeration, "r");
        assert!(rm.validate_state(&state));

        let mut no_goal = state.clone();
        no_goal.goal = String::new();
        assert!(!rm.validate_state(&no_goal));

        let mut broken = state.clone();
        broken.phases.phase = Phase::Exploitation;
        assert!(!rm.validate_state(&broken));
    }

    #[test]
    fn test_recover_primary_then_backup_then_fresh() {
        let dir = TempDir::new().unwrap();
        let rm = manager(&dir);

        let (fresh, src) = rm.recover_or_create("s1", Some("map lab"));
        assert_eq!(src, RecoverySource::Fresh);
        assert_eq!(fresh.goal, "map lab");

        let mut state = AgentState::new("s1", "map lab");
        state.transition_phase(Phase::Enumeration, "r");
        rm.auto_save(&state).unwrap();
        let (loaded, src) = rm.recover_or_create("s1", None);
        assert_eq!(src, RecoverySource::Primary);
        assert_eq!(loaded.phase(), Phase::Enumeration);

        // 主文件损坏后回退到备份
        std::fs::write(rm.persistence().state_path("s1"), "{ truncated").unwrap();
        let (restored, src) = rm.recover_or_create("s1", None);
        assert!(matches!(src, RecoverySource::Backup(_)));
        assert_eq!(restored.phase(), Phase::Enumeration);
    }

    #[test]
    fn test_auto_save_writes_backup_and_state() {
        let dir = TempDir::new().unwrap();
        let rm = manager(&dir);
        let state = AgentState::new("s2", "g");
        rm.auto_save(&state).unwrap();
        assert!(rm.persistence().session_exists("s2"));
        assert_eq!(rm.list_backups("s2").len(), 1);
    }
}
