//! 会话状态：AgentState 根聚合及其历史记录
//!
//! 每个会话由一个 Agent 独占一份 AgentState；命令与失败日志只追加不修改。
//! 整个结构可直接 serde 序列化，PersistenceManager / RecoveryManager 以整文档方式读写。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::phase::{Phase, PhaseStateMachine, PhaseTransition};
use crate::knowledge::FactStore;

/// 已执行命令的记录（追加后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub phase: Phase,
    pub tool_used: String,
    pub exit_code: i32,
    pub output: String,
    #[serde(default)]
    pub facts_extracted: Value,
}

/// 失败记录：安全拒绝、无法提出命令、步骤异常等
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    /// 相关命令，没有时为空串
    #[serde(default)]
    pub command: String,
    pub reason: String,
    pub phase: Phase,
}

/// Agent 全量状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub session_id: String,
    pub goal: String,
    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub phases: PhaseStateMachine,

    /// 运行环境上下文（如 network.subnet），透传给工具
    #[serde(default)]
    pub auto_context: BTreeMap<String, Value>,
    /// 工具名 -> 是否可用
    #[serde(default)]
    pub tools_available: BTreeMap<String, bool>,

    #[serde(default)]
    pub facts: FactStore,

    #[serde(default)]
    commands_executed: Vec<CommandRecord>,
    #[serde(default)]
    failures: Vec<FailureRecord>,

    #[serde(default)]
    pub current_objective: Option<String>,
    #[serde(default)]
    pub proposed_command: Option<String>,
    #[serde(default)]
    pub proposed_reasoning: Option<String>,
    #[serde(default)]
    pub waiting_for_approval: bool,
    #[serde(default)]
    pub done: bool,

    #[serde(default)]
    pub total_steps: u64,
    #[serde(default)]
    pub llm_calls: u64,
    #[serde(default)]
    pub tokens_used: u64,
}

impl AgentState {
    pub fn new(session_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            goal: goal.into(),
            created_at: Utc::now(),
            phases: PhaseStateMachine::new(),
            auto_context: BTreeMap::new(),
            tools_available: BTreeMap::new(),
            facts: FactStore::default(),
            commands_executed: Vec::new(),
            failures: Vec::new(),
            current_objective: None,
            proposed_command: None,
            proposed_reasoning: None,
            waiting_for_approval: false,
            done: false,
            total_steps: 0,
            llm_calls: 0,
            tokens_used: 0,
        }
    }

    /// 生成新的会话 ID：agent_ + 时间戳 + 短随机后缀
    pub fn generate_session_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("agent_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..6])
    }

    pub fn phase(&self) -> Phase {
        self.phases.current()
    }

    pub fn phase_history(&self) -> &[PhaseTransition] {
        self.phases.history()
    }

    pub fn transition_phase(&mut self, new_phase: Phase, reason: impl Into<String>) {
        self.phases.transition(new_phase, reason);
    }

    pub fn commands(&self) -> &[CommandRecord] {
        &self.commands_executed
    }

    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    pub fn last_command(&self) -> Option<&CommandRecord> {
        self.commands_executed.last()
    }

    /// 追加命令记录，total_steps 同步 +1
    pub fn add_command(&mut self, record: CommandRecord) {
        self.commands_executed.push(record);
        self.total_steps += 1;
    }

    pub fn add_failure(&mut self, command: impl Into<String>, reason: impl Into<String>) {
        self.failures.push(FailureRecord {
            timestamp: Utc::now(),
            command: command.into(),
            reason: reason.into(),
            phase: self.phase(),
        });
    }

    /// 记录一次待审批的提议
    pub fn set_proposal(&mut self, command: &str, reasoning: &str) {
        self.proposed_command = Some(command.to_string());
        self.proposed_reasoning = Some(reasoning.to_string());
        self.waiting_for_approval = true;
    }

    pub fn clear_proposal(&mut self) {
        self.proposed_command = None;
        self.proposed_reasoning = None;
        self.waiting_for_approval = false;
    }

    /// 给推理服务看的观测快照
    pub fn observation(&self) -> Value {
        serde_json::json!({
            "goal": self.goal,
            "phase": self.phase().as_str(),
            "auto_context": self.auto_context,
            "facts": self.facts,
            "last_command": self.last_command().map(|c| serde_json::json!({
                "command": c.command,
                "tool": c.tool_used,
                "exit_code": c.exit_code,
                "output": truncate(&c.output, 2000),
            })),
            "total_commands": self.commands_executed.len(),
            "failures": self.failures.len(),
        })
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let s = AgentState::new("s1", "map 10.0.0.0/24");
        assert_eq!(s.phase(), Phase::Recon);
        assert!(!s.done);
        assert!(s.commands().is_empty());
        assert!(AgentState::generate_session_id().starts_with("agent_"));
    }

    #[test]
    fn test_add_command_counts_step() {
        let mut s = AgentState::new("s1", "g");
        s.add_command(CommandRecord {
            timestamp: Utc::now(),
            command: "nmap -sn 10.0.0.0/24".into(),
            phase: Phase::Recon,
            tool_used: "nmap".into(),
            exit_code: 0,
            output: String::new(),
            facts_extracted: Value::Null,
        });
        s.add_failure("", "no tool");
        assert_eq!(s.total_steps, 1);
        assert_eq!(s.failures()[0].phase, Phase::Recon);
        assert_eq!(s.last_command().unwrap().tool_used, "nmap");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let raw = serde_json::json!({
            "session_id": "s1",
            "goal": "g",
            "created_at": "2024-01-01T00:00:00Z"
        });
        let s: AgentState = serde_json::from_value(raw).unwrap();
        assert_eq!(s.phase(), Phase::Recon);
        assert!(s.facts.live_hosts.is_empty());
        assert_eq!(s.llm_calls, 0);
    }

    #[test]
    fn test_phase_fields_flattened() {
        let mut s = AgentState::new("s1", "g");
        s.transition_phase(Phase::Enumeration, "hosts up");
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["phase"], "enumeration");
        assert_eq!(v["phase_history"][0]["from_phase"], "recon");
    }
}
