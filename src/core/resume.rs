//! 会话恢复：恢复前的摘要与可恢复性检查

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::core::phase::Phase;
use crate::core::state::AgentState;
use crate::knowledge::{FactMerger, FactSummary};

/// 超过该天数的会话仍可恢复，但给出告警
const STALE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
pub struct LastCommandSummary {
    pub command: String,
    pub tool: String,
    pub timestamp: DateTime<Utc>,
}

/// 恢复摘要
#[derive(Debug, Clone, Serialize)]
pub struct ResumeContext {
    pub session_id: String,
    pub goal: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub commands_count: usize,
    pub facts: FactSummary,
    pub last_command: Option<LastCommandSummary>,
    pub phase_transitions: usize,
    pub done: bool,
}

impl ResumeContext {
    pub fn from_state(state: &AgentState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            goal: state.goal.clone(),
            phase: state.phase(),
            created_at: state.created_at,
            commands_count: state.commands().len(),
            facts: FactMerger::summary(&state.facts),
            last_command: state.last_command().map(|c| LastCommandSummary {
                command: c.command.clone(),
                tool: c.tool_used.clone(),
                timestamp: c.timestamp,
            }),
            phase_transitions: state.phase_history().len(),
            done: state.done,
        }
    }
}

impl fmt::Display for ResumeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "RESUMING AGENT SESSION")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "Session:        {}", self.session_id)?;
        writeln!(f, "Goal:           {}", self.goal)?;
        writeln!(f, "Current phase:  {}", self.phase.as_str().to_uppercase())?;
        writeln!(f, "Started:        {}", self.created_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Progress:")?;
        writeln!(f, "  Commands executed:  {}", self.commands_count)?;
        writeln!(f, "  Hosts discovered:   {}", self.facts.hosts_discovered)?;
        writeln!(f, "  Open ports:         {}", self.facts.total_ports)?;
        writeln!(f, "  Vulnerabilities:    {}", self.facts.vulnerabilities_found)?;
        writeln!(f, "  Targets identified: {}", self.facts.targets_identified)?;
        if let Some(last) = &self.last_command {
            let preview: String = last.command.chars().take(60).collect();
            writeln!(f, "Last command ({}): {}", last.tool, preview)?;
        }
        if self.phase_transitions > 0 {
            writeln!(f, "Phase transitions: {}", self.phase_transitions)?;
        }
        if self.done {
            writeln!(f, "Status: GOAL SATISFIED")?;
        } else {
            writeln!(f, "Status: IN PROGRESS, resuming from last checkpoint")?;
        }
        write!(f, "{}", "=".repeat(60))
    }
}

/// (可恢复, 原因)；已完成或缺少身份字段的会话不可恢复，过旧的会话附带告警
pub fn validate_resume(state: &AgentState) -> (bool, String) {
    validate_resume_at(state, Utc::now())
}

fn validate_resume_at(state: &AgentState, now: DateTime<Utc>) -> (bool, String) {
    if state.done {
        return (false, "Session already completed (goal satisfied)".to_string());
    }
    if state.session_id.trim().is_empty() || state.goal.trim().is_empty() {
        return (false, "Session state corrupted (missing required fields)".to_string());
    }
    let age = now - state.created_at;
    if age > Duration::days(STALE_AFTER_DAYS) {
        return (true, format!("Warning: Session is {} days old", age.num_days()));
    }
    (true, "Session is valid and can be resumed".to_string())
}
