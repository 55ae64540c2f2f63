//! 红队阶段状态机
//!
//! 六个阶段，初始为 Recon。transition 不做合法性校验：阶段顺序由推理服务决定，状态机只负责记录。
//! 完成与否由 AgentState.done 表示，而不是到达 Reporting。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 工作流阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    #[serde(alias = "reconnaissance")]
    Recon,
    Enumeration,
    #[serde(alias = "vulnerability")]
    VulnerabilityScan,
    Exploitation,
    PostExploitation,
    Reporting,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Recon,
        Phase::Enumeration,
        Phase::VulnerabilityScan,
        Phase::Exploitation,
        Phase::PostExploitation,
        Phase::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Recon => "recon",
            Phase::Enumeration => "enumeration",
            Phase::VulnerabilityScan => "vulnerability_scan",
            Phase::Exploitation => "exploitation",
            Phase::PostExploitation => "post_exploitation",
            Phase::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "recon" | "reconnaissance" => Ok(Phase::Recon),
            "enumeration" => Ok(Phase::Enumeration),
            "vulnerability_scan" | "vulnerability" => Ok(Phase::VulnerabilityScan),
            "exploitation" => Ok(Phase::Exploitation),
            "post_exploitation" => Ok(Phase::PostExploitation),
            "reporting" => Ok(Phase::Reporting),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// 一次阶段迁移（不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from_phase: Phase,
    pub to_phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// 阶段状态机：当前阶段 + 迁移日志。序列化时平铺进 AgentState（phase / phase_history）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseStateMachine {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub phase_history: Vec<PhaseTransition>,
}

impl PhaseStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.phase_history
    }

    /// 记录迁移并切换阶段；允许任意迁移（包括回退与自迁移）
    pub fn transition(&mut self, new_phase: Phase, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(from = %self.phase, to = %new_phase, reason = %reason, "phase transition");
        self.phase_history.push(PhaseTransition {
            from_phase: self.phase,
            to_phase: new_phase,
            timestamp: Utc::now(),
            reason,
        });
        self.phase = new_phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_phase_is_recon() {
        let m = PhaseStateMachine::new();
        assert_eq!(m.current(), Phase::Recon);
        assert!(m.history().is_empty());
    }

    #[test]
    fn test_transition_records_from_phase() {
        let mut m = PhaseStateMachine::new();
        m.transition(Phase::Enumeration, "hosts found");
        m.transition(Phase::Exploitation, "skip ahead");
        assert_eq!(m.current(), Phase::Exploitation);
        assert_eq!(m.history().len(), 2);
        assert_eq!(m.history()[1].from_phase, Phase::Enumeration);
        assert_eq!(m.history()[1].reason, "skip ahead");
    }

    #[test]
    fn test_backward_transition_allowed() {
        let mut m = PhaseStateMachine::new();
        m.transition(Phase::Reporting, "done early");
        m.transition(Phase::Recon, "new subnet");
        assert_eq!(m.current(), Phase::Recon);
    }

    #[test]
    fn test_phase_parse_and_serde() {
        assert_eq!("vulnerability".parse::<Phase>().unwrap(), Phase::VulnerabilityScan);
        assert_eq!("Post-Exploitation".parse::<Phase>().unwrap(), Phase::PostExploitation);
        assert!("lunch".parse::<Phase>().is_err());
        let v = serde_json::to_value(Phase::VulnerabilityScan).unwrap();
        assert_eq!(v, serde_json::json!("vulnerability_scan"));
        let p: Phase = serde_json::from_value(serde_json::json!("reconnaissance")).unwrap();
        assert_eq!(p, Phase::Recon);
    }
}
