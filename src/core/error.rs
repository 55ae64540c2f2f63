//! Agent 错误类型与处置策略
//!
//! 每个 AgentError 都映射到一个 Disposition，主循环按它收尾，不再逐个匹配错误变体。

use thiserror::Error;

use crate::llm::LlmError;

/// 编排层错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 安全闸门拒绝
    #[error("Safety validation failed: {reason}")]
    Validation { command: String, reason: String },

    /// 等待执行结果超时
    #[error("Execution failed: {0}")]
    Execution(String),

    /// 推理服务重试耗尽
    #[error("Reasoning failed: {0}")]
    Reasoning(#[from] LlmError),

    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// 状态文件损坏或缺少关键字段
    #[error("State corrupted: {0}")]
    StateCorruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No eligible tool for phase {0}")]
    NoEligibleTool(String),

    /// 选中的工具无法为该 intent 生成命令
    #[error("No command rendered: {0}")]
    NoCommand(String),

    #[error("Session cannot be resumed: {0}")]
    NotResumable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 错误发生后主循环的处置方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 放弃本次提议，记录失败后进入下一轮
    SkipProposal,
    /// 记为命令结果（非零退出码），继续
    RecordAndContinue,
    /// 用保守的兜底结果替代，继续
    Degrade,
    /// 仅记录日志，不影响本步
    LogOnly,
    /// 走三级恢复链
    Restore,
    /// 无法给出下一步：记录失败、保存检查点、以 Stalled 结束
    Stall,
    /// 取消：保存检查点、以 Interrupted 结束
    Pause,
    /// 记录失败、保存检查点、终止运行
    FailStop,
}

impl AgentError {
    pub fn disposition(&self) -> Disposition {
        match self {
            AgentError::Validation { .. } => Disposition::SkipProposal,
            AgentError::Execution(_) => Disposition::RecordAndContinue,
            AgentError::Reasoning(_) => Disposition::Degrade,
            AgentError::Persistence(_) => Disposition::LogOnly,
            AgentError::StateCorruption(_) => Disposition::Restore,
            AgentError::NoEligibleTool(_) | AgentError::NoCommand(_) => Disposition::Stall,
            AgentError::Cancelled => Disposition::Pause,
            _ => Disposition::FailStop,
        }
    }

    /// 与错误相关的命令行（写入 FailureRecord）
    pub fn command(&self) -> Option<&str> {
        match self {
            AgentError::Validation { command, .. } => Some(command),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_mapping() {
        let rejected = AgentError::Validation {
            command: "rm -rf /".into(),
            reason: "Dangerous pattern".into(),
        };
        assert_eq!(rejected.disposition(), Disposition::SkipProposal);
        assert_eq!(rejected.command(), Some("rm -rf /"));
        assert_eq!(rejected.to_string(), "Safety validation failed: Dangerous pattern");
        assert_eq!(AgentError::Execution("exit 1".into()).disposition(), Disposition::RecordAndContinue);
        assert_eq!(
            AgentError::Reasoning(LlmError::Transport("down".into())).disposition(),
            Disposition::Degrade
        );
        assert_eq!(AgentError::Persistence("disk full".into()).disposition(), Disposition::LogOnly);
        assert_eq!(AgentError::StateCorruption("bad".into()).disposition(), Disposition::Restore);
        assert_eq!(AgentError::NoEligibleTool("recon".into()).disposition(), Disposition::Stall);
        assert_eq!(AgentError::NoCommand("curl".into()).disposition(), Disposition::Stall);
        assert_eq!(AgentError::Cancelled.disposition(), Disposition::Pause);
        assert_eq!(AgentError::Config("exists".into()).disposition(), Disposition::FailStop);
        assert_eq!(AgentError::NotFound("missing".into()).command(), None);
    }
}
