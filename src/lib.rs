//! Hornet - 红队评估智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 阶段状态机、会话状态、恢复与续跑、人工审批、主控循环
//! - **execution**: 执行邮箱（pending / complete）与执行端命令运行器
//! - **knowledge**: 事实模型与合并规则
//! - **llm**: 推理服务抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、重试、prompt
//! - **observability**: 日志初始化
//! - **storage**: 会话状态持久化
//! - **tools**: 工具能力注册表、可用性探测、安全校验、nmap / curl

pub mod config;
pub mod core;
pub mod execution;
pub mod knowledge;
pub mod llm;
pub mod observability;
pub mod storage;
pub mod tools;

pub use crate::core::{Agent, AgentError, AgentRuntime, AgentState, Phase, RunOutcome};
