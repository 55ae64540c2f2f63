//! 执行层：编排侧的执行邮箱与执行侧的命令运行器

pub mod bridge;
pub mod runner;

pub use bridge::{ExecutionBridge, ExecutionRecord, ExecutionStatus};
pub use runner::{run_shell, CommandOutcome, CommandRunner, RunReport};
