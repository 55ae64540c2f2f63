//! 核心编排层：阶段与状态、错误处置、恢复与续跑、人工审批、会话监管、主控循环

pub mod approval;
pub mod error;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod resume;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use approval::{ApprovalDecision, ApprovalGate, ConsoleGate, Proposal, ScriptedGate};
pub use error::{AgentError, Disposition};
pub use orchestrator::{Agent, AgentRuntime, RunOutcome};
pub use phase::{Phase, PhaseStateMachine, PhaseTransition};
pub use recovery::{RecoveryManager, RecoverySource};
pub use resume::{validate_resume, ResumeContext};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{AgentState, CommandRecord, FailureRecord};
