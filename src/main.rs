//! Hornet - 红队评估智能体
//!
//! 入口：解析命令行、加载配置、初始化日志，然后分派到各子命令。
//! start / resume 在前台运行主循环，Ctrl+C 时保存检查点后退出；run 在执行端运行已批准的命令并写回邮箱。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use hornet::config::{load_config, AppConfig};
use hornet::core::{
    Agent, AgentRuntime, AgentState, ConsoleGate, RunOutcome, SessionSupervisor, ShutdownManager,
};
use hornet::execution::{CommandRunner, ExecutionBridge};
use hornet::knowledge::FactMerger;
use hornet::storage::PersistenceManager;
use hornet::tools::{availability, ToolRegistry};

#[derive(Parser)]
#[command(name = "hornet")]
#[command(version)]
#[command(about = "Red-team assessment agent with a human approval gate", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new agent session
    Start {
        /// Assessment goal, e.g. "map 10.0.0.0/24"
        goal: String,

        /// Session id (generated when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Subnet used for host discovery when the goal names none
        #[arg(long)]
        subnet: Option<String>,
    },

    /// Resume a session from its last checkpoint
    Resume { session_id: String },

    /// Show one session in detail, or all sessions as a table
    Status { session_id: Option<String> },

    /// Mark a session as finished
    Stop { session_id: String },

    /// Execute an approved command by exec id, or a literal command
    Run { command_or_exec_id: String },

    /// Report which tool binaries are installed
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    hornet::observability::init(cli.verbose);

    let config = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        AppConfig::default()
    });

    match cli.command {
        Commands::Start { goal, session, subnet } => start(config, &goal, session, subnet).await?,
        Commands::Resume { session_id } => resume(config, &session_id).await?,
        Commands::Status { session_id } => status(&config, session_id.as_deref())?,
        Commands::Stop { session_id } => stop(&config, &session_id)?,
        Commands::Run { command_or_exec_id } => return run(&config, &command_or_exec_id).await,
        Commands::Tools => {
            println!("{}", availability::generate_report(&ToolRegistry::with_defaults()).await);
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// 进程退出状态取命令退出码的低 8 位；非零退出码不会被截成 0
fn exit_byte(code: i32) -> u8 {
    match (code & 0xff) as u8 {
        0 if code != 0 => 1,
        byte => byte,
    }
}

fn build_runtime(config: AppConfig) -> anyhow::Result<AgentRuntime> {
    AgentRuntime::from_config(config, Arc::new(ConsoleGate::new())).context("Failed to initialise agent runtime")
}

async fn start(config: AppConfig, goal: &str, session: Option<String>, subnet: Option<String>) -> anyhow::Result<()> {
    let runtime = build_runtime(config)?;
    let mut agent = Agent::start(runtime, goal, session).context("Failed to start session")?;
    if let Some(subnet) = subnet {
        agent.set_context("network", serde_json::json!({ "subnet": subnet }));
    }

    println!("\nStarting agent session: {}", agent.state().session_id);
    println!("Goal: {goal}");
    let ready: Vec<&String> = agent
        .state()
        .tools_available
        .iter()
        .filter(|(_, ok)| **ok)
        .map(|(name, _)| name)
        .collect();
    println!("Tools available: {ready:?}\n");

    drive(agent).await
}

async fn resume(config: AppConfig, session_id: &str) -> anyhow::Result<()> {
    let runtime = build_runtime(config)?;
    let (agent, context, reason) =
        Agent::resume(runtime, session_id).with_context(|| format!("Cannot resume session {session_id}"))?;
    println!("{context}");
    if reason.starts_with("Warning") {
        println!("{reason}");
    }
    drive(agent).await
}

/// 前台运行主循环，Ctrl+C / SIGTERM 取消
async fn drive(agent: Agent) -> anyhow::Result<()> {
    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let supervisor = SessionSupervisor::with_parent(shutdown.token());

    let session_id = agent.state().session_id.clone();
    let token = supervisor.register(&session_id).await;
    let mut agent = agent.with_cancel_token(token);

    let outcome = agent.run().await;
    supervisor.release(&session_id).await;

    let state = agent.state();
    match &outcome {
        RunOutcome::Completed => println!("\nGoal satisfied."),
        RunOutcome::StoppedByUser => println!("\nAgent stopped by user."),
        RunOutcome::Interrupted => println!("\nAgent paused. Resume with: hornet resume {session_id}"),
        RunOutcome::Stalled(reason) => println!("\nAgent unable to propose next step: {reason}"),
        RunOutcome::StepLimit => println!("\nStep limit reached. Resume with: hornet resume {session_id}"),
        RunOutcome::Failed(reason) => println!("\nRun stopped on error: {reason}. Resume with: hornet resume {session_id}"),
    }
    println!("Agent session complete");
    println!("   Steps: {}", state.total_steps);
    println!("   Hosts found: {}", state.facts.live_hosts.len());
    println!("   Targets: {}", state.facts.targets.len());
    Ok(())
}

fn status(config: &AppConfig, session_id: Option<&str>) -> anyhow::Result<()> {
    let persistence = PersistenceManager::new(&config.app.storage_root);

    if let Some(id) = session_id {
        let state = persistence.load(id).with_context(|| format!("Session not found: {id}"))?;
        let summary = FactMerger::summary(&state.facts);
        println!("\nSession: {}", state.session_id);
        println!("Goal: {}", state.goal);
        println!("Phase: {}", state.phase());
        println!("Completed: {}", state.done);
        println!("\nStats:");
        println!("   Commands: {}", state.commands().len());
        println!("   Failures: {}", state.failures().len());
        println!("   Hosts: {}", summary.hosts_discovered);
        println!("   Targets: {}", summary.targets_identified);
        println!("   Open ports: {}", summary.total_ports);
        println!("   Vulnerabilities: {}", summary.vulnerabilities_found);
        println!("   LLM calls: {}", state.llm_calls);
        println!("   Tokens used: {}", state.tokens_used);
        if state.waiting_for_approval {
            if let Some(cmd) = &state.proposed_command {
                println!("\nWaiting for approval:\n   {cmd}");
            }
        }
        return Ok(());
    }

    let sessions = persistence.list_sessions();
    if sessions.is_empty() {
        println!("\nNo agent sessions found");
        return Ok(());
    }
    println!("\n{:<32} {:<42} {:<18} {:<8} {:>5}", "Session ID", "Goal", "Phase", "Status", "Steps");
    for id in sessions {
        let state: AgentState = match persistence.load(&id) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "skipping unreadable session");
                continue;
            }
        };
        let goal: String = if state.goal.chars().count() > 40 {
            format!("{}...", state.goal.chars().take(40).collect::<String>())
        } else {
            state.goal.clone()
        };
        let label = if state.done {
            "Done"
        } else if state.waiting_for_approval {
            "Waiting"
        } else {
            "Running"
        };
        println!(
            "{:<32} {:<42} {:<18} {:<8} {:>5}",
            id,
            goal,
            state.phase().as_str(),
            label,
            state.total_steps
        );
    }
    Ok(())
}

fn stop(config: &AppConfig, session_id: &str) -> anyhow::Result<()> {
    let persistence = PersistenceManager::new(&config.app.storage_root);
    let mut state = persistence
        .load(session_id)
        .with_context(|| format!("Session not found: {session_id}"))?;
    state.done = true;
    state.waiting_for_approval = false;
    persistence.save(&state).context("Failed to save session")?;
    tracing::info!(session_id, "session stopped");
    println!("Session stopped: {session_id}");
    Ok(())
}

async fn run(config: &AppConfig, command_or_exec_id: &str) -> anyhow::Result<ExitCode> {
    let bridge = ExecutionBridge::new(&config.app.storage_root).context("Failed to open execution mailbox")?;
    let runner = CommandRunner::new(bridge, config.execution.command_timeout());
    let report = runner
        .run(command_or_exec_id)
        .await
        .with_context(|| format!("Failed to run {command_or_exec_id}"))?;

    println!("$ {}", report.command);
    if !report.outcome.stdout.is_empty() {
        println!("{}", report.outcome.stdout.trim_end());
    }
    if !report.outcome.stderr.is_empty() {
        eprintln!("{}", report.outcome.stderr.trim_end());
    }
    println!("Exit code: {}", report.outcome.exit_code);
    if let Some(id) = report.exec_id {
        println!("Result posted to mailbox: {id}");
    }
    Ok(ExitCode::from(exit_byte(report.outcome.exit_code)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_byte_follows_command_exit_code() {
        assert_eq!(exit_byte(0), 0);
        assert_eq!(exit_byte(2), 2);
        assert_eq!(exit_byte(-1), 255);
        assert_eq!(exit_byte(256), 1);
    }
}
