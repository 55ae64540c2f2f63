//! Agent 编排器：红队主控循环
//!
//! 一步 = 观测 → 分析(think) → 规划(plan，可切换阶段) → 提议(propose) → 安全校验 → 人工审批
//! → 经执行邮箱提交并等待 → 抽取事实 → 合并与记录 → 检查点。
//! 步内错误一律按 AgentError::disposition 收尾：推理失败降级为保守的兜底结果，安全拒绝跳过本次提议，
//! 等待超时记为退出码 -1；未分类的错误记录为 Failure、保存检查点后终止本次运行，由外部 resume 重新进入循环。

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::approval::{ApprovalDecision, ApprovalGate, Proposal};
use crate::core::error::{AgentError, Disposition};
use crate::core::phase::Phase;
use crate::core::recovery::{RecoveryManager, RecoverySource};
use crate::core::resume::{validate_resume, ResumeContext};
use crate::core::state::{AgentState, CommandRecord};
use crate::execution::ExecutionBridge;
use crate::knowledge::{FactBatch, FactMerger};
use crate::llm::prompts::{self, PlanDecision, ThinkVerdict, ToolChoice};
use crate::llm::{
    create_reasoner_from_config, retry_async, LlmError, ReasoningRequest, ReasoningService, ReasoningTask,
};
use crate::storage::PersistenceManager;
use crate::tools::{availability, SafetyValidator, ToolContext, ToolRegistry};

/// 一次 run 的结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// 推理判定目标已达成
    Completed,
    /// 操作员在审批时选择停止
    StoppedByUser,
    /// 收到取消信号（Ctrl+C），已保存检查点
    Interrupted,
    /// 无法给出下一步（无可用工具 / 工具无法生成命令）
    Stalled(String),
    /// 达到 max_steps 上限
    StepLimit,
    /// 未分类错误导致的 fail-stop
    Failed(String),
}

enum StepOutcome {
    Continue,
    Finished(RunOutcome),
}

/// 提议步产出：已渲染的命令与来源工具
#[derive(Debug, Clone)]
struct Rendered {
    command: String,
    tool: String,
    reasoning: String,
}

/// 循环依赖的外部协作者，按配置构建一次后传入 Agent
#[derive(Clone)]
pub struct AgentRuntime {
    pub config: AppConfig,
    pub reasoner: Arc<dyn ReasoningService>,
    pub tools: ToolRegistry,
    pub gate: Arc<dyn ApprovalGate>,
    pub bridge: ExecutionBridge,
    pub recovery: RecoveryManager,
}

impl AgentRuntime {
    /// 按配置创建推理后端、默认工具集、执行邮箱与恢复管理器
    pub fn from_config(config: AppConfig, gate: Arc<dyn ApprovalGate>) -> Result<Self, AgentError> {
        let persistence = PersistenceManager::new(&config.app.storage_root);
        let bridge = ExecutionBridge::new(&config.app.storage_root)?;
        Ok(Self {
            reasoner: create_reasoner_from_config(&config),
            tools: ToolRegistry::with_defaults(),
            gate,
            bridge,
            recovery: RecoveryManager::new(persistence, config.recovery.max_backups),
            config,
        })
    }

    pub fn with_reasoner(mut self, reasoner: Arc<dyn ReasoningService>) -> Self {
        self.reasoner = reasoner;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }
}

/// 单个会话的 Agent
pub struct Agent {
    state: AgentState,
    runtime: AgentRuntime,
    cancel: CancellationToken,
}

impl Agent {
    /// 包装已有状态；未登记或标记为不可用的工具重新在 PATH 中查找
    pub fn new(runtime: AgentRuntime, mut state: AgentState) -> Self {
        let mut rechecked = Vec::new();
        for spec in runtime.tools.specs() {
            if state.tools_available.get(spec.name).copied().unwrap_or(false) {
                continue;
            }
            let available = availability::check_binary(spec.binary);
            state.tools_available.insert(spec.name.to_string(), available);
            rechecked.push((spec.name, available));
        }
        if !rechecked.is_empty() {
            tracing::info!(session_id = %state.session_id, tools = ?rechecked, "tool availability checked");
        }
        Self {
            state,
            runtime,
            cancel: CancellationToken::new(),
        }
    }

    /// 新建会话并写入首个检查点
    pub fn start(runtime: AgentRuntime, goal: &str, session_id: Option<String>) -> Result<Self, AgentError> {
        let session_id = session_id.unwrap_or_else(AgentState::generate_session_id);
        if runtime.recovery.persistence().session_exists(&session_id) {
            return Err(AgentError::Config(format!(
                "session {session_id} already exists, use resume instead"
            )));
        }
        let agent = Self::new(runtime, AgentState::new(session_id, goal));
        agent.runtime.recovery.persistence().save(&agent.state)?;
        tracing::info!(session_id = %agent.state.session_id, goal, "session created");
        Ok(agent)
    }

    /// 经三级恢复链载入会话；返回 Agent、恢复摘要与可恢复性说明
    pub fn resume(runtime: AgentRuntime, session_id: &str) -> Result<(Self, ResumeContext, String), AgentError> {
        let existed = runtime.recovery.persistence().session_exists(session_id);
        let (state, source) = runtime.recovery.recover_or_create(session_id, None);
        match source {
            RecoverySource::Fresh if existed => {
                return Err(AgentError::StateCorruption(format!(
                    "session {session_id} could not be restored from state or backups"
                )))
            }
            RecoverySource::Fresh => return Err(AgentError::NotFound(format!("session {session_id}"))),
            RecoverySource::Backup(name) => {
                tracing::warn!(session_id, backup = %name, "resuming from backup")
            }
            RecoverySource::Primary => {}
        }

        let (ok, reason) = validate_resume(&state);
        if !ok {
            return Err(AgentError::NotResumable(reason));
        }
        if reason.starts_with("Warning") {
            tracing::warn!(session_id, "{}", reason);
        }
        let context = ResumeContext::from_state(&state);
        Ok((Self::new(runtime, state), context, reason))
    }

    /// 使用外部取消令牌（如 SessionSupervisor 的子 token）
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 写入 auto_context（如 network.subnet），随下一个检查点持久化
    pub fn set_context(&mut self, key: &str, value: Value) {
        self.state.auto_context.insert(key.to_string(), value);
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn into_state(self) -> AgentState {
        self.state
    }

    /// 主循环：直到目标达成、操作员停止、取消、卡住、出错或达到步数上限
    pub async fn run(&mut self) -> RunOutcome {
        tracing::info!(
            session_id = %self.state.session_id,
            goal = %self.state.goal,
            phase = %self.state.phase(),
            "agent run started"
        );
        let max_steps = self.runtime.config.app.max_steps;
        let mut steps = 0u64;

        let outcome = loop {
            if self.state.done {
                break RunOutcome::Completed;
            }
            if self.cancel.is_cancelled() {
                self.interrupt();
                break RunOutcome::Interrupted;
            }
            if steps >= max_steps {
                tracing::warn!(session_id = %self.state.session_id, max_steps, "step limit reached");
                self.checkpoint();
                break RunOutcome::StepLimit;
            }
            steps += 1;

            let cancel = self.cancel.clone();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                r = self.step() => r,
            };

            match result {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Finished(outcome)) => break outcome,
                Err(e) => {
                    if let Some(outcome) = self.dispose(e) {
                        break outcome;
                    }
                }
            }
        };

        tracing::info!(
            session_id = %self.state.session_id,
            outcome = ?outcome,
            steps = self.state.total_steps,
            hosts = self.state.facts.live_hosts.len(),
            targets = self.state.facts.targets.len(),
            "agent run finished"
        );
        outcome
    }

    /// 单步
    async fn step(&mut self) -> Result<StepOutcome, AgentError> {
        let observation = self.state.observation();

        let verdict = self.think(&observation).await?;
        if verdict.goal_satisfied {
            tracing::info!(session_id = %self.state.session_id, reasoning = %verdict.reasoning, "goal satisfied");
            self.state.done = true;
            self.state.clear_proposal();
            self.checkpoint();
            return Ok(StepOutcome::Finished(RunOutcome::Completed));
        }

        let plan = self.plan(&observation, &verdict).await?;
        self.state.current_objective = Some(plan.objective.clone());
        if plan.should_transition {
            self.apply_transition(plan.next_phase.as_deref(), plan.transition_reason.as_deref());
        }

        let proposal = self.propose(&plan).await?;

        let (safe, reason) = SafetyValidator::validate(&proposal.command);
        if !safe {
            return Err(AgentError::Validation {
                command: proposal.command,
                reason,
            });
        }
        let (needs_attention, warning) = SafetyValidator::requires_approval(&proposal.command);
        if needs_attention {
            tracing::warn!(session_id = %self.state.session_id, command = %proposal.command, warning = %warning, "command requires approval");
        }

        self.state.set_proposal(&proposal.command, &proposal.reasoning);
        self.persist();

        let decision = self
            .runtime
            .gate
            .review(&Proposal {
                command: proposal.command.clone(),
                reasoning: proposal.reasoning.clone(),
                tool: proposal.tool.clone(),
                phase: self.state.phase(),
                warning: needs_attention.then_some(warning),
            })
            .await;

        let final_command = match decision {
            ApprovalDecision::Approve => proposal.command.clone(),
            ApprovalDecision::Edit(edited) => {
                let (safe, reason) = SafetyValidator::validate(&edited);
                if !safe {
                    return Err(AgentError::Validation { command: edited, reason });
                }
                tracing::info!(session_id = %self.state.session_id, original = %proposal.command, edited = %edited, "command edited by operator");
                edited
            }
            ApprovalDecision::Reject => {
                tracing::info!(session_id = %self.state.session_id, command = %proposal.command, "command rejected by operator");
                self.state.clear_proposal();
                self.state.add_failure(&proposal.command, "Rejected by operator");
                self.checkpoint();
                return Ok(StepOutcome::Continue);
            }
            ApprovalDecision::Stop => {
                tracing::info!(session_id = %self.state.session_id, "agent stopped by operator");
                self.state.done = true;
                self.state.clear_proposal();
                self.checkpoint();
                return Ok(StepOutcome::Finished(RunOutcome::StoppedByUser));
            }
        };

        let (exit_code, output) = match self.execute(&final_command, &proposal.tool).await {
            Ok(result) => result,
            Err(e) if e.disposition() == Disposition::RecordAndContinue => {
                tracing::warn!(session_id = %self.state.session_id, error = %e, "recording command without output");
                (-1, String::new())
            }
            Err(e) => return Err(e),
        };
        let batch = self.extract(&proposal.tool, &final_command, &output).await?;

        FactMerger::merge_into(&mut self.state.facts, &batch);
        FactMerger::merge(&mut self.state.facts);

        let phase = self.state.phase();
        self.state.clear_proposal();
        self.state.add_command(CommandRecord {
            timestamp: chrono::Utc::now(),
            command: final_command,
            phase,
            tool_used: proposal.tool,
            exit_code,
            output,
            facts_extracted: batch.to_value(),
        });
        self.checkpoint();
        Ok(StepOutcome::Continue)
    }

    async fn think(&mut self, observation: &Value) -> Result<ThinkVerdict, AgentError> {
        let request = ReasoningRequest {
            task: ReasoningTask::Think,
            prompt: prompts::think_prompt(observation),
            system_prompt: Some(prompts::THINK_SYSTEM.to_string()),
            output_schema: Some(prompts::schema_of::<ThinkVerdict>()),
            max_tokens: self.runtime.config.llm.max_tokens.think,
            context: observation.clone(),
        };
        let verdict = self.reason(&request).await;
        self.degrade(verdict, ThinkVerdict::fallback)
    }

    async fn plan(&mut self, observation: &Value, verdict: &ThinkVerdict) -> Result<PlanDecision, AgentError> {
        let request = ReasoningRequest {
            task: ReasoningTask::Plan,
            prompt: prompts::plan_prompt(self.state.phase(), observation, verdict),
            system_prompt: Some(prompts::PLAN_SYSTEM.to_string()),
            output_schema: Some(prompts::schema_of::<PlanDecision>()),
            max_tokens: self.runtime.config.llm.max_tokens.plan,
            context: json!({ "observation": observation, "verdict": verdict }),
        };
        let plan = self.reason(&request).await;
        self.degrade(plan, PlanDecision::fallback)
    }

    fn apply_transition(&mut self, next_phase: Option<&str>, reason: Option<&str>) {
        let Some(raw) = next_phase else {
            tracing::warn!(session_id = %self.state.session_id, "transition requested without a target phase");
            return;
        };
        match raw.parse::<Phase>() {
            Ok(next) => {
                let from = self.state.phase();
                self.state.transition_phase(next, reason.unwrap_or_default());
                tracing::info!(session_id = %self.state.session_id, from = %from, to = %next, "phase transition");
            }
            Err(_) => {
                tracing::warn!(session_id = %self.state.session_id, phase = raw, "unknown phase requested, ignoring transition")
            }
        }
    }

    /// 选工具并渲染命令；推理失败或选了未知工具时退回第一个可用工具
    async fn propose(&mut self, plan: &PlanDecision) -> Result<Rendered, AgentError> {
        let phase = self.state.phase();
        let eligible: Vec<String> = self
            .runtime
            .tools
            .eligible(phase, &self.state.tools_available)
            .iter()
            .map(|s| s.name.to_string())
            .collect();
        let Some(first) = eligible.first().cloned() else {
            return Err(AgentError::NoEligibleTool(phase.to_string()));
        };

        let tools_json = {
            let specs = self.runtime.tools.eligible(phase, &self.state.tools_available);
            ToolRegistry::to_prompt_json(&specs)
        };
        let request = ReasoningRequest {
            task: ReasoningTask::Propose,
            prompt: prompts::propose_prompt(phase, plan, &tools_json),
            system_prompt: Some(prompts::PROPOSE_SYSTEM.to_string()),
            output_schema: Some(prompts::schema_of::<ToolChoice>()),
            max_tokens: self.runtime.config.llm.max_tokens.propose,
            context: json!({ "plan": plan, "tools": tools_json }),
        };

        let chosen = self.reason::<ToolChoice>(&request).await.map(Some);
        let choice = match self.degrade(chosen, || None)? {
            Some(choice) if eligible.contains(&choice.tool_name) => choice,
            Some(choice) => {
                tracing::warn!(tool = %choice.tool_name, fallback = %first, "reasoner chose an ineligible tool");
                ToolChoice { tool_name: first, ..choice }
            }
            None => ToolChoice {
                tool_name: first,
                action: plan.intent.clone(),
                parameters: None,
                reasoning: plan.rationale.clone(),
                expected_outcome: None,
            },
        };

        let capability = self
            .runtime
            .tools
            .get(&choice.tool_name)
            .ok_or_else(|| AgentError::NoEligibleTool(phase.to_string()))?;
        let target = plan.target.clone().or_else(|| {
            choice
                .parameters
                .as_ref()
                .and_then(|p| p["target"].as_str())
                .map(str::to_string)
        });
        let ctx = ToolContext {
            goal: self.state.goal.clone(),
            phase,
            target,
            auto_context: self.state.auto_context.clone(),
        };
        let command = capability
            .generate_command(&choice.action, &ctx, &self.state.facts)
            .ok_or_else(|| AgentError::NoCommand(format!("{} cannot handle '{}'", choice.tool_name, choice.action)))?;

        tracing::info!(session_id = %self.state.session_id, tool = %choice.tool_name, intent = %choice.action, command = %command, "command proposed");
        Ok(Rendered {
            command,
            tool: choice.tool_name,
            reasoning: choice.reasoning,
        })
    }

    /// 提交到执行邮箱并等待结果；等待超时返回 AgentError::Execution
    async fn execute(&mut self, command: &str, tool: &str) -> Result<(i32, String), AgentError> {
        let exec_id = self
            .runtime
            .bridge
            .submit(&self.state.session_id, command, tool, self.state.phase())?;
        tracing::info!(session_id = %self.state.session_id, exec_id = %exec_id, "waiting for execution: hornet run {}", exec_id);

        let exec = &self.runtime.config.execution;
        match self
            .runtime
            .bridge
            .wait_for_completion(&exec_id, exec.poll_interval(), exec.wait_timeout())
            .await
        {
            Some(record) => {
                let exit_code = record.exit_code.unwrap_or(-1);
                let mut output = record.output.unwrap_or_default();
                if exit_code != 0 {
                    if let Some(err) = record.error.filter(|e| !e.is_empty()) {
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(&err);
                    }
                }
                tracing::info!(session_id = %self.state.session_id, exec_id = %exec_id, exit_code, "execution complete");
                Ok((exit_code, output))
            }
            None => Err(AgentError::Execution(format!(
                "{exec_id} not completed within {}s",
                exec.wait_timeout().as_secs()
            ))),
        }
    }

    /// 工具解析优先；无解析器或解析失败时交给推理服务；都失败则视为无事实
    async fn extract(&mut self, tool: &str, command: &str, output: &str) -> Result<FactBatch, AgentError> {
        if output.trim().is_empty() {
            return Ok(FactBatch::default());
        }
        if let Some(capability) = self.runtime.tools.get(tool) {
            match capability.parse_output(output) {
                Ok(batch) => return Ok(batch),
                Err(e) => tracing::debug!(tool, error = %e, "tool parser unavailable, falling back to reasoning"),
            }
        }

        let request = ReasoningRequest {
            task: ReasoningTask::Extract,
            prompt: prompts::extract_prompt(command, output),
            system_prompt: Some(prompts::EXTRACT_SYSTEM.to_string()),
            output_schema: Some(prompts::extraction_schema()),
            max_tokens: self.runtime.config.llm.max_tokens.extract,
            context: json!({ "command": command, "output": output }),
        };
        let extracted = self.reason::<Value>(&request).await.map(Some);
        Ok(self
            .degrade(extracted, || None)?
            .map(|value| FactBatch::from_value(&value))
            .unwrap_or_default())
    }

    /// 带重试的推理调用；成功后计入 llm_calls / tokens_used。重试耗尽或结果不符合 schema 都是 AgentError::Reasoning
    async fn reason<T: DeserializeOwned>(&mut self, request: &ReasoningRequest) -> Result<T, AgentError> {
        let reasoner = self.runtime.reasoner.clone();
        let label = request.task.as_str();
        let response = retry_async(&self.runtime.config.retry, label, || reasoner.call(request))
            .await
            .ok_or_else(|| LlmError::Unavailable(format!("{label}: retries exhausted")))?;

        self.state.llm_calls += 1;
        self.state.tokens_used +=
            reasoner.count_tokens(&request.prompt) + reasoner.count_tokens(&response.to_string());

        serde_json::from_value(response)
            .map_err(|e| AgentError::Reasoning(LlmError::Parse(format!("{label}: {e}"))))
    }

    /// Degrade 类错误换成兜底结果，其余错误继续上抛
    fn degrade<T>(&self, result: Result<T, AgentError>, fallback: impl FnOnce() -> T) -> Result<T, AgentError> {
        match result {
            Err(e) if e.disposition() == Disposition::Degrade => {
                tracing::warn!(session_id = %self.state.session_id, error = %e, "reasoning unavailable, using fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    /// 按错误的处置方式收尾；返回 Some 时本次运行结束
    fn dispose(&mut self, err: AgentError) -> Option<RunOutcome> {
        let disposition = err.disposition();
        match disposition {
            Disposition::SkipProposal | Disposition::RecordAndContinue => {
                tracing::warn!(session_id = %self.state.session_id, error = %err, ?disposition, "proposal skipped");
                let command = err
                    .command()
                    .map(str::to_string)
                    .or_else(|| self.state.proposed_command.clone())
                    .unwrap_or_default();
                self.state.clear_proposal();
                self.state.add_failure(command, err.to_string());
                self.checkpoint();
                None
            }
            Disposition::Degrade | Disposition::LogOnly => {
                tracing::warn!(session_id = %self.state.session_id, error = %err, ?disposition, "step error ignored");
                None
            }
            Disposition::Restore => {
                let (state, source) = self.runtime.recovery.recover_or_create(&self.state.session_id, None);
                if source == RecoverySource::Fresh {
                    return Some(self.fail_stop(err));
                }
                tracing::warn!(session_id = %self.state.session_id, error = %err, source = ?source, "state restored from checkpoint");
                self.state = state;
                None
            }
            Disposition::Stall => {
                tracing::warn!(session_id = %self.state.session_id, error = %err, "agent unable to propose next step");
                self.state.add_failure("", err.to_string());
                self.checkpoint();
                Some(RunOutcome::Stalled(err.to_string()))
            }
            Disposition::Pause => {
                self.interrupt();
                Some(RunOutcome::Interrupted)
            }
            Disposition::FailStop => Some(self.fail_stop(err)),
        }
    }

    /// 记录失败（带上待审批命令）、撤下提议、保存检查点
    fn fail_stop(&mut self, err: AgentError) -> RunOutcome {
        tracing::error!(session_id = %self.state.session_id, error = %err, "step failed, stopping run");
        let command = self.state.proposed_command.clone().unwrap_or_default();
        self.state.clear_proposal();
        self.state.add_failure(command, err.to_string());
        self.checkpoint();
        RunOutcome::Failed(err.to_string())
    }

    fn interrupt(&mut self) {
        tracing::info!(session_id = %self.state.session_id, "agent paused, checkpoint saved");
        self.state.waiting_for_approval = false;
        self.checkpoint();
    }

    /// 备份 + 保存；失败按 Persistence 处置只记日志
    fn checkpoint(&self) {
        if let Err(e) = self.runtime.recovery.auto_save(&self.state) {
            self.log_persistence_failure(e, "checkpoint failed");
        }
    }

    fn persist(&self) {
        if let Err(e) = self.runtime.recovery.persistence().save(&self.state) {
            self.log_persistence_failure(e, "state save failed");
        }
    }

    fn log_persistence_failure(&self, cause: AgentError, what: &str) {
        let err = AgentError::Persistence(cause.to_string());
        tracing::warn!(session_id = %self.state.session_id, error = %err, disposition = ?err.disposition(), "{}", what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::approval::ScriptedGate;
    use crate::knowledge::FactStore;
    use crate::llm::MockReasoner;
    use crate::tools::{Capability, ToolCategory, ToolSpec};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.app.storage_root = dir.path().to_path_buf();
        config.app.max_steps = 5;
        config.retry.max_attempts = 1;
        config.retry.base_delay_ms = 1;
        config.execution.poll_interval_ms = 10;
        config.execution.wait_timeout_secs = 1;
        config
    }

    fn runtime(dir: &TempDir, reasoner: MockReasoner, gate: ScriptedGate) -> AgentRuntime {
        AgentRuntime::from_config(test_config(dir), Arc::new(gate))
            .unwrap()
            .with_reasoner(Arc::new(reasoner))
    }

    fn state_with_nmap(goal: &str) -> AgentState {
        let mut state = AgentState::new("s1", goal);
        state.tools_available = BTreeMap::from([("nmap".to_string(), true), ("curl".to_string(), false)]);
        state
    }

    static SHELL_SPEC: ToolSpec = ToolSpec {
        name: "shell",
        binary: "sh",
        category: ToolCategory::Scripting,
        phases: &[Phase::Recon],
        requires_root: false,
        destructive: false,
        network_active: false,
        description: "POSIX shell",
        safe_flags: &[],
        intents: &["host_discovery"],
    };

    /// 固定渲染同一条命令的工具
    struct ShellTool(&'static str);

    impl Capability for ShellTool {
        fn spec(&self) -> &ToolSpec {
            &SHELL_SPEC
        }

        fn generate_command(&self, _intent: &str, _ctx: &ToolContext, _facts: &FactStore) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn shell_only(command: &'static str) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(ShellTool(command));
        tools
    }

    #[tokio::test]
    async fn test_goal_satisfied_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let reasoner = MockReasoner::new().with_response(
            ReasoningTask::Think,
            json!({"goal_satisfied": true, "reasoning": "done"}),
        );
        let mut agent = Agent::new(runtime(&dir, reasoner, ScriptedGate::approve_all()), state_with_nmap("g"));
        assert_eq!(agent.run().await, RunOutcome::Completed);
        assert!(agent.state().done);
        assert_eq!(agent.state().llm_calls, 1);
        assert!(agent.state().tokens_used > 0);

        let saved = PersistenceManager::new(dir.path()).load("s1").unwrap();
        assert!(saved.done);
    }

    #[tokio::test]
    async fn test_no_eligible_tool_stalls() {
        let dir = TempDir::new().unwrap();
        let mut state = state_with_nmap("g");
        state.tools_available.insert("nmap".to_string(), false);
        let mut agent = Agent::new(runtime(&dir, MockReasoner::new(), ScriptedGate::approve_all()), state);

        assert!(matches!(agent.run().await, RunOutcome::Stalled(_)));
        assert_eq!(agent.state().failures().len(), 1);
        assert!(!agent.state().done);
    }

    #[tokio::test]
    async fn test_unsafe_command_recorded_and_skipped() {
        let dir = TempDir::new().unwrap();
        // 第一轮：操作员把命令改成危险命令 → 记失败；第二轮：停止
        let gate = ScriptedGate::new([ApprovalDecision::Edit("rm -rf /data".into()), ApprovalDecision::Stop]);
        let mut agent = Agent::new(runtime(&dir, MockReasoner::new(), gate), state_with_nmap("map 10.0.0.0/24"));

        assert_eq!(agent.run().await, RunOutcome::StoppedByUser);
        let failures = agent.state().failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].command, "rm -rf /data");
        assert!(failures[0].reason.starts_with("Safety validation failed"));
        assert!(agent.state().commands().is_empty());
        assert!(agent.state().done);
        assert!(!agent.state().waiting_for_approval);
    }

    #[tokio::test]
    async fn test_reject_continues_loop() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(ScriptedGate::new([ApprovalDecision::Reject, ApprovalDecision::Stop]));
        let rt = AgentRuntime::from_config(test_config(&dir), gate.clone())
            .unwrap()
            .with_reasoner(Arc::new(MockReasoner::new()));
        let mut agent = Agent::new(rt, state_with_nmap("map 10.0.0.0/24"));

        assert_eq!(agent.run().await, RunOutcome::StoppedByUser);
        assert_eq!(gate.reviewed(), vec!["nmap -sn 10.0.0.0/24", "nmap -sn 10.0.0.0/24"]);
        assert_eq!(agent.state().failures()[0].reason, "Rejected by operator");
    }

    #[tokio::test]
    async fn test_reasoning_failure_degrades_to_fallback() {
        let dir = TempDir::new().unwrap();
        // 分析失败 → 兜底 continue；规划兜底 intent=continue；提议失败 → 第一个可用工具 + 规划 intent
        let reasoner = MockReasoner::new()
            .with_error(ReasoningTask::Think, LlmError::Transport("down".into()))
            .with_error(ReasoningTask::Plan, LlmError::Transport("down".into()))
            .with_error(ReasoningTask::Propose, LlmError::Transport("down".into()));
        let mut agent = Agent::new(
            runtime(&dir, reasoner, ScriptedGate::approve_all()),
            state_with_nmap("g"),
        );

        let outcome = agent.run().await;
        assert!(matches!(outcome, RunOutcome::Stalled(ref m) if m.contains("nmap")));
        assert_eq!(agent.state().llm_calls, 0);
        assert_eq!(
            agent.state().current_objective.as_deref(),
            Some("Continue current phase")
        );
    }

    #[tokio::test]
    async fn test_plan_transition_applied() {
        let dir = TempDir::new().unwrap();
        let reasoner = MockReasoner::new()
            .with_response(ReasoningTask::Think, json!({"goal_satisfied": false}))
            .with_response(
                ReasoningTask::Plan,
                json!({
                    "objective": "enumerate services",
                    "intent": "service_detection",
                    "should_transition": true,
                    "next_phase": "enumeration",
                    "transition_reason": "hosts found"
                }),
            );
        let gate = ScriptedGate::new([ApprovalDecision::Stop]);
        let mut state = state_with_nmap("g");
        state.facts.live_hosts.push("10.0.0.5".into());
        let mut agent = Agent::new(runtime(&dir, reasoner, gate), state);

        assert_eq!(agent.run().await, RunOutcome::StoppedByUser);
        assert_eq!(agent.state().phase(), Phase::Enumeration);
        assert_eq!(agent.state().phase_history()[0].reason, "hosts found");
    }

    #[tokio::test]
    async fn test_execution_timeout_records_minus_one() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.app.max_steps = 1;
        let rt = AgentRuntime::from_config(config, Arc::new(ScriptedGate::approve_all()))
            .unwrap()
            .with_reasoner(Arc::new(MockReasoner::new()));
        let bridge = rt.bridge.clone();
        let mut agent = Agent::new(rt, state_with_nmap("map 10.0.0.0/24"));

        assert_eq!(agent.run().await, RunOutcome::StepLimit);
        let record = &agent.state().commands()[0];
        assert_eq!(record.exit_code, -1);
        assert!(record.output.is_empty());
        // 未完成的记录仍留在 pending，供执行端稍后处理
        assert_eq!(bridge.pending(Some("s1")).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_checkpoints_and_interrupts() {
        let dir = TempDir::new().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let mut agent = Agent::new(
            runtime(&dir, MockReasoner::new(), ScriptedGate::approve_all()),
            state_with_nmap("g"),
        )
        .with_cancel_token(token);

        assert_eq!(agent.run().await, RunOutcome::Interrupted);
        assert!(PersistenceManager::new(dir.path()).session_exists("s1"));
    }

    #[tokio::test]
    async fn test_start_and_resume() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir, MockReasoner::new(), ScriptedGate::approve_all());

        let agent = Agent::start(rt.clone(), "map 10.0.0.0/24", Some("s9".into())).unwrap();
        assert_eq!(agent.state().session_id, "s9");
        assert!(matches!(
            Agent::start(rt.clone(), "again", Some("s9".into())),
            Err(AgentError::Config(_))
        ));

        let (resumed, ctx, reason) = Agent::resume(rt.clone(), "s9").unwrap();
        assert_eq!(resumed.state().goal, "map 10.0.0.0/24");
        assert_eq!(ctx.session_id, "s9");
        assert!(reason.contains("valid"));

        assert!(matches!(Agent::resume(rt.clone(), "missing"), Err(AgentError::NotFound(_))));

        let mut done = resumed.into_state();
        done.done = true;
        rt.recovery.persistence().save(&done).unwrap();
        assert!(matches!(Agent::resume(rt, "s9"), Err(AgentError::NotResumable(_))));
    }

    #[tokio::test]
    async fn test_unsafe_proposal_skipped_without_review() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.app.max_steps = 2;
        let gate = Arc::new(ScriptedGate::approve_all());
        let rt = AgentRuntime::from_config(config, gate.clone())
            .unwrap()
            .with_reasoner(Arc::new(MockReasoner::new()))
            .with_tools(shell_only("rm -rf /data"));
        let mut state = AgentState::new("s3", "g");
        state.tools_available.insert("shell".to_string(), true);
        let mut agent = Agent::new(rt, state);

        assert_eq!(agent.run().await, RunOutcome::StepLimit);
        assert!(gate.reviewed().is_empty());
        let failures = agent.state().failures();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.command == "rm -rf /data"));
        assert!(failures[0].reason.starts_with("Safety validation failed"));
        assert!(agent.state().commands().is_empty());
    }

    #[tokio::test]
    async fn test_submit_failure_stops_and_clears_proposal() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir, MockReasoner::new(), ScriptedGate::approve_all());
        // 邮箱 pending 目录被普通文件占位，提交必然失败
        let pending = dir.path().join("executions").join("pending");
        std::fs::remove_dir_all(&pending).unwrap();
        std::fs::write(&pending, b"").unwrap();
        let mut agent = Agent::new(rt, state_with_nmap("map 10.0.0.0/24"));

        assert!(matches!(agent.run().await, RunOutcome::Failed(_)));
        let failures = agent.state().failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].command, "nmap -sn 10.0.0.0/24");
        assert!(agent.state().proposed_command.is_none());
        assert!(!agent.state().waiting_for_approval);

        let saved = PersistenceManager::new(dir.path()).load("s1").unwrap();
        assert_eq!(saved.failures().len(), 1);
        assert!(!saved.waiting_for_approval);
        assert!(saved.proposed_command.is_none());
        assert!(!saved.done);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unavailable_tools_rechecked_on_resume() {
        let dir = TempDir::new().unwrap();
        let rt = runtime(&dir, MockReasoner::new(), ScriptedGate::approve_all()).with_tools(shell_only("true"));
        let mut state = AgentState::new("s4", "g");
        state.tools_available.insert("shell".to_string(), false);
        rt.recovery.persistence().save(&state).unwrap();

        let (agent, _, _) = Agent::resume(rt, "s4").unwrap();
        assert_eq!(agent.state().tools_available.get("shell"), Some(&true));
    }
}
