//! Mock 推理服务（测试与离线模式，无需 API）
//!
//! 每类任务一条脚本队列，按顺序弹出预设响应；队列为空时走内置的离线启发式：
//! 无存活主机时建议主机发现，执行过一轮命令后判定目标达成。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::traits::{LlmError, ReasoningRequest, ReasoningService, ReasoningTask};

/// 可脚本化的 Mock 推理服务
#[derive(Debug, Default)]
pub struct MockReasoner {
    scripts: Mutex<HashMap<ReasoningTask, VecDeque<Result<Value, LlmError>>>>,
    calls: Mutex<Vec<ReasoningTask>>,
}

impl MockReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条预设响应（builder 形式）
    pub fn with_response(self, task: ReasoningTask, response: Value) -> Self {
        self.push(task, Ok(response));
        self
    }

    pub fn with_error(self, task: ReasoningTask, error: LlmError) -> Self {
        self.push(task, Err(error));
        self
    }

    pub fn push(&self, task: ReasoningTask, response: Result<Value, LlmError>) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.entry(task).or_default().push_back(response);
        }
    }

    /// 某类任务被调用的次数
    pub fn call_count(&self, task: ReasoningTask) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|t| **t == task).count())
            .unwrap_or(0)
    }

    fn next_scripted(&self, task: ReasoningTask) -> Option<Result<Value, LlmError>> {
        self.scripts.lock().ok()?.get_mut(&task)?.pop_front()
    }
}

#[async_trait]
impl ReasoningService for MockReasoner {
    async fn call(&self, request: &ReasoningRequest) -> Result<Value, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.task);
        }
        if let Some(scripted) = self.next_scripted(request.task) {
            return scripted;
        }
        Ok(match request.task {
            ReasoningTask::Think => offline_think(&request.context),
            ReasoningTask::Plan => offline_plan(&request.context),
            ReasoningTask::Propose => offline_propose(&request.context),
            ReasoningTask::Extract => json!({}),
        })
    }
}

fn offline_think(observation: &Value) -> Value {
    let no_hosts = observation["facts"]["live_hosts"]
        .as_array()
        .map(|a| a.is_empty())
        .unwrap_or(true);
    let ran_something = !observation["last_command"].is_null();

    if ran_something {
        json!({
            "goal_satisfied": true,
            "last_command_success": observation["last_command"]["exit_code"] == 0,
            "recommended_next_action": "report",
            "confidence": "medium",
            "reasoning": "offline mode completes after a single discovery pass"
        })
    } else if no_hosts && observation["phase"] == "recon" {
        json!({
            "goal_satisfied": false,
            "recommended_next_action": "discover_hosts",
            "confidence": "low",
            "reasoning": "no live hosts known yet"
        })
    } else {
        json!({
            "goal_satisfied": false,
            "recommended_next_action": "continue",
            "confidence": "low",
            "reasoning": "continuing current phase"
        })
    }
}

fn offline_plan(context: &Value) -> Value {
    if context["verdict"]["recommended_next_action"] == "discover_hosts" {
        json!({
            "objective": "Discover live hosts",
            "intent": "host_discovery",
            "should_transition": false,
            "rationale": "no hosts known"
        })
    } else {
        json!({
            "objective": "Continue current phase",
            "intent": "continue",
            "should_transition": false
        })
    }
}

fn offline_propose(context: &Value) -> Value {
    let intent = context["plan"]["intent"].as_str().unwrap_or("continue");
    let tools = context["tools"].as_array().cloned().unwrap_or_default();
    let supports = |t: &Value| {
        t["intents"]
            .as_array()
            .map(|i| i.iter().any(|x| x == intent))
            .unwrap_or(false)
    };
    let tool = tools
        .iter()
        .find(|t| supports(t))
        .or_else(|| tools.first())
        .and_then(|t| t["name"].as_str())
        .unwrap_or_default();

    json!({
        "tool_name": tool,
        "action": intent,
        "reasoning": format!("offline selection of {tool} for {intent}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(task: ReasoningTask, context: Value) -> ReasoningRequest {
        ReasoningRequest {
            task,
            prompt: String::new(),
            system_prompt: None,
            output_schema: None,
            max_tokens: 100,
            context,
        }
    }

    #[tokio::test]
    async fn test_scripted_then_offline() {
        let mock = MockReasoner::new()
            .with_response(ReasoningTask::Think, json!({"goal_satisfied": true}))
            .with_error(ReasoningTask::Think, LlmError::Transport("down".into()));

        let ctx = json!({"phase": "recon", "facts": {"live_hosts": []}, "last_command": null});
        let first = mock.call(&req(ReasoningTask::Think, ctx.clone())).await.unwrap();
        assert_eq!(first["goal_satisfied"], true);
        assert!(mock.call(&req(ReasoningTask::Think, ctx.clone())).await.is_err());

        let offline = mock.call(&req(ReasoningTask::Think, ctx)).await.unwrap();
        assert_eq!(offline["recommended_next_action"], "discover_hosts");
        assert_eq!(mock.call_count(ReasoningTask::Think), 3);
    }

    #[tokio::test]
    async fn test_offline_propose_prefers_matching_tool() {
        let mock = MockReasoner::new();
        let ctx = json!({
            "plan": {"intent": "http_probe"},
            "tools": [
                {"name": "nmap", "intents": ["host_discovery"]},
                {"name": "curl", "intents": ["http_probe"]}
            ]
        });
        let out = mock.call(&req(ReasoningTask::Propose, ctx)).await.unwrap();
        assert_eq!(out["tool_name"], "curl");
        assert_eq!(out["action"], "http_probe");
    }
}
