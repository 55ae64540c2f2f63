//! 推理各步骤的 prompt 模板与结构化输出类型
//!
//! 输出类型 derive JsonSchema，schema 随请求下发；解析失败时由 `fallback()` 提供保守默认值。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::phase::Phase;

pub const THINK_SYSTEM: &str = "You are the analysis component of an authorized red-team assessment agent. \
Given the engagement goal, the current phase, the knowledge gathered so far and the result of the last command, \
decide whether the goal is satisfied, whether the last command succeeded and what should happen next. \
Never recommend actions outside the engagement scope.";

pub const PLAN_SYSTEM: &str = "You are the planning component of an authorized red-team assessment agent. \
Turn the analysis into one concrete objective and a short intent label (for example host_discovery, \
port_scan_quick, service_detection, http_probe). Request a phase transition only when the current phase \
has produced what the next phase needs.";

pub const PROPOSE_SYSTEM: &str = "You are the tool selection component of an authorized red-team assessment agent. \
Pick exactly one tool from the available list and the action (intent) it should perform. \
Prefer non-destructive, read-only reconnaissance.";

pub const EXTRACT_SYSTEM: &str = "You extract structured facts from security tool output. \
Report only what the output actually shows: hosts, targets with ports and services, vulnerabilities and credentials. \
Do not guess.";

/// 分析步输出
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ThinkVerdict {
    pub goal_satisfied: bool,
    #[serde(default = "default_true")]
    pub last_command_success: bool,
    #[serde(default)]
    pub new_facts_discovered: Vec<String>,
    #[serde(default)]
    pub should_transition_phase: bool,
    #[serde(default)]
    pub next_phase: Option<String>,
    #[serde(default)]
    pub transition_reason: Option<String>,
    #[serde(default = "default_continue")]
    pub recommended_next_action: String,
    /// high / medium / low
    #[serde(default = "default_low")]
    pub confidence: String,
    #[serde(default)]
    pub reasoning: String,
}

impl ThinkVerdict {
    pub fn fallback() -> Self {
        Self {
            goal_satisfied: false,
            last_command_success: true,
            new_facts_discovered: Vec::new(),
            should_transition_phase: false,
            next_phase: None,
            transition_reason: None,
            recommended_next_action: default_continue(),
            confidence: default_low(),
            reasoning: "analysis unavailable, continuing".to_string(),
        }
    }
}

/// 规划步输出
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanDecision {
    pub objective: String,
    pub intent: String,
    /// 明确的目标（IP / 子网 / URL），可选
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub should_transition: bool,
    #[serde(default)]
    pub next_phase: Option<String>,
    #[serde(default)]
    pub transition_reason: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub rationale: String,
}

impl PlanDecision {
    pub fn fallback() -> Self {
        Self {
            objective: "Continue current phase".to_string(),
            intent: default_continue(),
            target: None,
            should_transition: false,
            next_phase: None,
            transition_reason: None,
            priority: None,
            rationale: String::new(),
        }
    }
}

/// 提议步输出：选用的工具与动作
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolChoice {
    pub tool_name: String,
    /// 交给工具生成命令的 intent
    pub action: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub expected_outcome: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_continue() -> String {
    "continue".to_string()
}

fn default_low() -> String {
    "low".to_string()
}

/// 输出类型对应的 JSON Schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// 事实抽取的输出 schema（FactBatch 的宽松形态）
pub fn extraction_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "hosts": { "type": "array", "items": { "type": "string" } },
            "targets": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "ip": { "type": "string" },
                        "hostname": { "type": "string" },
                        "ports": { "type": "array", "items": { "type": "integer" } },
                        "services": { "type": "object" },
                        "os": { "type": "string" }
                    },
                    "required": ["ip"]
                }
            },
            "vulnerabilities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "severity": { "type": "string", "enum": ["critical", "high", "medium", "low", "info", "unknown"] },
                        "target": { "type": "string" },
                        "cve": { "type": "string" },
                        "description": { "type": "string" }
                    }
                }
            },
            "credentials": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "host": { "type": "string" },
                        "username": { "type": "string" },
                        "password": { "type": "string" }
                    }
                }
            },
            "summary": { "type": "string" }
        }
    })
}

pub fn think_prompt(observation: &Value) -> String {
    format!(
        "Current state of the engagement:\n{}\n\n\
         Evaluate the last command and the knowledge gathered so far. Is the goal satisfied? \
         What should be done next?",
        pretty(observation)
    )
}

pub fn plan_prompt(phase: Phase, observation: &Value, verdict: &ThinkVerdict) -> String {
    format!(
        "Current phase: {phase}\n\nState:\n{}\n\nAnalysis:\n{}\n\n\
         Decide the next objective and intent. Valid phases: recon, enumeration, vulnerability_scan, \
         exploitation, post_exploitation, reporting.",
        pretty(observation),
        pretty(&serde_json::to_value(verdict).unwrap_or(Value::Null))
    )
}

pub fn propose_prompt(phase: Phase, plan: &PlanDecision, tools: &Value) -> String {
    format!(
        "Current phase: {phase}\nObjective: {}\nIntent: {}\n\nAvailable tools:\n{}\n\n\
         Choose one tool and the action it should perform.",
        plan.objective,
        plan.intent,
        pretty(tools)
    )
}

pub fn extract_prompt(command: &str, output: &str) -> String {
    format!(
        "Command:\n{command}\n\nOutput:\n{}\n\nExtract hosts, targets (ip, ports, services, os), \
         vulnerabilities and credentials.",
        truncate(output, 8000)
    )
}

fn pretty(v: &Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_default()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...[truncated]", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
