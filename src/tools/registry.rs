//! 工具能力注册表
//!
//! 每个安全工具实现 Capability trait（spec / generate_command / parse_output），由 ToolRegistry 按名注册与查找。
//! 能力本身不执行命令：只负责把 intent 翻译成命令行、把输出解析成 FactBatch。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::phase::Phase;
use crate::knowledge::{FactBatch, FactStore};

/// 工具解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("tool {0} has no output parser")]
    NoParser(String),

    #[error("failed to parse {tool} output: {reason}")]
    Parse { tool: String, reason: String },
}

/// 工具类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Discovery,
    Enumeration,
    Vulnerability,
    Web,
    Exploitation,
    PostExploitation,
    Scripting,
}

/// 工具元数据
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    /// 实际调用的可执行文件名
    pub binary: &'static str,
    pub category: ToolCategory,
    pub phases: &'static [Phase],
    pub requires_root: bool,
    pub destructive: bool,
    pub network_active: bool,
    pub description: &'static str,
    pub safe_flags: &'static [&'static str],
    /// 支持的 intent，供推理服务挑选
    pub intents: &'static [&'static str],
}

/// 命令生成时的上下文
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub goal: String,
    pub phase: Phase,
    /// 规划给出的显式目标（IP / 子网 / URL）
    pub target: Option<String>,
    pub auto_context: BTreeMap<String, Value>,
}

/// 工具能力 trait
pub trait Capability: Send + Sync {
    fn spec(&self) -> &ToolSpec;

    /// 把 intent 翻译为命令行；无法处理时返回 None
    fn generate_command(&self, intent: &str, ctx: &ToolContext, facts: &FactStore) -> Option<String>;

    /// 把原始输出解析为事实；默认无解析器，调用方回退到推理服务抽取
    fn parse_output(&self, _output: &str) -> Result<FactBatch, ToolError> {
        Err(ToolError::NoParser(self.spec().name.to_string()))
    }

    /// 给定 flag 是否都在白名单内
    fn validate_flags(&self, flags: &[&str]) -> bool {
        flags.iter().all(|f| self.spec().safe_flags.contains(f))
    }
}

/// 工具注册表：按名称存储 Arc<dyn Capability>，保持注册顺序
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 nmap 与 curl
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::tools::nmap::NmapTool);
        registry.register(crate::tools::curl::CurlTool);
        registry
    }

    pub fn register(&mut self, tool: impl Capability + 'static) {
        let name = tool.spec().name.to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.tools.get(name).cloned()
    }

    /// 注册顺序的工具名
    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn specs(&self) -> Vec<&ToolSpec> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.spec())
            .collect()
    }

    pub fn for_phase(&self, phase: Phase) -> Vec<&ToolSpec> {
        self.specs()
            .into_iter()
            .filter(|s| s.phases.contains(&phase))
            .collect()
    }

    pub fn for_category(&self, category: ToolCategory) -> Vec<&ToolSpec> {
        self.specs()
            .into_iter()
            .filter(|s| s.category == category)
            .collect()
    }

    /// 当前阶段可用且已安装的工具（availability 中没有记录的工具视为未安装）
    pub fn eligible(&self, phase: Phase, availability: &BTreeMap<String, bool>) -> Vec<&ToolSpec> {
        self.for_phase(phase)
            .into_iter()
            .filter(|s| availability.get(s.name).copied().unwrap_or(false))
            .collect()
    }

    /// 生成 prompt 中的可用工具列表
    pub fn to_prompt_json(specs: &[&ToolSpec]) -> Value {
        Value::Array(
            specs
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "description": s.description,
                        "category": s.category,
                        "intents": s.intents,
                    })
                })
                .collect(),
        )
    }
}
