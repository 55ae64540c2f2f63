//! 人工审批闸门
//!
//! 每条通过安全校验的命令在提交执行前都要经过 ApprovalGate：批准、修改后批准、拒绝（跳过本步）或停止整个运行。
//! ConsoleGate 在独立线程上读取操作员输入，经 channel 交给异步侧，取消时不会卡在阻塞读上；ScriptedGate 按预设顺序给出决定，供测试与无人值守场景使用。

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::core::phase::Phase;

/// 提交审批的提议
#[derive(Debug, Clone)]
pub struct Proposal {
    pub command: String,
    pub reasoning: String,
    pub tool: String,
    pub phase: Phase,
    /// requires_approval 给出的软告警
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    /// 用修改后的命令替换原命令
    Edit(String),
    Reject,
    Stop,
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn review(&self, proposal: &Proposal) -> ApprovalDecision;
}

/// 终端交互：y 批准 / e 修改 / n 拒绝 / q 停止；输入关闭时视为停止
pub struct ConsoleGate {
    lines: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ConsoleGate {
    pub fn new() -> Self {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// 后台线程逐行读取 reader；读到 EOF 或出错时关闭 channel
    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            lines: tokio::sync::Mutex::new(rx),
        }
    }

    async fn prompt(text: &str) {
        let mut out = tokio::io::stdout();
        let _ = out.write_all(text.as_bytes()).await;
        let _ = out.flush().await;
    }
}

impl Default for ConsoleGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApprovalGate for ConsoleGate {
    async fn review(&self, proposal: &Proposal) -> ApprovalDecision {
        let mut banner = format!(
            "\n[{}] proposed {} command:\n  $ {}\n  why: {}\n",
            proposal.phase, proposal.tool, proposal.command, proposal.reasoning
        );
        if let Some(w) = &proposal.warning {
            banner.push_str(&format!("  warning: {w}\n"));
        }
        Self::prompt(&banner).await;

        let mut lines = self.lines.lock().await;
        loop {
            Self::prompt("Approve? [y]es / [e]dit / [n]o / [q]uit: ").await;
            let Some(answer) = lines.recv().await else {
                return ApprovalDecision::Stop;
            };
            match answer.trim().to_lowercase().as_str() {
                "y" | "yes" | "" => return ApprovalDecision::Approve,
                "n" | "no" => return ApprovalDecision::Reject,
                "q" | "quit" | "stop" => return ApprovalDecision::Stop,
                "e" | "edit" => {
                    Self::prompt("New command: ").await;
                    match lines.recv().await {
                        Some(edited) if !edited.trim().is_empty() => {
                            return ApprovalDecision::Edit(edited.trim().to_string())
                        }
                        Some(_) => continue,
                        None => return ApprovalDecision::Stop,
                    }
                }
                _ => continue,
            }
        }
    }
}

/// 按顺序返回预设决定；用完后一律批准
#[derive(Debug, Default)]
pub struct ScriptedGate {
    decisions: Mutex<VecDeque<ApprovalDecision>>,
    reviewed: Mutex<Vec<String>>,
}

impl ScriptedGate {
    pub fn new(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            reviewed: Mutex::new(Vec::new()),
        }
    }

    pub fn approve_all() -> Self {
        Self::default()
    }

    /// 已审阅过的命令（按顺序）
    pub fn reviewed(&self) -> Vec<String> {
        self.reviewed.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ApprovalGate for ScriptedGate {
    async fn review(&self, proposal: &Proposal) -> ApprovalDecision {
        if let Ok(mut r) = self.reviewed.lock() {
            r.push(proposal.command.clone());
        }
        self.decisions
            .lock()
            .ok()
            .and_then(|mut d| d.pop_front())
            .unwrap_or(ApprovalDecision::Approve)
    }
}
