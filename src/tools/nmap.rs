//! nmap：主机发现与端口扫描
//!
//! 解析 "Nmap scan report for" 行得到主机（可带主机名），`port/proto open service` 行得到端口与服务，
//! "OS details:" 行得到操作系统。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::phase::Phase;
use crate::knowledge::{FactBatch, FactStore, TargetUpdate};
use crate::tools::registry::{Capability, ToolCategory, ToolContext, ToolError, ToolSpec};

const DEFAULT_SUBNET: &str = "192.168.0.0/24";
/// service_detection 最多带的端口数
const MAX_SERVICE_PORTS: usize = 20;

static SPEC: ToolSpec = ToolSpec {
    name: "nmap",
    binary: "nmap",
    category: ToolCategory::Discovery,
    phases: &[Phase::Recon, Phase::Enumeration],
    requires_root: true,
    destructive: false,
    network_active: true,
    description: "Network discovery and port scanning",
    safe_flags: &[
        "-sn", "-sS", "-sT", "-sV", "-p-", "-p", "--top-ports", "-O", "-A", "-T4", "-Pn", "-n",
    ],
    intents: &[
        "host_discovery",
        "port_scan_quick",
        "port_scan_full",
        "service_detection",
        "os_detection",
    ],
};

struct Patterns {
    host: Regex,
    port: Regex,
    os: Regex,
    cidr: Regex,
}

static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();

fn patterns() -> Option<&'static Patterns> {
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                host: Regex::new(r"Nmap scan report for (?:([\w\.-]+) \()?(\d+\.\d+\.\d+\.\d+)").ok()?,
                port: Regex::new(r"(\d+)/(tcp|udp)\s+open\s+([\w\-]+)").ok()?,
                os: Regex::new(r"OS details:\s*(.+)").ok()?,
                cidr: Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3}/\d{1,2})\b").ok()?,
            })
        })
        .as_ref()
}

pub struct NmapTool;

impl NmapTool {
    /// 主机发现的子网：显式目标 > auto_context.network.subnet > 目标描述中的首个 CIDR > 默认
    fn resolve_subnet(ctx: &ToolContext) -> String {
        if let Some(t) = ctx.target.as_deref().filter(|t| !t.trim().is_empty()) {
            return t.trim().to_string();
        }
        if let Some(subnet) = ctx
            .auto_context
            .get("network")
            .and_then(|n| n.get("subnet"))
            .and_then(|s| s.as_str())
        {
            return subnet.to_string();
        }
        patterns()
            .and_then(|p| p.cidr.captures(&ctx.goal))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_SUBNET.to_string())
    }

    /// 单主机目标：显式目标 > 第一个存活主机
    fn resolve_host(ctx: &ToolContext, facts: &FactStore) -> Option<String> {
        ctx.target
            .as_deref()
            .filter(|t| !t.trim().is_empty() && !t.contains('/'))
            .map(|t| t.trim().to_string())
            .or_else(|| facts.live_hosts.first().cloned())
    }
}

impl Capability for NmapTool {
    fn spec(&self) -> &ToolSpec {
        &SPEC
    }

    fn generate_command(&self, intent: &str, ctx: &ToolContext, facts: &FactStore) -> Option<String> {
        match intent {
            "host_discovery" => Some(format!("nmap -sn {}", Self::resolve_subnet(ctx))),
            "port_scan_quick" => {
                Self::resolve_host(ctx, facts).map(|h| format!("nmap -sS --top-ports 100 {h}"))
            }
            "port_scan_full" => Self::resolve_host(ctx, facts).map(|h| format!("nmap -sS -p- {h}")),
            "service_detection" => {
                let target = match ctx.target.as_deref() {
                    Some(ip) => facts.target(ip),
                    None => facts.targets.first(),
                };
                match target {
                    Some(t) if !t.ports.is_empty() => {
                        let ports: Vec<String> =
                            t.ports.iter().take(MAX_SERVICE_PORTS).map(|p| p.to_string()).collect();
                        Some(format!("nmap -sV -p {} {}", ports.join(","), t.ip))
                    }
                    Some(t) => Some(format!("nmap -sV {}", t.ip)),
                    None => Self::resolve_host(ctx, facts).map(|h| format!("nmap -sV {h}")),
                }
            }
            "os_detection" => Self::resolve_host(ctx, facts).map(|h| format!("nmap -O {h}")),
            _ => None,
        }
    }

    fn parse_output(&self, output: &str) -> Result<FactBatch, ToolError> {
        let p = patterns().ok_or_else(|| ToolError::Parse {
            tool: SPEC.name.to_string(),
            reason: "patterns unavailable".to_string(),
        })?;

        let mut batch = FactBatch::default();
        let mut current: Option<TargetUpdate> = None;

        for line in output.lines() {
            if let Some(c) = p.host.captures(line) {
                if let Some(done) = current.take() {
                    batch.targets.push(done);
                }
                let ip = c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
                if !batch.hosts.contains(&ip) {
                    batch.hosts.push(ip.clone());
                }
                let mut target = TargetUpdate::new(ip);
                target.hostname = c.get(1).map(|m| m.as_str().to_string());
                current = Some(target);
                continue;
            }
            let Some(target) = current.as_mut() else { continue };
            if let Some(c) = p.port.captures(line) {
                if let Ok(port) = c[1].parse::<u16>() {
                    target.ports.push(port);
                    target.services.insert(port, c[3].to_string());
                }
            } else if let Some(c) = p.os.captures(line) {
                target.os = Some(c[1].trim().to_string());
            }
        }
        if let Some(done) = current.take() {
            batch.targets.push(done);
        }
        // 只有 ping 结果的主机不作为 target 上报
        batch
            .targets
            .retain(|t| !t.ports.is_empty() || t.os.is_some() || t.hostname.is_some());

        Ok(batch)
    }
}
