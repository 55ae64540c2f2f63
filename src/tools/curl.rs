//! curl：HTTP 探测
//!
//! 对已识别出 http 服务的目标生成探测命令；解析状态行、Server 与 Content-Type 头。
//! verbose 输出中带 "Connected to ... port N" 时，结果同时写入 services["ip:port"]。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::phase::Phase;
use crate::knowledge::{FactBatch, FactStore, Target};
use crate::tools::registry::{Capability, ToolCategory, ToolContext, ToolError, ToolSpec};

static SPEC: ToolSpec = ToolSpec {
    name: "curl",
    binary: "curl",
    category: ToolCategory::Web,
    phases: &[Phase::Recon, Phase::Enumeration, Phase::VulnerabilityScan],
    requires_root: false,
    destructive: false,
    network_active: true,
    description: "HTTP client for web requests and API enumeration",
    safe_flags: &["-I", "-L", "-s", "-v", "-X", "-H", "-A", "-k", "--head", "-o"],
    intents: &["http_probe", "http_headers"],
};

struct Patterns {
    status: Regex,
    server: Regex,
    content_type: Regex,
    connected: Regex,
}

static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();

fn patterns() -> Option<&'static Patterns> {
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                status: Regex::new(r"HTTP/[\d.]+\s+(\d{3})").ok()?,
                server: Regex::new(r"(?im)^[<\s]*Server:\s*(.+?)\s*$").ok()?,
                content_type: Regex::new(r"(?im)^[<\s]*Content-Type:\s*(.+?)\s*$").ok()?,
                connected: Regex::new(r"Connected to \S+ \((\d+\.\d+\.\d+\.\d+)\) port (\d+)").ok()?,
            })
        })
        .as_ref()
}

pub struct CurlTool;

impl CurlTool {
    /// 找第一个 http 类服务：显式目标优先
    fn find_http<'a>(ctx: &ToolContext, facts: &'a FactStore) -> Option<(&'a Target, u16, bool)> {
        let candidates: Vec<&Target> = match ctx.target.as_deref().and_then(|ip| facts.target(ip)) {
            Some(t) => vec![t],
            None => facts.targets.iter().collect(),
        };
        candidates.into_iter().find_map(|t| {
            t.services.iter().find_map(|(port, service)| {
                let service = service.to_lowercase();
                service.contains("http").then(|| {
                    let tls = service.contains("ssl") || service.contains("https") || *port == 443;
                    (t, *port, tls)
                })
            })
        })
    }
}

impl Capability for CurlTool {
    fn spec(&self) -> &ToolSpec {
        &SPEC
    }

    fn generate_command(&self, intent: &str, ctx: &ToolContext, facts: &FactStore) -> Option<String> {
        // 显式给出 URL 时直接使用
        let explicit_url = ctx
            .target
            .as_deref()
            .filter(|t| t.starts_with("http://") || t.starts_with("https://"));

        let url = match explicit_url {
            Some(u) => u.to_string(),
            None => {
                let (target, port, tls) = Self::find_http(ctx, facts)?;
                let scheme = if tls { "https" } else { "http" };
                format!("{scheme}://{}:{port}", target.ip)
            }
        };

        match intent {
            "http_probe" | "web_probe" => Some(format!("curl -I -L -k {url}")),
            "http_headers" | "web_headers" => Some(format!("curl -v -s -k {url} -o /dev/null")),
            _ => None,
        }
    }

    fn parse_output(&self, output: &str) -> Result<FactBatch, ToolError> {
        let p = patterns().ok_or_else(|| ToolError::Parse {
            tool: SPEC.name.to_string(),
            reason: "patterns unavailable".to_string(),
        })?;

        let mut info = Map::new();
        if let Some(c) = p.status.captures_iter(output).last() {
            info.insert("status_code".into(), Value::String(c[1].to_string()));
        }
        if let Some(c) = p.server.captures(output) {
            info.insert("server".into(), Value::String(c[1].to_string()));
        }
        if let Some(c) = p.content_type.captures(output) {
            info.insert("content_type".into(), Value::String(c[1].to_string()));
        }

        let mut batch = FactBatch::default();
        if info.is_empty() {
            return Ok(batch);
        }
        if let Some(c) = p.connected.captures(output) {
            let addr = format!("{}:{}", &c[1], &c[2]);
            let table: BTreeMap<String, Value> = info.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            batch.services.insert(addr, table);
        }
        batch.custom.insert("web_info".into(), Value::Object(info));
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts_with_web() -> FactStore {
        let mut facts = FactStore::default();
        let mut t = Target::new("10.0.0.5");
        t.add_ports([22, 8443]);
        t.services.insert(22, "ssh".into());
        t.services.insert(8443, "ssl/http".into());
        facts.targets.push(t);
        facts
    }

    #[test]
    fn test_generate_from_known_service() {
        let facts = facts_with_web();
        let ctx = ToolContext::default();
        assert_eq!(
            CurlTool.generate_command("http_probe", &ctx, &facts).unwrap(),
            "curl -I -L -k https://10.0.0.5:8443"
        );
        assert_eq!(
            CurlTool.generate_command("http_headers", &ctx, &facts).unwrap(),
            "curl -v -s -k https://10.0.0.5:8443 -o /dev/null"
        );
    }

    #[test]
    fn test_no_web_service_no_command() {
        let ctx = ToolContext::default();
        assert!(CurlTool.generate_command("http_probe", &ctx, &FactStore::default()).is_none());
    }

    #[test]
    fn test_explicit_url() {
        let ctx = ToolContext {
            target: Some("http://intranet.lab".into()),
            ..ToolContext::default()
        };
        assert_eq!(
            CurlTool.generate_command("http_probe", &ctx, &FactStore::default()).unwrap(),
            "curl -I -L -k http://intranet.lab"
        );
    }

    #[test]
    fn test_parse_headers() {
        let out = "*   Trying 10.0.0.5:80...\n\
* Connected to 10.0.0.5 (10.0.0.5) port 80 (#0)\n\
< HTTP/1.1 200 OK\n\
< Server: nginx/1.18.0\n\
< Content-Type: text/html\n";
        let batch = CurlTool.parse_output(out).unwrap();
        let info = &batch.custom["web_info"];
        assert_eq!(info["status_code"], "200");
        assert_eq!(info["server"], "nginx/1.18.0");
        assert_eq!(batch.services["10.0.0.5:80"]["content_type"], "text/html");
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(CurlTool.parse_output("curl: (7) Failed to connect").unwrap().is_empty());
    }
}
