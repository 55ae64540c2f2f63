//! 知识库数据模型：FactStore 及其记录类型
//!
//! FactStore 由 AgentState 独占；新观测到的事实以 FactBatch 形式到达，再由 FactMerger 合并。
//! FactBatch 的解析是宽松的：单条畸形记录被丢弃，而不是让整批失败。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 漏洞严重程度，封闭集合；无法识别的字符串一律归为 Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    #[default]
    Unknown,
}

impl Severity {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" | "moderate" => Self::Medium,
            "low" => Self::Low,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Unknown => "unknown",
        }
    }
}

impl From<String> for Severity {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

/// 已发现的目标主机，ip 为身份键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    /// 去重且升序
    #[serde(default)]
    pub ports: Vec<u16>,
    /// 端口 -> 服务描述
    #[serde(default)]
    pub services: BTreeMap<u16, String>,
    #[serde(default)]
    pub os: Option<String>,
    /// 自由文本的漏洞引用（CVE 编号或名称）
    #[serde(default)]
    pub vulnerabilities: Vec<String>,
}

impl Target {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            hostname: None,
            ports: Vec::new(),
            services: BTreeMap::new(),
            os: None,
            vulnerabilities: Vec::new(),
        }
    }

    /// 并入端口并恢复「去重 + 升序」不变式
    pub fn add_ports(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.ports.extend(ports);
        self.ports.sort_unstable();
        self.ports.dedup();
    }
}

/// 漏洞记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    #[serde(default)]
    pub cve_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    pub target: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub exploit_available: bool,
}

impl Vulnerability {
    /// 构造时即规范化 severity，空 cve_id 视为无
    pub fn new(
        cve_id: Option<String>,
        name: impl Into<String>,
        severity: &str,
        target: impl Into<String>,
        port: Option<u16>,
        description: impl Into<String>,
        exploit_available: bool,
    ) -> Self {
        Self {
            cve_id: cve_id.filter(|c| !c.trim().is_empty()),
            name: name.into(),
            severity: Severity::parse(severity),
            target: target.into(),
            port,
            description: description.into(),
            exploit_available,
        }
    }

    /// 去重判定：相同的非空 cve_id，或相同 (name, target, port)
    pub fn is_duplicate_of(&self, other: &Vulnerability) -> bool {
        if let (Some(a), Some(b)) = (&self.cve_id, &other.cve_id) {
            if !a.is_empty() && a == b {
                return true;
            }
        }
        self.name == other.name && self.target == other.target && self.port == other.port
    }
}

/// 凭据，(host, username) 唯一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub host: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

/// 结构化知识库
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FactStore {
    #[serde(default)]
    pub live_hosts: Vec<String>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
    /// 地址 -> 服务表
    #[serde(default)]
    pub services: BTreeMap<String, BTreeMap<String, Value>>,
    /// 工具自定义扩展，按键 last-write-wins
    #[serde(default)]
    pub custom_facts: BTreeMap<String, Value>,
}

impl FactStore {
    pub fn target(&self, ip: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.ip == ip)
    }

    pub fn target_mut(&mut self, ip: &str) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.ip == ip)
    }

    pub fn has_host(&self, ip: &str) -> bool {
        self.live_hosts.iter().any(|h| h == ip)
    }
}

/// 入站目标载荷：所有字段可缺省，ip 缺失的载荷在合并时被跳过
///
/// 按字段宽松解析：单个畸形端口只丢弃该端口，非字符串的服务描述被转成字符串。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct TargetUpdate {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub ports: Vec<u16>,
    pub services: BTreeMap<u16, String>,
    pub os: Option<String>,
    pub vulnerabilities: Vec<String>,
}

impl From<Value> for TargetUpdate {
    fn from(raw: Value) -> Self {
        let Some(obj) = raw.as_object() else {
            return Self::default();
        };
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let ports = obj
            .get("ports")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(port_number).collect())
            .unwrap_or_default();
        let services = obj
            .get("services")
            .and_then(Value::as_object)
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(port, desc)| {
                        let port = port.trim().parse::<u16>().ok()?;
                        Some((port, describe_service(desc)?))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let vulnerabilities = obj
            .get("vulnerabilities")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            ip: text("ip"),
            hostname: text("hostname"),
            ports,
            services,
            os: text("os"),
            vulnerabilities,
        }
    }
}

/// 端口可以是数字或数字字符串，超出 u16 的丢弃
fn port_number(raw: &Value) -> Option<u16> {
    match raw {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 服务描述：字符串原样保留；对象优先拼接 name + version，否则取其 JSON 文本
fn describe_service(raw: &Value) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => {
            let parts: Vec<&str> = ["name", "product", "version"]
                .iter()
                .filter_map(|key| obj.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                Some(raw.to_string())
            } else {
                Some(parts.join(" "))
            }
        }
        other => Some(other.to_string()),
    }
}

impl TargetUpdate {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16, service: Option<&str>) -> Self {
        self.ports.push(port);
        if let Some(s) = service {
            self.services.insert(port, s.to_string());
        }
        self
    }
}

/// 入站漏洞载荷（缺省值与 FactMerger 约定一致：name=Unknown、target=unknown）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityReport {
    #[serde(default)]
    pub cve_id: Option<String>,
    #[serde(default = "default_unknown_name")]
    pub name: String,
    #[serde(default = "default_unknown_lower")]
    pub severity: String,
    #[serde(default = "default_unknown_lower")]
    pub target: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub exploit_available: bool,
}

fn default_unknown_name() -> String {
    "Unknown".to_string()
}

fn default_unknown_lower() -> String {
    "unknown".to_string()
}

impl From<VulnerabilityReport> for Vulnerability {
    fn from(r: VulnerabilityReport) -> Self {
        Vulnerability::new(
            r.cve_id,
            r.name,
            &r.severity,
            r.target,
            r.port,
            r.description,
            r.exploit_available,
        )
    }
}

/// 入站凭据载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialReport {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// 一批新观测到的事实（工具解析器或推理服务的输出）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FactBatch {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vulnerabilities: Vec<VulnerabilityReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialReport>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, BTreeMap<String, Value>>,
    /// 未识别的顶层类别，原样进入 custom_facts
    #[serde(flatten)]
    pub custom: BTreeMap<String, Value>,
}

const KNOWN_CATEGORIES: &[&str] = &["hosts", "targets", "vulnerabilities", "credentials", "services"];

impl FactBatch {
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
            && self.targets.is_empty()
            && self.vulnerabilities.is_empty()
            && self.credentials.is_empty()
            && self.services.is_empty()
            && self.custom.is_empty()
    }

    /// 从任意 JSON 宽松解析：逐条解析，畸形条目丢弃；非对象输入得到空批次
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };
        let mut batch = Self::default();

        if let Some(hosts) = obj.get("hosts").and_then(Value::as_array) {
            batch.hosts = hosts
                .iter()
                .filter_map(Value::as_str)
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        batch.targets = parse_entries(obj.get("targets"));
        batch.vulnerabilities = parse_entries(obj.get("vulnerabilities"));
        batch.credentials = parse_entries(obj.get("credentials"));
        if let Some(services) = obj.get("services").and_then(Value::as_object) {
            for (addr, table) in services {
                if let Some(table) = table.as_object() {
                    batch.services.insert(
                        addr.clone(),
                        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                    );
                }
            }
        }
        for (key, v) in obj {
            if !KNOWN_CATEGORIES.contains(&key.as_str()) {
                batch.custom.insert(key.clone(), v.clone());
            }
        }
        batch
    }

    /// 用于 CommandRecord 的快照
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn parse_entries<T: serde::de::DeserializeOwned>(raw: Option<&Value>) -> Vec<T> {
    raw.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match serde_json::from_value::<T>(item.clone()) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::debug!(error = %e, "dropping malformed fact entry");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_severity_normalized() {
        assert_eq!(Severity::parse("HIGH"), Severity::High);
        assert_eq!(Severity::parse("weird"), Severity::Unknown);
        let v: Severity = serde_json::from_value(json!("Critical")).unwrap();
        assert_eq!(v, Severity::Critical);
        assert_eq!(serde_json::to_value(Severity::Low).unwrap(), json!("low"));
    }

    #[test]
    fn test_vulnerability_identity() {
        let a = Vulnerability::new(Some("CVE-2021-1234".into()), "a", "high", "10.0.0.1", Some(80), "", false);
        let b = Vulnerability::new(Some("CVE-2021-1234".into()), "b", "low", "10.0.0.2", None, "", false);
        let c = Vulnerability::new(None, "a", "high", "10.0.0.1", Some(80), "", false);
        let d = Vulnerability::new(None, "a", "high", "10.0.0.1", Some(443), "", false);
        assert!(a.is_duplicate_of(&b));
        assert!(c.is_duplicate_of(&a));
        assert!(!d.is_duplicate_of(&a));
        let empty = Vulnerability::new(Some("  ".into()), "x", "low", "t", None, "", false);
        assert_eq!(empty.cve_id, None);
    }

    #[test]
    fn test_batch_lenient_parse() {
        let raw = json!({
            "hosts": ["10.0.0.1", null, "", "10.0.0.2"],
            "targets": [{"ip": "10.0.0.1", "ports": [22], "services": {"22": "ssh"}}, {"ports": "bad"}],
            "vulnerabilities": [{"name": "weak ssh", "severity": "HIGH"}],
            "os_guess": "linux"
        });
        let batch = FactBatch::from_value(&raw);
        assert_eq!(batch.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(batch.targets.len(), 2);
        assert_eq!(batch.targets[1].ip, None);
        assert_eq!(batch.targets[0].services.get(&22).map(String::as_str), Some("ssh"));
        assert_eq!(batch.vulnerabilities[0].target, "unknown");
        assert_eq!(batch.custom.get("os_guess"), Some(&json!("linux")));
    }

    #[test]
    fn test_target_fields_parsed_independently() {
        let raw = json!({
            "targets": [
                {"ip": "10.0.0.7", "ports": [22], "services": {"22": {"name": "ssh", "version": "OpenSSH 8.9"}}},
                {"ip": "10.0.0.8", "ports": ["80", "http", 70000]},
                {"hostname": "no-ip.local", "ports": [443]}
            ]
        });
        let batch = FactBatch::from_value(&raw);
        assert_eq!(batch.targets.len(), 3);
        assert_eq!(batch.targets[0].ports, vec![22]);
        assert_eq!(
            batch.targets[0].services.get(&22).map(String::as_str),
            Some("ssh OpenSSH 8.9")
        );
        assert_eq!(batch.targets[1].ip.as_deref(), Some("10.0.0.8"));
        assert_eq!(batch.targets[1].ports, vec![80]);
        assert_eq!(batch.targets[2].ip, None);

        let mut store = FactStore::default();
        crate::knowledge::FactMerger::merge_into(&mut store, &batch);
        assert_eq!(store.targets.len(), 2);
        assert_eq!(store.live_hosts, vec!["10.0.0.7", "10.0.0.8"]);
        assert_eq!(store.targets[1].ports, vec![80]);
    }

    #[test]
    fn test_target_ports_sorted_dedup() {
        let mut t = Target::new("10.0.0.1");
        t.add_ports([443, 22, 80, 22]);
        assert_eq!(t.ports, vec![22, 80, 443]);
    }
}
