//! 事实合并：把一批新事实幂等地折叠进 FactStore
//!
//! 规则：
//! - hosts：已存在则忽略
//! - targets：按 ip 查找；已存在则并端口（升序）、覆盖服务、hostname/os 先写者胜、追加新漏洞引用；
//!   不存在则新建，并把 ip 加入 live_hosts
//! - vulnerabilities：重复（同 cve_id 或同 name+target+port）则丢弃，先写者胜
//! - credentials：(host, username) 重复时仅更新 password
//! - services：按地址做字典并集，新值覆盖
//! - 其余顶层类别原样写入 custom_facts

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::knowledge::facts::{
    Credential, CredentialReport, FactBatch, FactStore, Target, TargetUpdate, Vulnerability,
    VulnerabilityReport,
};

/// 事实概览（用于状态展示）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FactSummary {
    pub hosts_discovered: usize,
    pub targets_identified: usize,
    pub total_ports: usize,
    pub vulnerabilities_found: usize,
    pub credentials_captured: usize,
    pub services_detected: usize,
}

/// 无状态合并器
#[derive(Debug, Default, Clone, Copy)]
pub struct FactMerger;

impl FactMerger {
    /// 把整批事实并入 store
    pub fn merge_into(store: &mut FactStore, batch: &FactBatch) {
        Self::merge_hosts(store, &batch.hosts);
        Self::merge_targets(store, &batch.targets);
        Self::merge_vulnerabilities(store, &batch.vulnerabilities);
        Self::merge_credentials(store, &batch.credentials);
        Self::merge_services(store, &batch.services);
        for (key, value) in &batch.custom {
            store.custom_facts.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_hosts(store: &mut FactStore, hosts: &[String]) {
        for host in hosts {
            let host = host.trim();
            if host.is_empty() || store.has_host(host) {
                continue;
            }
            store.live_hosts.push(host.to_string());
        }
    }

    pub fn merge_targets(store: &mut FactStore, updates: &[TargetUpdate]) {
        for update in updates {
            let Some(ip) = update.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty()) else {
                continue;
            };
            match store.target_mut(ip) {
                Some(existing) => Self::update_target(existing, update),
                None => {
                    let mut target = Target::new(ip);
                    Self::update_target(&mut target, update);
                    store.targets.push(target);
                    if !store.has_host(ip) {
                        store.live_hosts.push(ip.to_string());
                    }
                }
            }
        }
    }

    fn update_target(target: &mut Target, update: &TargetUpdate) {
        target.add_ports(update.ports.iter().copied());
        for (port, service) in &update.services {
            target.services.insert(*port, service.clone());
        }
        if target.hostname.is_none() {
            target.hostname = update.hostname.clone().filter(|h| !h.is_empty());
        }
        if target.os.is_none() {
            target.os = update.os.clone().filter(|o| !o.is_empty());
        }
        for vuln in &update.vulnerabilities {
            if !target.vulnerabilities.contains(vuln) {
                target.vulnerabilities.push(vuln.clone());
            }
        }
    }

    pub fn merge_vulnerabilities(store: &mut FactStore, reports: &[VulnerabilityReport]) {
        for report in reports {
            let vuln = Vulnerability::from(report.clone());
            if store.vulnerabilities.iter().any(|v| vuln.is_duplicate_of(v)) {
                continue;
            }
            store.vulnerabilities.push(vuln);
        }
    }

    pub fn merge_credentials(store: &mut FactStore, reports: &[CredentialReport]) {
        for report in reports {
            let host = report.host.clone().unwrap_or_default();
            let username = report.username.clone().unwrap_or_default();
            match store
                .credentials
                .iter_mut()
                .find(|c| c.host == host && c.username == username)
            {
                Some(existing) => {
                    if existing.password != report.password {
                        existing.password = report.password.clone();
                    }
                }
                None => store.credentials.push(Credential {
                    host,
                    username,
                    password: report.password.clone(),
                }),
            }
        }
    }

    pub fn merge_services(
        store: &mut FactStore,
        services: &BTreeMap<String, BTreeMap<String, Value>>,
    ) {
        for (addr, table) in services {
            let entry = store.services.entry(addr.clone()).or_default();
            for (k, v) in table {
                entry.insert(k.clone(), v.clone());
            }
        }
    }

    /// 压缩整理：live_hosts 去重、targets 按 ip 去重（保留首个）；可随时调用，幂等
    pub fn merge(store: &mut FactStore) {
        let mut seen = HashSet::new();
        store.live_hosts.retain(|h| seen.insert(h.clone()));

        let mut seen = HashSet::new();
        store.targets.retain(|t| seen.insert(t.ip.clone()));
    }

    pub fn summary(store: &FactStore) -> FactSummary {
        FactSummary {
            hosts_discovered: store.live_hosts.len(),
            targets_identified: store.targets.len(),
            total_ports: store.targets.iter().map(|t| t.ports.len()).sum(),
            vulnerabilities_found: store.vulnerabilities.len(),
            credentials_captured: store.credentials.len(),
            services_detected: store.services.values().map(BTreeMap::len).sum(),
        }
    }
}
