//! 工具可用性探测：在 PATH 中查找每个已注册工具的可执行文件

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;

use crate::tools::registry::ToolRegistry;

const VERSION_FLAGS: &[&str] = &["--version", "-V", "-v", "version"];

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for segment in std::env::split_paths(&path_var) {
        let candidate = segment.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = segment.join(format!("{binary}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

pub fn check_binary(binary: &str) -> bool {
    find_in_path(binary).is_some()
}

/// 工具名 -> 是否已安装
pub fn check_all(registry: &ToolRegistry) -> BTreeMap<String, bool> {
    registry
        .specs()
        .into_iter()
        .map(|spec| {
            let available = check_binary(spec.binary);
            tracing::debug!(tool = spec.name, binary = spec.binary, available, "tool probe");
            (spec.name.to_string(), available)
        })
        .collect()
}

/// 依次尝试常见版本参数，取首行输出
pub async fn get_version(binary: &str) -> String {
    for flag in VERSION_FLAGS {
        let run = Command::new(binary).arg(flag).output();
        if let Ok(Ok(out)) = tokio::time::timeout(Duration::from_secs(3), run).await {
            let stdout = String::from_utf8_lossy(&out.stdout);
            if out.status.success() {
                if let Some(first) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                    return first.to_string();
                }
            }
        }
    }
    "unknown".to_string()
}

/// 可读的可用性报告（tools 子命令）
pub async fn generate_report(registry: &ToolRegistry) -> String {
    let availability = check_all(registry);
    let mut available = Vec::new();
    let mut missing = Vec::new();

    for spec in registry.specs() {
        if availability.get(spec.name).copied().unwrap_or(false) {
            let version = get_version(spec.binary).await;
            available.push(format!("  [ok]      {:<12} {}", spec.name, version));
        } else {
            missing.push(format!("  [missing] {:<12} {}", spec.name, spec.description));
        }
    }

    let mut lines = vec!["Tool Availability Report".to_string(), "=".repeat(60)];
    if !available.is_empty() {
        lines.push("Available:".to_string());
        lines.extend(available.iter().cloned());
    }
    if !missing.is_empty() {
        lines.push("Missing:".to_string());
        lines.extend(missing.iter().cloned());
    }
    lines.push(format!("Total: {}/{} tools available", available.len(), availability.len()));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary() {
        assert!(!check_binary("definitely-not-a-real-binary-4f2a"));
    }

    #[test]
    fn test_check_all_keys_by_tool_name() {
        let reg = ToolRegistry::with_defaults();
        let avail = check_all(&reg);
        assert_eq!(avail.len(), 2);
        assert!(avail.contains_key("nmap"));
        assert!(avail.contains_key("curl"));
    }

    #[tokio::test]
    async fn test_report_has_totals() {
        let report = generate_report(&ToolRegistry::new()).await;
        assert!(report.contains("Total: 0/0 tools available"));
    }
}
