//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HORNET__*` 覆盖（双下划线表示嵌套，如 `HORNET__LLM__PROVIDER=openai`）。
//! 配置在 main 中构建一次，按引用或克隆传给各组件。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::retry::RetryConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub retry: RetryConfig,
    pub execution: ExecutionSection,
    pub recovery: RecoverySection,
}

/// [app] 段：应用名、主循环步数上限、会话存储根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub max_steps: u64,
    pub storage_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_steps: 100,
            storage_root: PathBuf::from("./sessions"),
        }
    }
}

/// [llm] 段：后端选择与各步 max_tokens
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；实际选择还取决于是否有 API Key
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: MaxTokensSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            max_tokens: MaxTokensSection::default(),
        }
    }
}

/// [llm.max_tokens] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaxTokensSection {
    pub think: u32,
    pub plan: u32,
    pub propose: u32,
    pub extract: u32,
}

impl Default for MaxTokensSection {
    fn default() -> Self {
        Self {
            think: 1000,
            plan: 800,
            propose: 600,
            extract: 1500,
        }
    }
}

/// [execution] 段：执行邮箱轮询与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub poll_interval_ms: u64,
    /// 编排侧等待结果的上限
    pub wait_timeout_secs: u64,
    /// 执行侧（run 子命令）单条命令的超时
    pub command_timeout_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            wait_timeout_secs: 300,
            command_timeout_secs: 300,
        }
    }
}

impl ExecutionSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_backups: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self { max_backups: 10 }
    }
}

/// 从 config 目录加载配置，环境变量 HORNET__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HORNET__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HORNET")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_steps, 100);
        assert_eq!(cfg.llm.max_tokens.extract, 1500);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.execution.poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.recovery.max_backups, 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[execution]\nwait_timeout_secs = 5\n\n[llm]\nprovider = \"mock\"").unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.execution.wait_timeout_secs, 5);
        assert_eq!(cfg.execution.poll_interval_ms, 2000);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.llm.max_tokens.think, 1000);
    }
}
