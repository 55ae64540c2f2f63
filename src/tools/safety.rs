//! 命令安全校验：硬拦截 + 软标记
//!
//! - validate：命中破坏性 / 提权 / 管道到解释器 / `-e`+`sh` 任一规则即拒绝（硬闸门）
//! - requires_approval：外传数据、写系统目录等仅标记告警，不拦截
//! - sanitize：去掉尾部串联符与开头的 sudo/su，不被 validate 自动调用

use std::sync::OnceLock;

use regex::Regex;

/// 破坏性命令（不区分大小写）
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"\brm\s+-rf\b",
    r"\brm\s+.*\*",
    r"\bformat\b",
    r"\bdel\s+/[fFsS]",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bmkfs\b",
    r"\bdd\s+if=.*of=/dev/",
    r">\s*/dev/sd[a-z]",
    r"\bmv\s+.*\s+/dev/null",
    r"\bchmod\s+777",
    r"\bchmod\s+-R\s+777",
    r"wget.*\|\s*bash",
    r"curl.*\|\s*bash",
];

/// 提权
const PRIVESC_PATTERNS: &[&str] = &[
    r"\bsudo\s+",
    r"\bsu\s+",
    r"\brunas\b",
    r"chmod\s+\+s\b",
    r"chown\s+root",
];

/// 数据外传（只标记）
const EXFIL_PATTERNS: &[&str] = &[
    r"scp\s+.*@",
    r"rsync\s+.*@",
    r"curl.*-X\s+POST\s+.*-d",
    r"nc\s+.*>",
];

const IMPORTANT_PATHS: &[&str] = &["/etc/", "/var/", "/usr/", "/sys/", "C:\\Windows", "C:\\Program Files"];

const PIPE_TO_INTERPRETER: &str = r"\|\s*(bash|sh|python|perl|ruby)";

struct CompiledRules {
    destructive: Vec<(&'static str, Regex)>,
    privesc: Vec<(&'static str, Regex)>,
    exfil: Vec<(&'static str, Regex)>,
    pipe_to_interpreter: Option<Regex>,
    trailing_chain: Option<Regex>,
    leading_sudo: Option<Regex>,
}

static RULES: OnceLock<CompiledRules> = OnceLock::new();

fn compile(patterns: &[&'static str], case_insensitive: bool) -> Vec<(&'static str, Regex)> {
    patterns
        .iter()
        .filter_map(|p| {
            let source = if case_insensitive { format!("(?i){p}") } else { (*p).to_string() };
            match Regex::new(&source) {
                Ok(re) => Some((*p, re)),
                Err(e) => {
                    tracing::error!(pattern = %p, error = %e, "invalid safety pattern");
                    None
                }
            }
        })
        .collect()
}

fn rules() -> &'static CompiledRules {
    RULES.get_or_init(|| CompiledRules {
        destructive: compile(DESTRUCTIVE_PATTERNS, true),
        privesc: compile(PRIVESC_PATTERNS, false),
        exfil: compile(EXFIL_PATTERNS, false),
        pipe_to_interpreter: Regex::new(PIPE_TO_INTERPRETER).ok(),
        trailing_chain: Regex::new(r"[;&|]+\s*$").ok(),
        leading_sudo: Regex::new(r"^\s*(sudo|su)\s+").ok(),
    })
}

/// 无状态的命令安全校验器
pub struct SafetyValidator;

impl SafetyValidator {
    /// 硬闸门：返回 (is_safe, reason)，首个命中的规则作为原因
    pub fn validate(command: &str) -> (bool, String) {
        let rules = rules();

        if let Some((p, _)) = rules.destructive.iter().find(|(_, re)| re.is_match(command)) {
            return (false, format!("Destructive command detected: {p}"));
        }
        if let Some((p, _)) = rules.privesc.iter().find(|(_, re)| re.is_match(command)) {
            return (false, format!("Privilege escalation detected: {p}"));
        }
        if command.contains("-e") && command.contains("sh") {
            return (false, "Suspicious command execution pattern".to_string());
        }
        if rules
            .pipe_to_interpreter
            .as_ref()
            .is_some_and(|re| re.is_match(command))
        {
            return (false, "Piping to interpreter detected".to_string());
        }
        (true, "Command passed safety checks".to_string())
    }

    /// 软标记：返回 (needs_approval, reason)，不影响 validate 的结果
    pub fn requires_approval(command: &str) -> (bool, String) {
        if let Some((p, _)) = rules().exfil.iter().find(|(_, re)| re.is_match(command)) {
            return (true, format!("Data exfiltration pattern detected: {p}"));
        }
        if command.contains('>') {
            if let Some(path) = IMPORTANT_PATHS.iter().find(|p| command.contains(*p)) {
                return (true, format!("Writing to important directory: {path}"));
            }
        }
        (false, "No special approval needed".to_string())
    }

    pub fn sanitize(command: &str) -> String {
        let rules = rules();
        let mut out = command.to_string();
        if let Some(re) = &rules.trailing_chain {
            out = re.replace(&out, "").into_owned();
        }
        if let Some(re) = &rules.leading_sudo {
            out = re.replace(&out, "").into_owned();
        }
        out.trim().to_string()
    }
}
