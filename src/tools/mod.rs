//! 工具层：能力注册表、可用性探测、安全校验与具体工具（nmap / curl）

pub mod availability;
pub mod curl;
pub mod nmap;
pub mod registry;
pub mod safety;

pub use curl::CurlTool;
pub use nmap::NmapTool;
pub use registry::{Capability, ToolCategory, ToolContext, ToolError, ToolRegistry, ToolSpec};
pub use safety::SafetyValidator;
